//! QR challenge encoding.
//!
//! Turns the raw pairing payload into a PNG the companion transport can
//! display as a photo.

use image::{codecs::png::PngEncoder, ExtendedColorType, ImageEncoder};
use qrcode::{Color, QrCode};

use crate::{errors::Error, Result};

/// Pixels per QR module. Telegram downscales large photos, so this only needs
/// to keep the modules comfortably scannable.
const MODULE_SCALE: u32 = 8;

/// Quiet-zone border around the symbol, in modules.
const QUIET_MODULES: u32 = 4;

/// Encode a challenge payload into a grayscale PNG.
pub fn challenge_to_png(code: &str) -> Result<Vec<u8>> {
    let payload = code.trim();
    if payload.is_empty() {
        return Err(Error::Protocol("QR challenge payload is empty".to_string()));
    }

    let qr = QrCode::new(payload.as_bytes())
        .map_err(|e| Error::Protocol(format!("failed to encode QR challenge: {e}")))?;

    let modules = qr.width() as u32;
    let colors = qr.to_colors();
    let side = (modules + 2 * QUIET_MODULES) * MODULE_SCALE;

    let mut pixels = vec![0xffu8; (side * side) as usize];
    for (i, color) in colors.iter().enumerate() {
        if *color != Color::Dark {
            continue;
        }
        let mx = i as u32 % modules;
        let my = i as u32 / modules;
        let x0 = (mx + QUIET_MODULES) * MODULE_SCALE;
        let y0 = (my + QUIET_MODULES) * MODULE_SCALE;
        for dy in 0..MODULE_SCALE {
            let row = ((y0 + dy) * side + x0) as usize;
            for px in &mut pixels[row..row + MODULE_SCALE as usize] {
                *px = 0x00;
            }
        }
    }

    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(&pixels, side, side, ExtendedColorType::L8)
        .map_err(|e| Error::Protocol(format!("failed to write QR PNG: {e}")))?;

    Ok(png)
}
