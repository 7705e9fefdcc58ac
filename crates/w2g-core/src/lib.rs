//! Core domain + application logic for what2gram (WhatsApp → Telegram relay).
//!
//! This crate is intentionally framework-agnostic. Telegram / the WhatsApp
//! bridge live behind ports (traits) implemented in adapter crates.

pub mod config;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod media;
pub mod messaging;
pub mod protocol;
pub mod qr;
pub mod registry;
pub mod relay;
pub mod security;
pub mod store;
pub mod utils;

pub use errors::{Error, Result};
