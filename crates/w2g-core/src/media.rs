//! Media sink port + filesystem implementation.
//!
//! Persists decoded media blobs and hands back a locator the relay forwards
//! to the companion chat transport.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::{errors::Error, protocol::MediaPayload, Result};

#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Persist `payload` and return a locator for it.
    ///
    /// Must create any needed storage location, and must reject payloads with
    /// missing data or mimetype.
    async fn persist(&self, payload: &MediaPayload) -> Result<PathBuf>;
}

/// Writes media files under a configured download directory.
pub struct FsMediaSink {
    dir: PathBuf,
}

impl FsMediaSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_name(payload: &MediaPayload) -> String {
        if let Some(name) = payload.filename.as_deref() {
            let trimmed = name.trim();
            if !trimmed.is_empty() && !trimmed.contains('/') && !trimmed.contains("..") {
                return trimmed.to_string();
            }
        }

        // No usable declared name: derive an extension from the mimetype
        // subtype, falling back to a generic binary suffix.
        let ext = payload
            .mimetype
            .split('/')
            .nth(1)
            .map(|s| s.split(';').next().unwrap_or(s).trim())
            .filter(|s| !s.is_empty())
            .unwrap_or("bin");
        let ts = chrono::Utc::now().timestamp_millis();
        format!("media_{ts}.{ext}")
    }
}

#[async_trait]
impl MediaSink for FsMediaSink {
    async fn persist(&self, payload: &MediaPayload) -> Result<PathBuf> {
        if payload.data.is_empty() {
            return Err(Error::Media("media payload has no data".to_string()));
        }
        if payload.mimetype.trim().is_empty() {
            return Err(Error::Media("media payload has no mimetype".to_string()));
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::Media(format!("create {}: {e}", self.dir.display())))?;

        let path = self.dir.join(Self::file_name(payload));
        tokio::fs::write(&path, &payload.data)
            .await
            .map_err(|e| Error::Media(format!("write {}: {e}", path.display())))?;

        Ok(path)
    }
}
