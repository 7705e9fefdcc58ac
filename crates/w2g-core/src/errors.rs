use std::path::PathBuf;

/// Core error type for the relay.
///
/// Adapter crates map their specific errors into this type so the core can
/// tell setup failures (surfaced to the caller) apart from per-message
/// failures (logged and skipped inside the relay).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("session store error: {0}")]
    Store(String),

    #[error("protocol client error: {0}")]
    Protocol(String),

    #[error("companion transport error: {0}")]
    Transport(String),

    #[error("media error: {0}")]
    Media(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
