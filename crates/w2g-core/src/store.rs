//! Persistent session store port + filesystem implementation.
//!
//! The core never reads or writes credential bytes itself; blobs are opaque
//! and flow between the store and the protocol client.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::{errors::Error, Result};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Prepare the store for use (create storage, open connections).
    async fn connect(&self) -> Result<()>;

    async fn save(&self, key: &str, blob: &[u8]) -> Result<()>;

    /// `None` when no credentials exist for `key`.
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Blob-per-key store on the local filesystem.
pub struct FsSessionStore {
    dir: PathBuf,
}

impl FsSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf> {
        // Keys come from ClientId (numeric user ids); reject anything that
        // could escape the session dir.
        if key.is_empty() || key.contains('/') || key.contains("..") {
            return Err(Error::Store(format!("invalid session key: {key:?}")));
        }
        Ok(self.dir.join(format!("{key}.session")))
    }
}

#[async_trait]
impl SessionStore for FsSessionStore {
    async fn connect(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::Store(format!("create {}: {e}", self.dir.display())))?;
        Ok(())
    }

    async fn save(&self, key: &str, blob: &[u8]) -> Result<()> {
        let path = self.blob_path(key)?;
        tokio::fs::write(&path, blob)
            .await
            .map_err(|e| Error::Store(format!("write {}: {e}", path.display())))?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Store(format!("read {}: {e}", path.display()))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.blob_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Store(format!("delete {}: {e}", path.display()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_store(tag: &str) -> FsSessionStore {
        FsSessionStore::new(format!("/tmp/w2g-store-{tag}-{}", std::process::id()))
    }

    #[tokio::test]
    async fn save_load_delete_roundtrip() {
        let store = tmp_store("rt");
        store.connect().await.unwrap();

        assert_eq!(store.load("100").await.unwrap(), None);

        store.save("100", b"creds").await.unwrap();
        assert_eq!(store.load("100").await.unwrap(), Some(b"creds".to_vec()));

        store.delete("100").await.unwrap();
        assert_eq!(store.load("100").await.unwrap(), None);

        // Deleting a missing key is not an error.
        store.delete("100").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let store = tmp_store("trav");
        store.connect().await.unwrap();
        assert!(store.load("../etc/passwd").await.is_err());
        assert!(store.save("", b"x").await.is_err());
    }
}
