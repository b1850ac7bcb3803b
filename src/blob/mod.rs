//! Blob store interface.
//!
//! The file-content store is an external collaborator addressed by
//! `(zone_id, file_name)` — one zone per block. The daemon only needs the
//! operations below; [`DirBlobStore`] is a local filesystem-backed
//! implementation so the daemon runs standalone.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::obj::MetaMap;

#[derive(Debug, Clone)]
pub struct BlobFileInfo {
    pub zone_id: String,
    pub name: String,
    pub size: u64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn make_file(&self, zone_id: &str, name: &str, meta: Option<MetaMap>) -> Result<()>;
    async fn write_file(&self, zone_id: &str, name: &str, data: &[u8]) -> Result<()>;
    async fn read_file(&self, zone_id: &str, name: &str) -> Result<Vec<u8>>;
    async fn list_files(&self, zone_id: &str) -> Result<Vec<BlobFileInfo>>;
    async fn delete_zone(&self, zone_id: &str) -> Result<()>;

    /// Flush any buffered writes. Called once during shutdown.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Filesystem-backed blob store. Zones are directories; file names are
/// base64-encoded because they may contain characters like `:`
/// (`cache:term:full`).
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn zone_dir(&self, zone_id: &str) -> Result<PathBuf> {
        if zone_id.is_empty() || zone_id.contains(['/', '\\']) || zone_id.contains("..") {
            bail!("invalid zone id: {zone_id:?}");
        }
        Ok(self.root.join(zone_id))
    }

    fn file_path(&self, zone_id: &str, name: &str) -> Result<PathBuf> {
        let encoded = URL_SAFE_NO_PAD.encode(name.as_bytes());
        Ok(self.zone_dir(zone_id)?.join(encoded))
    }
}

#[async_trait]
impl BlobStore for DirBlobStore {
    async fn make_file(&self, zone_id: &str, name: &str, _meta: Option<MetaMap>) -> Result<()> {
        let path = self.file_path(zone_id, name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating zone dir for {zone_id}"))?;
        }
        if tokio::fs::metadata(&path).await.is_ok() {
            return Ok(());
        }
        tokio::fs::write(&path, b"")
            .await
            .with_context(|| format!("creating blob file {zone_id}/{name}"))?;
        Ok(())
    }

    async fn write_file(&self, zone_id: &str, name: &str, data: &[u8]) -> Result<()> {
        let path = self.file_path(zone_id, name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("writing blob file {zone_id}/{name}"))?;
        Ok(())
    }

    async fn read_file(&self, zone_id: &str, name: &str) -> Result<Vec<u8>> {
        let path = self.file_path(zone_id, name)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading blob file {zone_id}/{name}"))
    }

    async fn list_files(&self, zone_id: &str) -> Result<Vec<BlobFileInfo>> {
        let dir = self.zone_dir(zone_id)?;
        let mut rtn = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(rtn),
        };
        while let Some(entry) = entries.next_entry().await? {
            let encoded = entry.file_name();
            let Ok(raw) = URL_SAFE_NO_PAD.decode(encoded.to_string_lossy().as_bytes()) else {
                continue;
            };
            let Ok(name) = String::from_utf8(raw) else {
                continue;
            };
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            rtn.push(BlobFileInfo {
                zone_id: zone_id.to_string(),
                name,
                size,
            });
        }
        rtn.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rtn)
    }

    async fn delete_zone(&self, zone_id: &str) -> Result<()> {
        let dir = self.zone_dir(zone_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting blob zone {zone_id}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_list_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirBlobStore::new(tmp.path());

        store
            .write_file("zone1", "cache:term:full", b"scrollback")
            .await
            .unwrap();
        store.write_file("zone1", "env", b"A=1").await.unwrap();

        let data = store.read_file("zone1", "cache:term:full").await.unwrap();
        assert_eq!(data, b"scrollback");

        let files = store.list_files("zone1").await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["cache:term:full", "env"]);

        store.delete_zone("zone1").await.unwrap();
        assert!(store.list_files("zone1").await.unwrap().is_empty());
        // deleting a missing zone is not an error
        store.delete_zone("zone1").await.unwrap();
    }

    #[tokio::test]
    async fn test_make_file_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirBlobStore::new(tmp.path());
        store.write_file("z", "term", b"data").await.unwrap();
        store.make_file("z", "term", None).await.unwrap();
        assert_eq!(store.read_file("z", "term").await.unwrap(), b"data");
    }
}
