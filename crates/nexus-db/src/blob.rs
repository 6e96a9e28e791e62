//! Filesystem blob store backend.
//!
//! Stores objects under `<root>/<bucket>/<key>`, with a metadata
//! sidecar per object carrying the checksum and owning project.
//! Pointing the root at a shared mount gives workers the common file
//! share the sync layer needs; an object-store backend would
//! implement the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nexus_core::blob::{BlobObject, BlobStore};
use nexus_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use walkdir::WalkDir;

const META_SUFFIX: &str = ".nexus-meta";

#[derive(Debug, Serialize, Deserialize, Default)]
struct SidecarMeta {
    checksum: Option<String>,
    project_id: Option<String>,
}

/// Filesystem implementation of [`BlobStore`].
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, bucket: &str) -> Self {
        Self {
            root: root.into().join(bucket),
        }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        // Keys are relative; reject traversal out of the bucket.
        let relative = Path::new(key);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::InvalidInput(format!("invalid blob key: {key}")));
        }
        Ok(self.root.join(relative))
    }

    fn meta_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(META_SUFFIX);
        path.with_file_name(name)
    }

    async fn read_meta(path: &Path) -> SidecarMeta {
        match fs::read(Self::meta_path(path)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => SidecarMeta::default(),
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        checksum: Option<String>,
        project_id: Option<String>,
    ) -> Result<BlobObject> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
        }
        let size = data.len() as u64;
        fs::write(&path, data)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        let meta = SidecarMeta {
            checksum: checksum.clone(),
            project_id: project_id.clone(),
        };
        let meta_bytes =
            serde_json::to_vec(&meta).map_err(|e| Error::Storage(e.to_string()))?;
        fs::write(Self::meta_path(&path), meta_bytes)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(BlobObject {
            key: key.to_string(),
            size,
            last_modified: Utc::now(),
            checksum,
            project_id,
        })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(key)?;
        fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("blob {key}"))
            } else {
                Error::Storage(e.to_string())
            }
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>> {
        let base = self.object_path(prefix.trim_end_matches('/'))?;
        if !base.exists() {
            return Ok(Vec::new());
        }

        let mut objects = Vec::new();
        for entry in WalkDir::new(&base).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            if path.to_string_lossy().ends_with(META_SUFFIX) {
                continue;
            }
            let metadata = entry
                .metadata()
                .map_err(|e| Error::Storage(e.to_string()))?;
            let last_modified: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());
            let relative = path
                .strip_prefix(&self.root)
                .map_err(|e| Error::Storage(e.to_string()))?;
            let sidecar = Self::read_meta(path).await;
            objects.push(BlobObject {
                key: relative.to_string_lossy().replace('\\', "/"),
                size: metadata.len(),
                last_modified,
                checksum: sidecar.checksum,
                project_id: sidecar.project_id,
            });
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Storage(e.to_string())),
        }
        let _ = fs::remove_file(Self::meta_path(&path)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), "nexus-ai-workflow-files");
        (dir, store)
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let (_dir, store) = store();
        let data = b"stage output".to_vec();
        let object = store
            .put(
                "workflow-files/p1/outputs/orchestrator.txt",
                data.clone(),
                Some("abc123".into()),
                Some("p1".into()),
            )
            .await
            .unwrap();
        assert_eq!(object.size, data.len() as u64);
        let back = store
            .get("workflow-files/p1/outputs/orchestrator.txt")
            .await
            .unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn list_scopes_to_prefix_and_keeps_metadata() {
        let (_dir, store) = store();
        store
            .put("workflow-files/p1/a.txt", b"a".to_vec(), Some("c1".into()), Some("p1".into()))
            .await
            .unwrap();
        store
            .put("workflow-files/p1/sub/b.txt", b"bb".to_vec(), None, Some("p1".into()))
            .await
            .unwrap();
        store
            .put("workflow-files/p2/c.txt", b"c".to_vec(), None, Some("p2".into()))
            .await
            .unwrap();

        let objects = store.list("workflow-files/p1/").await.unwrap();
        let keys: Vec<_> = objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["workflow-files/p1/a.txt", "workflow-files/p1/sub/b.txt"]
        );
        assert_eq!(objects[0].checksum.as_deref(), Some("c1"));
        assert_eq!(objects[0].project_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let (_dir, store) = store();
        match store.get("workflow-files/p1/missing.txt").await {
            Err(Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
        // Deleting a missing key is fine.
        store.delete("workflow-files/p1/missing.txt").await.unwrap();
    }

    #[tokio::test]
    async fn traversal_keys_rejected() {
        let (_dir, store) = store();
        assert!(store.get("../outside").await.is_err());
    }
}
