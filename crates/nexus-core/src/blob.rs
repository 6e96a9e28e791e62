//! Blob store abstraction.
//!
//! The cross-worker file share: project directories and oversize
//! stage outputs live here, keyed under
//! `<prefix><project_id>/<relative-path>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Metadata for one stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobObject {
    /// Full key, including the store prefix.
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    /// MD5 hex digest recorded at upload time.
    pub checksum: Option<String>,
    pub project_id: Option<String>,
}

/// Trait for blob store backends.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store an object, carrying checksum and project id as metadata.
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        checksum: Option<String>,
        project_id: Option<String>,
    ) -> Result<BlobObject>;

    /// Retrieve an object's bytes.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// List objects under a key prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>>;

    /// Delete an object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}
