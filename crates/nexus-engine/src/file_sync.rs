//! Cross-worker file sync.
//!
//! Stage executions write into a per-worker project directory; the
//! sync layer pushes those files to the blob store and pulls them back
//! so any worker can resume a project it did not start.

use nexus_core::ResourceId;
use nexus_core::blob::BlobStore;
use nexus_core::stage::FileMetadata;
use nexus_db::{StageRepo, StageUpdate};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::executor::scan_directory;
use crate::{EngineError, EngineResult};

/// Records and queries generated-file metadata on stage records.
pub struct FileMetadataManager {
    stages: Arc<dyn StageRepo>,
    projects_dir: PathBuf,
}

impl FileMetadataManager {
    pub fn new(stages: Arc<dyn StageRepo>, projects_dir: PathBuf) -> Self {
        Self {
            stages,
            projects_dir,
        }
    }

    fn project_dir(&self, project_id: ResourceId, project_name: &str) -> PathBuf {
        let by_name = self.projects_dir.join(project_name);
        if !project_name.is_empty() && by_name.is_dir() {
            return by_name;
        }
        self.projects_dir.join(project_id.to_string())
    }

    /// Rescan the project directory into a fresh metadata list.
    pub fn scan_project_files(
        &self,
        project_id: ResourceId,
        project_name: &str,
    ) -> Vec<FileMetadata> {
        let dir = self.project_dir(project_id, project_name);
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "project directory not found");
            return Vec::new();
        }
        scan_directory(&dir)
    }

    /// Persist a metadata list onto a stage record.
    pub async fn save_file_metadata(
        &self,
        project_id: ResourceId,
        stage_name: &str,
        files: Vec<FileMetadata>,
    ) -> EngineResult<()> {
        info!(project_id = %project_id, stage = %stage_name, count = files.len(),
              "saving file metadata");
        self.stages
            .update(
                project_id,
                stage_name,
                StageUpdate {
                    generated_files: Some(files),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Metadata for one stage, or the union over all stages.
    pub async fn get_file_metadata(
        &self,
        project_id: ResourceId,
        stage_name: Option<&str>,
    ) -> EngineResult<Vec<FileMetadata>> {
        match stage_name {
            Some(stage_name) => {
                let record = self.stages.get(project_id, stage_name).await?;
                Ok(record.generated_files)
            }
            None => {
                let records = self.stages.list(project_id).await?;
                let mut files = Vec::new();
                for record in records {
                    for file in record.generated_files {
                        if !files.contains(&file) {
                            files.push(file);
                        }
                    }
                }
                Ok(files)
            }
        }
    }
}

/// Pushes and pulls project files through the blob store.
pub struct FileSyncManager {
    blob: Arc<dyn BlobStore>,
    metadata: FileMetadataManager,
    blob_prefix: String,
    projects_dir: PathBuf,
}

impl FileSyncManager {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        metadata: FileMetadataManager,
        blob_prefix: String,
        projects_dir: PathBuf,
    ) -> Self {
        Self {
            blob,
            metadata,
            blob_prefix,
            projects_dir,
        }
    }

    fn project_prefix(&self, project_id: ResourceId) -> String {
        format!("{}{}/", self.blob_prefix, project_id)
    }

    fn local_dir(&self, project_id: ResourceId, project_name: &str) -> PathBuf {
        let by_name = self.projects_dir.join(project_name);
        if !project_name.is_empty() && by_name.is_dir() {
            return by_name;
        }
        let by_id = self.projects_dir.join(project_id.to_string());
        if by_id.is_dir() || project_name.is_empty() {
            by_id
        } else {
            self.projects_dir.join(project_name)
        }
    }

    /// Upload project files to the blob store. Without an explicit
    /// list, everything currently on disk is pushed. Returns the
    /// number of files uploaded.
    pub async fn sync_to_blob(
        &self,
        project_id: ResourceId,
        project_name: &str,
        files: Option<&[FileMetadata]>,
    ) -> EngineResult<usize> {
        let scanned;
        let files = match files {
            Some(files) => files,
            None => {
                scanned = self.metadata.scan_project_files(project_id, project_name);
                &scanned
            }
        };
        if files.is_empty() {
            return Ok(0);
        }

        let dir = self.local_dir(project_id, project_name);
        let mut synced = 0usize;
        for file in files {
            let local_path = dir.join(&file.path);
            let bytes = match tokio::fs::read(&local_path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %local_path.display(), error = %e, "failed to read file for push");
                    continue;
                }
            };
            let key = format!("{}{}", self.project_prefix(project_id), file.path);
            match self
                .blob
                .put(
                    &key,
                    bytes,
                    file.checksum.clone(),
                    Some(project_id.to_string()),
                )
                .await
            {
                Ok(_) => {
                    synced += 1;
                    debug!(key = %key, "pushed file to blob store");
                }
                Err(e) => warn!(key = %key, error = %e, "failed to push file"),
            }
        }
        info!(project_id = %project_id, synced, "pushed project files to blob store");
        Ok(synced)
    }

    /// Download project files from the blob store. Existing local
    /// files are only overwritten when the remote copy is newer.
    /// Returns the number of files downloaded.
    pub async fn sync_from_blob(
        &self,
        project_id: ResourceId,
        project_name: &str,
        paths: Option<&[String]>,
    ) -> EngineResult<usize> {
        let prefix = self.project_prefix(project_id);
        let objects = self.blob.list(&prefix).await?;
        let dir = self.local_dir(project_id, project_name);

        let mut synced = 0usize;
        for object in objects {
            let Some(relative) = object.key.strip_prefix(&prefix) else {
                continue;
            };
            if let Some(paths) = paths {
                if !paths.iter().any(|p| p == relative) {
                    continue;
                }
            }

            let local_path = dir.join(relative);
            if let Ok(metadata) = tokio::fs::metadata(&local_path).await {
                if let Ok(modified) = metadata.modified() {
                    let local_mtime: chrono::DateTime<chrono::Utc> = modified.into();
                    if local_mtime >= object.last_modified {
                        continue;
                    }
                }
            }

            let bytes = match self.blob.get(&object.key).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(key = %object.key, error = %e, "failed to fetch object");
                    continue;
                }
            };
            if let Some(parent) = local_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| EngineError::Core(nexus_core::Error::Storage(e.to_string())))?;
            }
            tokio::fs::write(&local_path, bytes)
                .await
                .map_err(|e| EngineError::Core(nexus_core::Error::Storage(e.to_string())))?;
            synced += 1;
            debug!(path = %local_path.display(), "pulled file from blob store");
        }
        info!(project_id = %project_id, synced, "pulled project files from blob store");
        Ok(synced)
    }

    /// Which of `required` are absent locally.
    pub fn check_missing_files(
        &self,
        project_id: ResourceId,
        project_name: &str,
        required: &[String],
    ) -> Vec<String> {
        let dir = self.local_dir(project_id, project_name);
        required
            .iter()
            .filter(|path| !dir.join(path.as_str()).exists())
            .cloned()
            .collect()
    }

    /// Make sure `required` files exist locally, pulling the whole
    /// project from the blob store when any are missing. Returns
    /// whether everything is available afterwards.
    pub async fn ensure_files_available(
        &self,
        project_id: ResourceId,
        project_name: &str,
        required: &[String],
    ) -> EngineResult<bool> {
        let missing = self.check_missing_files(project_id, project_name, required);
        if missing.is_empty() {
            return Ok(true);
        }

        info!(project_id = %project_id, missing = missing.len(),
              "missing files, pulling project from blob store");
        self.sync_from_blob(project_id, project_name, None).await?;

        let still_missing = self.check_missing_files(project_id, project_name, required);
        if !still_missing.is_empty() {
            warn!(project_id = %project_id, still_missing = still_missing.len(),
                  "files still missing after sync");
            return Ok(false);
        }
        Ok(true)
    }
}
