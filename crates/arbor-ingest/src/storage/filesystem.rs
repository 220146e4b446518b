use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{validate_path, ObjectStore, RemoveFailure, RemoveReport};
use crate::error::StorageError;

/// Object store backed by a local directory served under `public_base_url`.
pub struct FilesystemStore {
    root: PathBuf,
    public_base_url: String,
}

impl FilesystemStore {
    pub fn new<P: AsRef<Path>>(root: P, public_base_url: &str) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        validate_path(path)?;
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl ObjectStore for FilesystemStore {
    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<(), StorageError> {
        let full = self.full_path(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::CreateDirectory {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        // Write next to the target then rename so readers never see a torn file.
        let staging = full.with_extension("upload");
        tokio::fs::write(&staging, bytes)
            .await
            .map_err(|e| StorageError::WriteObject {
                path: staging.clone(),
                source: e,
            })?;
        tokio::fs::rename(&staging, &full)
            .await
            .map_err(|e| StorageError::WriteObject {
                path: full.clone(),
                source: e,
            })?;

        tracing::debug!(path, size = bytes.len(), content_type, "object stored");
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/{}", self.public_base_url, path.trim_start_matches('/'))
    }

    async fn remove(&self, paths: &[String]) -> RemoveReport {
        let mut report = RemoveReport::default();
        for path in paths {
            let result = match self.full_path(path) {
                Ok(full) => match tokio::fs::remove_file(&full).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(StorageError::RemoveObject { path: full, source: e }),
                },
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => report.removed.push(path.clone()),
                Err(e) => report.failed.push(RemoveFailure {
                    path: path.clone(),
                    error: e.to_string(),
                }),
            }
        }
        report
    }
}
