//! Object store boundary for page images.
//!
//! Objects are addressed by relative path and every `put` is an upsert.
//! `remove` is best-effort per path and reports which paths failed.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::StorageError;
use crate::sanitize;

pub mod filesystem;

pub use filesystem::FilesystemStore;

/// Outcome of a multi-path remove.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveReport {
    pub removed: Vec<String>,
    pub failed: Vec<RemoveFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoveFailure {
    pub path: String,
    pub error: String,
}

impl RemoveReport {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes `bytes` to `path`, overwriting any existing object.
    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<(), StorageError>;

    /// Resolvable URL for a stored object.
    fn public_url(&self, path: &str) -> String;

    async fn remove(&self, paths: &[String]) -> RemoveReport;
}

/// `{sourceId}/batch-{n}/page-{k}-{originalName}`.
pub fn object_path(source_id: &str, batch_index: u64, page: i64, original_name: &str) -> String {
    format!(
        "{}/batch-{}/page-{}-{}",
        sanitize::object_file_name(source_id),
        batch_index,
        page,
        sanitize::object_file_name(original_name)
    )
}

/// Turns a stored `uri` into an absolute URL. Absolute URLs pass through.
pub fn resolve_url(store: &dyn ObjectStore, uri: &str) -> String {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        uri.to_string()
    } else {
        store.public_url(uri.trim_start_matches('/'))
    }
}

/// Inverse of [`resolve_url`]: the store-relative path of `uri`, or `None`
/// for absolute URLs that point outside this store.
pub fn storage_path(store: &dyn ObjectStore, uri: &str) -> Option<String> {
    if !(uri.starts_with("http://") || uri.starts_with("https://")) {
        return Some(uri.trim_start_matches('/').to_string());
    }
    let base = store.public_url("");
    uri.strip_prefix(base.as_str())
        .map(|rest| rest.trim_start_matches('/').to_string())
        .filter(|rest| !rest.is_empty())
}

/// Rejects absolute paths and parent-directory segments.
pub fn validate_path(path: &str) -> Result<(), StorageError> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(())
}
