//! Blob storage contract.
//!
//! A [`Backend`] is one content-addressed storage target. Objects are keyed
//! by their [`Checksum`]; the same bytes always land under the same key, so
//! `put` of an existing object is a harmless overwrite.
//!
//! Backends report failures as `anyhow` errors with whatever detail the
//! underlying system gives. The content store wraps them with the backend
//! name and operation before surfacing them.

pub mod cache;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;

/// Caller-supplied attributes stored alongside a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlobMetadata {
    pub content_type: String,
    pub content_encoding: Option<String>,
    pub filename: Option<String>,
}

impl Default for BlobMetadata {
    fn default() -> Self {
        Self {
            content_type: "application/octet-stream".to_string(),
            content_encoding: None,
            filename: None,
        }
    }
}

impl BlobMetadata {
    pub fn json() -> Self {
        Self {
            content_type: crate::models::DEFAULT_CONTENT_TYPE.to_string(),
            content_encoding: Some(crate::models::DEFAULT_CONTENT_ENCODING.to_string()),
            filename: None,
        }
    }
}

/// What a backend knows about one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStat {
    pub checksum: Checksum,
    pub size: u64,
    #[serde(flatten)]
    pub metadata: BlobMetadata,
    pub stored_at: DateTime<Utc>,
    pub backend: String,
}

/// A content-addressed storage target.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`has`](Backend::has) | Existence check |
/// | [`stat`](Backend::stat) | Size and metadata, `None` when absent |
/// | [`get`](Backend::get) | Object bytes, `None` when absent |
/// | [`put`](Backend::put) | Store (or overwrite) an object |
/// | [`delete`](Backend::delete) | Remove; `false` when it was absent |
/// | [`list`](Backend::list) | Every stored checksum |
#[async_trait]
pub trait Backend: Send + Sync {
    /// Configured name, unique within a content store.
    fn name(&self) -> &str;

    /// Implementation kind (`memory`, `sqlite`, `fs`, `s3`).
    fn kind(&self) -> &'static str;

    async fn has(&self, checksum: &Checksum) -> Result<bool>;

    async fn stat(&self, checksum: &Checksum) -> Result<Option<ObjectStat>>;

    async fn get(&self, checksum: &Checksum) -> Result<Option<Vec<u8>>>;

    async fn put(&self, checksum: &Checksum, data: &[u8], metadata: &BlobMetadata) -> Result<()>;

    async fn delete(&self, checksum: &Checksum) -> Result<bool>;

    async fn list(&self) -> Result<Vec<Checksum>>;
}
