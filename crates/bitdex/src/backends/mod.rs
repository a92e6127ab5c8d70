//! Concrete blob backends and their construction from config.

pub mod fs;
pub mod s3;
pub mod sqlite;

use std::sync::Arc;

use anyhow::Result;
use bitdex_core::store::memory::MemoryBackend;
use bitdex_core::store::Backend;
use sqlx::SqlitePool;

use crate::config::{BackendConfig, BackendKind};

/// Instantiate the backend described by one `[backends.<name>]` table.
pub fn build_backend(
    name: &str,
    config: &BackendConfig,
    pool: &SqlitePool,
) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match &config.kind {
        BackendKind::Memory => Arc::new(MemoryBackend::new(name)),
        BackendKind::Sqlite => Arc::new(sqlite::SqliteBackend::new(name, pool.clone())),
        BackendKind::Fs { root } => Arc::new(fs::FsBackend::new(name, root)?),
        BackendKind::S3 {
            bucket,
            prefix,
            region,
            endpoint_url,
        } => Arc::new(s3::S3Backend::new(
            name,
            bucket,
            prefix,
            region,
            endpoint_url.as_deref(),
        )?),
    };
    tracing::debug!(backend = name, kind = backend.kind(), "backend configured");
    Ok(backend)
}
