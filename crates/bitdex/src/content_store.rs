//! Content-addressed blob storage across several named backends.
//!
//! A [`ContentStore`] owns every configured [`Backend`] plus an optional
//! [`BlobCache`]. Each call names the backends to use, in priority order;
//! an empty list means the configured defaults.
//!
//! # Failure policy
//!
//! Every backend call is bounded by that backend's timeout. A failure or a
//! timeout on a backend with `ignore_backend_errors` is retried up to
//! `max_retries` times, logged, and skipped. On any other backend it aborts
//! the call; an aborted insert deletes the objects it already wrote.
//!
//! # Cancellation
//!
//! Dropping an insert future mid-flight leaves no objects behind: a guard
//! schedules deletion of everything written so far on the current runtime.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bitdex_core::checksum::canonical_json;
use bitdex_core::store::cache::{BlobCache, CacheStats};
use bitdex_core::store::{Backend, BlobMetadata, ObjectStat};
use bitdex_core::{BackendFailure, Checksum, ChecksumAlgorithm, IndexError, IndexResult};
use serde::Serialize;

use crate::config::BackendConfig;

/// Scheme of the storage paths recorded on documents.
pub const STORAGE_PATH_SCHEME: &str = "bitdex://";

/// `bitdex://<backend>/checksum/<algorithm>/<digest>`
pub fn storage_path(backend: &str, checksum: &Checksum) -> String {
    format!(
        "{}{}/checksum/{}/{}",
        STORAGE_PATH_SCHEME, backend, checksum.algorithm, checksum.digest
    )
}

/// Split a storage path into backend name and checksum.
pub fn parse_storage_path(path: &str) -> IndexResult<(String, Checksum)> {
    const OP: &str = "parse_storage_path";
    let rest = path.strip_prefix(STORAGE_PATH_SCHEME).ok_or_else(|| {
        IndexError::validation(OP, format!("'{}' does not start with {}", path, STORAGE_PATH_SCHEME))
    })?;
    let parts: Vec<&str> = rest.split('/').collect();
    match parts.as_slice() {
        [backend, "checksum", algo, digest] if !backend.is_empty() => {
            Ok((backend.to_string(), Checksum::new(algo.parse()?, digest)?))
        }
        _ => Err(IndexError::validation(
            OP,
            format!("'{}' is not a storage path", path),
        )),
    }
}

/// Per-backend behaviour switches.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BackendFlags {
    pub local_cache_enabled: bool,
    pub ignore_backend_errors: bool,
    pub dedup: bool,
    #[serde(serialize_with = "serialize_millis")]
    pub timeout: Duration,
    pub max_retries: u32,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl Default for BackendFlags {
    fn default() -> Self {
        Self {
            local_cache_enabled: true,
            ignore_backend_errors: false,
            dedup: true,
            timeout: Duration::from_secs(30),
            max_retries: 2,
        }
    }
}

impl From<&BackendConfig> for BackendFlags {
    fn from(config: &BackendConfig) -> Self {
        Self {
            local_cache_enabled: config.local_cache_enabled,
            ignore_backend_errors: config.ignore_backend_errors,
            dedup: config.dedup,
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum BackendStatus {
    Online,
    /// Skipped by every call until set back online.
    Offline,
    /// Last call failed; the backend is still tried.
    Error(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub name: String,
    pub kind: &'static str,
    pub status: BackendStatus,
    pub flags: BackendFlags,
}

/// What happened on one backend during a multi-backend call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum BackendOutcome {
    Stored,
    /// The backend already held the object.
    Deduplicated,
    Deleted,
    /// Nothing to delete.
    Missing,
    Skipped { reason: String },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendReport {
    pub backend: String,
    #[serde(flatten)]
    pub outcome: BackendOutcome,
}

/// Result of an insert.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreReceipt {
    pub checksum: Checksum,
    pub size: u64,
    /// One storage path per backend that holds the object.
    pub storage_paths: Vec<String>,
    pub backends: Vec<BackendReport>,
}

impl StoreReceipt {
    pub fn failures(&self) -> Vec<&BackendReport> {
        self.backends
            .iter()
            .filter(|r| matches!(r.outcome, BackendOutcome::Failed { .. }))
            .collect()
    }
}

/// Result of a delete.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub checksum: Checksum,
    pub backends: Vec<BackendReport>,
}

impl DeleteReport {
    /// Whether at least one backend actually removed the object.
    pub fn deleted(&self) -> bool {
        self.backends
            .iter()
            .any(|r| r.outcome == BackendOutcome::Deleted)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Confirm a cache hit with a backend `has()` before returning it.
    pub strict: bool,
}

struct BackendEntry {
    backend: Arc<dyn Backend>,
    flags: BackendFlags,
    status: RwLock<BackendStatus>,
}

impl BackendEntry {
    fn name(&self) -> &str {
        self.backend.name()
    }

    fn status(&self) -> BackendStatus {
        self.status
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn set_status(&self, status: BackendStatus) {
        *self.status.write().unwrap_or_else(|p| p.into_inner()) = status;
    }

    fn is_offline(&self) -> bool {
        self.status() == BackendStatus::Offline
    }

    fn record_result(&self, error: Option<&IndexError>) {
        let mut status = self.status.write().unwrap_or_else(|p| p.into_inner());
        if *status == BackendStatus::Offline {
            return;
        }
        *status = match error {
            Some(e) => BackendStatus::Error(e.to_string()),
            None => BackendStatus::Online,
        };
    }
}

/// Deletes freshly written objects unless the insert completes.
struct WriteGuard {
    checksum: Checksum,
    written: Vec<Arc<dyn Backend>>,
    cache: Option<Arc<BlobCache>>,
    armed: bool,
}

impl WriteGuard {
    fn new(checksum: &Checksum) -> Self {
        Self {
            checksum: checksum.clone(),
            written: Vec::new(),
            cache: None,
            armed: true,
        }
    }

    fn commit(mut self) {
        self.armed = false;
    }

    async fn rollback(mut self) {
        self.armed = false;
        if let Some(cache) = self.cache.take() {
            cache.remove(&self.checksum);
        }
        for backend in std::mem::take(&mut self.written) {
            if let Err(e) = backend.delete(&self.checksum).await {
                tracing::warn!(
                    backend = backend.name(),
                    checksum = %self.checksum,
                    "rollback delete failed: {:#}",
                    e
                );
            }
        }
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(cache) = self.cache.take() {
            cache.remove(&self.checksum);
        }
        let written = std::mem::take(&mut self.written);
        if written.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(checksum = %self.checksum, "insert cancelled outside a runtime; objects left behind");
            return;
        };
        let checksum = self.checksum.clone();
        tracing::debug!(checksum = %checksum, backends = written.len(), "rolling back cancelled insert");
        handle.spawn(async move {
            for backend in written {
                if let Err(e) = backend.delete(&checksum).await {
                    tracing::warn!(backend = backend.name(), checksum = %checksum, "rollback delete failed: {:#}", e);
                }
            }
        });
    }
}

pub struct ContentStore {
    backends: BTreeMap<String, BackendEntry>,
    default_backends: Vec<String>,
    cache: Option<Arc<BlobCache>>,
    algorithm: ChecksumAlgorithm,
}

impl ContentStore {
    pub fn new(
        algorithm: ChecksumAlgorithm,
        cache: Option<BlobCache>,
        default_backends: Vec<String>,
    ) -> Self {
        Self {
            backends: BTreeMap::new(),
            default_backends,
            cache: cache.map(Arc::new),
            algorithm,
        }
    }

    /// Register a backend. Names must be unique.
    pub fn add_backend(&mut self, backend: Arc<dyn Backend>, flags: BackendFlags) -> IndexResult<()> {
        let name = backend.name().to_string();
        if self.backends.contains_key(&name) {
            return Err(IndexError::validation(
                "add_backend",
                format!("backend '{}' is already registered", name),
            ));
        }
        self.backends.insert(
            name,
            BackendEntry {
                backend,
                flags,
                status: RwLock::new(BackendStatus::Online),
            },
        );
        Ok(())
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn default_backends(&self) -> &[String] {
        &self.default_backends
    }

    pub fn list_backends(&self) -> Vec<BackendInfo> {
        self.backends
            .values()
            .map(|e| BackendInfo {
                name: e.name().to_string(),
                kind: e.backend.kind(),
                status: e.status(),
                flags: e.flags,
            })
            .collect()
    }

    pub fn backend_status(&self, name: &str) -> IndexResult<BackendStatus> {
        Ok(self.entry("backend_status", name)?.status())
    }

    pub fn set_backend_status(&self, name: &str, status: BackendStatus) -> IndexResult<()> {
        let entry = self.entry("set_backend_status", name)?;
        tracing::info!(backend = name, ?status, "backend status changed");
        entry.set_status(status);
        Ok(())
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    fn entry(&self, operation: &'static str, name: &str) -> IndexResult<&BackendEntry> {
        self.backends
            .get(name)
            .ok_or_else(|| IndexError::not_found(operation, "backend", name))
    }

    /// Entries for the requested names, defaults when empty.
    fn resolve(&self, operation: &'static str, names: &[String]) -> IndexResult<Vec<&BackendEntry>> {
        let names = if names.is_empty() {
            &self.default_backends
        } else {
            names
        };
        if names.is_empty() {
            return Err(IndexError::validation(operation, "no backends requested"));
        }
        names.iter().map(|n| self.entry(operation, n)).collect()
    }

    /// The cache, when `entry` reads and writes through it.
    fn cache_for(&self, entry: &BackendEntry) -> Option<&Arc<BlobCache>> {
        self.cache.as_ref().filter(|_| entry.flags.local_cache_enabled)
    }

    /// Run one backend call with the backend's timeout and retry policy.
    async fn call<T, F, Fut>(
        &self,
        entry: &BackendEntry,
        operation: &'static str,
        checksum: &Checksum,
        f: F,
    ) -> IndexResult<T>
    where
        F: Fn(Arc<dyn Backend>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let attempts = if entry.flags.ignore_backend_errors {
            entry.flags.max_retries + 1
        } else {
            1
        };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match tokio::time::timeout(entry.flags.timeout, f(entry.backend.clone())).await {
                Ok(Ok(value)) => {
                    entry.record_result(None);
                    return Ok(value);
                }
                Ok(Err(e)) => IndexError::Backend {
                    operation,
                    backend: entry.name().to_string(),
                    key: checksum.to_string(),
                    message: format!("{:#}", e),
                },
                Err(_) => IndexError::Timeout {
                    operation,
                    backend: entry.name().to_string(),
                    key: checksum.to_string(),
                    timeout_ms: entry.flags.timeout.as_millis() as u64,
                },
            };
            if attempt >= attempts || !err.is_retryable() {
                entry.record_result(Some(&err));
                return Err(err);
            }
            tracing::debug!(backend = entry.name(), attempt, "retrying after: {}", err);
        }
    }

    // ============ Insert ============

    /// Store `data` on the requested backends.
    pub async fn insert_blob(
        &self,
        data: &[u8],
        metadata: &BlobMetadata,
        backends: &[String],
    ) -> IndexResult<StoreReceipt> {
        const OP: &str = "insert_blob";
        let entries = self.resolve(OP, backends)?;
        let checksum = Checksum::compute(self.algorithm, data);
        let mut guard = WriteGuard::new(&checksum);
        let mut reports = Vec::with_capacity(entries.len());
        let mut storage_paths = Vec::new();
        let mut failures = Vec::new();

        for entry in entries {
            let name = entry.name().to_string();
            if entry.is_offline() {
                reports.push(BackendReport {
                    backend: name,
                    outcome: BackendOutcome::Skipped {
                        reason: "offline".to_string(),
                    },
                });
                continue;
            }

            if entry.flags.local_cache_enabled {
                if let Some(cache) = &self.cache {
                    if !cache.contains(&checksum) && cache.put(&checksum, data) && guard.cache.is_none() {
                        guard.cache = Some(cache.clone());
                    }
                }
            }

            let result = self.store_one(entry, &checksum, data, metadata).await;
            match result {
                Ok(outcome) => {
                    if outcome == BackendOutcome::Stored {
                        guard.written.push(entry.backend.clone());
                    }
                    storage_paths.push(storage_path(&name, &checksum));
                    reports.push(BackendReport {
                        backend: name,
                        outcome,
                    });
                }
                Err(e) if entry.flags.ignore_backend_errors => {
                    tracing::warn!(backend = %name, checksum = %checksum, "ignoring backend failure: {}", e);
                    failures.push(BackendFailure {
                        backend: name.clone(),
                        message: e.to_string(),
                    });
                    reports.push(BackendReport {
                        backend: name,
                        outcome: BackendOutcome::Failed {
                            message: e.to_string(),
                        },
                    });
                }
                Err(e) => {
                    guard.rollback().await;
                    return Err(e);
                }
            }
        }

        if storage_paths.is_empty() {
            guard.rollback().await;
            if failures.is_empty() {
                return Err(IndexError::validation(
                    OP,
                    "every requested backend is offline",
                ));
            }
            return Err(IndexError::AllBackendsFailed {
                operation: OP,
                key: checksum.to_string(),
                failures,
            });
        }

        guard.commit();
        tracing::debug!(checksum = %checksum, size = data.len(), backends = storage_paths.len(), "blob stored");
        Ok(StoreReceipt {
            checksum,
            size: data.len() as u64,
            storage_paths,
            backends: reports,
        })
    }

    async fn store_one(
        &self,
        entry: &BackendEntry,
        checksum: &Checksum,
        data: &[u8],
        metadata: &BlobMetadata,
    ) -> IndexResult<BackendOutcome> {
        const OP: &str = "insert_blob";
        if entry.flags.dedup
            && self
                .call(entry, OP, checksum, |b| async move { b.has(checksum).await })
                .await?
        {
            return Ok(BackendOutcome::Deduplicated);
        }
        self.call(entry, OP, checksum, |b| async move {
            b.put(checksum, data, metadata).await
        })
        .await?;
        Ok(BackendOutcome::Stored)
    }

    /// Store a local file. The file name is kept in the blob metadata.
    pub async fn insert_file(
        &self,
        path: &Path,
        content_type: Option<&str>,
        backends: &[String],
    ) -> IndexResult<StoreReceipt> {
        let data = tokio::fs::read(path).await.map_err(|e| {
            IndexError::validation(
                "insert_file",
                format!("cannot read {}: {}", path.display(), e),
            )
        })?;
        let metadata = BlobMetadata {
            content_type: content_type
                .map(str::to_string)
                .unwrap_or_else(|| detect_content_type(path)),
            content_encoding: None,
            filename: path.file_name().map(|n| n.to_string_lossy().to_string()),
        };
        self.insert_blob(&data, &metadata, backends).await
    }

    /// Store a JSON body in canonical form.
    pub async fn insert_document_body(
        &self,
        body: &serde_json::Value,
        backends: &[String],
    ) -> IndexResult<StoreReceipt> {
        self.insert_blob(&canonical_json(body), &BlobMetadata::json(), backends)
            .await
    }

    // ============ Read ============

    /// Bytes of `checksum` from the cache or the first backend that has it.
    pub async fn get_blob(
        &self,
        checksum: &Checksum,
        backends: &[String],
        options: GetOptions,
    ) -> IndexResult<Vec<u8>> {
        const OP: &str = "get_blob";
        let entries = self.resolve(OP, backends)?;

        for entry in &entries {
            if let Some(cache) = self.cache_for(entry) {
                if let Some(hit) = cache.get(checksum) {
                    if !options.strict || self.any_has(&entries, OP, checksum).await? {
                        tracing::debug!(backend = entry.name(), checksum = %checksum, "cache hit");
                        return Ok(hit.as_ref().clone());
                    }
                    tracing::debug!(checksum = %checksum, "evicting cache entry no backend confirms");
                    cache.remove(checksum);
                }
            }
            if entry.is_offline() {
                continue;
            }
            let fetched = self
                .call(entry, OP, checksum, |b| async move { b.get(checksum).await })
                .await
                .and_then(|data| match data {
                    Some(bytes) if Checksum::compute(checksum.algorithm, &bytes) != *checksum => {
                        Err(IndexError::Backend {
                            operation: OP,
                            backend: entry.name().to_string(),
                            key: checksum.to_string(),
                            message: "stored bytes do not match their checksum".to_string(),
                        })
                    }
                    other => Ok(other),
                });
            match fetched {
                Ok(Some(bytes)) => {
                    if let Some(cache) = self.cache_for(entry) {
                        cache.put(checksum, &bytes);
                    }
                    return Ok(bytes);
                }
                Ok(None) => continue,
                Err(e) if entry.flags.ignore_backend_errors => {
                    tracing::warn!(backend = entry.name(), checksum = %checksum, "ignoring backend failure: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(IndexError::not_found(OP, "blob", checksum.to_string()))
    }

    /// Parse a stored JSON body.
    pub async fn get_document(
        &self,
        checksum: &Checksum,
        backends: &[String],
        options: GetOptions,
    ) -> IndexResult<serde_json::Value> {
        let bytes = self.get_blob(checksum, backends, options).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| IndexError::serialization("get_document", e.to_string()))
    }

    /// Write a blob to `dest`; returns the byte count.
    pub async fn get_file(
        &self,
        checksum: &Checksum,
        dest: &Path,
        backends: &[String],
        options: GetOptions,
    ) -> IndexResult<u64> {
        let bytes = self.get_blob(checksum, backends, options).await?;
        tokio::fs::write(dest, &bytes).await.map_err(|e| {
            IndexError::validation(
                "get_file",
                format!("cannot write {}: {}", dest.display(), e),
            )
        })?;
        Ok(bytes.len() as u64)
    }

    async fn any_has(
        &self,
        entries: &[&BackendEntry],
        operation: &'static str,
        checksum: &Checksum,
    ) -> IndexResult<bool> {
        for entry in entries {
            if entry.is_offline() {
                continue;
            }
            match self
                .call(entry, operation, checksum, |b| async move { b.has(checksum).await })
                .await
            {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) if entry.flags.ignore_backend_errors => {
                    tracing::warn!(backend = entry.name(), checksum = %checksum, "ignoring backend failure: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    /// Whether any requested backend, or the cache of one that uses it,
    /// holds `checksum`.
    pub async fn has(&self, checksum: &Checksum, backends: &[String]) -> IndexResult<bool> {
        const OP: &str = "has_blob";
        let entries = self.resolve(OP, backends)?;
        for (i, entry) in entries.iter().enumerate() {
            if self.cache_for(entry).is_some_and(|c| c.contains(checksum)) {
                return Ok(true);
            }
            if self.any_has(&entries[i..=i], OP, checksum).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Metadata from the first backend that has the object.
    pub async fn stat(&self, checksum: &Checksum, backends: &[String]) -> IndexResult<ObjectStat> {
        const OP: &str = "stat_blob";
        for entry in self.resolve(OP, backends)? {
            if entry.is_offline() {
                continue;
            }
            match self
                .call(entry, OP, checksum, |b| async move { b.stat(checksum).await })
                .await
            {
                Ok(Some(stat)) => return Ok(stat),
                Ok(None) => {}
                Err(e) if entry.flags.ignore_backend_errors => {
                    tracing::warn!(backend = entry.name(), checksum = %checksum, "ignoring backend failure: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(IndexError::not_found(OP, "blob", checksum.to_string()))
    }

    // ============ Delete ============

    /// Delete from every requested backend.
    ///
    /// Failures on backends without `ignore_backend_errors` fail the call
    /// with `PartialFailure` (or `AllBackendsFailed` when nothing was
    /// deleted); ignored failures only appear in the report.
    pub async fn delete(&self, checksum: &Checksum, backends: &[String]) -> IndexResult<DeleteReport> {
        const OP: &str = "delete_blob";
        let entries = self.resolve(OP, backends)?;
        let mut reports = Vec::with_capacity(entries.len());
        let mut succeeded = Vec::new();
        let mut failures = Vec::new();

        for entry in entries {
            let name = entry.name().to_string();
            if entry.flags.local_cache_enabled {
                if let Some(cache) = &self.cache {
                    cache.remove(checksum);
                }
            }
            if entry.is_offline() {
                reports.push(BackendReport {
                    backend: name,
                    outcome: BackendOutcome::Skipped {
                        reason: "offline".to_string(),
                    },
                });
                continue;
            }
            let outcome = match self
                .call(entry, OP, checksum, |b| async move { b.delete(checksum).await })
                .await
            {
                Ok(true) => {
                    succeeded.push(name.clone());
                    BackendOutcome::Deleted
                }
                Ok(false) => {
                    succeeded.push(name.clone());
                    BackendOutcome::Missing
                }
                Err(e) => {
                    if entry.flags.ignore_backend_errors {
                        tracing::warn!(backend = %name, checksum = %checksum, "ignoring backend failure: {}", e);
                    } else {
                        failures.push(BackendFailure {
                            backend: name.clone(),
                            message: e.to_string(),
                        });
                    }
                    BackendOutcome::Failed {
                        message: e.to_string(),
                    }
                }
            };
            reports.push(BackendReport {
                backend: name,
                outcome,
            });
        }

        if !failures.is_empty() {
            return Err(if succeeded.is_empty() {
                IndexError::AllBackendsFailed {
                    operation: OP,
                    key: checksum.to_string(),
                    failures,
                }
            } else {
                IndexError::PartialFailure {
                    operation: OP,
                    key: checksum.to_string(),
                    succeeded,
                    failures,
                }
            });
        }
        tracing::debug!(checksum = %checksum, "blob deleted");
        Ok(DeleteReport {
            checksum: checksum.clone(),
            backends: reports,
        })
    }

    /// Every checksum held by one backend.
    pub async fn list(&self, backend: &str) -> IndexResult<Vec<Checksum>> {
        const OP: &str = "list_blobs";
        let entry = self.entry(OP, backend)?;
        match tokio::time::timeout(entry.flags.timeout, entry.backend.list()).await {
            Ok(Ok(keys)) => Ok(keys),
            Ok(Err(e)) => Err(IndexError::Backend {
                operation: OP,
                backend: backend.to_string(),
                key: "*".to_string(),
                message: format!("{:#}", e),
            }),
            Err(_) => Err(IndexError::Timeout {
                operation: OP,
                backend: backend.to_string(),
                key: "*".to_string(),
                timeout_ms: entry.flags.timeout.as_millis() as u64,
            }),
        }
    }
}

/// MIME type from a file extension.
fn detect_content_type(path: &Path) -> String {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "json" => "application/json",
        "md" => "text/markdown",
        "txt" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "yaml" | "yml" => "text/yaml",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bitdex_core::store::cache::CacheLimits;
    use bitdex_core::store::memory::MemoryBackend;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn flags(ignore: bool, cache: bool) -> BackendFlags {
        BackendFlags {
            local_cache_enabled: cache,
            ignore_backend_errors: ignore,
            dedup: true,
            timeout: Duration::from_millis(200),
            max_retries: 1,
        }
    }

    fn store_with(
        backends: &[(&Arc<MemoryBackend>, BackendFlags)],
        cache: bool,
    ) -> ContentStore {
        let cache = cache.then(|| BlobCache::new(CacheLimits::default()));
        let mut store = ContentStore::new(ChecksumAlgorithm::Sha256, cache, names(&["b1"]));
        for (backend, f) in backends {
            let b: Arc<dyn Backend> = (*backend).clone();
            store.add_backend(b, *f).unwrap();
        }
        store
    }

    /// Never answers; used to exercise timeouts and cancellation.
    struct StuckBackend;

    #[async_trait]
    impl Backend for StuckBackend {
        fn name(&self) -> &str {
            "stuck"
        }
        fn kind(&self) -> &'static str {
            "test"
        }
        async fn has(&self, _: &Checksum) -> anyhow::Result<bool> {
            Ok(false)
        }
        async fn stat(&self, _: &Checksum) -> anyhow::Result<Option<ObjectStat>> {
            Ok(None)
        }
        async fn get(&self, _: &Checksum) -> anyhow::Result<Option<Vec<u8>>> {
            Ok(None)
        }
        async fn put(&self, _: &Checksum, _: &[u8], _: &BlobMetadata) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
        async fn delete(&self, _: &Checksum) -> anyhow::Result<bool> {
            Ok(false)
        }
        async fn list(&self) -> anyhow::Result<Vec<Checksum>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_fallback_past_ignored_failure() {
        let b1 = Arc::new(MemoryBackend::new("b1"));
        let b2 = Arc::new(MemoryBackend::new("b2"));
        b1.set_failing(true);
        let store = store_with(&[(&b1, flags(true, false)), (&b2, flags(false, false))], false);

        let receipt = store
            .insert_blob(b"body", &BlobMetadata::default(), &names(&["b1", "b2"]))
            .await
            .unwrap();
        assert_eq!(receipt.storage_paths, vec![storage_path("b2", &receipt.checksum)]);
        assert_eq!(receipt.failures().len(), 1);
        assert_eq!(b2.len(), 1);

        let bytes = store
            .get_blob(&receipt.checksum, &names(&["b1", "b2"]), GetOptions::default())
            .await
            .unwrap();
        assert_eq!(bytes, b"body");
        assert!(matches!(
            store.backend_status("b1").unwrap(),
            BackendStatus::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_strict_failure_stops_before_next_backend() {
        let b1 = Arc::new(MemoryBackend::new("b1"));
        let b2 = Arc::new(MemoryBackend::new("b2"));
        b1.set_failing(true);
        let store = store_with(&[(&b1, flags(false, false)), (&b2, flags(false, false))], false);

        let err = store
            .insert_blob(b"body", &BlobMetadata::default(), &names(&["b1", "b2"]))
            .await
            .unwrap_err();
        assert_eq!(err.backend_name(), Some("b1"));
        assert!(b2.is_empty());
    }

    #[tokio::test]
    async fn test_abort_rolls_back_earlier_writes() {
        let b1 = Arc::new(MemoryBackend::new("b1"));
        let b2 = Arc::new(MemoryBackend::new("b2"));
        b2.set_failing(true);
        let store = store_with(&[(&b1, flags(false, true)), (&b2, flags(false, false))], true);

        let sum = Checksum::compute(ChecksumAlgorithm::Sha256, b"body");
        assert!(store
            .insert_blob(b"body", &BlobMetadata::default(), &names(&["b1", "b2"]))
            .await
            .is_err());
        assert!(b1.is_empty());
        assert!(!store.has(&sum, &names(&["b1"])).await.unwrap());
    }

    #[tokio::test]
    async fn test_all_backends_failed() {
        let b1 = Arc::new(MemoryBackend::new("b1"));
        b1.set_failing(true);
        let store = store_with(&[(&b1, flags(true, false))], false);
        let err = store
            .insert_blob(b"x", &BlobMetadata::default(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::AllBackendsFailed { .. }));
    }

    #[tokio::test]
    async fn test_dedup_and_cache() {
        let b1 = Arc::new(MemoryBackend::new("b1"));
        let store = store_with(&[(&b1, flags(false, true))], true);
        let first = store
            .insert_blob(b"same", &BlobMetadata::default(), &[])
            .await
            .unwrap();
        let second = store
            .insert_blob(b"same", &BlobMetadata::default(), &[])
            .await
            .unwrap();
        assert_eq!(first.backends[0].outcome, BackendOutcome::Stored);
        assert_eq!(second.backends[0].outcome, BackendOutcome::Deduplicated);

        // Served from cache even after the backend goes away.
        b1.set_failing(true);
        let bytes = store
            .get_blob(&first.checksum, &[], GetOptions::default())
            .await
            .unwrap();
        assert_eq!(bytes, b"same");
        // Strict reads must confirm with a backend.
        assert!(store
            .get_blob(&first.checksum, &[], GetOptions { strict: true })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cache_applies_only_to_caching_backends() {
        let b1 = Arc::new(MemoryBackend::new("b1"));
        let b2 = Arc::new(MemoryBackend::new("b2"));
        let store = store_with(&[(&b1, flags(false, false)), (&b2, flags(false, true))], true);
        let receipt = store
            .insert_blob(b"body", &BlobMetadata::default(), &names(&["b1", "b2"]))
            .await
            .unwrap();

        b1.set_failing(true);
        b2.set_failing(true);
        // b1 is consulted first and does not use the cache.
        let err = store
            .get_blob(&receipt.checksum, &names(&["b1", "b2"]), GetOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.backend_name(), Some("b1"));
        assert!(store.has(&receipt.checksum, &names(&["b1"])).await.is_err());

        let bytes = store
            .get_blob(&receipt.checksum, &names(&["b2", "b1"]), GetOptions::default())
            .await
            .unwrap();
        assert_eq!(bytes, b"body");
        assert!(store.has(&receipt.checksum, &names(&["b2"])).await.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_counts_as_backend_error() {
        let b2 = Arc::new(MemoryBackend::new("b2"));
        let mut store = ContentStore::new(ChecksumAlgorithm::Sha256, None, names(&["stuck", "b2"]));
        store
            .add_backend(Arc::new(StuckBackend), flags(true, false))
            .unwrap();
        store.add_backend(b2.clone(), flags(false, false)).unwrap();

        let receipt = store
            .insert_blob(b"slow", &BlobMetadata::default(), &[])
            .await
            .unwrap();
        assert!(matches!(
            receipt.backends[0].outcome,
            BackendOutcome::Failed { .. }
        ));
        assert_eq!(b2.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_insert_leaves_nothing_behind() {
        let b1 = Arc::new(MemoryBackend::new("b1"));
        let mut store = ContentStore::new(ChecksumAlgorithm::Sha256, None, names(&["b1", "stuck"]));
        store.add_backend(b1.clone(), flags(false, false)).unwrap();
        let mut slow = flags(false, false);
        slow.timeout = Duration::from_secs(60);
        store.add_backend(Arc::new(StuckBackend), slow).unwrap();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            store.insert_blob(b"partial", &BlobMetadata::default(), &[]),
        )
        .await;
        assert!(cancelled.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b1.is_empty());
    }

    #[tokio::test]
    async fn test_delete_reports_per_backend() {
        let b1 = Arc::new(MemoryBackend::new("b1"));
        let b2 = Arc::new(MemoryBackend::new("b2"));
        let store = store_with(&[(&b1, flags(false, false)), (&b2, flags(false, false))], false);
        let receipt = store
            .insert_blob(b"gone", &BlobMetadata::default(), &names(&["b1"]))
            .await
            .unwrap();

        let report = store
            .delete(&receipt.checksum, &names(&["b1", "b2"]))
            .await
            .unwrap();
        assert!(report.deleted());
        assert_eq!(report.backends[0].outcome, BackendOutcome::Deleted);
        assert_eq!(report.backends[1].outcome, BackendOutcome::Missing);

        store
            .insert_blob(b"gone", &BlobMetadata::default(), &names(&["b1", "b2"]))
            .await
            .unwrap();
        b2.set_failing(true);
        let err = store
            .delete(&receipt.checksum, &names(&["b1", "b2"]))
            .await
            .unwrap_err();
        match err {
            IndexError::PartialFailure {
                succeeded, failures, ..
            } => {
                assert_eq!(succeeded, vec!["b1"]);
                assert_eq!(failures[0].backend, "b2");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offline_backends_are_skipped() {
        let b1 = Arc::new(MemoryBackend::new("b1"));
        let b2 = Arc::new(MemoryBackend::new("b2"));
        let store = store_with(&[(&b1, flags(false, false)), (&b2, flags(false, false))], false);
        store.set_backend_status("b1", BackendStatus::Offline).unwrap();
        let receipt = store
            .insert_blob(b"x", &BlobMetadata::default(), &names(&["b1", "b2"]))
            .await
            .unwrap();
        assert!(b1.is_empty());
        assert_eq!(receipt.storage_paths.len(), 1);
        assert!(store.set_backend_status("nope", BackendStatus::Online).is_err());
    }

    #[tokio::test]
    async fn test_stat_and_document_body() {
        let b1 = Arc::new(MemoryBackend::new("b1"));
        let store = store_with(&[(&b1, flags(false, false))], false);
        let body = serde_json::json!({"b": 2, "a": 1});
        let receipt = store.insert_document_body(&body, &[]).await.unwrap();
        let stat = store.stat(&receipt.checksum, &[]).await.unwrap();
        assert_eq!(stat.metadata.content_type, "application/json");
        assert_eq!(stat.size, br#"{"a":1,"b":2}"#.len() as u64);
        let back = store
            .get_document(&receipt.checksum, &[], GetOptions::default())
            .await
            .unwrap();
        assert_eq!(back, body);

        let missing = Checksum::compute(ChecksumAlgorithm::Sha256, b"nothing");
        assert!(store.stat(&missing, &[]).await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_storage_paths() {
        let sum = Checksum::compute(ChecksumAlgorithm::Sha256, b"p");
        let path = storage_path("local", &sum);
        assert!(path.starts_with("bitdex://local/checksum/sha256/"));
        assert_eq!(parse_storage_path(&path).unwrap(), ("local".to_string(), sum));
        assert!(parse_storage_path("s3://x/y").is_err());
    }
}
