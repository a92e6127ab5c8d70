//! The engine handle.
//!
//! [`Engine`] ties together the [`DocumentIndex`], the [`ContextTree`], the
//! [`ContentStore`] and the [`EventBus`]. It is built once with
//! [`Engine::open`] and torn down with [`Engine::shutdown`]; there is no
//! global state.
//!
//! Callers address contexts by path (`/projects/reports`). The engine maps
//! paths to context labels through the tree, creating missing nodes on
//! insert. A context query for a path matches documents filed anywhere in
//! its subtree.
//!
//! # Concurrency
//!
//! Mutations of one document id are serialized by a keyed lock, as are
//! inserts of the same primary checksum and writes or purges of the same
//! body. Index and tree state are applied in short synchronous critical
//! sections; no lock on either is held across an `.await`. Context labels
//! resolved by an in-flight mutation are reserved until it finishes, so a
//! concurrent failure never undoes a node still about to be ticked.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Context, Result};
use bitdex_core::checksum::canonical_json;
use bitdex_core::index::IndexSettings;
use bitdex_core::store::cache::{BlobCache, CacheLimits};
use bitdex_core::store::{BlobMetadata, ObjectStat};
use bitdex_core::tree::{
    join_path, normalize_path, segments, ContextTree, InsertedPath, LayerKind, LayerUpdate,
    LayerView, NodeView, RemovedPath, WorkspaceInfo, CONTEXT_LABEL_ROOT, ROOT_PATH,
};
use bitdex_core::{
    Checksum, Dimension, Document, DocumentIndex, DocumentPatch, FindOptions, FindResult,
    IndexError, IndexResult, InsertOutcome, LabelQuery, RemoveOutcome,
};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::backends::build_backend;
use crate::config::Config;
use crate::content_store::{
    parse_storage_path, storage_path, BackendFlags, BackendOutcome, BackendStatus, ContentStore, DeleteReport,
    GetOptions, StoreReceipt,
};
use crate::events::{Event, EventBus, Subscription};
use crate::locks::KeyedLocks;
use crate::{db, migrate, persist};

/// Nodes an insert created, so they can be taken back if the insert fails.
struct CreatedPath {
    /// Topmost node that did not exist before.
    top: String,
    layers: Vec<String>,
}

type PendingLabels = Mutex<HashMap<String, usize>>;

/// Context labels held by one in-flight mutation. Released on drop.
struct LabelReservation<'a> {
    pending: &'a PendingLabels,
    labels: Vec<String>,
}

impl<'a> LabelReservation<'a> {
    fn new(pending: &'a PendingLabels, labels: &[String]) -> Self {
        let mut map = pending.lock().unwrap_or_else(|p| p.into_inner());
        for label in labels {
            *map.entry(label.clone()).or_insert(0) += 1;
        }
        Self {
            pending,
            labels: labels.to_vec(),
        }
    }
}

impl Drop for LabelReservation<'_> {
    fn drop(&mut self) {
        let mut map = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        for label in &self.labels {
            if let Some(count) = map.get_mut(label) {
                *count -= 1;
                if *count == 0 {
                    map.remove(label);
                }
            }
        }
    }
}

/// Labels for a set of context paths, with the nodes created to get them.
struct EnsuredPaths<'a> {
    labels: Vec<String>,
    created: Vec<CreatedPath>,
    reservation: LabelReservation<'a>,
}

pub struct Engine {
    config: Config,
    pool: SqlitePool,
    index: DocumentIndex,
    tree: RwLock<ContextTree>,
    store: ContentStore,
    events: EventBus,
    doc_locks: KeyedLocks<u32>,
    insert_locks: KeyedLocks<String>,
    body_locks: KeyedLocks<Checksum>,
    pending_labels: PendingLabels,
}

impl Engine {
    /// Open the database, restore the last snapshot, and build backends.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;

        let index = DocumentIndex::new(IndexSettings {
            max_labels: config.index.max_labels,
        });
        let tree = match persist::load(&pool).await? {
            Some((index_snapshot, tree_snapshot)) => {
                index
                    .restore(index_snapshot)
                    .context("Failed to restore index snapshot")?;
                ContextTree::restore(tree_snapshot).context("Failed to restore context tree")?
            }
            None => ContextTree::new(),
        };

        let cache = config.cache.enabled.then(|| {
            BlobCache::new(CacheLimits {
                max_entries: config.cache.max_entries,
                max_bytes: config.cache.max_bytes,
            })
        });
        let mut store = ContentStore::new(
            config.store.body_algorithm,
            cache,
            config.store.default_backends.clone(),
        );
        for (name, backend_config) in &config.backends {
            let backend = build_backend(name, backend_config, &pool)
                .with_context(|| format!("Failed to configure backend '{}'", name))?;
            store.add_backend(backend, BackendFlags::from(backend_config))?;
        }

        tracing::info!(
            db = %config.db.path.display(),
            documents = index.len(),
            backends = config.backends.len(),
            "engine opened"
        );
        Ok(Self {
            config,
            pool,
            index,
            tree: RwLock::new(tree),
            store,
            events: EventBus::default(),
            doc_locks: KeyedLocks::default(),
            insert_locks: KeyedLocks::default(),
            body_locks: KeyedLocks::default(),
            pending_labels: Mutex::new(HashMap::new()),
        })
    }

    /// Persist the snapshot and close the database.
    pub async fn shutdown(self) -> Result<()> {
        self.flush().await?;
        self.pool.close().await;
        tracing::info!("engine shut down");
        Ok(())
    }

    /// Write the current index and tree to the database.
    pub async fn flush(&self) -> Result<()> {
        let index_snapshot = self.index.snapshot()?;
        let tree_snapshot = self.tree_read().snapshot();
        persist::save(&self.pool, &index_snapshot, &tree_snapshot).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &DocumentIndex {
        &self.index
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    fn tree_read(&self) -> RwLockReadGuard<'_, ContextTree> {
        self.tree.read().unwrap_or_else(|p| p.into_inner())
    }

    fn tree_write(&self) -> RwLockWriteGuard<'_, ContextTree> {
        self.tree.write().unwrap_or_else(|p| p.into_inner())
    }

    /// A new document carrying the configured checksum options.
    pub fn new_document(&self, schema: &str, data: serde_json::Value) -> Document {
        let mut doc = Document::new(schema, data);
        doc.index = self.config.index.document_options();
        doc
    }

    // ============ Context paths ============

    /// Create missing paths and return their labels, reserved until the
    /// result drops. No paths means the root. Every path must be writable.
    fn ensure_paths(&self, paths: &[String]) -> IndexResult<EnsuredPaths<'_>> {
        if paths.is_empty() {
            return Ok(EnsuredPaths {
                labels: vec![CONTEXT_LABEL_ROOT.to_string()],
                created: Vec::new(),
                reservation: LabelReservation::new(&self.pending_labels, &[]),
            });
        }
        let mut tree = self.tree_write();
        let mut labels = Vec::with_capacity(paths.len());
        let mut created: Vec<CreatedPath> = Vec::new();
        let mut inserted_paths = Vec::new();
        for path in paths {
            let result = normalize_path(path).and_then(|normalized| {
                let top = first_missing_prefix(&tree, &normalized);
                let inserted = tree.insert_path(&normalized, true)?;
                Ok((top, inserted))
            });
            let (top, inserted) = match result {
                Ok(found) => found,
                Err(e) => {
                    self.undo_paths_locked(&mut tree, &created);
                    return Err(e);
                }
            };
            if let Some(top) = top {
                created.push(CreatedPath {
                    top,
                    layers: inserted.created_layers.clone(),
                });
                inserted_paths.push(inserted.path.clone());
            }
            if let Err(e) = tree.ensure_writable(&inserted.path) {
                self.undo_paths_locked(&mut tree, &created);
                return Err(e);
            }
            labels.push(inserted.label);
        }
        labels.sort();
        labels.dedup();
        let reservation = LabelReservation::new(&self.pending_labels, &labels);
        let version = tree.version();
        drop(tree);
        for path in inserted_paths {
            self.events.publish(Event::TreePathInserted { path, version });
        }
        Ok(EnsuredPaths {
            labels,
            created,
            reservation,
        })
    }

    /// Release a failed mutation's reservation, then take back the nodes it
    /// created.
    fn abandon_paths(&self, ensured: EnsuredPaths<'_>) {
        let EnsuredPaths {
            created,
            reservation,
            ..
        } = ensured;
        drop(reservation);
        if created.is_empty() {
            return;
        }
        let mut tree = self.tree_write();
        self.undo_paths_locked(&mut tree, &created);
    }

    fn undo_paths_locked(&self, tree: &mut ContextTree, created: &[CreatedPath]) {
        for c in created.iter().rev() {
            let in_use = tree
                .subtree_labels(&c.top)
                .map(|labels| labels.iter().any(|l| self.label_in_use(l)))
                .unwrap_or(true);
            if in_use {
                continue;
            }
            if let Err(e) = tree.remove_path(&c.top, true, true) {
                tracing::debug!(path = %c.top, "could not undo path: {}", e);
                continue;
            }
            for layer in &c.layers {
                if let Err(e) = tree.delete_layer(layer) {
                    tracing::debug!(layer = %layer, "could not undo layer: {}", e);
                }
            }
        }
    }

    /// Whether a context label has members or is reserved by an in-flight
    /// mutation.
    fn label_in_use(&self, label: &str) -> bool {
        if self.index.label_len(Dimension::Context, label) > 0 {
            return true;
        }
        self.pending_labels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(label)
    }

    /// Fail with `LayerLocked` if any path carrying one of `labels` runs
    /// through a locked layer.
    fn ensure_labels_writable(&self, labels: &[String]) -> IndexResult<()> {
        if labels.is_empty() {
            return Ok(());
        }
        let tree = self.tree_read();
        for path in tree.paths() {
            if tree.label_for(&path).is_ok_and(|l| labels.contains(&l)) {
                tree.ensure_writable(&path)?;
            }
        }
        Ok(())
    }

    /// Expand context query entries (paths, optionally `!`-negated) into
    /// subtree labels. Raw `context/...` labels pass through.
    fn context_query_labels(&self, entries: &[String]) -> IndexResult<Vec<String>> {
        let tree = self.tree_read();
        let mut out = Vec::new();
        for raw in entries {
            let (negated, body) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, raw.as_str()),
            };
            if body == CONTEXT_LABEL_ROOT || body.starts_with("context/") {
                out.push(raw.clone());
                continue;
            }
            match tree.subtree_labels(body) {
                Ok(labels) => out.extend(labels.into_iter().map(|l| {
                    if negated {
                        format!("!{}", l)
                    } else {
                        l
                    }
                })),
                // Excluding a path that does not exist excludes nothing.
                Err(e) if negated && e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    // ============ Documents ============

    /// Store the body of `doc`, then index it under `contexts` (paths) and
    /// `features`.
    ///
    /// Identical content resolves to the existing document, which gains the
    /// supplied contexts and features.
    pub async fn insert_document(
        &self,
        doc: Document,
        contexts: &[String],
        features: &[String],
        backends: &[String],
    ) -> IndexResult<InsertOutcome> {
        let ensured = self.ensure_paths(contexts)?;
        let result = self
            .insert_with_labels(doc, &ensured.labels, features, backends)
            .await;
        if result.is_err() {
            self.abandon_paths(ensured);
        }
        result
    }

    async fn insert_with_labels(
        &self,
        mut doc: Document,
        labels: &[String],
        features: &[String],
        backends: &[String],
    ) -> IndexResult<InsertOutcome> {
        const OP: &str = "insert_document";
        doc.validate_shape(OP)?;
        doc.apply_checksums(OP)?;
        let primary = doc
            .primary_checksum()
            .map(|digest| format!("{}:{}", doc.index.primary_checksum_algorithm, digest))
            .ok_or_else(|| IndexError::validation(OP, "primary checksum missing"))?;
        let _guard = self.insert_locks.lock(primary.clone()).await;
        let _body_guard = self.body_locks.lock(self.body_checksum(&doc.data)).await;

        let receipt = self.store.insert_document_body(&doc.data, backends).await?;
        for path in &receipt.storage_paths {
            if !doc.storage_paths.contains(path) {
                doc.storage_paths.push(path.clone());
            }
        }

        let outcome = match self.index.insert_document(doc, labels, features) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.discard_fresh_body(&receipt).await;
                return Err(e);
            }
        };

        if outcome.deduplicated {
            // The existing record keeps its own storage paths.
            self.discard_fresh_body(&receipt).await;
        } else {
            self.publish_stored(&receipt);
        }
        self.events.publish(if outcome.deduplicated {
            Event::DocumentDeduplicated {
                id: outcome.id,
                checksum: primary,
            }
        } else {
            Event::DocumentInserted {
                id: outcome.id,
                checksum: primary,
            }
        });
        Ok(outcome)
    }

    /// Delete a body this call wrote but no live document references.
    async fn discard_fresh_body(&self, receipt: &StoreReceipt) {
        let fresh: Vec<String> = receipt
            .backends
            .iter()
            .filter(|r| r.outcome == BackendOutcome::Stored)
            .filter(|r| {
                self.index
                    .documents_with_storage_path(&storage_path(&r.backend, &receipt.checksum))
                    .is_empty()
            })
            .map(|r| r.backend.clone())
            .collect();
        if fresh.is_empty() {
            return;
        }
        if let Err(e) = self.store.delete(&receipt.checksum, &fresh).await {
            tracing::warn!(checksum = %receipt.checksum, "could not discard body: {}", e);
        }
    }

    fn publish_stored(&self, receipt: &StoreReceipt) {
        let stored: Vec<String> = receipt
            .backends
            .iter()
            .filter(|r| r.outcome == BackendOutcome::Stored)
            .map(|r| r.backend.clone())
            .collect();
        if !stored.is_empty() {
            self.events.publish(Event::BlobStored {
                checksum: receipt.checksum.to_string(),
                backends: stored,
            });
        }
    }

    /// Body checksum of a JSON payload under the store's algorithm.
    fn body_checksum(&self, data: &serde_json::Value) -> Checksum {
        Checksum::compute(self.store.algorithm(), &canonical_json(data))
    }

    /// Merge `patch` into document `id`.
    ///
    /// `patch.contexts`, when set, holds paths and replaces the document's
    /// contexts. A changed `data` payload is stored as a new body.
    pub async fn update_document(
        &self,
        id: u32,
        patch: &DocumentPatch,
        backends: &[String],
    ) -> IndexResult<Document> {
        let _guard = self.doc_locks.lock(id).await;
        let current = self.index.get_document(id)?;

        let mut patch = patch.clone();
        let ensured = match &patch.contexts {
            Some(paths) => {
                let ensured = self.ensure_paths(paths)?;
                let dropped: Vec<String> = self
                    .index
                    .labels_of(Dimension::Context, id)
                    .into_iter()
                    .filter(|l| !ensured.labels.contains(l))
                    .collect();
                if let Err(e) = self.ensure_labels_writable(&dropped) {
                    self.abandon_paths(ensured);
                    return Err(e);
                }
                patch.contexts = Some(ensured.labels.clone());
                Some(ensured)
            }
            None => None,
        };

        let mut receipt = None;
        let mut _body_guard = None;
        if patch.data.is_some() {
            let mut preview = current.clone();
            patch.apply_to(&mut preview);
            if preview.data != current.data {
                _body_guard = Some(self.body_locks.lock(self.body_checksum(&preview.data)).await);
                let stored = match self.store.insert_document_body(&preview.data, backends).await {
                    Ok(r) => r,
                    Err(e) => {
                        if let Some(ensured) = ensured {
                            self.abandon_paths(ensured);
                        }
                        return Err(e);
                    }
                };
                let old_body = self.body_checksum(&current.data);
                let mut paths: Vec<String> = preview
                    .storage_paths
                    .into_iter()
                    .filter(|p| {
                        parse_storage_path(p)
                            .map(|(_, sum)| sum != old_body)
                            .unwrap_or(true)
                    })
                    .collect();
                for p in &stored.storage_paths {
                    if !paths.contains(p) {
                        paths.push(p.clone());
                    }
                }
                patch.storage_paths = Some(paths);
                receipt = Some(stored);
            }
        }

        match self.index.update_document(id, &patch) {
            Ok(doc) => {
                if let Some(r) = &receipt {
                    self.publish_stored(r);
                }
                self.events.publish(Event::DocumentUpdated { id });
                Ok(doc)
            }
            Err(e) => {
                if let Some(r) = &receipt {
                    self.discard_fresh_body(r).await;
                }
                if let Some(ensured) = ensured {
                    self.abandon_paths(ensured);
                }
                Err(e)
            }
        }
    }

    /// Remove document `id`. With `purge_body` its body is first deleted
    /// from every backend listed in its storage paths that no other live
    /// document references.
    pub async fn remove_document(&self, id: u32, purge_body: bool) -> IndexResult<RemoveOutcome> {
        let _guard = self.doc_locks.lock(id).await;
        self.ensure_labels_writable(&self.index.labels_of(Dimension::Context, id))?;
        if purge_body {
            match self.index.get_document(id) {
                Ok(doc) => self.purge_bodies(&doc).await?,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        let outcome = self.index.remove_document(id)?;
        if matches!(outcome, RemoveOutcome::Removed(_)) {
            self.events.publish(Event::DocumentRemoved { id });
        }
        Ok(outcome)
    }

    async fn purge_bodies(&self, doc: &Document) -> IndexResult<()> {
        let mut by_checksum: BTreeMap<Checksum, Vec<String>> = BTreeMap::new();
        for path in &doc.storage_paths {
            if let Ok((backend, checksum)) = parse_storage_path(path) {
                by_checksum.entry(checksum).or_default().push(backend);
            }
        }
        for (checksum, backends) in by_checksum {
            let _body_guard = self.body_locks.lock(checksum.clone()).await;
            let known: Vec<String> = backends
                .into_iter()
                .filter(|b| self.store.backend_status(b).is_ok())
                .filter(|b| {
                    self.index
                        .documents_with_storage_path(&storage_path(b, &checksum))
                        .iter()
                        .all(|&owner| owner == doc.id)
                })
                .collect();
            if known.is_empty() {
                continue;
            }
            self.store.delete(&checksum, &known).await?;
            self.events.publish(Event::BlobDeleted {
                checksum: checksum.to_string(),
            });
        }
        Ok(())
    }

    /// Insert a new version of `parent_id` with `patch` applied.
    ///
    /// The version inherits the parent's contexts unless `patch.contexts`
    /// names paths. The parent records the version and its
    /// `latest_version` advances.
    pub async fn create_version(
        &self,
        parent_id: u32,
        patch: &DocumentPatch,
        backends: &[String],
    ) -> IndexResult<InsertOutcome> {
        const OP: &str = "create_version";
        let _guard = self.doc_locks.lock(parent_id).await;
        let parent = self.index.get_document(parent_id)?;

        let mut child = parent.clone();
        patch.apply_to(&mut child);
        let now = Utc::now();
        child.id = 0;
        child.parent_id = Some(parent_id);
        child.versions.clear();
        child.version_number = parent.latest_version + 1;
        child.latest_version = child.version_number;
        child.created_at = now;
        child.updated_at = now;
        child.checksums.clear();
        child.storage_paths.clear();
        child.validate_shape(OP)?;
        child.apply_checksums(OP)?;
        if let Some(digest) = child.primary_checksum() {
            if let Some(existing) = self
                .index
                .document_id_by_checksum(child.index.primary_checksum_algorithm, digest)
            {
                return Err(IndexError::validation(
                    OP,
                    format!("version content is identical to document {}", existing),
                ));
            }
        }

        let ensured = match &patch.contexts {
            Some(paths) => self.ensure_paths(paths)?,
            None => {
                let inherited = self.index.labels_of(Dimension::Context, parent_id);
                self.ensure_labels_writable(&inherited)?;
                EnsuredPaths {
                    reservation: LabelReservation::new(&self.pending_labels, &inherited),
                    labels: inherited,
                    created: Vec::new(),
                }
            }
        };
        let outcome = match self
            .insert_with_labels(child, &ensured.labels, &[], backends)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.abandon_paths(ensured);
                return Err(e);
            }
        };
        let stored = self.index.get_document(outcome.id)?;
        self.index.link_version(parent_id, &stored)?;
        self.events.publish(Event::DocumentUpdated { id: parent_id });
        tracing::debug!(parent_id, id = outcome.id, version = stored.version_number, "version created");
        Ok(outcome)
    }

    pub fn get_document(&self, id: u32) -> IndexResult<Document> {
        self.index.get_document(id)
    }

    /// The stored body of document `id`, read from the backends named in
    /// its storage paths.
    pub async fn get_document_body(
        &self,
        id: u32,
        options: GetOptions,
    ) -> IndexResult<serde_json::Value> {
        const OP: &str = "get_document_body";
        let doc = self.index.get_document(id)?;
        let body = self.body_checksum(&doc.data);
        let backends: Vec<String> = doc
            .storage_paths
            .iter()
            .filter_map(|p| parse_storage_path(p).ok())
            .filter(|(b, sum)| *sum == body && self.store.backend_status(b).is_ok())
            .map(|(b, _)| b)
            .collect();
        if backends.is_empty() {
            return Err(IndexError::not_found(OP, "body", body.to_string()));
        }
        self.store.get_document(&body, &backends, options).await
    }

    pub fn has_document(&self, id: u32) -> bool {
        self.index.has_document(id)
    }

    pub fn has_document_by_checksum(&self, checksum: &Checksum) -> bool {
        self.index
            .has_document_by_checksum(checksum.algorithm, &checksum.digest)
    }

    /// Query with context paths, features and filters.
    pub fn find_documents(&self, query: &LabelQuery, options: FindOptions) -> IndexResult<FindResult> {
        let resolved = LabelQuery {
            contexts: self.context_query_labels(&query.contexts)?,
            features: query.features.clone(),
            filters: query.filters.clone(),
        };
        self.index.find_documents(&resolved, options)
    }

    /// Context paths a document is filed under.
    pub fn document_paths(&self, id: u32) -> IndexResult<Vec<String>> {
        if !self.index.has_document(id) {
            return Err(IndexError::not_found("document_paths", "document", id.to_string()));
        }
        let labels = self.index.labels_of(Dimension::Context, id);
        let tree = self.tree_read();
        Ok(tree
            .paths()
            .into_iter()
            .filter(|p| {
                tree.label_for(p)
                    .map(|l| labels.contains(&l))
                    .unwrap_or(false)
            })
            .collect())
    }

    // ============ Context tree ============

    pub fn insert_context(&self, path: &str) -> IndexResult<InsertedPath> {
        let mut tree = self.tree_write();
        let inserted = tree.insert_path(path, true)?;
        if inserted.changed {
            self.events.publish(Event::TreePathInserted {
                path: inserted.path.clone(),
                version: tree.version(),
            });
        }
        Ok(inserted)
    }

    /// Move `from` under `to_parent`; returns the new path.
    pub fn move_context(&self, from: &str, to_parent: &str, recursive: bool) -> IndexResult<String> {
        let from = normalize_path(from)?;
        let to_parent = normalize_path(to_parent)?;
        let mut tree = self.tree_write();
        let backup = tree.clone();
        let renames = tree.move_path(&from, &to_parent, recursive)?;
        if let Err(e) = self.index.rename_context_labels(&renames) {
            *tree = backup;
            return Err(e);
        }
        let name = segments(&from).last().map(|s| s.to_string()).unwrap_or_default();
        let to = join_path(&to_parent, &name);
        self.events.publish(Event::TreePathMoved {
            from,
            to: to.clone(),
            version: tree.version(),
        });
        Ok(to)
    }

    /// Copy the subtree at `from` under `to_parent`, documents included.
    /// Returns the number of memberships copied.
    pub fn copy_context(&self, from: &str, to_parent: &str) -> IndexResult<u64> {
        let from = normalize_path(from)?;
        let to_parent = normalize_path(to_parent)?;
        let mut tree = self.tree_write();
        let backup = tree.clone();
        let pairs = tree.copy_path(&from, &to_parent)?;
        match self.index.copy_context_labels(&pairs) {
            Ok(copied) => {
                let name = segments(&from).last().map(|s| s.to_string()).unwrap_or_default();
                self.events.publish(Event::TreePathInserted {
                    path: join_path(&to_parent, &name),
                    version: tree.version(),
                });
                Ok(copied)
            }
            Err(e) => {
                *tree = backup;
                Err(e)
            }
        }
    }

    /// Remove a context path.
    ///
    /// Without `force`, fails with `NotEmpty` while documents are filed on
    /// the node (or, with `recursive`, anywhere in its subtree). Forced
    /// removal drops those memberships.
    pub fn remove_context(&self, path: &str, recursive: bool, force: bool) -> IndexResult<RemovedPath> {
        const OP: &str = "remove_context";
        let normalized = normalize_path(path)?;
        let mut tree = self.tree_write();
        let affected = if recursive {
            tree.subtree_labels(&normalized)?
        } else {
            vec![tree.label_for(&normalized)?]
        };
        if !force
            && affected
                .iter()
                .any(|l| self.index.label_len(Dimension::Context, l) > 0)
        {
            return Err(IndexError::NotEmpty {
                operation: OP,
                path: normalized,
            });
        }
        let backup = tree.clone();
        let removed = tree.remove_path(&normalized, recursive, force)?;
        if let Err(e) = self.index.rename_context_labels(&removed.renames) {
            *tree = backup;
            return Err(e);
        }
        let cleared = self.index.drop_context_labels(&removed.removed_labels);
        tracing::debug!(path = %normalized, cleared, "context removed");
        self.events.publish(Event::TreePathRemoved {
            path: normalized,
            version: tree.version(),
        });
        Ok(removed)
    }

    pub fn get_context(&self, path: &str) -> IndexResult<NodeView> {
        self.tree_read().get_node(path)
    }

    pub fn context_paths(&self) -> Vec<String> {
        self.tree_read().paths()
    }

    pub fn context_tree(&self) -> serde_json::Value {
        self.tree_read().to_json()
    }

    pub fn tree_version(&self) -> u64 {
        self.tree_read().version()
    }

    // ============ Layers ============

    fn layer_changed(&self, view: &LayerView) {
        self.events.publish(Event::LayerChanged {
            id: view.id,
            name: view.name.clone(),
        });
    }

    pub fn create_layer(&self, name: &str, kind: LayerKind) -> IndexResult<LayerView> {
        let view = self.tree_write().create_layer(name, kind)?;
        self.layer_changed(&view);
        Ok(view)
    }

    pub fn get_layer(&self, name: &str) -> IndexResult<LayerView> {
        self.tree_read().get_layer(name)
    }

    pub fn list_layers(&self) -> Vec<LayerView> {
        self.tree_read().list_layers()
    }

    pub fn rename_layer(&self, name: &str, new_name: &str) -> IndexResult<LayerView> {
        let view = self.tree_write().rename_layer(name, new_name)?;
        self.layer_changed(&view);
        Ok(view)
    }

    pub fn update_layer(&self, name: &str, update: &LayerUpdate) -> IndexResult<LayerView> {
        let view = self.tree_write().update_layer(name, update)?;
        self.layer_changed(&view);
        Ok(view)
    }

    pub fn lock_layer(&self, name: &str) -> IndexResult<LayerView> {
        let view = self.tree_write().lock_layer(name)?;
        self.layer_changed(&view);
        Ok(view)
    }

    pub fn unlock_layer(&self, name: &str) -> IndexResult<LayerView> {
        let view = self.tree_write().unlock_layer(name)?;
        self.layer_changed(&view);
        Ok(view)
    }

    pub fn set_layer_acl(&self, name: &str, principal: &str, permission: &str) -> IndexResult<LayerView> {
        let view = self.tree_write().set_acl(name, principal, permission)?;
        self.layer_changed(&view);
        Ok(view)
    }

    pub fn remove_layer_acl(&self, name: &str, principal: &str) -> IndexResult<LayerView> {
        let view = self.tree_write().remove_acl(name, principal)?;
        self.layer_changed(&view);
        Ok(view)
    }

    pub fn delete_layer(&self, name: &str) -> IndexResult<()> {
        let mut tree = self.tree_write();
        let view = tree.get_layer(name)?;
        tree.delete_layer(name)?;
        drop(tree);
        self.layer_changed(&view);
        Ok(())
    }

    pub fn upsert_workspace(&self, info: WorkspaceInfo) -> IndexResult<()> {
        self.tree_write().upsert_workspace(info)
    }

    pub fn remove_workspace(&self, id: &str) -> IndexResult<WorkspaceInfo> {
        self.tree_write().remove_workspace(id)
    }

    // ============ Blobs ============

    pub async fn insert_blob(
        &self,
        data: &[u8],
        metadata: &BlobMetadata,
        backends: &[String],
    ) -> IndexResult<StoreReceipt> {
        let receipt = self.store.insert_blob(data, metadata, backends).await?;
        self.publish_stored(&receipt);
        Ok(receipt)
    }

    pub async fn insert_file(
        &self,
        path: &std::path::Path,
        content_type: Option<&str>,
        backends: &[String],
    ) -> IndexResult<StoreReceipt> {
        let receipt = self.store.insert_file(path, content_type, backends).await?;
        self.publish_stored(&receipt);
        Ok(receipt)
    }

    pub async fn get_blob(
        &self,
        checksum: &Checksum,
        backends: &[String],
        options: GetOptions,
    ) -> IndexResult<Vec<u8>> {
        self.store.get_blob(checksum, backends, options).await
    }

    pub async fn get_file(
        &self,
        checksum: &Checksum,
        dest: &std::path::Path,
        backends: &[String],
        options: GetOptions,
    ) -> IndexResult<u64> {
        self.store.get_file(checksum, dest, backends, options).await
    }

    pub async fn has_blob(&self, checksum: &Checksum, backends: &[String]) -> IndexResult<bool> {
        self.store.has(checksum, backends).await
    }

    pub async fn stat_blob(&self, checksum: &Checksum, backends: &[String]) -> IndexResult<ObjectStat> {
        self.store.stat(checksum, backends).await
    }

    pub async fn delete_blob(&self, checksum: &Checksum, backends: &[String]) -> IndexResult<DeleteReport> {
        let report = self.store.delete(checksum, backends).await?;
        if report.deleted() {
            self.events.publish(Event::BlobDeleted {
                checksum: checksum.to_string(),
            });
        }
        Ok(report)
    }

    pub fn set_backend_status(&self, name: &str, status: BackendStatus) -> IndexResult<()> {
        self.store.set_backend_status(name, status)
    }
}

/// First prefix of `normalized` that is not yet in the tree.
fn first_missing_prefix(tree: &ContextTree, normalized: &str) -> Option<String> {
    let mut prefix = ROOT_PATH.to_string();
    for seg in segments(normalized) {
        prefix = join_path(&prefix, seg);
        if !tree.path_exists(&prefix) {
            return Some(prefix);
        }
    }
    None
}
