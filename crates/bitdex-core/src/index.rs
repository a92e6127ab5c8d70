//! The document index: metadata records, the three bitmap collections, and
//! the checksum registry behind one lock.
//!
//! Every mutating call runs inside a [`Txn`] that records the inverse of
//! each sub-step. If any sub-step fails the log is replayed backwards before
//! the error is returned, so no reader ever observes a document whose
//! bitmap, registry, and record state disagree.
//!
//! Readers hold the shared lock for the whole call and therefore see a
//! single consistent snapshot.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::bitmap::{
    is_document_id, validate_label, BitmapCollection, LabelSnapshot, FIRST_DOCUMENT_ID,
    RESERVED_LABEL_CAPACITY,
};
use crate::checksum::{ChecksumAlgorithm, ChecksumRegistry};
use crate::error::{IndexError, IndexResult};
use crate::filter::{derive_filters, resolve_filters};
use crate::models::{Document, DocumentPatch, FindOptions, FindResult, LabelQuery};

/// The three label dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Context,
    Feature,
    Filter,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Self::Context, Self::Feature, Self::Filter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::Feature => "feature",
            Self::Filter => "filter",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IndexSettings {
    /// Label capacity of each bitmap collection.
    pub max_labels: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            max_labels: RESERVED_LABEL_CAPACITY,
        }
    }
}

/// Result of `insert_document`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InsertOutcome {
    pub id: u32,
    /// `true` when the primary checksum matched an existing document.
    pub deduplicated: bool,
}

/// Result of `remove_document`.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoveOutcome {
    Removed(Box<Document>),
    /// The id was allocated once but is already gone.
    AlreadyRemoved,
}

/// Counters for `stats` style reporting.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub documents: u64,
    pub next_id: u64,
    pub checksums: usize,
    pub context_labels: usize,
    pub feature_labels: usize,
    pub filter_labels: usize,
}

/// Serializable image of the whole index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub next_id: u64,
    pub documents: Vec<Document>,
    pub contexts: Vec<LabelSnapshot>,
    pub features: Vec<LabelSnapshot>,
    pub filters: Vec<LabelSnapshot>,
}

#[derive(Debug, Clone)]
struct IndexState {
    records: HashMap<u32, Document>,
    /// Ids of every live record; the universe for negated queries.
    live: RoaringBitmap,
    contexts: BitmapCollection,
    features: BitmapCollection,
    filters: BitmapCollection,
    checksums: ChecksumRegistry,
    /// Next id to allocate. `u64` so exhaustion of the 32-bit space is
    /// representable.
    next_id: u64,
}

impl IndexState {
    fn new(settings: IndexSettings) -> Self {
        Self {
            records: HashMap::new(),
            live: RoaringBitmap::new(),
            contexts: BitmapCollection::new("context", settings.max_labels),
            features: BitmapCollection::new("feature", settings.max_labels),
            filters: BitmapCollection::new("filter", settings.max_labels),
            checksums: ChecksumRegistry::new(),
            next_id: FIRST_DOCUMENT_ID as u64,
        }
    }

    fn collection(&self, dim: Dimension) -> &BitmapCollection {
        match dim {
            Dimension::Context => &self.contexts,
            Dimension::Feature => &self.features,
            Dimension::Filter => &self.filters,
        }
    }

    fn collection_mut(&mut self, dim: Dimension) -> &mut BitmapCollection {
        match dim {
            Dimension::Context => &mut self.contexts,
            Dimension::Feature => &mut self.features,
            Dimension::Filter => &mut self.filters,
        }
    }

    fn was_allocated(&self, id: u32) -> bool {
        is_document_id(id) && (id as u64) < self.next_id
    }
}

/// Inverse of one applied sub-step.
enum Undo {
    Untick(Dimension, String, u32),
    Retick(Dimension, String, u32),
    DropLabel(Dimension, String),
    RenameLabel(Dimension, String, String),
    Unregister(ChecksumAlgorithm, String),
    Reregister(ChecksumAlgorithm, String, u32),
    RestoreRecord(u32, Option<Box<Document>>),
}

/// A mutation in progress against the locked state.
struct Txn<'a> {
    state: &'a mut IndexState,
    log: Vec<Undo>,
}

impl<'a> Txn<'a> {
    fn new(state: &'a mut IndexState) -> Self {
        Self {
            state,
            log: Vec::new(),
        }
    }

    fn tick(&mut self, dim: Dimension, label: &str, id: u32) -> IndexResult<()> {
        let collection = self.state.collection_mut(dim);
        let created = !collection.has_label(label);
        let added = collection.insert(label, id)?;
        if created {
            self.log.push(Undo::DropLabel(dim, label.to_string()));
        } else if added {
            self.log.push(Undo::Untick(dim, label.to_string(), id));
        }
        Ok(())
    }

    fn untick(&mut self, dim: Dimension, label: &str, id: u32) {
        if self.state.collection_mut(dim).remove(label, id) {
            self.log.push(Undo::Retick(dim, label.to_string(), id));
        }
    }

    fn untick_all(&mut self, dim: Dimension, id: u32) {
        for label in self.state.collection_mut(dim).remove_from_all(id) {
            self.log.push(Undo::Retick(dim, label, id));
        }
    }

    fn rename(&mut self, dim: Dimension, from: &str, to: &str) -> IndexResult<()> {
        self.state.collection_mut(dim).rename_label(from, to)?;
        self.log
            .push(Undo::RenameLabel(dim, to.to_string(), from.to_string()));
        Ok(())
    }

    fn register(&mut self, algo: ChecksumAlgorithm, digest: &str, id: u32) -> IndexResult<()> {
        if self.state.checksums.put(algo, digest, id)? {
            self.log.push(Undo::Unregister(algo, digest.to_string()));
        }
        Ok(())
    }

    fn unregister(&mut self, algo: ChecksumAlgorithm, digest: &str, id: u32) {
        if self.state.checksums.lookup(algo, digest) == Some(id) {
            self.state.checksums.remove(algo, digest);
            self.log.push(Undo::Reregister(algo, digest.to_string(), id));
        }
    }

    fn put_record(&mut self, doc: Document) {
        let id = doc.id;
        let previous = self.state.records.insert(id, doc);
        self.state.live.insert(id);
        self.log.push(Undo::RestoreRecord(id, previous.map(Box::new)));
    }

    fn take_record(&mut self, id: u32) -> Option<Document> {
        let previous = self.state.records.remove(&id)?;
        self.state.live.remove(id);
        self.log
            .push(Undo::RestoreRecord(id, Some(Box::new(previous.clone()))));
        Some(previous)
    }

    /// Apply `err`'s rollback and hand it back.
    fn abort(self, err: IndexError) -> IndexError {
        let Txn { state, log } = self;
        let steps = log.len();
        for undo in log.into_iter().rev() {
            match undo {
                Undo::Untick(dim, label, id) => {
                    state.collection_mut(dim).remove(&label, id);
                }
                Undo::Retick(dim, label, id) => {
                    // The label still exists, so this cannot hit capacity.
                    let _ = state.collection_mut(dim).insert(&label, id);
                }
                Undo::DropLabel(dim, label) => {
                    state.collection_mut(dim).delete_label(&label);
                }
                Undo::RenameLabel(dim, from, to) => {
                    let _ = state.collection_mut(dim).rename_label(&from, &to);
                }
                Undo::Unregister(algo, digest) => {
                    state.checksums.remove(algo, &digest);
                }
                Undo::Reregister(algo, digest, id) => {
                    let _ = state.checksums.put(algo, &digest, id);
                }
                Undo::RestoreRecord(id, previous) => match previous {
                    Some(doc) => {
                        state.records.insert(id, *doc);
                        state.live.insert(id);
                    }
                    None => {
                        state.records.remove(&id);
                        state.live.remove(id);
                    }
                },
            }
        }
        tracing::debug!(steps, error = %err, "rolled back index mutation");
        err
    }
}

/// Run `f` as one transaction: commit on `Ok`, roll back on `Err`.
fn transact<T>(
    state: &mut IndexState,
    f: impl FnOnce(&mut Txn<'_>) -> IndexResult<T>,
) -> IndexResult<T> {
    let mut txn = Txn::new(state);
    match f(&mut txn) {
        Ok(v) => Ok(v),
        Err(e) => Err(txn.abort(e)),
    }
}

/// Thread-safe document index.
#[derive(Debug)]
pub struct DocumentIndex {
    settings: IndexSettings,
    state: RwLock<IndexState>,
}

impl Default for DocumentIndex {
    fn default() -> Self {
        Self::new(IndexSettings::default())
    }
}

impl DocumentIndex {
    pub fn new(settings: IndexSettings) -> Self {
        Self {
            settings,
            state: RwLock::new(IndexState::new(settings)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    // ============ Mutations ============

    /// Insert a document under the given context and feature labels.
    ///
    /// When a document with the same primary checksum already exists its id
    /// is returned instead, and the supplied labels are added to it.
    pub fn insert_document(
        &self,
        mut doc: Document,
        contexts: &[String],
        features: &[String],
    ) -> IndexResult<InsertOutcome> {
        const OP: &str = "insert_document";
        doc.validate_shape(OP)?;
        doc.apply_checksums(OP)?;
        for label in contexts.iter().chain(features) {
            validate_label(OP, label)?;
        }
        for label in &doc.features {
            validate_label(OP, label)?;
        }

        let primary_algo = doc.index.primary_checksum_algorithm;
        let primary = doc
            .primary_checksum()
            .map(str::to_string)
            .ok_or_else(|| IndexError::validation(OP, "primary checksum missing"))?;

        let mut guard = self.write();
        let state = &mut *guard;

        if let Some(existing) = state.checksums.lookup(primary_algo, &primary) {
            transact(state, |txn| {
                let mut record = txn.state.records.get(&existing).cloned().ok_or_else(|| {
                    IndexError::not_found(OP, "document", existing.to_string())
                })?;
                for label in contexts {
                    txn.tick(Dimension::Context, label, existing)?;
                }
                let before = record.features.len();
                for label in features.iter().chain(doc.features.iter()) {
                    txn.tick(Dimension::Feature, label, existing)?;
                    if *label != record.schema {
                        record.features.insert(label.clone());
                    }
                }
                if record.features.len() != before {
                    txn.put_record(record);
                }
                Ok(())
            })?;
            tracing::debug!(id = existing, checksum = %primary, "insert deduplicated");
            return Ok(InsertOutcome {
                id: existing,
                deduplicated: true,
            });
        }

        if state.next_id > u32::MAX as u64 {
            return Err(IndexError::capacity(OP, "document id space exhausted"));
        }
        let id = state.next_id as u32;
        if doc.id != 0 && doc.id != id {
            tracing::debug!(requested = doc.id, assigned = id, "ignoring caller-supplied id");
        }
        doc.id = id;
        doc.features.extend(features.iter().cloned());
        doc.validate(OP)?;

        transact(state, |txn| {
            for (algo, digest) in &doc.checksums {
                txn.register(*algo, digest, id)?;
            }
            for label in contexts {
                txn.tick(Dimension::Context, label, id)?;
            }
            for label in doc.feature_labels() {
                txn.tick(Dimension::Feature, &label, id)?;
            }
            for label in derive_filters(&doc) {
                txn.tick(Dimension::Filter, &label, id)?;
            }
            txn.put_record(doc);
            Ok(())
        })?;
        state.next_id += 1;
        tracing::debug!(id, checksum = %primary, "inserted document");
        Ok(InsertOutcome {
            id,
            deduplicated: false,
        })
    }

    /// Merge `patch` into document `id` and reconcile label membership.
    pub fn update_document(&self, id: u32, patch: &DocumentPatch) -> IndexResult<Document> {
        self.update_document_at(id, patch, Utc::now())
    }

    pub fn update_document_at(
        &self,
        id: u32,
        patch: &DocumentPatch,
        now: DateTime<Utc>,
    ) -> IndexResult<Document> {
        const OP: &str = "update_document";
        if let Some(contexts) = &patch.contexts {
            for label in contexts {
                validate_label(OP, label)?;
            }
        }

        let mut guard = self.write();
        let state = &mut *guard;
        let old = state
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| IndexError::not_found(OP, "document", id.to_string()))?;

        let mut new = old.clone();
        patch.apply_to(&mut new);
        for label in &new.features {
            validate_label(OP, label)?;
        }
        new.id = id;
        new.updated_at = now.max(old.created_at);
        new.checksums = new.compute_checksums();
        new.validate(OP)?;

        transact(state, |txn| {
            for (algo, digest) in &old.checksums {
                if new.checksums.get(algo) != Some(digest) {
                    txn.unregister(*algo, digest, id);
                }
            }
            for (algo, digest) in &new.checksums {
                txn.register(*algo, digest, id)?;
            }

            reconcile(txn, Dimension::Feature, id, old.feature_labels(), new.feature_labels())?;
            reconcile(
                txn,
                Dimension::Filter,
                id,
                derive_filters(&old).into_iter().collect(),
                derive_filters(&new).into_iter().collect(),
            )?;
            if let Some(contexts) = &patch.contexts {
                let current: BTreeSet<String> = txn
                    .state
                    .contexts
                    .labels_of(id)
                    .into_iter()
                    .collect();
                reconcile(
                    txn,
                    Dimension::Context,
                    id,
                    current,
                    contexts.iter().cloned().collect(),
                )?;
            }
            txn.put_record(new.clone());
            Ok(())
        })?;
        tracing::debug!(id, "updated document");
        Ok(new)
    }

    /// Remove document `id` from every label, the registry, and the record
    /// table.
    ///
    /// Ids that were allocated but are already removed return
    /// [`RemoveOutcome::AlreadyRemoved`]; ids never allocated are `NotFound`.
    pub fn remove_document(&self, id: u32) -> IndexResult<RemoveOutcome> {
        const OP: &str = "remove_document";
        let mut guard = self.write();
        let state = &mut *guard;
        if !state.records.contains_key(&id) {
            if state.was_allocated(id) {
                return Ok(RemoveOutcome::AlreadyRemoved);
            }
            return Err(IndexError::not_found(OP, "document", id.to_string()));
        }
        let removed = transact(state, |txn| {
            for dim in Dimension::ALL {
                txn.untick_all(dim, id);
            }
            let doc = txn
                .take_record(id)
                .ok_or_else(|| IndexError::not_found(OP, "document", id.to_string()))?;
            for (algo, digest) in &doc.checksums {
                txn.unregister(*algo, digest, id);
            }
            Ok(doc)
        })?;
        tracing::debug!(id, "removed document");
        Ok(RemoveOutcome::Removed(Box::new(removed)))
    }

    /// Add context labels to an existing document.
    pub fn tick_contexts(&self, id: u32, labels: &[String]) -> IndexResult<()> {
        const OP: &str = "tick_contexts";
        for label in labels {
            validate_label(OP, label)?;
        }
        let mut guard = self.write();
        if !guard.records.contains_key(&id) {
            return Err(IndexError::not_found(OP, "document", id.to_string()));
        }
        transact(&mut guard, |txn| {
            for label in labels {
                txn.tick(Dimension::Context, label, id)?;
            }
            Ok(())
        })
    }

    /// Remove context labels from a document. Unknown labels are ignored.
    pub fn untick_contexts(&self, id: u32, labels: &[String]) -> IndexResult<()> {
        let mut guard = self.write();
        if !guard.records.contains_key(&id) {
            return Err(IndexError::not_found(
                "untick_contexts",
                "document",
                id.to_string(),
            ));
        }
        for label in labels {
            guard.contexts.remove(label, id);
        }
        Ok(())
    }

    /// Rename context labels as one unit, e.g. after a subtree move.
    pub fn rename_context_labels(&self, renames: &[(String, String)]) -> IndexResult<()> {
        let mut guard = self.write();
        transact(&mut guard, |txn| {
            for (from, to) in renames {
                if txn.state.contexts.has_label(from) {
                    txn.rename(Dimension::Context, from, to)?;
                }
            }
            Ok(())
        })
    }

    /// Give every member of each source label the paired target label.
    pub fn copy_context_labels(&self, pairs: &[(String, String)]) -> IndexResult<u64> {
        let mut guard = self.write();
        transact(&mut guard, |txn| {
            let mut copied = 0;
            for (from, to) in pairs {
                let members: Vec<u32> = match txn.state.contexts.get(from) {
                    Some(bm) => bm.iter().collect(),
                    None => continue,
                };
                for id in members {
                    txn.tick(Dimension::Context, to, id)?;
                    copied += 1;
                }
            }
            Ok(copied)
        })
    }

    /// Empty and drop context labels. Returns how many memberships were
    /// cleared.
    pub fn drop_context_labels(&self, labels: &[String]) -> u64 {
        let mut guard = self.write();
        let mut cleared = 0;
        for label in labels {
            if let Ok(n) = guard.contexts.clear_bitmap(label) {
                cleared += n;
            }
            guard.contexts.delete_label(label);
        }
        cleared
    }

    /// Empty a label's bitmap in one dimension, keeping the label.
    pub fn clear_bitmap(&self, dim: Dimension, label: &str) -> IndexResult<u64> {
        self.write().collection_mut(dim).clear_bitmap(label)
    }

    /// Register an extra version link on a parent document.
    pub fn link_version(&self, parent_id: u32, child: &Document) -> IndexResult<Document> {
        const OP: &str = "link_version";
        let mut guard = self.write();
        let parent = guard
            .records
            .get_mut(&parent_id)
            .ok_or_else(|| IndexError::not_found(OP, "document", parent_id.to_string()))?;
        if !parent.versions.iter().any(|v| v.id == child.id) {
            parent.versions.push(crate::models::VersionRef {
                id: child.id,
                version_number: child.version_number,
                created_at: child.created_at,
            });
        }
        parent.latest_version = parent.latest_version.max(child.version_number);
        Ok(parent.clone())
    }

    // ============ Queries ============

    pub fn find_documents(&self, query: &LabelQuery, opts: FindOptions) -> IndexResult<FindResult> {
        self.find_documents_at(query, opts, Utc::now())
    }

    /// Query with an explicit clock for timeframe filters.
    pub fn find_documents_at(
        &self,
        query: &LabelQuery,
        opts: FindOptions,
        now: DateTime<Utc>,
    ) -> IndexResult<FindResult> {
        let filters = resolve_filters(&query.filters, now)?;
        let state = self.read();
        let matches = matching_ids(&state, &query.contexts, &query.features, &filters);
        let total_count = matches.len() as usize;
        let take = if opts.limit == 0 { usize::MAX } else { opts.limit };
        let documents: Vec<Document> = matches
            .iter()
            .skip(opts.offset)
            .take(take)
            .filter_map(|id| state.records.get(&id).cloned())
            .collect();
        Ok(FindResult {
            count: documents.len(),
            total_count,
            documents,
        })
    }

    /// Matching ids only, ascending.
    pub fn find_ids(&self, query: &LabelQuery) -> IndexResult<RoaringBitmap> {
        let filters = resolve_filters(&query.filters, Utc::now())?;
        let state = self.read();
        Ok(matching_ids(&state, &query.contexts, &query.features, &filters))
    }

    pub fn has_document(&self, id: u32) -> bool {
        self.read().records.contains_key(&id)
    }

    pub fn has_document_by_checksum(&self, algorithm: ChecksumAlgorithm, digest: &str) -> bool {
        let state = self.read();
        state
            .checksums
            .lookup(algorithm, digest)
            .map(|id| state.records.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn get_document(&self, id: u32) -> IndexResult<Document> {
        self.read()
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| IndexError::not_found("get_document", "document", id.to_string()))
    }

    pub fn get_document_by_checksum(
        &self,
        algorithm: ChecksumAlgorithm,
        digest: &str,
    ) -> IndexResult<Document> {
        let state = self.read();
        let id = state.checksums.get(algorithm, digest)?;
        state.records.get(&id).cloned().ok_or_else(|| {
            IndexError::not_found("get_document_by_checksum", "document", id.to_string())
        })
    }

    pub fn document_id_by_checksum(&self, algorithm: ChecksumAlgorithm, digest: &str) -> Option<u32> {
        self.read().checksums.lookup(algorithm, digest)
    }

    /// Live documents listing `path` among their storage paths.
    pub fn documents_with_storage_path(&self, path: &str) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .read()
            .records
            .values()
            .filter(|doc| doc.storage_paths.iter().any(|p| p == path))
            .map(|doc| doc.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Labels of `id` in one dimension.
    pub fn labels_of(&self, dim: Dimension, id: u32) -> Vec<String> {
        self.read().collection(dim).labels_of(id)
    }

    pub fn list_labels(&self, dim: Dimension) -> Vec<String> {
        self.read().collection(dim).list_labels()
    }

    /// Member count of a label (0 for unknown labels).
    pub fn label_len(&self, dim: Dimension, label: &str) -> u64 {
        self.read().collection(dim).len(label)
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> IndexStats {
        let state = self.read();
        IndexStats {
            documents: state.live.len(),
            next_id: state.next_id,
            checksums: state.checksums.len(),
            context_labels: state.contexts.label_count(),
            feature_labels: state.features.label_count(),
            filter_labels: state.filters.label_count(),
        }
    }

    // ============ Persistence ============

    pub fn snapshot(&self) -> IndexResult<IndexSnapshot> {
        let state = self.read();
        let documents = state
            .live
            .iter()
            .filter_map(|id| state.records.get(&id).cloned())
            .collect();
        Ok(IndexSnapshot {
            next_id: state.next_id,
            documents,
            contexts: state.contexts.snapshot()?,
            features: state.features.snapshot()?,
            filters: state.filters.snapshot()?,
        })
    }

    /// Replace the index contents with `snapshot`.
    ///
    /// The checksum registry is rebuilt from the documents. Bitmaps that
    /// reference unknown documents are rejected.
    pub fn restore(&self, snapshot: IndexSnapshot) -> IndexResult<()> {
        const OP: &str = "restore_index";
        let max = self.settings.max_labels;
        let mut fresh = IndexState::new(self.settings);
        fresh.contexts = BitmapCollection::restore("context", max, &snapshot.contexts)?;
        fresh.features = BitmapCollection::restore("feature", max, &snapshot.features)?;
        fresh.filters = BitmapCollection::restore("filter", max, &snapshot.filters)?;

        let mut highest = 0u32;
        for doc in snapshot.documents {
            doc.validate(OP)?;
            if !is_document_id(doc.id) {
                return Err(IndexError::validation(
                    OP,
                    format!("document id {} is in the reserved range", doc.id),
                ));
            }
            for (algo, digest) in &doc.checksums {
                fresh.checksums.put(*algo, digest, doc.id)?;
            }
            highest = highest.max(doc.id);
            fresh.live.insert(doc.id);
            fresh.records.insert(doc.id, doc);
        }
        for dim in Dimension::ALL {
            let collection = fresh.collection(dim);
            for label in collection.list_labels() {
                if let Some(bm) = collection.get(&label) {
                    if !bm.is_subset(&fresh.live) {
                        return Err(IndexError::validation(
                            OP,
                            format!("{} label '{}' references unknown documents", dim.as_str(), label),
                        ));
                    }
                }
            }
        }
        fresh.next_id = snapshot
            .next_id
            .max(highest as u64 + 1)
            .max(FIRST_DOCUMENT_ID as u64);
        *self.write() = fresh;
        Ok(())
    }
}

fn reconcile(
    txn: &mut Txn<'_>,
    dim: Dimension,
    id: u32,
    old: BTreeSet<String>,
    new: BTreeSet<String>,
) -> IndexResult<()> {
    for label in old.difference(&new) {
        txn.untick(dim, label, id);
    }
    for label in new.difference(&old) {
        txn.tick(dim, label, id)?;
    }
    Ok(())
}

/// AND across dimensions, OR within each; an empty dimension is
/// unconstrained. The result is always a subset of the live records.
fn matching_ids(
    state: &IndexState,
    contexts: &[String],
    features: &[String],
    filters: &[String],
) -> RoaringBitmap {
    let mut result = state.live.clone();
    let dims = [
        (&state.contexts, contexts),
        (&state.features, features),
        (&state.filters, filters),
    ];
    for (collection, labels) in dims {
        if let Some(bm) = collection.evaluate(labels, &state.live) {
            result &= bm;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn doc(title: &str) -> Document {
        Document::new("data/abstraction/note", json!({ "title": title }))
    }

    fn labels(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn ids(result: &FindResult) -> Vec<u32> {
        result.documents.iter().map(|d| d.id).collect()
    }

    #[test]
    fn test_insert_assigns_ids_outside_reserved_range() {
        let index = DocumentIndex::default();
        let a = index.insert_document(doc("a"), &[], &[]).unwrap();
        let b = index.insert_document(doc("b"), &[], &[]).unwrap();
        assert_eq!(a.id, FIRST_DOCUMENT_ID);
        assert_eq!(b.id, FIRST_DOCUMENT_ID + 1);
        assert!(!a.deduplicated);
    }

    #[test]
    fn test_caller_supplied_id_is_ignored() {
        let index = DocumentIndex::default();
        let mut d = doc("a");
        d.id = 42;
        let out = index.insert_document(d, &[], &[]).unwrap();
        assert_eq!(out.id, FIRST_DOCUMENT_ID);
    }

    #[test]
    fn test_dedup_idempotence() {
        let index = DocumentIndex::default();
        let first = index
            .insert_document(doc("same"), &labels(&["A"]), &[])
            .unwrap();
        let registered = index.stats().checksums;
        let second = index
            .insert_document(doc("same"), &labels(&["B"]), &labels(&["custom/tag/x"]))
            .unwrap();
        assert_eq!(first.id, second.id);
        assert!(second.deduplicated);
        assert_eq!(index.len(), 1);
        assert_eq!(index.stats().checksums, registered);
        // Labels supplied with the duplicate land on the existing document.
        assert_eq!(index.labels_of(Dimension::Context, first.id), labels(&["A", "B"]));
        assert!(index
            .get_document(first.id)
            .unwrap()
            .features
            .contains("custom/tag/x"));
    }

    #[test]
    fn test_insert_consistency() {
        let index = DocumentIndex::default();
        let d = doc("x");
        let checksum = d.compute_checksums()[&ChecksumAlgorithm::Sha256].clone();
        let out = index
            .insert_document(d, &labels(&["ctx/a", "ctx/b"]), &labels(&["custom/tag/x"]))
            .unwrap();
        for label in ["ctx/a", "ctx/b"] {
            assert_eq!(index.label_len(Dimension::Context, label), 1);
        }
        let features = index.labels_of(Dimension::Feature, out.id);
        assert!(features.contains(&"custom/tag/x".to_string()));
        assert!(features.contains(&"data/abstraction/note".to_string()));
        assert_eq!(index.labels_of(Dimension::Filter, out.id).len(), 6);
        assert!(index.has_document_by_checksum(ChecksumAlgorithm::Sha256, &checksum));
        assert!(index.has_document(out.id));
    }

    #[test]
    fn test_failed_insert_rolls_back() {
        // Six labels per collection: the schema plus six extra features overflow.
        let index = DocumentIndex::new(IndexSettings { max_labels: 6 });
        let d = doc("x");
        let checksum = d.compute_checksums()[&ChecksumAlgorithm::Sha256].clone();
        let err = index
            .insert_document(
                d,
                &labels(&["ctx/a"]),
                &labels(&["f1", "f2", "f3", "f4", "f5", "f6"]),
            )
            .unwrap_err();
        assert!(matches!(err, IndexError::CapacityExceeded { .. }));
        assert!(index.is_empty());
        assert!(!index.has_document_by_checksum(ChecksumAlgorithm::Sha256, &checksum));
        assert!(index.list_labels(Dimension::Context).is_empty());
        assert!(index.list_labels(Dimension::Feature).is_empty());
        assert_eq!(index.stats().checksums, 0);

        // The failed call did not burn the id.
        let ok = index.insert_document(doc("y"), &[], &[]).unwrap();
        assert_eq!(ok.id, FIRST_DOCUMENT_ID);
    }

    #[test]
    fn test_invalid_labels_rejected() {
        let index = DocumentIndex::default();
        assert!(index.insert_document(doc("x"), &labels(&["!A"]), &[]).is_err());
        assert!(index.insert_document(doc("x"), &[], &labels(&[""])).is_err());
        assert!(index.is_empty());
    }

    #[test]
    fn test_removal_completeness() {
        let index = DocumentIndex::default();
        let d = doc("gone");
        let sums = d.compute_checksums();
        let out = index
            .insert_document(d, &labels(&["A"]), &labels(&["X"]))
            .unwrap();
        match index.remove_document(out.id).unwrap() {
            RemoveOutcome::Removed(removed) => assert_eq!(removed.id, out.id),
            other => panic!("unexpected {:?}", other),
        }
        for dim in Dimension::ALL {
            assert!(index.labels_of(dim, out.id).is_empty());
        }
        for (algo, digest) in &sums {
            assert!(index.document_id_by_checksum(*algo, digest).is_none());
        }
        assert!(!index.has_document(out.id));
        assert_eq!(
            index.remove_document(out.id).unwrap(),
            RemoveOutcome::AlreadyRemoved
        );
        // Labels survive as empty sets.
        assert!(index.list_labels(Dimension::Context).contains(&"A".to_string()));
    }

    #[test]
    fn test_remove_unknown_is_not_found() {
        let index = DocumentIndex::default();
        assert!(index.remove_document(5).unwrap_err().is_not_found());
        assert!(index
            .remove_document(FIRST_DOCUMENT_ID)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_ids_never_recycled() {
        let index = DocumentIndex::default();
        let a = index.insert_document(doc("a"), &[], &[]).unwrap();
        index.remove_document(a.id).unwrap();
        let b = index.insert_document(doc("a"), &[], &[]).unwrap();
        assert_eq!(b.id, a.id + 1);
    }

    #[test]
    fn test_query_boolean_semantics() {
        let index = DocumentIndex::default();
        let d1 = index
            .insert_document(doc("1"), &labels(&["A"]), &labels(&["X"]))
            .unwrap()
            .id;
        let d2 = index
            .insert_document(doc("2"), &labels(&["A"]), &labels(&["Y"]))
            .unwrap()
            .id;
        let d3 = index
            .insert_document(doc("3"), &labels(&["B"]), &labels(&["X"]))
            .unwrap()
            .id;

        let q = |c: &[&str], f: &[&str]| {
            index
                .find_documents(&LabelQuery::new(labels(c), labels(f), Vec::<String>::new()), FindOptions::default())
                .unwrap()
        };
        assert_eq!(ids(&q(&["A"], &["X"])), vec![d1]);
        assert_eq!(ids(&q(&["A"], &[])), vec![d1, d2]);
        assert_eq!(ids(&q(&[], &[])), vec![d1, d2, d3]);
        assert_eq!(ids(&q(&["A", "B"], &["X"])), vec![d1, d3]);
        assert_eq!(ids(&q(&["A"], &["!X"])), vec![d2]);
        assert!(ids(&q(&["missing"], &[])).is_empty());
    }

    #[test]
    fn test_pagination() {
        let index = DocumentIndex::default();
        for i in 0..25 {
            index
                .insert_document(doc(&format!("doc-{}", i)), &labels(&["A"]), &[])
                .unwrap();
        }
        let query = LabelQuery::new(labels(&["A"]), Vec::<String>::new(), Vec::<String>::new());

        let page = index.find_documents(&query, FindOptions::page(10, 0)).unwrap();
        assert_eq!(page.count, 10);
        assert_eq!(page.total_count, 25);

        let last = index.find_documents(&query, FindOptions::page(10, 20)).unwrap();
        assert_eq!(last.count, 5);
        assert_eq!(last.total_count, 25);
        assert!(last.documents.windows(2).all(|w| w[0].id < w[1].id));

        let all = index.find_documents(&query, FindOptions::page(0, 0)).unwrap();
        assert_eq!(all.count, 25);
        assert_eq!(all.total_count, 25);

        let past = index.find_documents(&query, FindOptions::page(10, 100)).unwrap();
        assert_eq!(past.count, 0);
        assert_eq!(past.total_count, 25);
    }

    #[test]
    fn test_update_reconciles_labels() {
        let index = DocumentIndex::default();
        let created = Utc.with_ymd_and_hms(2025, 12, 31, 8, 0, 0).unwrap();
        let mut d = doc("v1").with_features(["old"]);
        d.created_at = created;
        d.updated_at = created;
        let id = index
            .insert_document(d, &labels(&["A"]), &[])
            .unwrap()
            .id;
        let old_sum = index.get_document(id).unwrap().checksums[&ChecksumAlgorithm::Sha256].clone();

        let patch = DocumentPatch {
            data: Some(json!({"title": "v2"})),
            add_features: vec!["new".to_string()],
            remove_features: vec!["old".to_string()],
            contexts: Some(labels(&["B"])),
            ..Default::default()
        };
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 8, 0, 0).unwrap();
        let updated = index.update_document_at(id, &patch, now).unwrap();
        assert_eq!(updated.updated_at, now);
        assert_eq!(updated.created_at, created);

        assert_eq!(index.labels_of(Dimension::Context, id), labels(&["B"]));
        let features = index.labels_of(Dimension::Feature, id);
        assert!(features.contains(&"new".to_string()));
        assert!(!features.contains(&"old".to_string()));
        let filters = index.labels_of(Dimension::Filter, id);
        assert!(filters.contains(&"date/created/2025-12-31".to_string()));
        assert!(filters.contains(&"date/updated/2026-01-02".to_string()));
        assert!(!filters.contains(&"date/updated/2025-12-31".to_string()));

        assert!(!index.has_document_by_checksum(ChecksumAlgorithm::Sha256, &old_sum));
        let new_sum = &updated.checksums[&ChecksumAlgorithm::Sha256];
        assert_eq!(
            index.document_id_by_checksum(ChecksumAlgorithm::Sha256, new_sum),
            Some(id)
        );
    }

    #[test]
    fn test_update_into_existing_content_conflicts() {
        let index = DocumentIndex::default();
        let a = index.insert_document(doc("a"), &[], &[]).unwrap().id;
        let b = index.insert_document(doc("b"), &labels(&["B"]), &[]).unwrap().id;
        let patch = DocumentPatch {
            data: Some(json!({"title": "a"})),
            contexts: Some(labels(&["C"])),
            ..Default::default()
        };
        let err = index.update_document(b, &patch).unwrap_err();
        assert!(matches!(err, IndexError::ChecksumConflict { existing_id, .. } if existing_id == a));
        // Nothing about b changed.
        assert_eq!(index.get_document(b).unwrap().data, json!({"title": "b"}));
        assert_eq!(index.labels_of(Dimension::Context, b), labels(&["B"]));
    }

    #[test]
    fn test_update_unknown_is_not_found() {
        let index = DocumentIndex::default();
        let err = index
            .update_document(FIRST_DOCUMENT_ID, &DocumentPatch::default())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_filters_and_timeframes() {
        let index = DocumentIndex::default();
        let day = Utc.with_ymd_and_hms(2026, 10, 15, 9, 0, 0).unwrap();
        let mut d = doc("dated");
        d.created_at = day;
        d.updated_at = day;
        let id = index.insert_document(d, &[], &[]).unwrap().id;
        index.insert_document(doc("other"), &[], &[]).unwrap();

        let today = LabelQuery::new(Vec::<String>::new(), Vec::<String>::new(), ["today"]);
        let hit = index
            .find_documents_at(&today, FindOptions::default(), day)
            .unwrap();
        assert!(ids(&hit).contains(&id));

        let by_month =
            LabelQuery::new(Vec::<String>::new(), Vec::<String>::new(), ["date/created/2026-10"]);
        let hit = index
            .find_documents_at(&by_month, FindOptions::default(), day)
            .unwrap();
        assert!(ids(&hit).contains(&id));
    }

    #[test]
    fn test_rename_context_labels() {
        let index = DocumentIndex::default();
        let id = index.insert_document(doc("x"), &labels(&["ctx/1"]), &[]).unwrap().id;
        index
            .rename_context_labels(&[("ctx/1".to_string(), "ctx/2".to_string())])
            .unwrap();
        assert_eq!(index.labels_of(Dimension::Context, id), labels(&["ctx/2"]));
    }

    #[test]
    fn test_documents_with_storage_path() {
        let index = DocumentIndex::default();
        let path = "bitdex://b1/checksum/sha256/aa";
        let mut a = doc("a");
        a.storage_paths.push(path.to_string());
        let a = index.insert_document(a, &[], &[]).unwrap().id;
        index.insert_document(doc("b"), &[], &[]).unwrap();
        assert_eq!(index.documents_with_storage_path(path), vec![a]);
        index.remove_document(a).unwrap();
        assert!(index.documents_with_storage_path(path).is_empty());
    }

    #[test]
    fn test_snapshot_restore() {
        let index = DocumentIndex::default();
        let a = index.insert_document(doc("a"), &labels(&["A"]), &labels(&["X"])).unwrap().id;
        let b = index.insert_document(doc("b"), &labels(&["A"]), &[]).unwrap().id;
        index.remove_document(b).unwrap();

        let snap = index.snapshot().unwrap();
        let restored = DocumentIndex::default();
        restored.restore(snap).unwrap();
        assert!(restored.has_document(a));
        assert!(!restored.has_document(b));
        assert_eq!(restored.labels_of(Dimension::Context, a), labels(&["A"]));
        let c = restored.insert_document(doc("c"), &[], &[]).unwrap().id;
        assert_eq!(c, b + 1);
    }

    #[test]
    fn test_restore_rejects_dangling_bitmap() {
        let index = DocumentIndex::default();
        index.insert_document(doc("a"), &labels(&["A"]), &[]).unwrap();
        let mut snap = index.snapshot().unwrap();
        snap.documents.clear();
        assert!(DocumentIndex::default().restore(snap).is_err());
    }
}
