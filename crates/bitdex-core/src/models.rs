//! Document model shared by the index, the content store, and transport
//! collaborators.
//!
//! Field names follow the wire schema: camelCase, except the timestamp and
//! versioning fields which stay snake_case (`created_at`, `parent_id`, ...).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::{canonical_json, ChecksumAlgorithm};
use crate::error::{IndexError, IndexResult};

pub const DOCUMENT_SCHEMA: &str = "data/abstraction/document";
pub const DOCUMENT_SCHEMA_VERSION: &str = "2.0";
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";
pub const DEFAULT_CONTENT_ENCODING: &str = "utf8";
/// Checksum field name that selects the whole `data` payload.
pub const DATA_FIELD: &str = "data";

/// Per-document index configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexOptions {
    pub checksum_algorithms: Vec<ChecksumAlgorithm>,
    pub primary_checksum_algorithm: ChecksumAlgorithm,
    pub primary_checksum_fields: Vec<String>,
    pub full_text_index_fields: Vec<String>,
    pub embedding_fields: Vec<String>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            checksum_algorithms: vec![ChecksumAlgorithm::Sha256, ChecksumAlgorithm::Blake3],
            primary_checksum_algorithm: ChecksumAlgorithm::Sha256,
            primary_checksum_fields: vec![DATA_FIELD.to_string()],
            full_text_index_fields: vec!["title".to_string(), "content".to_string()],
            embedding_fields: vec!["title".to_string(), "content".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocumentMeta {
    pub data_content_type: String,
    pub data_content_encoding: String,
}

impl Default for DocumentMeta {
    fn default() -> Self {
        Self {
            data_content_type: DEFAULT_CONTENT_TYPE.to_string(),
            data_content_encoding: DEFAULT_CONTENT_ENCODING.to_string(),
        }
    }
}

/// Reference from a parent document to one of its versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRef {
    pub id: u32,
    pub version_number: u32,
    pub created_at: DateTime<Utc>,
}

/// A unit of indexed content.
///
/// `id == 0` means "not yet assigned"; the index allocates ids on insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Document {
    pub id: u32,
    pub schema: String,
    pub schema_version: String,
    #[serde(rename = "created_at")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updated_at")]
    pub updated_at: DateTime<Utc>,
    pub index: IndexOptions,
    pub checksums: BTreeMap<ChecksumAlgorithm, String>,
    pub meta: DocumentMeta,
    pub data: serde_json::Value,
    pub storage_paths: Vec<String>,
    pub features: BTreeSet<String>,
    #[serde(rename = "parent_id")]
    pub parent_id: Option<u32>,
    pub versions: Vec<VersionRef>,
    #[serde(rename = "version_number")]
    pub version_number: u32,
    #[serde(rename = "latest_version")]
    pub latest_version: u32,
}

impl Default for Document {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            schema: DOCUMENT_SCHEMA.to_string(),
            schema_version: DOCUMENT_SCHEMA_VERSION.to_string(),
            created_at: now,
            updated_at: now,
            index: IndexOptions::default(),
            checksums: BTreeMap::new(),
            meta: DocumentMeta::default(),
            data: serde_json::Value::Object(Default::default()),
            storage_paths: Vec::new(),
            features: BTreeSet::new(),
            parent_id: None,
            versions: Vec::new(),
            version_number: 1,
            latest_version: 1,
        }
    }
}

impl Document {
    pub fn new(schema: &str, data: serde_json::Value) -> Self {
        Self {
            schema: schema.to_string(),
            data,
            ..Default::default()
        }
    }

    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features.extend(features.into_iter().map(Into::into));
        self
    }

    pub fn primary_checksum(&self) -> Option<&str> {
        self.checksums
            .get(&self.index.primary_checksum_algorithm)
            .map(String::as_str)
    }

    pub fn is_json(&self) -> bool {
        self.meta.data_content_type == DEFAULT_CONTENT_TYPE
    }

    /// Bytes covered by the primary checksum: the canonical JSON of the
    /// configured checksum fields.
    pub fn checksum_payload(&self) -> Vec<u8> {
        let fields = &self.index.primary_checksum_fields;
        if fields.is_empty() || fields.iter().any(|f| f == DATA_FIELD) {
            return canonical_json(&self.data);
        }
        let selected: serde_json::Map<String, serde_json::Value> = fields
            .iter()
            .map(|f| {
                let v = self.data.get(f).cloned().unwrap_or(serde_json::Value::Null);
                (f.clone(), v)
            })
            .collect();
        canonical_json(&serde_json::Value::Object(selected))
    }

    /// Digests for every configured algorithm (primary included).
    pub fn compute_checksums(&self) -> BTreeMap<ChecksumAlgorithm, String> {
        let payload = self.checksum_payload();
        let mut algorithms: BTreeSet<ChecksumAlgorithm> =
            self.index.checksum_algorithms.iter().copied().collect();
        algorithms.insert(self.index.primary_checksum_algorithm);
        algorithms
            .into_iter()
            .map(|a| (a, a.digest(&payload)))
            .collect()
    }

    /// Fill in computed checksums, rejecting supplied digests that disagree.
    pub fn apply_checksums(&mut self, operation: &'static str) -> IndexResult<()> {
        let computed = self.compute_checksums();
        for (algo, supplied) in &self.checksums {
            if let Some(expected) = computed.get(algo) {
                if expected != supplied {
                    return Err(IndexError::validation(
                        operation,
                        format!(
                            "supplied {} checksum {} does not match computed {}",
                            algo, supplied, expected
                        ),
                    ));
                }
            }
        }
        self.checksums = computed;
        Ok(())
    }

    /// Structural validation that does not depend on index state.
    pub fn validate_shape(&self, operation: &'static str) -> IndexResult<()> {
        if self.schema.trim().is_empty() {
            return Err(IndexError::validation(operation, "document schema is not defined"));
        }
        if self.schema_version.trim().is_empty() {
            return Err(IndexError::validation(
                operation,
                "document schema version is not defined",
            ));
        }
        if self.meta.data_content_type.is_empty() {
            return Err(IndexError::validation(
                operation,
                "document must have a dataContentType",
            ));
        }
        if self.meta.data_content_encoding.is_empty() {
            return Err(IndexError::validation(
                operation,
                "document must have a dataContentEncoding",
            ));
        }
        if self.is_json() && !self.data.is_object() {
            return Err(IndexError::validation(
                operation,
                "JSON documents must carry an object payload",
            ));
        }
        if self.index.primary_checksum_fields.is_empty() {
            return Err(IndexError::validation(
                operation,
                "index.primaryChecksumFields must not be empty",
            ));
        }
        if self.updated_at < self.created_at {
            return Err(IndexError::validation(
                operation,
                "updated_at precedes created_at",
            ));
        }
        Ok(())
    }

    /// Full validation for a stored (queryable) document.
    pub fn validate(&self, operation: &'static str) -> IndexResult<()> {
        self.validate_shape(operation)?;
        if self.id == 0 {
            return Err(IndexError::validation(operation, "document id is not defined"));
        }
        if self.primary_checksum().is_none() {
            return Err(IndexError::validation(
                operation,
                format!(
                    "document must have a checksum for the primary algorithm {}",
                    self.index.primary_checksum_algorithm
                ),
            ));
        }
        Ok(())
    }

    /// Feature labels this document contributes: its own features plus its
    /// schema.
    pub fn feature_labels(&self) -> BTreeSet<String> {
        let mut labels = self.features.clone();
        labels.insert(self.schema.clone());
        labels
    }
}

/// Partial update merged into a stored document by `update_document`.
///
/// `data` is applied as a JSON merge patch; every other `Some` field
/// replaces the stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocumentPatch {
    pub schema: Option<String>,
    pub schema_version: Option<String>,
    pub index: Option<IndexOptions>,
    pub meta: Option<DocumentMeta>,
    pub data: Option<serde_json::Value>,
    pub storage_paths: Option<Vec<String>>,
    pub features: Option<BTreeSet<String>>,
    pub add_features: Vec<String>,
    pub remove_features: Vec<String>,
    /// Replace the document's context labels.
    pub contexts: Option<Vec<String>>,
}

impl DocumentPatch {
    pub fn is_empty(&self) -> bool {
        self.schema.is_none()
            && self.schema_version.is_none()
            && self.index.is_none()
            && self.meta.is_none()
            && self.data.is_none()
            && self.storage_paths.is_none()
            && self.features.is_none()
            && self.add_features.is_empty()
            && self.remove_features.is_empty()
            && self.contexts.is_none()
    }

    /// Apply the record-level part of the patch (everything except
    /// `contexts`) to `doc`.
    pub fn apply_to(&self, doc: &mut Document) {
        if let Some(schema) = &self.schema {
            doc.schema = schema.clone();
        }
        if let Some(v) = &self.schema_version {
            doc.schema_version = v.clone();
        }
        if let Some(index) = &self.index {
            doc.index = index.clone();
        }
        if let Some(meta) = &self.meta {
            doc.meta = meta.clone();
        }
        if let Some(data) = &self.data {
            merge_patch(&mut doc.data, data);
        }
        if let Some(paths) = &self.storage_paths {
            doc.storage_paths = paths.clone();
        }
        if let Some(features) = &self.features {
            doc.features = features.clone();
        }
        doc.features.extend(self.add_features.iter().cloned());
        for f in &self.remove_features {
            doc.features.remove(f);
        }
    }
}

/// RFC 7386 JSON merge patch.
pub fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match patch {
        serde_json::Value::Object(patch_map) => {
            if !target.is_object() {
                *target = serde_json::Value::Object(Default::default());
            }
            if let serde_json::Value::Object(target_map) = target {
                for (key, value) in patch_map {
                    if value.is_null() {
                        target_map.remove(key);
                    } else {
                        merge_patch(
                            target_map.entry(key.clone()).or_insert(serde_json::Value::Null),
                            value,
                        );
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

/// Pagination for `find_documents`. `limit == 0` means no limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindOptions {
    pub limit: usize,
    pub offset: usize,
}

impl FindOptions {
    pub fn page(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }
}

/// Label arrays for one query, one per dimension.
///
/// Within a dimension labels are OR-ed (a `!` prefix excludes); dimensions
/// are AND-ed. An empty array places no constraint on its dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelQuery {
    pub contexts: Vec<String>,
    pub features: Vec<String>,
    pub filters: Vec<String>,
}

impl LabelQuery {
    pub fn new<C, F, L>(contexts: C, features: F, filters: L) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        F: IntoIterator,
        F::Item: Into<String>,
        L: IntoIterator,
        L::Item: Into<String>,
    {
        Self {
            contexts: contexts.into_iter().map(Into::into).collect(),
            features: features.into_iter().map(Into::into).collect(),
            filters: filters.into_iter().map(Into::into).collect(),
        }
    }
}

/// One page of query results.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FindResult {
    /// Number of documents in this page.
    pub count: usize,
    /// Size of the full matching id set.
    pub total_count: usize,
    pub documents: Vec<Document>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_field_names() {
        let doc = Document::new("data/abstraction/tab", json!({"url": "https://example.com"}));
        let v = serde_json::to_value(&doc).unwrap();
        for key in [
            "id",
            "schema",
            "schemaVersion",
            "created_at",
            "updated_at",
            "index",
            "checksums",
            "meta",
            "data",
            "storagePaths",
            "features",
            "parent_id",
            "versions",
            "version_number",
            "latest_version",
        ] {
            assert!(v.get(key).is_some(), "missing wire field {}", key);
        }
        assert!(v["index"].get("primaryChecksumAlgorithm").is_some());
        assert_eq!(v["meta"]["dataContentType"], "application/json");
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let doc: Document =
            serde_json::from_value(json!({"schema": "data/abstraction/note", "data": {"title": "x"}}))
                .unwrap();
        assert_eq!(doc.id, 0);
        assert_eq!(doc.schema_version, DOCUMENT_SCHEMA_VERSION);
        assert_eq!(doc.index.primary_checksum_algorithm, ChecksumAlgorithm::Sha256);
    }

    #[test]
    fn test_checksums_ignore_key_order() {
        let a = Document::new("s", json!({"title": "t", "content": "c"}));
        let b = Document::new("s", json!({"content": "c", "title": "t"}));
        assert_eq!(a.compute_checksums(), b.compute_checksums());
        assert_eq!(a.compute_checksums().len(), 2);
    }

    #[test]
    fn test_checksum_fields_select_subset() {
        let mut a = Document::new("s", json!({"url": "u", "visited": 1}));
        let mut b = Document::new("s", json!({"url": "u", "visited": 2}));
        a.index.primary_checksum_fields = vec!["url".to_string()];
        b.index.primary_checksum_fields = vec!["url".to_string()];
        assert_eq!(a.compute_checksums(), b.compute_checksums());
    }

    #[test]
    fn test_apply_checksums_rejects_mismatch() {
        let mut doc = Document::new("s", json!({"a": 1}));
        doc.checksums
            .insert(ChecksumAlgorithm::Sha256, "0".repeat(64));
        assert!(matches!(
            doc.apply_checksums("insert_document"),
            Err(IndexError::Validation { .. })
        ));

        let mut ok = Document::new("s", json!({"a": 1}));
        let expected = ok.compute_checksums();
        ok.checksums = expected.clone();
        ok.apply_checksums("insert_document").unwrap();
        assert_eq!(ok.checksums, expected);
    }

    #[test]
    fn test_validate() {
        let mut doc = Document::new("s", json!({"a": 1}));
        assert!(doc.validate("x").is_err());
        doc.id = 1_000_001;
        assert!(doc.validate("x").is_err());
        doc.apply_checksums("x").unwrap();
        doc.validate("x").unwrap();

        doc.schema = " ".to_string();
        assert!(doc.validate_shape("x").is_err());

        let not_object = Document::new("s", json!([1, 2]));
        assert!(not_object.validate_shape("x").is_err());
    }

    #[test]
    fn test_merge_patch() {
        let mut target = json!({"title": "a", "tags": {"x": 1, "y": 2}});
        merge_patch(&mut target, &json!({"title": "b", "tags": {"y": null, "z": 3}}));
        assert_eq!(target, json!({"title": "b", "tags": {"x": 1, "z": 3}}));
    }

    #[test]
    fn test_patch_features() {
        let mut doc = Document::new("s", json!({})).with_features(["a", "b"]);
        let patch = DocumentPatch {
            add_features: vec!["c".to_string()],
            remove_features: vec!["a".to_string()],
            ..Default::default()
        };
        assert!(!patch.is_empty());
        patch.apply_to(&mut doc);
        assert_eq!(
            doc.features.iter().cloned().collect::<Vec<_>>(),
            vec!["b".to_string(), "c".to_string()]
        );
        assert!(doc.feature_labels().contains("s"));
    }
}
