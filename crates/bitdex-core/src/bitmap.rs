//! Named roaring bitmaps over the shared 32-bit document-id space.
//!
//! A [`BitmapCollection`] holds one bit-set per label (a context path, a
//! feature tag, or a derived filter facet). Each label is also assigned an
//! internal id from the reserved range
//! [`INTERNAL_BITMAP_ID_MIN`]`..=`[`INTERNAL_BITMAP_ID_MAX`], which is how
//! persisted bit-sets are keyed.
//!
//! # Id space
//!
//! | Range | Use |
//! |-------|-----|
//! | `0` | invalid |
//! | `1..=999` | reserved, never allocated |
//! | `1_000..=1_000_000` | internal bitmap label ids |
//! | `1_000_001..=u32::MAX` | user documents |

use std::collections::{BTreeMap, HashMap};

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, IndexResult};

pub const INTERNAL_BITMAP_ID_MIN: u32 = 1_000;
pub const INTERNAL_BITMAP_ID_MAX: u32 = 1_000_000;
/// First id handed out to a user document.
pub const FIRST_DOCUMENT_ID: u32 = INTERNAL_BITMAP_ID_MAX + 1;
/// Prefix marking a negated label inside a query array.
pub const NEGATION_PREFIX: char = '!';

/// Number of label ids available in the reserved range.
pub const RESERVED_LABEL_CAPACITY: usize =
    (INTERNAL_BITMAP_ID_MAX - INTERNAL_BITMAP_ID_MIN + 1) as usize;

/// Whether `id` may be stored in a bitmap as a document member.
pub fn is_document_id(id: u32) -> bool {
    id >= FIRST_DOCUMENT_ID
}

/// Whether `id` falls in the reserved internal range.
pub fn is_internal_id(id: u32) -> bool {
    (INTERNAL_BITMAP_ID_MIN..=INTERNAL_BITMAP_ID_MAX).contains(&id)
}

#[derive(Debug, Clone)]
struct LabelEntry {
    internal_id: u32,
    bitmap: RoaringBitmap,
}

/// Persisted form of one label: its internal id and serialized bitmap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSnapshot {
    pub label: String,
    pub internal_id: u32,
    pub bitmap: Vec<u8>,
}

/// A named set of bitmaps, one per label.
#[derive(Debug, Clone)]
pub struct BitmapCollection {
    name: String,
    labels: HashMap<String, LabelEntry>,
    next_internal_id: u32,
    max_labels: usize,
}

impl BitmapCollection {
    pub fn new(name: &str, max_labels: usize) -> Self {
        Self {
            name: name.to_string(),
            labels: HashMap::new(),
            next_internal_id: INTERNAL_BITMAP_ID_MIN,
            max_labels: max_labels.min(RESERVED_LABEL_CAPACITY),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_labels(&self) -> usize {
        self.max_labels
    }

    // ============ Label lifecycle ============

    /// Create `label` if absent. Returns its internal id.
    pub fn create_label(&mut self, label: &str) -> IndexResult<u32> {
        validate_label("create_label", label)?;
        if let Some(entry) = self.labels.get(label) {
            return Ok(entry.internal_id);
        }
        if self.labels.len() >= self.max_labels || self.next_internal_id > INTERNAL_BITMAP_ID_MAX {
            return Err(IndexError::capacity(
                "create_label",
                format!(
                    "collection '{}' is full ({} labels), cannot add '{}'",
                    self.name,
                    self.labels.len(),
                    label
                ),
            ));
        }
        let internal_id = self.next_internal_id;
        self.next_internal_id += 1;
        self.labels.insert(
            label.to_string(),
            LabelEntry {
                internal_id,
                bitmap: RoaringBitmap::new(),
            },
        );
        tracing::debug!(collection = %self.name, label, internal_id, "created bitmap label");
        Ok(internal_id)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains_key(label)
    }

    pub fn internal_id(&self, label: &str) -> Option<u32> {
        self.labels.get(label).map(|e| e.internal_id)
    }

    /// Labels sorted by name.
    pub fn list_labels(&self) -> Vec<String> {
        let mut out: Vec<String> = self.labels.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    /// Rename a label, keeping its internal id and members.
    pub fn rename_label(&mut self, from: &str, to: &str) -> IndexResult<()> {
        validate_label("rename_label", to)?;
        if self.labels.contains_key(to) {
            return Err(IndexError::validation(
                "rename_label",
                format!("label '{}' already exists in '{}'", to, self.name),
            ));
        }
        let entry = self
            .labels
            .remove(from)
            .ok_or_else(|| IndexError::not_found("rename_label", "label", from))?;
        self.labels.insert(to.to_string(), entry);
        Ok(())
    }

    /// Drop a label definition entirely. Its internal id is not reused.
    pub fn delete_label(&mut self, label: &str) -> bool {
        self.labels.remove(label).is_some()
    }

    // ============ Membership ============

    /// Add `id` to `label`, creating the label if needed.
    ///
    /// Returns `true` if the id was newly added.
    pub fn insert(&mut self, label: &str, id: u32) -> IndexResult<bool> {
        check_document_id("bitmap_insert", id)?;
        self.create_label(label)?;
        let entry = self
            .labels
            .get_mut(label)
            .ok_or_else(|| IndexError::not_found("bitmap_insert", "label", label))?;
        Ok(entry.bitmap.insert(id))
    }

    pub fn insert_many(&mut self, label: &str, ids: &[u32]) -> IndexResult<u64> {
        for &id in ids {
            check_document_id("bitmap_insert_many", id)?;
        }
        self.create_label(label)?;
        let entry = self
            .labels
            .get_mut(label)
            .ok_or_else(|| IndexError::not_found("bitmap_insert_many", "label", label))?;
        let before = entry.bitmap.len();
        entry.bitmap.extend(ids.iter().copied());
        Ok(entry.bitmap.len() - before)
    }

    /// Remove `id` from `label`. Unknown labels are a no-op; the label is kept
    /// even when it becomes empty.
    pub fn remove(&mut self, label: &str, id: u32) -> bool {
        self.labels
            .get_mut(label)
            .map(|e| e.bitmap.remove(id))
            .unwrap_or(false)
    }

    pub fn remove_many(&mut self, label: &str, ids: &[u32]) -> u64 {
        match self.labels.get_mut(label) {
            Some(entry) => ids.iter().filter(|&&id| entry.bitmap.remove(id)).count() as u64,
            None => 0,
        }
    }

    /// Remove `id` from every label. Returns the labels it was removed from.
    pub fn remove_from_all(&mut self, id: u32) -> Vec<String> {
        let mut touched: Vec<String> = self
            .labels
            .iter_mut()
            .filter_map(|(label, e)| e.bitmap.remove(id).then(|| label.clone()))
            .collect();
        touched.sort();
        touched
    }

    /// Empty a label's set without removing the label.
    pub fn clear_bitmap(&mut self, label: &str) -> IndexResult<u64> {
        let entry = self
            .labels
            .get_mut(label)
            .ok_or_else(|| IndexError::not_found("clear_bitmap", "label", label))?;
        let cleared = entry.bitmap.len();
        entry.bitmap.clear();
        Ok(cleared)
    }

    pub fn contains(&self, label: &str, id: u32) -> bool {
        self.labels
            .get(label)
            .map(|e| e.bitmap.contains(id))
            .unwrap_or(false)
    }

    pub fn get(&self, label: &str) -> Option<&RoaringBitmap> {
        self.labels.get(label).map(|e| &e.bitmap)
    }

    /// Number of members in `label` (0 for unknown labels).
    pub fn len(&self, label: &str) -> u64 {
        self.labels.get(label).map(|e| e.bitmap.len()).unwrap_or(0)
    }

    /// Labels containing `id`, sorted.
    pub fn labels_of(&self, id: u32) -> Vec<String> {
        let mut out: Vec<String> = self
            .labels
            .iter()
            .filter(|(_, e)| e.bitmap.contains(id))
            .map(|(l, _)| l.clone())
            .collect();
        out.sort();
        out
    }

    // ============ Boolean combination ============

    /// Union of the given labels. Unknown labels contribute nothing.
    pub fn or(&self, labels: &[&str]) -> RoaringBitmap {
        let mut result = RoaringBitmap::new();
        for label in labels {
            if let Some(bm) = self.get(label) {
                result |= bm;
            }
        }
        result
    }

    /// Intersection of the given labels. An unknown label makes the result
    /// empty; an empty label list yields an empty set.
    pub fn and(&self, labels: &[&str]) -> RoaringBitmap {
        let mut iter = labels.iter();
        let mut result = match iter.next().and_then(|l| self.get(l)) {
            Some(bm) => bm.clone(),
            None => return RoaringBitmap::new(),
        };
        for label in iter {
            match self.get(label) {
                Some(bm) => result &= bm,
                None => return RoaringBitmap::new(),
            }
        }
        result
    }

    /// Members present in an odd number of the given labels.
    pub fn xor(&self, labels: &[&str]) -> RoaringBitmap {
        let mut result = RoaringBitmap::new();
        for label in labels {
            if let Some(bm) = self.get(label) {
                result ^= bm;
            }
        }
        result
    }

    /// `base` minus the union of `labels`.
    pub fn and_not(&self, base: &RoaringBitmap, labels: &[&str]) -> RoaringBitmap {
        base - &self.or(labels)
    }

    /// Evaluate one dimension of a query.
    ///
    /// Plain labels are OR-ed; labels prefixed with `!` are subtracted from
    /// the result. With only negated labels the base is `universe`. Returns
    /// `None` when the array imposes no constraint.
    pub fn evaluate(&self, labels: &[String], universe: &RoaringBitmap) -> Option<RoaringBitmap> {
        if labels.is_empty() {
            return None;
        }
        let (negated, positive): (Vec<&str>, Vec<&str>) = labels
            .iter()
            .map(String::as_str)
            .partition(|l| l.starts_with(NEGATION_PREFIX));
        let base = if positive.is_empty() {
            universe.clone()
        } else {
            self.or(&positive)
        };
        if negated.is_empty() {
            return Some(base);
        }
        let stripped: Vec<&str> = negated
            .iter()
            .map(|l| &l[NEGATION_PREFIX.len_utf8()..])
            .collect();
        Some(self.and_not(&base, &stripped))
    }

    // ============ Persistence ============

    /// Serialize every label, sorted by internal id.
    pub fn snapshot(&self) -> IndexResult<Vec<LabelSnapshot>> {
        let mut ordered: BTreeMap<u32, (&String, &RoaringBitmap)> = BTreeMap::new();
        for (label, entry) in &self.labels {
            ordered.insert(entry.internal_id, (label, &entry.bitmap));
        }
        ordered
            .into_iter()
            .map(|(internal_id, (label, bitmap))| {
                let mut bytes = Vec::with_capacity(bitmap.serialized_size());
                bitmap
                    .serialize_into(&mut bytes)
                    .map_err(|e| IndexError::serialization("bitmap_snapshot", e.to_string()))?;
                Ok(LabelSnapshot {
                    label: label.clone(),
                    internal_id,
                    bitmap: bytes,
                })
            })
            .collect()
    }

    /// Rebuild a collection from persisted labels.
    pub fn restore(name: &str, max_labels: usize, labels: &[LabelSnapshot]) -> IndexResult<Self> {
        let mut collection = Self::new(name, max_labels);
        for snap in labels {
            if !is_internal_id(snap.internal_id) {
                return Err(IndexError::validation(
                    "bitmap_restore",
                    format!(
                        "label '{}' has internal id {} outside the reserved range {}..={}",
                        snap.label, snap.internal_id, INTERNAL_BITMAP_ID_MIN, INTERNAL_BITMAP_ID_MAX
                    ),
                ));
            }
            let bitmap = RoaringBitmap::deserialize_from(&snap.bitmap[..])
                .map_err(|e| IndexError::serialization("bitmap_restore", e.to_string()))?;
            if bitmap.min().map(|m| !is_document_id(m)).unwrap_or(false) {
                return Err(IndexError::validation(
                    "bitmap_restore",
                    format!("label '{}' contains ids from the reserved range", snap.label),
                ));
            }
            collection.next_internal_id = collection.next_internal_id.max(snap.internal_id + 1);
            collection.labels.insert(
                snap.label.clone(),
                LabelEntry {
                    internal_id: snap.internal_id,
                    bitmap,
                },
            );
        }
        Ok(collection)
    }
}

/// Reject labels that could not round-trip through a query array.
pub fn validate_label(operation: &'static str, label: &str) -> IndexResult<()> {
    if label.is_empty() {
        return Err(IndexError::validation(operation, "label must not be empty"));
    }
    if label.starts_with(NEGATION_PREFIX) {
        return Err(IndexError::validation(
            operation,
            format!("label '{}' must not start with '{}'", label, NEGATION_PREFIX),
        ));
    }
    Ok(())
}

fn check_document_id(operation: &'static str, id: u32) -> IndexResult<()> {
    if !is_document_id(id) {
        return Err(IndexError::validation(
            operation,
            format!(
                "id {} is reserved; document ids start at {}",
                id, FIRST_DOCUMENT_ID
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const D1: u32 = FIRST_DOCUMENT_ID;
    const D2: u32 = FIRST_DOCUMENT_ID + 1;
    const D3: u32 = FIRST_DOCUMENT_ID + 2;

    fn ids(bm: &RoaringBitmap) -> Vec<u32> {
        bm.iter().collect()
    }

    #[test]
    fn test_insert_is_idempotent_and_creates_label() {
        let mut c = BitmapCollection::new("feature", 100);
        assert!(c.insert("custom/tag/x", D1).unwrap());
        assert!(!c.insert("custom/tag/x", D1).unwrap());
        assert_eq!(c.len("custom/tag/x"), 1);
        assert_eq!(c.internal_id("custom/tag/x"), Some(INTERNAL_BITMAP_ID_MIN));
    }

    #[test]
    fn test_remove_last_member_keeps_label() {
        let mut c = BitmapCollection::new("context", 100);
        c.insert("A", D1).unwrap();
        assert!(c.remove("A", D1));
        assert!(!c.remove("A", D1));
        assert!(c.has_label("A"));
        assert_eq!(c.len("A"), 0);
    }

    #[test]
    fn test_labels_are_case_sensitive() {
        let mut c = BitmapCollection::new("feature", 100);
        c.insert("Tag", D1).unwrap();
        assert!(!c.contains("tag", D1));
        assert!(ids(&c.or(&["tag"])).is_empty());
    }

    #[test]
    fn test_reserved_ids_rejected() {
        let mut c = BitmapCollection::new("feature", 100);
        assert!(c.insert("x", 0).is_err());
        assert!(c.insert("x", 999).is_err());
        assert!(c.insert("x", INTERNAL_BITMAP_ID_MIN).is_err());
        assert!(c.insert("x", INTERNAL_BITMAP_ID_MAX).is_err());
        assert!(c.insert("x", u32::MAX).unwrap());
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut c = BitmapCollection::new("filter", 2);
        c.insert("a", D1).unwrap();
        c.insert("b", D1).unwrap();
        let err = c.insert("c", D1).unwrap_err();
        assert!(matches!(err, IndexError::CapacityExceeded { .. }));
        assert!(!c.has_label("c"));
    }

    #[test]
    fn test_capacity_clamped_to_reserved_range() {
        let c = BitmapCollection::new("context", usize::MAX);
        assert_eq!(c.max_labels(), RESERVED_LABEL_CAPACITY);
    }

    #[test]
    fn test_boolean_ops() {
        let mut c = BitmapCollection::new("feature", 100);
        c.insert("x", D1).unwrap();
        c.insert("x", D2).unwrap();
        c.insert("y", D2).unwrap();
        c.insert("y", D3).unwrap();

        assert_eq!(ids(&c.or(&["x", "y"])), vec![D1, D2, D3]);
        assert_eq!(ids(&c.and(&["x", "y"])), vec![D2]);
        assert_eq!(ids(&c.xor(&["x", "y"])), vec![D1, D3]);
        assert!(c.and(&["x", "missing"]).is_empty());
        assert!(c.and(&[]).is_empty());
        assert_eq!(ids(&c.and_not(&c.or(&["x"]), &["y"])), vec![D1]);
    }

    #[test]
    fn test_evaluate_with_negation() {
        let mut c = BitmapCollection::new("feature", 100);
        c.insert("x", D1).unwrap();
        c.insert("y", D2).unwrap();
        let universe: RoaringBitmap = [D1, D2, D3].into_iter().collect();

        assert!(c.evaluate(&[], &universe).is_none());
        let only_not_x = c.evaluate(&["!x".to_string()], &universe).unwrap();
        assert_eq!(ids(&only_not_x), vec![D2, D3]);
        let x_or_y_not_y = c
            .evaluate(&["x".to_string(), "y".to_string(), "!y".to_string()], &universe)
            .unwrap();
        assert_eq!(ids(&x_or_y_not_y), vec![D1]);
    }

    #[test]
    fn test_negated_label_rejected_on_write() {
        let mut c = BitmapCollection::new("feature", 100);
        assert!(c.insert("!x", D1).is_err());
        assert!(c.insert("", D1).is_err());
    }

    #[test]
    fn test_remove_from_all_and_labels_of() {
        let mut c = BitmapCollection::new("context", 100);
        c.insert("b", D1).unwrap();
        c.insert("a", D1).unwrap();
        c.insert("a", D2).unwrap();
        assert_eq!(c.labels_of(D1), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(c.remove_from_all(D1), vec!["a".to_string(), "b".to_string()]);
        assert!(c.labels_of(D1).is_empty());
        assert_eq!(c.len("a"), 1);
    }

    #[test]
    fn test_clear_and_rename() {
        let mut c = BitmapCollection::new("filter", 100);
        c.insert_many("date/2026", &[D1, D2]).unwrap();
        assert_eq!(c.clear_bitmap("date/2026").unwrap(), 2);
        assert!(c.has_label("date/2026"));
        assert!(c.clear_bitmap("missing").unwrap_err().is_not_found());

        c.insert("old", D3).unwrap();
        let id = c.internal_id("old").unwrap();
        c.rename_label("old", "new").unwrap();
        assert_eq!(c.internal_id("new"), Some(id));
        assert!(c.contains("new", D3));
        assert!(c.rename_label("new", "date/2026").is_err());
    }

    #[test]
    fn test_snapshot_restore() {
        let mut c = BitmapCollection::new("feature", 100);
        c.insert_many("x", &[D1, D3]).unwrap();
        c.insert("y", D2).unwrap();
        c.delete_label("x");
        c.insert("z", D1).unwrap();

        let snap = c.snapshot().unwrap();
        let restored = BitmapCollection::restore("feature", 100, &snap).unwrap();
        assert_eq!(restored.list_labels(), vec!["y".to_string(), "z".to_string()]);
        assert!(restored.contains("z", D1));
        // Internal ids keep advancing past the highest restored one.
        let mut restored = restored;
        let next = restored.create_label("w").unwrap();
        assert!(next > restored.internal_id("z").unwrap());
    }
}
