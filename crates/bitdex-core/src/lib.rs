//! # bitdex core
//!
//! Runtime-free building blocks of the bitdex engine: the document model,
//! checksums and the checksum registry, roaring-bitmap label collections,
//! the transactional [`DocumentIndex`](index::DocumentIndex), the context
//! tree, and the blob [`Backend`](store::Backend) contract with an
//! in-memory implementation and a size-bounded blob cache.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! native-only dependencies.

pub mod bitmap;
pub mod checksum;
pub mod error;
pub mod filter;
pub mod index;
pub mod models;
pub mod store;
pub mod tree;

pub use checksum::{Checksum, ChecksumAlgorithm};
pub use error::{BackendFailure, IndexError, IndexResult};
pub use index::{DocumentIndex, Dimension, InsertOutcome, RemoveOutcome};
pub use models::{Document, DocumentPatch, FindOptions, FindResult, LabelQuery};
