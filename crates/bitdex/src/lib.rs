//! # bitdex
//!
//! **A local-first document index with content-addressed blob storage.**
//!
//! bitdex files JSON documents under context paths and feature labels,
//! answers label queries with roaring-bitmap set algebra, and stores each
//! document body as a checksum-addressed blob on one or more backends.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────────────┐   ┌──────────────┐
//! │   CLI    │──▶│            Engine            │──▶│ ContentStore │
//! │  (bdx)   │   │ DocumentIndex + ContextTree  │   │ + blob cache │
//! └──────────┘   └──────────────┬───────────────┘   └──────┬───────┘
//!                               │ snapshot                 │
//!                               ▼                          ▼
//!                          ┌──────────┐     ┌────────────────────────┐
//!                          │  SQLite  │     │ sqlite / fs / s3 / mem │
//!                          └──────────┘     └────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection pool with WAL mode |
//! | [`migrate`] | Database schema (idempotent) |
//! | [`persist`] | Save and load index and tree snapshots |
//! | [`backends`] | SQLite, filesystem and S3 blob backends |
//! | [`content_store`] | Multi-backend blob storage with fallback, retries and cache |
//! | [`engine`] | The engine handle tying index, tree and store together |
//! | [`events`] | Broadcast change notifications |
//! | [`locks`] | Per-key async locks |
//! | [`stats`] | Engine statistics |
//!
//! ## Configuration
//!
//! bitdex is configured via a TOML file (default: `config/bitdex.toml`).
//! See [`config`] for all options and [`config::load_config`] for the
//! validation rules.

pub mod backends;
pub mod config;
pub mod content_store;
pub mod db;
pub mod engine;
pub mod events;
pub mod locks;
pub mod migrate;
pub mod persist;
pub mod stats;

pub use bitdex_core::{
    Checksum, ChecksumAlgorithm, Document, DocumentPatch, FindOptions, FindResult, IndexError,
    IndexResult, LabelQuery,
};
pub use engine::Engine;
