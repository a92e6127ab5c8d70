//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/bitdex.sqlite"
//!
//! [index]
//! primary_checksum_algorithm = "sha256"
//! checksum_algorithms = ["sha256", "blake3"]
//!
//! [store]
//! default_backends = ["local"]
//!
//! [backends.local]
//! kind = "sqlite"
//! ```
//!
//! Every section except `[db]` has defaults. With no `[backends]` table at
//! all, a single SQLite backend named `local` is configured.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bitdex_core::bitmap::RESERVED_LABEL_CAPACITY;
use bitdex_core::models::IndexOptions;
use bitdex_core::ChecksumAlgorithm;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default = "default_backends_table")]
    pub backends: BTreeMap<String, BackendConfig>,
}

impl Config {
    /// Defaults for every section, with the database under `./data`.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/bitdex.sqlite"),
            },
            index: IndexConfig::default(),
            cache: CacheConfig::default(),
            store: StoreConfig::default(),
            backends: default_backends_table(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_algorithm")]
    pub primary_checksum_algorithm: ChecksumAlgorithm,
    #[serde(default = "default_algorithms")]
    pub checksum_algorithms: Vec<ChecksumAlgorithm>,
    #[serde(default = "default_max_labels")]
    pub max_labels: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            primary_checksum_algorithm: default_algorithm(),
            checksum_algorithms: default_algorithms(),
            max_labels: default_max_labels(),
        }
    }
}

impl IndexConfig {
    /// Index options applied to documents that do not carry their own.
    pub fn document_options(&self) -> IndexOptions {
        IndexOptions {
            primary_checksum_algorithm: self.primary_checksum_algorithm,
            checksum_algorithms: self.checksum_algorithms.clone(),
            ..IndexOptions::default()
        }
    }
}

fn default_algorithm() -> ChecksumAlgorithm {
    ChecksumAlgorithm::Sha256
}
fn default_algorithms() -> Vec<ChecksumAlgorithm> {
    vec![ChecksumAlgorithm::Sha256, ChecksumAlgorithm::Blake3]
}
fn default_max_labels() -> usize {
    100_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_bytes")]
    pub max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_cache_entries(),
            max_bytes: default_cache_bytes(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_cache_entries() -> usize {
    1024
}
fn default_cache_bytes() -> u64 {
    64 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Backends used, in priority order, when a call names none.
    #[serde(default = "default_backend_names")]
    pub default_backends: Vec<String>,
    /// Algorithm used to address document bodies and blobs.
    #[serde(default = "default_algorithm")]
    pub body_algorithm: ChecksumAlgorithm,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_backends: default_backend_names(),
            body_algorithm: default_algorithm(),
        }
    }
}

fn default_backend_names() -> Vec<String> {
    vec!["local".to_string()]
}

fn default_backends_table() -> BTreeMap<String, BackendConfig> {
    let mut map = BTreeMap::new();
    map.insert(
        "local".to_string(),
        BackendConfig {
            kind: BackendKind::Sqlite,
            local_cache_enabled: true,
            ignore_backend_errors: false,
            dedup: true,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        },
    );
    map
}

/// One `[backends.<name>]` table.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(flatten)]
    pub kind: BackendKind,
    #[serde(default = "default_true")]
    pub local_cache_enabled: bool,
    #[serde(default)]
    pub ignore_backend_errors: bool,
    /// Skip the write when the backend already has the object.
    #[serde(default = "default_true")]
    pub dedup: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra attempts after a failure; only used with
    /// `ignore_backend_errors`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local; contents vanish on exit.
    Memory,
    /// `blobs` table in the engine's SQLite database.
    Sqlite,
    /// One file per object under `root`.
    Fs { root: PathBuf },
    /// S3 or an S3-compatible object store.
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: String,
        #[serde(default = "default_region")]
        region: String,
        #[serde(default)]
        endpoint_url: Option<String>,
    },
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Read, parse, and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate config text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.index.max_labels == 0 || config.index.max_labels > RESERVED_LABEL_CAPACITY {
        bail!(
            "index.max_labels must be in 1..={}",
            RESERVED_LABEL_CAPACITY
        );
    }
    if config.index.checksum_algorithms.is_empty() {
        bail!("index.checksum_algorithms must not be empty");
    }
    if !config
        .index
        .checksum_algorithms
        .contains(&config.index.primary_checksum_algorithm)
    {
        bail!(
            "index.primary_checksum_algorithm '{}' must be listed in index.checksum_algorithms",
            config.index.primary_checksum_algorithm
        );
    }

    if config.cache.enabled && (config.cache.max_entries == 0 || config.cache.max_bytes == 0) {
        bail!("cache.max_entries and cache.max_bytes must be > 0 when the cache is enabled");
    }

    if config.backends.is_empty() {
        bail!("at least one [backends.<name>] table is required");
    }
    for (name, backend) in &config.backends {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            bail!(
                "backend name '{}' must be non-empty and use only [A-Za-z0-9_-]",
                name
            );
        }
        if backend.timeout_secs == 0 {
            bail!("backends.{}.timeout_secs must be > 0", name);
        }
        if let BackendKind::S3 { bucket, .. } = &backend.kind {
            if bucket.is_empty() {
                bail!("backends.{}.bucket must not be empty", name);
            }
        }
    }

    if config.store.default_backends.is_empty() {
        bail!("store.default_backends must name at least one backend");
    }
    for name in &config.store.default_backends {
        if !config.backends.contains_key(name) {
            bail!(
                "store.default_backends references unknown backend '{}'. Configured: {}",
                name,
                config.backends.keys().cloned().collect::<Vec<_>>().join(", ")
            );
        }
    }
    Ok(())
}
