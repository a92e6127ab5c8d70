//! Content checksums and the checksum registry.
//!
//! A checksum is both the integrity hash of a payload and its dedup key.
//! The [`ChecksumRegistry`] maps `(algorithm, digest)` to exactly one
//! document id per algorithm.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::error::{IndexError, IndexResult};

/// Hash algorithms supported for document and blob checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
    Blake3,
}

impl ChecksumAlgorithm {
    pub const ALL: [ChecksumAlgorithm; 3] = [Self::Sha256, Self::Sha512, Self::Blake3];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
            Self::Blake3 => "blake3",
        }
    }

    /// Hex-encoded digest of `data`.
    pub fn digest(&self, data: &[u8]) -> String {
        match self {
            Self::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                hex::encode(hasher.finalize())
            }
            Self::Sha512 => {
                let mut hasher = Sha512::new();
                hasher.update(data);
                hex::encode(hasher.finalize())
            }
            Self::Blake3 => blake3::hash(data).to_hex().to_string(),
        }
    }

    /// Length of a hex digest produced by this algorithm.
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 | Self::Blake3 => 64,
            Self::Sha512 => 128,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            "blake3" => Ok(Self::Blake3),
            other => Err(IndexError::validation(
                "parse_algorithm",
                format!("unknown checksum algorithm '{}'", other),
            )),
        }
    }
}

/// A content address: algorithm plus lowercase hex digest.
///
/// Renders as `algorithm:digest` (e.g. `sha256:9f86d0...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub digest: String,
}

impl Checksum {
    pub fn compute(algorithm: ChecksumAlgorithm, data: &[u8]) -> Self {
        Self {
            algorithm,
            digest: algorithm.digest(data),
        }
    }

    /// Build from a digest string, rejecting malformed hex.
    pub fn new(algorithm: ChecksumAlgorithm, digest: &str) -> IndexResult<Self> {
        let digest = digest.to_string();
        if digest.len() != algorithm.hex_len()
            || !digest.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(IndexError::validation(
                "checksum",
                format!(
                    "'{}' is not a lowercase {}-character {} hex digest",
                    digest,
                    algorithm.hex_len(),
                    algorithm
                ),
            ));
        }
        Ok(Self { algorithm, digest })
    }

    /// Relative object path used by path-addressed backends:
    /// `<algorithm>/<first two hex chars>/<digest>`.
    pub fn object_path(&self) -> String {
        format!(
            "{}/{}/{}",
            self.algorithm,
            &self.digest[..2.min(self.digest.len())],
            self.digest
        )
    }

    /// Inverse of [`object_path`](Self::object_path).
    pub fn from_object_path(path: &str) -> IndexResult<Self> {
        let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
        match parts.as_slice() {
            [algo, shard, digest] if digest.starts_with(shard) => {
                Checksum::new(algo.parse()?, digest)
            }
            _ => Err(IndexError::validation(
                "parse_object_path",
                format!("'{}' is not an object path", path),
            )),
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.digest)
    }
}

impl FromStr for Checksum {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, digest) = s.split_once(':').ok_or_else(|| {
            IndexError::validation(
                "parse_checksum",
                format!("expected '<algorithm>:<digest>', got '{}'", s),
            )
        })?;
        Checksum::new(algo.parse()?, digest)
    }
}

/// Serialize a JSON value canonically (object keys sorted, no whitespace).
///
/// `serde_json::Map` is ordered by key unless the `preserve_order` feature is
/// enabled, which this workspace never does.
pub fn canonical_json(value: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

/// Maps `(algorithm, digest)` to a document id.
#[derive(Debug, Default, Clone)]
pub struct ChecksumRegistry {
    entries: HashMap<ChecksumAlgorithm, HashMap<String, u32>>,
}

impl ChecksumRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a digest for `id`.
    ///
    /// Re-registering the same pair for the same id is a no-op; a pair that
    /// already maps to a different id fails with `ChecksumConflict`.
    pub fn put(&mut self, algorithm: ChecksumAlgorithm, digest: &str, id: u32) -> IndexResult<bool> {
        let by_digest = self.entries.entry(algorithm).or_default();
        match by_digest.get(digest) {
            Some(&existing) if existing == id => Ok(false),
            Some(&existing) => Err(IndexError::ChecksumConflict {
                operation: "checksum_put",
                algorithm: algorithm.to_string(),
                digest: digest.to_string(),
                existing_id: existing,
                requested_id: id,
            }),
            None => {
                by_digest.insert(digest.to_string(), id);
                Ok(true)
            }
        }
    }

    pub fn get(&self, algorithm: ChecksumAlgorithm, digest: &str) -> IndexResult<u32> {
        self.lookup(algorithm, digest).ok_or_else(|| {
            IndexError::not_found("checksum_get", "checksum", format!("{}:{}", algorithm, digest))
        })
    }

    pub fn lookup(&self, algorithm: ChecksumAlgorithm, digest: &str) -> Option<u32> {
        self.entries
            .get(&algorithm)
            .and_then(|m| m.get(digest))
            .copied()
    }

    pub fn contains(&self, algorithm: ChecksumAlgorithm, digest: &str) -> bool {
        self.lookup(algorithm, digest).is_some()
    }

    /// Remove a digest. Returns the id it pointed to, if any.
    pub fn remove(&mut self, algorithm: ChecksumAlgorithm, digest: &str) -> Option<u32> {
        let by_digest = self.entries.get_mut(&algorithm)?;
        let removed = by_digest.remove(digest);
        if by_digest.is_empty() {
            self.entries.remove(&algorithm);
        }
        removed
    }

    /// Total number of registered digests across all algorithms.
    pub fn len(&self) -> usize {
        self.entries.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries as `(algorithm, digest, id)`, sorted for stable output.
    pub fn entries(&self) -> Vec<(ChecksumAlgorithm, String, u32)> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .flat_map(|(algo, m)| m.iter().map(move |(d, id)| (*algo, d.clone(), *id)))
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        assert_eq!(
            ChecksumAlgorithm::Sha256.digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(ChecksumAlgorithm::Sha512.digest(b"abc").len(), 128);
        assert_eq!(ChecksumAlgorithm::Blake3.digest(b"abc").len(), 64);
    }

    #[test]
    fn test_checksum_parse_and_display() {
        let c = Checksum::compute(ChecksumAlgorithm::Sha256, b"hello");
        let parsed: Checksum = c.to_string().parse().unwrap();
        assert_eq!(parsed, c);
        assert!(c.object_path().starts_with("sha256/2c/"));
        assert_eq!(Checksum::from_object_path(&c.object_path()).unwrap(), c);
        assert!(Checksum::from_object_path("sha256/ff/2cf24d").is_err());

        assert!("sha256:nothex".parse::<Checksum>().is_err());
        assert!("md5:abcd".parse::<Checksum>().is_err());
        assert!("no-separator".parse::<Checksum>().is_err());
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a = serde_json::json!({"b": 1, "a": {"z": true, "y": null}});
        let b = serde_json::json!({"a": {"y": null, "z": true}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), br#"{"a":{"y":null,"z":true},"b":1}"#.to_vec());
    }

    #[test]
    fn test_registry_put_is_idempotent_per_id() {
        let mut reg = ChecksumRegistry::new();
        assert!(reg.put(ChecksumAlgorithm::Sha256, "aa", 1_000_001).unwrap());
        assert!(!reg.put(ChecksumAlgorithm::Sha256, "aa", 1_000_001).unwrap());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_registry_conflict() {
        let mut reg = ChecksumRegistry::new();
        reg.put(ChecksumAlgorithm::Sha256, "aa", 1_000_001).unwrap();
        let err = reg.put(ChecksumAlgorithm::Sha256, "aa", 1_000_002).unwrap_err();
        assert!(matches!(
            err,
            IndexError::ChecksumConflict {
                existing_id: 1_000_001,
                requested_id: 1_000_002,
                ..
            }
        ));
        // Same digest under a different algorithm is a separate key.
        assert!(reg.put(ChecksumAlgorithm::Blake3, "aa", 1_000_002).unwrap());
    }

    #[test]
    fn test_registry_get_and_remove() {
        let mut reg = ChecksumRegistry::new();
        reg.put(ChecksumAlgorithm::Blake3, "bb", 1_000_005).unwrap();
        assert_eq!(reg.get(ChecksumAlgorithm::Blake3, "bb").unwrap(), 1_000_005);
        assert_eq!(reg.remove(ChecksumAlgorithm::Blake3, "bb"), Some(1_000_005));
        assert!(reg.get(ChecksumAlgorithm::Blake3, "bb").unwrap_err().is_not_found());
        assert!(reg.is_empty());
    }
}
