//! In-memory [`Backend`] for tests and ephemeral stores.
//!
//! Objects live in a `HashMap` behind `std::sync::RwLock`. A failure switch
//! makes every call error, which is how multi-backend fallback is exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::checksum::Checksum;

use super::{Backend, BlobMetadata, ObjectStat};

struct StoredObject {
    data: Vec<u8>,
    metadata: BlobMetadata,
    stored_at: DateTime<Utc>,
}

pub struct MemoryBackend {
    name: String,
    objects: RwLock<HashMap<Checksum, StoredObject>>,
    failing: AtomicBool,
}

impl MemoryBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            objects: RwLock::new(HashMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, op: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("memory backend '{}' unavailable during {}", self.name, op);
        }
        Ok(())
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("memory backend lock poisoned")
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn has(&self, checksum: &Checksum) -> Result<bool> {
        self.check("has")?;
        Ok(self.objects.read().map_err(poisoned)?.contains_key(checksum))
    }

    async fn stat(&self, checksum: &Checksum) -> Result<Option<ObjectStat>> {
        self.check("stat")?;
        let objects = self.objects.read().map_err(poisoned)?;
        Ok(objects.get(checksum).map(|o| ObjectStat {
            checksum: checksum.clone(),
            size: o.data.len() as u64,
            metadata: o.metadata.clone(),
            stored_at: o.stored_at,
            backend: self.name.clone(),
        }))
    }

    async fn get(&self, checksum: &Checksum) -> Result<Option<Vec<u8>>> {
        self.check("get")?;
        let objects = self.objects.read().map_err(poisoned)?;
        Ok(objects.get(checksum).map(|o| o.data.clone()))
    }

    async fn put(&self, checksum: &Checksum, data: &[u8], metadata: &BlobMetadata) -> Result<()> {
        self.check("put")?;
        let mut objects = self.objects.write().map_err(poisoned)?;
        objects.insert(
            checksum.clone(),
            StoredObject {
                data: data.to_vec(),
                metadata: metadata.clone(),
                stored_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, checksum: &Checksum) -> Result<bool> {
        self.check("delete")?;
        Ok(self
            .objects
            .write()
            .map_err(poisoned)?
            .remove(checksum)
            .is_some())
    }

    async fn list(&self) -> Result<Vec<Checksum>> {
        self.check("list")?;
        let mut out: Vec<Checksum> = self.objects.read().map_err(poisoned)?.keys().cloned().collect();
        out.sort();
        Ok(out)
    }
}
