//! [`Backend`] storing one file per object under a root directory.
//!
//! Layout: `<root>/<algorithm>/<xx>/<digest>` holds the bytes and a sibling
//! `<digest>.meta.json` holds the [`BlobMetadata`]. Writes go to a temp file
//! first and are renamed into place, so readers never see a partial object.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bitdex_core::store::{Backend, BlobMetadata, ObjectStat};
use bitdex_core::Checksum;
use chrono::{DateTime, Utc};
use walkdir::WalkDir;

const META_SUFFIX: &str = ".meta.json";

pub struct FsBackend {
    name: String,
    root: PathBuf,
}

impl FsBackend {
    pub fn new(name: &str, root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create backend root: {}", root.display()))?;
        Ok(Self {
            name: name.to_string(),
            root: root.to_path_buf(),
        })
    }

    fn object_file(&self, checksum: &Checksum) -> PathBuf {
        self.root.join(checksum.object_path())
    }

    fn meta_file(&self, checksum: &Checksum) -> PathBuf {
        let mut path = self.object_file(checksum).into_os_string();
        path.push(META_SUFFIX);
        PathBuf::from(path)
    }
}

fn is_missing(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::NotFound
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp-{}", uuid::Uuid::new_v4()));
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, data)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("Failed to move object into {}", path.display()));
    }
    Ok(())
}

#[async_trait]
impl Backend for FsBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "fs"
    }

    async fn has(&self, checksum: &Checksum) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.object_file(checksum)).await?)
    }

    async fn stat(&self, checksum: &Checksum) -> Result<Option<ObjectStat>> {
        let file = self.object_file(checksum);
        let fs_meta = match tokio::fs::metadata(&file).await {
            Ok(m) => m,
            Err(e) if is_missing(&e) => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", file.display())),
        };
        let metadata = match tokio::fs::read(self.meta_file(checksum)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).with_context(|| {
                format!("Corrupt metadata sidecar for {}", file.display())
            })?,
            Err(e) if is_missing(&e) => BlobMetadata::default(),
            Err(e) => return Err(e.into()),
        };
        let stored_at: DateTime<Utc> = fs_meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(Some(ObjectStat {
            checksum: checksum.clone(),
            size: fs_meta.len(),
            metadata,
            stored_at,
            backend: self.name.clone(),
        }))
    }

    async fn get(&self, checksum: &Checksum) -> Result<Option<Vec<u8>>> {
        let file = self.object_file(checksum);
        match tokio::fs::read(&file).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", file.display())),
        }
    }

    async fn put(&self, checksum: &Checksum, data: &[u8], metadata: &BlobMetadata) -> Result<()> {
        let file = self.object_file(checksum);
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let meta_json = serde_json::to_vec_pretty(metadata)?;
        write_atomic(&self.meta_file(checksum), &meta_json).await?;
        write_atomic(&file, data).await?;
        Ok(())
    }

    async fn delete(&self, checksum: &Checksum) -> Result<bool> {
        let file = self.object_file(checksum);
        let existed = match tokio::fs::remove_file(&file).await {
            Ok(()) => true,
            Err(e) if is_missing(&e) => false,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to delete {}", file.display()))
            }
        };
        match tokio::fs::remove_file(self.meta_file(checksum)).await {
            Ok(()) => {}
            Err(e) if is_missing(&e) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(existed)
    }

    async fn list(&self) -> Result<Vec<Checksum>> {
        let root = self.root.clone();
        let keys = tokio::task::spawn_blocking(move || -> Result<Vec<Checksum>> {
            let mut out = Vec::new();
            for entry in WalkDir::new(&root).min_depth(3).max_depth(3) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let rel = rel.to_string_lossy().replace('\\', "/");
                if rel.ends_with(META_SUFFIX) || rel.contains(".tmp-") {
                    continue;
                }
                match Checksum::from_object_path(&rel) {
                    Ok(c) => out.push(c),
                    Err(_) => tracing::debug!(path = %rel, "skipping stray file in fs backend"),
                }
            }
            out.sort();
            Ok(out)
        })
        .await??;
        Ok(keys)
    }
}
