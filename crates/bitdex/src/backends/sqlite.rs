//! [`Backend`] over the `blobs` table of the engine database.
//!
//! Several `sqlite` backends may share one database; rows are partitioned
//! by backend name.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bitdex_core::store::{Backend, BlobMetadata, ObjectStat};
use bitdex_core::Checksum;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

pub struct SqliteBackend {
    name: String,
    pool: SqlitePool,
}

impl SqliteBackend {
    pub fn new(name: &str, pool: SqlitePool) -> Self {
        Self {
            name: name.to_string(),
            pool,
        }
    }
}

fn format_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

#[async_trait]
impl Backend for SqliteBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn has(&self, checksum: &Checksum) -> Result<bool> {
        let found: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM blobs WHERE backend = ? AND checksum = ?",
        )
        .bind(&self.name)
        .bind(checksum.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn stat(&self, checksum: &Checksum) -> Result<Option<ObjectStat>> {
        let row = sqlx::query(
            "SELECT size, content_type, content_encoding, filename, stored_at
             FROM blobs WHERE backend = ? AND checksum = ?",
        )
        .bind(&self.name)
        .bind(checksum.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ObjectStat {
            checksum: checksum.clone(),
            size: r.get::<i64, _>("size") as u64,
            metadata: BlobMetadata {
                content_type: r.get("content_type"),
                content_encoding: r.get("content_encoding"),
                filename: r.get("filename"),
            },
            stored_at: format_ts(r.get("stored_at")),
            backend: self.name.clone(),
        }))
    }

    async fn get(&self, checksum: &Checksum) -> Result<Option<Vec<u8>>> {
        let data: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT data FROM blobs WHERE backend = ? AND checksum = ?")
                .bind(&self.name)
                .bind(checksum.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(data)
    }

    async fn put(&self, checksum: &Checksum, data: &[u8], metadata: &BlobMetadata) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO blobs (backend, checksum, data, size, content_type,
                               content_encoding, filename, stored_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(backend, checksum) DO UPDATE SET
                data = excluded.data,
                size = excluded.size,
                content_type = excluded.content_type,
                content_encoding = excluded.content_encoding,
                filename = excluded.filename,
                stored_at = excluded.stored_at
            "#,
        )
        .bind(&self.name)
        .bind(checksum.to_string())
        .bind(data)
        .bind(data.len() as i64)
        .bind(&metadata.content_type)
        .bind(&metadata.content_encoding)
        .bind(&metadata.filename)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, checksum: &Checksum) -> Result<bool> {
        let result = sqlx::query("DELETE FROM blobs WHERE backend = ? AND checksum = ?")
            .bind(&self.name)
            .bind(checksum.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<Checksum>> {
        let keys: Vec<String> =
            sqlx::query_scalar("SELECT checksum FROM blobs WHERE backend = ? ORDER BY checksum")
                .bind(&self.name)
                .fetch_all(&self.pool)
                .await?;
        keys.iter()
            .map(|k| {
                k.parse::<Checksum>()
                    .with_context(|| format!("Corrupt checksum in blobs table: '{}'", k))
            })
            .collect()
    }
}
