//! Schema creation. Every statement is idempotent, so running this on an
//! existing database is a no-op.

use anyhow::Result;
use sqlx::SqlitePool;

/// Bumped whenever a table below changes shape.
pub const SCHEMA_VERSION: i64 = 1;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Objects of every `sqlite` backend, partitioned by backend name.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS blobs (
            backend TEXT NOT NULL,
            checksum TEXT NOT NULL,
            data BLOB NOT NULL,
            size INTEGER NOT NULL,
            content_type TEXT NOT NULL,
            content_encoding TEXT,
            filename TEXT,
            stored_at INTEGER NOT NULL,
            PRIMARY KEY (backend, checksum)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Index records, one JSON document per row.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_documents (
            id INTEGER PRIMARY KEY,
            checksum TEXT NOT NULL,
            document_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Serialized roaring bitmaps of the three label dimensions.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_labels (
            dimension TEXT NOT NULL,
            label TEXT NOT NULL,
            internal_id INTEGER NOT NULL,
            bitmap BLOB NOT NULL,
            PRIMARY KEY (dimension, label),
            UNIQUE (dimension, internal_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Scalars: id counter, tree snapshot, schema version.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "INSERT INTO meta (key, value) VALUES ('schema_version', ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(SCHEMA_VERSION.to_string())
    .execute(pool)
    .await?;

    Ok(())
}
