//! Snapshot persistence of the index and context tree.
//!
//! The whole in-memory state is written in one SQLite transaction, so a
//! crash mid-flush leaves the previous snapshot intact.

use anyhow::{Context, Result};
use bitdex_core::bitmap::LabelSnapshot;
use bitdex_core::index::{Dimension, IndexSnapshot};
use bitdex_core::models::Document;
use bitdex_core::tree::TreeSnapshot;
use sqlx::{Row, SqlitePool};

const NEXT_ID_KEY: &str = "next_id";
const TREE_KEY: &str = "tree";

/// Replace the stored snapshot with `index` and `tree`.
pub async fn save(pool: &SqlitePool, index: &IndexSnapshot, tree: &TreeSnapshot) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM index_documents")
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM index_labels")
        .execute(&mut *tx)
        .await?;

    for doc in &index.documents {
        let json = serde_json::to_string(doc)
            .with_context(|| format!("Failed to serialize document {}", doc.id))?;
        sqlx::query("INSERT INTO index_documents (id, checksum, document_json) VALUES (?, ?, ?)")
            .bind(doc.id as i64)
            .bind(doc.primary_checksum().unwrap_or_default())
            .bind(json)
            .execute(&mut *tx)
            .await?;
    }

    for (dimension, labels) in [
        (Dimension::Context, &index.contexts),
        (Dimension::Feature, &index.features),
        (Dimension::Filter, &index.filters),
    ] {
        for snap in labels {
            sqlx::query(
                "INSERT INTO index_labels (dimension, label, internal_id, bitmap) VALUES (?, ?, ?, ?)",
            )
            .bind(dimension.as_str())
            .bind(&snap.label)
            .bind(snap.internal_id as i64)
            .bind(&snap.bitmap)
            .execute(&mut *tx)
            .await?;
        }
    }

    let tree_json = serde_json::to_string(tree).context("Failed to serialize context tree")?;
    for (key, value) in [
        (NEXT_ID_KEY, index.next_id.to_string()),
        (TREE_KEY, tree_json),
    ] {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    tracing::debug!(
        documents = index.documents.len(),
        next_id = index.next_id,
        "snapshot saved"
    );
    Ok(())
}

/// Load the stored snapshot. `None` when nothing has been saved yet.
pub async fn load(pool: &SqlitePool) -> Result<Option<(IndexSnapshot, TreeSnapshot)>> {
    let next_id: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
        .bind(NEXT_ID_KEY)
        .fetch_optional(pool)
        .await?;
    let Some(next_id) = next_id else {
        return Ok(None);
    };
    let next_id: u64 = next_id
        .parse()
        .with_context(|| format!("Corrupt next_id in meta table: '{}'", next_id))?;

    let tree_json: String = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
        .bind(TREE_KEY)
        .fetch_one(pool)
        .await
        .context("Snapshot has an id counter but no context tree")?;
    let tree: TreeSnapshot =
        serde_json::from_str(&tree_json).context("Failed to parse stored context tree")?;

    let rows = sqlx::query("SELECT id, document_json FROM index_documents ORDER BY id")
        .fetch_all(pool)
        .await?;
    let mut documents = Vec::with_capacity(rows.len());
    for row in rows {
        let id: i64 = row.get("id");
        let json: String = row.get("document_json");
        let doc: Document = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse stored document {}", id))?;
        documents.push(doc);
    }

    let rows = sqlx::query(
        "SELECT dimension, label, internal_id, bitmap FROM index_labels ORDER BY internal_id",
    )
    .fetch_all(pool)
    .await?;
    let mut snapshot = IndexSnapshot {
        next_id,
        documents,
        ..IndexSnapshot::default()
    };
    for row in rows {
        let dimension: String = row.get("dimension");
        let internal_id: i64 = row.get("internal_id");
        let label = LabelSnapshot {
            label: row.get("label"),
            internal_id: u32::try_from(internal_id)
                .with_context(|| format!("Corrupt internal id {}", internal_id))?,
            bitmap: row.get("bitmap"),
        };
        match dimension.as_str() {
            "context" => snapshot.contexts.push(label),
            "feature" => snapshot.features.push(label),
            "filter" => snapshot.filters.push(label),
            other => anyhow::bail!("Unknown label dimension in snapshot: '{}'", other),
        }
    }

    Ok(Some((snapshot, tree)))
}
