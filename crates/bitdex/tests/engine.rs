use std::path::Path;

use bitdex::config::{parse_config, Config};
use bitdex::content_store::{BackendStatus, GetOptions};
use bitdex::events::Event;
use bitdex::Engine;
use bitdex_core::index::RemoveOutcome;
use bitdex_core::store::BlobMetadata;
use bitdex_core::{Checksum, ChecksumAlgorithm, Document, DocumentPatch, FindOptions, IndexError, LabelQuery};
use serde_json::json;
use tempfile::TempDir;

fn sqlite_config(dir: &Path) -> Config {
    parse_config(&format!(
        "[db]\npath = \"{}/data/bitdex.sqlite\"\n",
        dir.display()
    ))
    .unwrap()
}

fn memory_config(dir: &Path) -> Config {
    parse_config(&format!(
        r#"[db]
path = "{}/data/bitdex.sqlite"

[store]
default_backends = ["primary", "secondary"]

[backends.primary]
kind = "memory"
ignore_backend_errors = true

[backends.secondary]
kind = "memory"
"#,
        dir.display()
    ))
    .unwrap()
}

fn note(title: &str) -> Document {
    Document::new("data/abstraction/note", json!({ "title": title }))
}

fn paths(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

fn find_ids(engine: &Engine, contexts: &[&str]) -> Vec<u32> {
    let query = LabelQuery::new(contexts.iter().copied(), Vec::<String>::new(), Vec::<String>::new());
    engine
        .find_documents(&query, FindOptions::default())
        .unwrap()
        .documents
        .iter()
        .map(|d| d.id)
        .collect()
}

#[tokio::test]
async fn test_context_query_matches_subtree() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();

    let a = engine
        .insert_document(note("a"), &paths(&["/projects/reports"]), &[], &[])
        .await
        .unwrap();
    let b = engine
        .insert_document(note("b"), &paths(&["/projects"]), &[], &[])
        .await
        .unwrap();
    let c = engine
        .insert_document(note("c"), &paths(&["/personal"]), &[], &[])
        .await
        .unwrap();

    assert_eq!(find_ids(&engine, &["/projects"]), vec![a.id, b.id]);
    assert_eq!(find_ids(&engine, &["/projects/reports"]), vec![a.id]);
    assert_eq!(find_ids(&engine, &["/projects", "!/projects/reports"]), vec![b.id]);
    assert_eq!(find_ids(&engine, &["!/projects"]), vec![c.id]);
    assert_eq!(engine.document_paths(a.id).unwrap(), vec!["/projects/reports"]);

    // Unknown paths fail when required and are ignored when excluded.
    let err = engine
        .find_documents(
            &LabelQuery::new(["/missing"], Vec::<String>::new(), Vec::<String>::new()),
            FindOptions::default(),
        )
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(find_ids(&engine, &["!/missing"]).len(), 3);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_document_without_contexts_is_filed_at_root() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();

    let a = engine.insert_document(note("a"), &[], &[], &[]).await.unwrap();
    assert_eq!(find_ids(&engine, &["/"]), vec![a.id]);
    assert_eq!(engine.document_paths(a.id).unwrap(), vec!["/"]);
}

#[tokio::test]
async fn test_identical_content_deduplicates() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();

    let first = engine
        .insert_document(note("same"), &paths(&["/one"]), &[], &[])
        .await
        .unwrap();
    let second = engine
        .insert_document(note("same"), &paths(&["/two"]), &paths(&["starred"]), &[])
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert!(!first.deduplicated);
    assert!(second.deduplicated);
    assert_eq!(engine.index().len(), 1);
    assert_eq!(find_ids(&engine, &["/two"]), vec![first.id]);
    assert!(engine.get_document(first.id).unwrap().features.contains("starred"));
}

#[tokio::test]
async fn test_body_is_stored_and_read_back() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();

    let outcome = engine
        .insert_document(note("body"), &[], &[], &[])
        .await
        .unwrap();
    let doc = engine.get_document(outcome.id).unwrap();
    assert_eq!(doc.storage_paths.len(), 1);
    assert!(doc.storage_paths[0].starts_with("bitdex://local/checksum/sha256/"));

    let body = engine
        .get_document_body(outcome.id, GetOptions::default())
        .await
        .unwrap();
    assert_eq!(body, json!({ "title": "body" }));
}

#[tokio::test]
async fn test_update_replaces_contexts_and_body() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();

    let id = engine
        .insert_document(note("old"), &paths(&["/old"]), &[], &[])
        .await
        .unwrap()
        .id;
    let old_paths = engine.get_document(id).unwrap().storage_paths;

    let patch = DocumentPatch {
        data: Some(json!({ "title": "new" })),
        contexts: Some(paths(&["/new"])),
        ..Default::default()
    };
    let updated = engine.update_document(id, &patch, &[]).await.unwrap();

    assert_eq!(updated.data, json!({ "title": "new" }));
    assert_eq!(updated.storage_paths.len(), 1);
    assert_ne!(updated.storage_paths, old_paths);
    assert!(find_ids(&engine, &["/old"]).is_empty());
    assert_eq!(find_ids(&engine, &["/new"]), vec![id]);
    assert_eq!(
        engine.get_document_body(id, GetOptions::default()).await.unwrap(),
        json!({ "title": "new" })
    );
}

#[tokio::test]
async fn test_remove_document_purges_body() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();

    let id = engine
        .insert_document(note("gone"), &paths(&["/trash"]), &[], &[])
        .await
        .unwrap()
        .id;
    let body = Checksum::compute(
        ChecksumAlgorithm::Sha256,
        &bitdex_core::checksum::canonical_json(&json!({ "title": "gone" })),
    );
    assert!(engine.has_blob(&body, &[]).await.unwrap());

    let outcome = engine.remove_document(id, true).await.unwrap();
    assert!(matches!(outcome, RemoveOutcome::Removed(ref doc) if doc.id == id));
    assert!(!engine.has_document(id));
    assert!(!engine.has_blob(&body, &[]).await.unwrap());
    assert!(find_ids(&engine, &["/trash"]).is_empty());

    assert_eq!(
        engine.remove_document(id, true).await.unwrap(),
        RemoveOutcome::AlreadyRemoved
    );
    assert!(engine
        .remove_document(5_000_000, true)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_keep_blobs_leaves_body_in_place() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();

    let id = engine.insert_document(note("kept"), &[], &[], &[]).await.unwrap().id;
    let body = Checksum::compute(
        ChecksumAlgorithm::Sha256,
        &bitdex_core::checksum::canonical_json(&json!({ "title": "kept" })),
    );
    engine.remove_document(id, false).await.unwrap();
    assert!(engine.has_blob(&body, &[]).await.unwrap());
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let id = {
        let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();
        let id = engine
            .insert_document(note("durable"), &paths(&["/keep/me"]), &paths(&["pinned"]), &[])
            .await
            .unwrap()
            .id;
        engine.shutdown().await.unwrap();
        id
    };

    let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();
    assert!(engine.has_document(id));
    assert_eq!(find_ids(&engine, &["/keep"]), vec![id]);
    assert!(engine.context_paths().contains(&"/keep/me".to_string()));
    assert_eq!(
        engine.get_document_body(id, GetOptions::default()).await.unwrap(),
        json!({ "title": "durable" })
    );

    // Ids keep increasing after a reopen.
    let next = engine.insert_document(note("later"), &[], &[], &[]).await.unwrap();
    assert_eq!(next.id, id + 1);
}

#[tokio::test]
async fn test_move_context_carries_documents() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();

    let id = engine
        .insert_document(note("moved"), &paths(&["/a/b"]), &[], &[])
        .await
        .unwrap()
        .id;
    engine.insert_context("/c").unwrap();

    let to = engine.move_context("/a/b", "/c", true).unwrap();
    assert_eq!(to, "/c/b");
    assert_eq!(find_ids(&engine, &["/c"]), vec![id]);
    assert!(find_ids(&engine, &["/a"]).is_empty());
    assert_eq!(engine.document_paths(id).unwrap(), vec!["/c/b"]);
}

#[tokio::test]
async fn test_copy_context_duplicates_memberships() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();

    let id = engine
        .insert_document(note("copied"), &paths(&["/a/b"]), &[], &[])
        .await
        .unwrap()
        .id;
    engine.insert_context("/c").unwrap();

    assert_eq!(engine.copy_context("/a/b", "/c").unwrap(), 1);
    assert_eq!(find_ids(&engine, &["/a"]), vec![id]);
    assert_eq!(find_ids(&engine, &["/c"]), vec![id]);
}

#[tokio::test]
async fn test_remove_context_requires_force_when_filed() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();

    let id = engine
        .insert_document(note("filed"), &paths(&["/a/b"]), &[], &[])
        .await
        .unwrap()
        .id;

    let err = engine.remove_context("/a/b", false, false).unwrap_err();
    assert!(matches!(err, IndexError::NotEmpty { .. }));
    assert!(engine.context_paths().contains(&"/a/b".to_string()));

    engine.remove_context("/a/b", false, true).unwrap();
    assert!(!engine.context_paths().contains(&"/a/b".to_string()));
    assert!(find_ids(&engine, &["/a"]).is_empty());
    assert!(engine.has_document(id));
}

#[tokio::test]
async fn test_create_version_links_parent() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();

    let parent = engine
        .insert_document(note("v1"), &paths(&["/drafts"]), &[], &[])
        .await
        .unwrap()
        .id;
    let patch = DocumentPatch {
        data: Some(json!({ "title": "v2" })),
        ..Default::default()
    };
    let child = engine.create_version(parent, &patch, &[]).await.unwrap();
    assert!(!child.deduplicated);

    let child_doc = engine.get_document(child.id).unwrap();
    assert_eq!(child_doc.parent_id, Some(parent));
    assert_eq!(child_doc.version_number, 2);
    assert_eq!(child_doc.data, json!({ "title": "v2" }));

    let parent_doc = engine.get_document(parent).unwrap();
    assert_eq!(parent_doc.latest_version, 2);
    assert_eq!(parent_doc.versions.len(), 1);
    assert_eq!(parent_doc.versions[0].id, child.id);

    // The version inherits the parent's contexts.
    assert_eq!(find_ids(&engine, &["/drafts"]), vec![parent, child.id]);

    // A version identical to existing content is rejected.
    let err = engine.create_version(parent, &patch, &[]).await.unwrap_err();
    assert!(matches!(err, IndexError::Validation { .. }));
}

#[tokio::test]
async fn test_failed_insert_undoes_created_paths() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();

    let bad = Document::new("", json!({ "title": "no schema" }));
    let err = engine
        .insert_document(bad, &paths(&["/ghost/town"]), &[], &[])
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::Validation { .. }));
    assert!(!engine.context_paths().iter().any(|p| p.starts_with("/ghost")));
}

#[tokio::test]
async fn test_timeframe_filters() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();

    let id = engine.insert_document(note("fresh"), &[], &[], &[]).await.unwrap().id;
    let today = LabelQuery::new(Vec::<String>::new(), Vec::<String>::new(), ["today"]);
    let yesterday = LabelQuery::new(
        Vec::<String>::new(),
        Vec::<String>::new(),
        ["created:yesterday"],
    );
    let found = engine.find_documents(&today, FindOptions::default()).unwrap();
    assert_eq!(found.documents[0].id, id);
    let found = engine.find_documents(&yesterday, FindOptions::default()).unwrap();
    assert_eq!(found.total_count, 0);
}

#[tokio::test]
async fn test_offline_backend_is_skipped() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(memory_config(tmp.path())).await.unwrap();

    engine
        .set_backend_status("primary", BackendStatus::Offline)
        .unwrap();
    let receipt = engine
        .insert_blob(b"payload", &BlobMetadata::default(), &[])
        .await
        .unwrap();
    assert_eq!(receipt.storage_paths.len(), 1);
    assert!(receipt.storage_paths[0].starts_with("bitdex://secondary/"));

    engine
        .set_backend_status("primary", BackendStatus::Online)
        .unwrap();
    let bytes = engine
        .get_blob(&receipt.checksum, &[], GetOptions { strict: true })
        .await
        .unwrap();
    assert_eq!(bytes, b"payload");
}

#[tokio::test]
async fn test_events_follow_mutations() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();
    let mut events = engine.subscribe();

    let id = engine
        .insert_document(note("evented"), &paths(&["/inbox"]), &[], &[])
        .await
        .unwrap()
        .id;
    engine.remove_document(id, false).await.unwrap();

    let mut seen = Vec::new();
    while let Some(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen
        .iter()
        .any(|e| matches!(e, Event::TreePathInserted { path, .. } if path == "/inbox")));
    assert!(seen.iter().any(|e| matches!(e, Event::BlobStored { .. })));
    assert!(seen
        .iter()
        .any(|e| matches!(e, Event::DocumentInserted { id: i, .. } if *i == id)));
    assert_eq!(seen.last(), Some(&Event::DocumentRemoved { id }));
}

#[tokio::test]
async fn test_layers_round_trip_through_engine() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();

    engine
        .create_layer("shared", bitdex_core::tree::LayerKind::Context)
        .unwrap();
    engine.set_layer_acl("shared", "alice", "read").unwrap();
    let locked = engine.lock_layer("shared").unwrap();
    assert!(locked.locked);
    assert_eq!(locked.acl.get("alice").map(String::as_str), Some("read"));

    engine.unlock_layer("shared").unwrap();
    engine.rename_layer("shared", "team").unwrap();
    assert!(engine.get_layer("team").is_ok());
    assert!(engine.get_layer("shared").is_err());
}

#[tokio::test]
async fn test_locked_layer_rejects_document_mutations() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();

    let kept = engine
        .insert_document(note("kept"), &paths(&["/vault"]), &[], &[])
        .await
        .unwrap()
        .id;
    let loose = engine
        .insert_document(note("loose"), &paths(&["/open"]), &[], &[])
        .await
        .unwrap()
        .id;
    engine.lock_layer("vault").unwrap();

    let err = engine
        .insert_document(note("new"), &paths(&["/vault"]), &[], &[])
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::LayerLocked { .. }));
    let err = engine
        .insert_document(note("nested"), &paths(&["/vault/inner"]), &[], &[])
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::LayerLocked { .. }));
    assert!(!engine.context_paths().contains(&"/vault/inner".to_string()));
    assert_eq!(engine.index().len(), 2);

    let into_vault = DocumentPatch {
        contexts: Some(paths(&["/vault"])),
        ..Default::default()
    };
    let err = engine.update_document(loose, &into_vault, &[]).await.unwrap_err();
    assert!(matches!(err, IndexError::LayerLocked { .. }));
    assert_eq!(engine.document_paths(loose).unwrap(), vec!["/open"]);

    let out_of_vault = DocumentPatch {
        contexts: Some(paths(&["/open"])),
        ..Default::default()
    };
    let err = engine.update_document(kept, &out_of_vault, &[]).await.unwrap_err();
    assert!(matches!(err, IndexError::LayerLocked { .. }));

    let err = engine.remove_document(kept, true).await.unwrap_err();
    assert!(matches!(err, IndexError::LayerLocked { .. }));
    assert!(engine.has_document(kept));
    assert!(engine
        .get_document_body(kept, GetOptions::default())
        .await
        .is_ok());

    engine.unlock_layer("vault").unwrap();
    engine.remove_document(kept, true).await.unwrap();
    assert!(find_ids(&engine, &["/vault"]).is_empty());
}

fn keyed_by_url(data: serde_json::Value) -> Document {
    let mut doc = Document::new("data/abstraction/bookmark", data);
    doc.index.primary_checksum_fields = vec!["url".to_string()];
    doc
}

fn body_checksum(data: &serde_json::Value) -> Checksum {
    Checksum::compute(
        ChecksumAlgorithm::Sha256,
        &bitdex_core::checksum::canonical_json(data),
    )
}

#[tokio::test]
async fn test_purge_keeps_body_shared_with_live_document() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();
    let data = json!({ "url": "https://example.com", "title": "shared" });

    let by_url = engine
        .insert_document(keyed_by_url(data.clone()), &[], &[], &[])
        .await
        .unwrap();
    let whole = engine
        .insert_document(Document::new("data/abstraction/bookmark", data.clone()), &[], &[], &[])
        .await
        .unwrap();
    assert!(!whole.deduplicated);
    assert_ne!(by_url.id, whole.id);
    assert_eq!(
        engine.get_document(by_url.id).unwrap().storage_paths,
        engine.get_document(whole.id).unwrap().storage_paths
    );

    engine.remove_document(whole.id, true).await.unwrap();
    assert_eq!(
        engine
            .get_document_body(by_url.id, GetOptions::default())
            .await
            .unwrap(),
        data
    );

    // The last reference takes the body with it.
    engine.remove_document(by_url.id, true).await.unwrap();
    assert!(!engine.has_blob(&body_checksum(&data), &[]).await.unwrap());
}

#[tokio::test]
async fn test_deduplicated_insert_discards_its_body() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();
    let first = json!({ "url": "https://example.com", "visited": 1 });
    let second = json!({ "url": "https://example.com", "visited": 2 });

    let original = engine
        .insert_document(keyed_by_url(first.clone()), &[], &[], &[])
        .await
        .unwrap();
    let repeat = engine
        .insert_document(keyed_by_url(second.clone()), &[], &[], &[])
        .await
        .unwrap();
    assert!(repeat.deduplicated);
    assert_eq!(repeat.id, original.id);
    assert!(!engine.has_blob(&body_checksum(&second), &[]).await.unwrap());

    // A repeat carrying the same body leaves the stored one alone.
    let same = engine
        .insert_document(keyed_by_url(first.clone()), &[], &[], &[])
        .await
        .unwrap();
    assert!(same.deduplicated);
    assert!(engine.has_blob(&body_checksum(&first), &[]).await.unwrap());
    assert_eq!(
        engine
            .get_document_body(original.id, GetOptions::default())
            .await
            .unwrap(),
        first
    );
}

#[tokio::test]
async fn test_concurrent_failure_keeps_shared_path() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(sqlite_config(tmp.path())).await.unwrap();
    let target = paths(&["/x/y"]);
    let sibling = paths(&["/x/z"]);
    let bad = paths(&["!bad"]);

    // The first insert creates /x/y and fails at the index step, after its
    // body write has yielded to the others.
    let (a, b, c) = tokio::join!(
        engine.insert_document(note("a"), &target, &bad, &[]),
        engine.insert_document(note("b"), &target, &[], &[]),
        engine.insert_document(note("c"), &sibling, &[], &[]),
    );
    assert!(matches!(a, Err(IndexError::Validation { .. })));
    let b = b.unwrap().id;
    let c = c.unwrap().id;

    assert_eq!(engine.document_paths(b).unwrap(), vec!["/x/y"]);
    assert_eq!(engine.document_paths(c).unwrap(), vec!["/x/z"]);
    let mut expected = vec![b, c];
    expected.sort();
    assert_eq!(find_ids(&engine, &["/x"]), expected);
    assert!(!engine
        .has_blob(&body_checksum(&json!({ "title": "a" })), &[])
        .await
        .unwrap());
}
