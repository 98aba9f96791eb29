use indexmap::IndexMap;
use serde_json::json;
use tempfile::TempDir;

use sync_commit_log::store::ChunkRecord;
use sync_commit_log::{
   ChangeOp, CommitLogStore, EmittedChange, Error, NewCommit, ScopeFilter, ScopeMap, ScopeValue,
   SyncDb, ensure_sync_schema, now_unix_ms,
};

async fn create_test_store() -> (CommitLogStore, TempDir) {
   let temp_dir = TempDir::new().expect("Failed to create temp directory");
   let db_path = temp_dir.path().join("log.db");
   let db = SyncDb::connect_sqlite(&db_path, None)
      .await
      .expect("Failed to open test database");
   ensure_sync_schema(&db).await.expect("Failed to ensure schema");
   (CommitLogStore::new(db), temp_dir)
}

fn change(table: &str, row_id: &str, version: i64, user: &str) -> EmittedChange {
   let mut scopes = IndexMap::new();
   scopes.insert("user_id".to_string(), user.to_string());
   EmittedChange {
      table: table.into(),
      row_id: row_id.into(),
      op: ChangeOp::Upsert,
      row_json: Some(json!({"id": row_id, "user_id": user, "server_version": version})),
      row_version: Some(version),
      scopes,
   }
}

async fn append(
   store: &CommitLogStore,
   partition: &str,
   client_commit_id: &str,
   changes: &[EmittedChange],
) -> i64 {
   let mut txn = store.db().begin().await.unwrap();
   let seq = store
      .append_commit(
         &mut txn,
         NewCommit {
            partition_id: partition,
            actor_id: "u1",
            client_id: "c1",
            client_commit_id,
            changes,
            meta: None,
            result: Some(&json!([{"status": "applied", "opIndex": 0}])),
         },
      )
      .await
      .unwrap();
   txn.commit().await.unwrap();
   seq
}

#[tokio::test]
async fn test_ensure_schema_is_idempotent() {
   let (store, _temp) = create_test_store().await;
   // Second and third passes must be no-ops
   ensure_sync_schema(store.db()).await.unwrap();
   ensure_sync_schema(store.db()).await.unwrap();

   let seq = append(&store, "default", "cc1", &[change("tasks", "t1", 1, "u1")]).await;
   assert_eq!(seq, 1);
}

#[tokio::test]
async fn test_append_assigns_monotonic_seqs_per_partition() {
   let (store, _temp) = create_test_store().await;

   assert_eq!(append(&store, "p1", "cc1", &[change("tasks", "t1", 1, "u1")]).await, 1);
   assert_eq!(append(&store, "p1", "cc2", &[change("tasks", "t2", 1, "u1")]).await, 2);
   // A different partition starts its own sequence
   assert_eq!(append(&store, "p2", "cc1", &[change("tasks", "t1", 1, "u1")]).await, 1);

   assert_eq!(store.max_commit_seq("p1").await.unwrap(), 2);
   assert_eq!(store.max_commit_seq("p2").await.unwrap(), 1);
   assert_eq!(store.max_commit_seq("empty").await.unwrap(), 0);
}

#[tokio::test]
async fn test_idempotency_key_is_unique() {
   let (store, _temp) = create_test_store().await;
   append(&store, "default", "cc1", &[change("tasks", "t1", 1, "u1")]).await;

   let mut txn = store.db().begin().await.unwrap();
   let err = store
      .append_commit(
         &mut txn,
         NewCommit {
            partition_id: "default",
            actor_id: "u1",
            client_id: "c1",
            client_commit_id: "cc1",
            changes: &[change("tasks", "t9", 1, "u1")],
            meta: None,
            result: None,
         },
      )
      .await
      .unwrap_err();
   txn.rollback().await.unwrap();

   assert!(matches!(err, Error::IdempotencyViolation { .. }));
   assert_eq!(err.error_code(), "IDEMPOTENCY_VIOLATION");

   // The stored commit is findable by its key
   let commit = store
      .find_commit_by_idempotency_key("default", "c1", "cc1")
      .await
      .unwrap()
      .unwrap();
   assert_eq!(commit.commit_seq, 1);
   assert_eq!(commit.change_count, 1);
   assert_eq!(commit.affected_tables, vec!["tasks"]);
   assert!(commit.result.is_some());
}

#[tokio::test]
async fn test_read_commit_seqs_for_pull_filters_by_table_and_cursor() {
   let (store, _temp) = create_test_store().await;
   append(&store, "default", "cc1", &[change("tasks", "t1", 1, "u1")]).await;
   append(&store, "default", "cc2", &[change("notes", "n1", 1, "u1")]).await;
   append(&store, "default", "cc3", &[change("tasks", "t1", 2, "u1")]).await;

   let seqs = store
      .read_commit_seqs_for_pull("default", &["tasks".to_string()], 0, 100)
      .await
      .unwrap();
   assert_eq!(seqs, vec![1, 3]);

   // Cursor is exclusive
   let seqs = store
      .read_commit_seqs_for_pull("default", &["tasks".to_string()], 1, 100)
      .await
      .unwrap();
   assert_eq!(seqs, vec![3]);

   // Multi-table union, deduplicated and ordered
   let seqs = store
      .read_commit_seqs_for_pull(
         "default",
         &["tasks".to_string(), "notes".to_string()],
         0,
         100,
      )
      .await
      .unwrap();
   assert_eq!(seqs, vec![1, 2, 3]);

   // Limit applies after ordering
   let seqs = store
      .read_commit_seqs_for_pull(
         "default",
         &["tasks".to_string(), "notes".to_string()],
         0,
         2,
      )
      .await
      .unwrap();
   assert_eq!(seqs, vec![1, 2]);
}

#[tokio::test]
async fn test_read_changes_applies_scope_filter() {
   let (store, _temp) = create_test_store().await;
   append(
      &store,
      "default",
      "cc1",
      &[change("tasks", "t1", 1, "u1"), change("tasks", "t2", 1, "u2")],
   )
   .await;

   let all = store
      .read_changes_for_commits("default", &[1], "tasks", &ScopeFilter::default())
      .await
      .unwrap();
   assert_eq!(all.len(), 2);
   // Insertion order within the commit
   assert!(all[0].change.change_id < all[1].change.change_id);
   assert_eq!(all[0].actor_id, "u1");

   let filter = ScopeFilter::from_scope_map(&ScopeMap::single("user_id", "u2"));
   let filtered = store
      .read_changes_for_commits("default", &[1], "tasks", &filter)
      .await
      .unwrap();
   assert_eq!(filtered.len(), 1);
   assert_eq!(filtered[0].change.row_id, "t2");
   assert_eq!(filtered[0].change.scopes.get("user_id"), Some(&"u2".to_string()));

   let mut many = ScopeMap::new();
   many.insert(
      "user_id",
      ScopeValue::Many(vec!["u1".into(), "u2".into()]),
   );
   let both = store
      .read_changes_for_commits("default", &[1], "tasks", &ScopeFilter::from_scope_map(&many))
      .await
      .unwrap();
   assert_eq!(both.len(), 2);
}

#[tokio::test]
async fn test_incremental_windows_align_with_commit_boundaries() {
   let (store, _temp) = create_test_store().await;
   for i in 0..5 {
      append(
         &store,
         "default",
         &format!("cc{i}"),
         &[
            change("tasks", &format!("a{i}"), 1, "u1"),
            change("tasks", &format!("b{i}"), 1, "u1"),
         ],
      )
      .await;
   }

   let mut iter = store
      .incremental_pull("default", "tasks", ScopeFilter::default(), 0, 100, 2)
      .await
      .unwrap();
   assert_eq!(iter.commit_seqs(), &[1, 2, 3, 4, 5]);
   assert_eq!(iter.last_commit_seq(), Some(5));

   // Windows of 2 whole commits: 4 + 4 + 2 rows, never splitting a commit
   let w1 = iter.next_window().await.unwrap().unwrap();
   assert_eq!(w1.len(), 4);
   assert_eq!(w1.iter().map(|r| r.change.commit_seq).collect::<Vec<_>>(), vec![1, 1, 2, 2]);
   let w2 = iter.next_window().await.unwrap().unwrap();
   assert_eq!(w2.len(), 4);
   let w3 = iter.next_window().await.unwrap().unwrap();
   assert_eq!(w3.len(), 2);
   assert_eq!(w3[0].change.commit_seq, 5);
   assert!(iter.next_window().await.unwrap().is_none());
}

#[tokio::test]
async fn test_incremental_respects_limit_commits() {
   let (store, _temp) = create_test_store().await;
   for i in 0..5 {
      append(&store, "default", &format!("cc{i}"), &[change("tasks", "t1", i + 1, "u1")]).await;
   }

   let iter = store
      .incremental_pull("default", "tasks", ScopeFilter::default(), 0, 3, 10)
      .await
      .unwrap();
   assert_eq!(iter.commit_seqs(), &[1, 2, 3]);
}

#[tokio::test]
async fn test_client_cursor_upsert_and_evict() {
   let (store, _temp) = create_test_store().await;

   assert!(store.get_client_cursor("default", "c1").await.unwrap().is_none());

   store
      .record_client_cursor("default", "c1", "u1", 7, Some(&json!({"s": {"user_id": "u1"}})))
      .await
      .unwrap();
   let cursor = store.get_client_cursor("default", "c1").await.unwrap().unwrap();
   assert_eq!(cursor.cursor, 7);
   assert_eq!(cursor.actor_id, "u1");
   assert!(cursor.effective_scopes.is_some());

   // Upsert replaces in place
   store
      .record_client_cursor("default", "c1", "u1", 9, None)
      .await
      .unwrap();
   let cursor = store.get_client_cursor("default", "c1").await.unwrap().unwrap();
   assert_eq!(cursor.cursor, 9);

   assert!(store.evict_client_cursor("default", "c1").await.unwrap());
   assert!(!store.evict_client_cursor("default", "c1").await.unwrap());
   assert!(store.get_client_cursor("default", "c1").await.unwrap().is_none());
}

fn chunk_record(chunk_id: &str, body: &[u8], expires_at: i64) -> ChunkRecord {
   ChunkRecord {
      chunk_id: chunk_id.into(),
      partition_id: "default".into(),
      scope_key: "user:u1".into(),
      scope: r#"{"user_id":"u1"}"#.into(),
      as_of_commit_seq: 3,
      row_cursor: String::new(),
      row_limit: 500,
      encoding: "json".into(),
      compression: "none".into(),
      sha256: "abc".into(),
      byte_length: body.len() as i64,
      body: body.to_vec(),
      blob_hash: None,
      created_at: now_unix_ms(),
      expires_at,
   }
}

#[tokio::test]
async fn test_chunk_page_key_deduplicates() {
   let (store, _temp) = create_test_store().await;
   let later = now_unix_ms() + 60_000;

   let first = store
      .insert_chunk_if_absent(&chunk_record("chunk-a", b"[1,2,3]", later))
      .await
      .unwrap();
   assert_eq!(first.chunk_id, "chunk-a");

   // Same page key from a concurrent producer: the stored row wins
   let second = store
      .insert_chunk_if_absent(&chunk_record("chunk-b", b"[1,2,3]", later))
      .await
      .unwrap();
   assert_eq!(second.chunk_id, "chunk-a");
   assert_eq!(second.body, b"[1,2,3]");

   let fetched = store.get_chunk("chunk-a", now_unix_ms()).await.unwrap().unwrap();
   assert_eq!(fetched.body, b"[1,2,3]");
   assert_eq!(fetched.row_limit, 500);
}

#[tokio::test]
async fn test_expired_chunks_read_as_missing_and_sweep() {
   let (store, _temp) = create_test_store().await;
   let past = now_unix_ms() - 1;
   store
      .insert_chunk_if_absent(&chunk_record("old", b"[]", past))
      .await
      .unwrap();

   assert!(store.get_chunk("old", now_unix_ms()).await.unwrap().is_none());
   assert_eq!(store.delete_expired_chunks(now_unix_ms()).await.unwrap(), 1);
   assert_eq!(store.delete_expired_chunks(now_unix_ms()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_oldest_retained_and_partitions() {
   let (store, _temp) = create_test_store().await;
   assert_eq!(store.oldest_retained_commit_seq("default").await.unwrap(), 0);

   append(&store, "default", "cc1", &[change("tasks", "t1", 1, "u1")]).await;
   append(&store, "other", "cc1", &[change("tasks", "t1", 1, "u1")]).await;

   assert_eq!(store.oldest_retained_commit_seq("default").await.unwrap(), 1);
   assert_eq!(store.list_partitions().await.unwrap(), vec!["default", "other"]);
}

#[tokio::test]
async fn test_savepoint_rollback_discards_partial_work() {
   let (store, _temp) = create_test_store().await;

   let mut txn = store.db().begin().await.unwrap();
   txn.savepoint("op_0").await.unwrap();
   store
      .append_commit(
         &mut txn,
         NewCommit {
            partition_id: "default",
            actor_id: "u1",
            client_id: "c1",
            client_commit_id: "cc1",
            changes: &[change("tasks", "t1", 1, "u1")],
            meta: None,
            result: None,
         },
      )
      .await
      .unwrap();
   txn.rollback_to_savepoint("op_0").await.unwrap();
   txn.commit().await.unwrap();

   // The appended commit was rolled back with the savepoint
   assert_eq!(store.max_commit_seq("default").await.unwrap(), 0);
   assert!(
      store
         .find_commit_by_idempotency_key("default", "c1", "cc1")
         .await
         .unwrap()
         .is_none()
   );
}
