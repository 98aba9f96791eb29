use std::sync::Arc;

use serde_json::{Value as JsonValue, json};
use tempfile::TempDir;

use sync_commit_log::maintenance::prune_commits;
use sync_engine::{
   AuthContext, ChunkCompression, ChunkerConfig, JsonTableHandler, SnapshotChunker,
   SubscriptionStatus, SyncDb, SyncEngine, SyncEngineConfig, SyncRequest,
};

async fn create_engine() -> (SyncEngine, TempDir) {
   create_engine_with_config(SyncEngineConfig::default()).await
}

async fn create_engine_with_config(config: SyncEngineConfig) -> (SyncEngine, TempDir) {
   let temp_dir = TempDir::new().expect("Failed to create temp directory");
   let db = SyncDb::connect_sqlite(temp_dir.path().join("sync.db"), None)
      .await
      .expect("Failed to open test database");
   let engine = SyncEngine::builder(db)
      .handler(Arc::new(JsonTableHandler::user_scoped("tasks").unwrap()))
      .config(config)
      .build()
      .await
      .expect("Failed to build engine");
   (engine, temp_dir)
}

async fn push_task(engine: &SyncEngine, actor: &str, commit_id: &str, row_id: &str, title: &str) {
   let auth = AuthContext::new(actor, "default");
   let request: SyncRequest = serde_json::from_value(json!({
      "clientId": format!("c-{actor}"),
      "push": {
         "clientCommitId": commit_id,
         "operations": [{
            "table": "tasks",
            "row_id": row_id,
            "op": "upsert",
            "payload": {"id": row_id, "title": title, "user_id": actor},
            "base_version": null
         }]
      }
   }))
   .unwrap();
   let response = engine.handle_sync(&auth, &request).await.unwrap();
   assert_eq!(
      response.push.unwrap().status,
      sync_engine::PushStatus::Applied
   );
}

fn pull_request(client_id: &str, subscriptions: JsonValue) -> SyncRequest {
   serde_json::from_value(json!({
      "clientId": client_id,
      "pull": {"subscriptions": subscriptions}
   }))
   .unwrap()
}

#[tokio::test]
async fn test_bootstrap_pull_returns_snapshot_and_cursor() {
   let (engine, _temp) = create_engine().await;
   push_task(&engine, "u1", "cc1", "t1", "Buy milk").await;

   let auth = AuthContext::new("u1", "default");
   let request = pull_request("c-u1", json!([{"id": "s", "table": "tasks", "cursor": 0}]));
   let response = engine.handle_sync(&auth, &request).await.unwrap();

   let pull = response.pull.unwrap();
   assert_eq!(pull.subscriptions.len(), 1);
   let sub = &pull.subscriptions[0];
   assert_eq!(sub.id, "s");
   assert_eq!(sub.status, SubscriptionStatus::Active);
   assert!(sub.bootstrap);
   assert_eq!(sub.next_cursor, 1);

   let snapshots = sub.snapshots.as_ref().unwrap();
   assert_eq!(snapshots.len(), 1);
   let rows = snapshots[0].rows.as_ref().unwrap();
   assert_eq!(rows.len(), 1);
   assert_eq!(rows[0].get("title"), Some(&json!("Buy milk")));
   assert_eq!(rows[0].get("server_version"), Some(&json!(1)));
   assert!(snapshots[0].chunk_id.is_none());
}

#[tokio::test]
async fn test_scope_isolation_hides_other_users_rows() {
   let (engine, _temp) = create_engine().await;
   push_task(&engine, "u1", "cc1", "t1", "private").await;

   // u2 sees an empty snapshot but still lands on the current cursor
   let auth = AuthContext::new("u2", "default");
   let request = pull_request(
      "c-u2",
      json!([{"id": "s", "table": "tasks", "scopes": {"user_id": "u2"}, "cursor": 0}]),
   );
   let response = engine.handle_sync(&auth, &request).await.unwrap();
   let pull = response.pull.unwrap();
   let sub = &pull.subscriptions[0];

   assert_eq!(sub.status, SubscriptionStatus::Active);
   assert!(sub.bootstrap);
   assert_eq!(sub.snapshots.as_ref().unwrap().len(), 0);
   assert_eq!(sub.next_cursor, 1);
}

#[tokio::test]
async fn test_subscription_beyond_authorization_is_revoked() {
   let (engine, _temp) = create_engine().await;
   push_task(&engine, "u1", "cc1", "t1", "private").await;

   // u2 asking for u1's scope gets revoked, not filtered
   let auth = AuthContext::new("u2", "default");
   let request = pull_request(
      "c-u2",
      json!([{"id": "s", "table": "tasks", "scopes": {"user_id": "u1"}, "cursor": 0}]),
   );
   let response = engine.handle_sync(&auth, &request).await.unwrap();
   let pull = response.pull.unwrap();
   let sub = &pull.subscriptions[0];

   assert_eq!(sub.status, SubscriptionStatus::Revoked);
   assert!(sub.snapshots.is_none());
   assert!(sub.commits.is_none());
}

#[tokio::test]
async fn test_unknown_table_subscription_is_revoked() {
   let (engine, _temp) = create_engine().await;
   let auth = AuthContext::new("u1", "default");
   let request = pull_request("c-u1", json!([{"id": "s", "table": "nope", "cursor": 5}]));
   let response = engine.handle_sync(&auth, &request).await.unwrap();
   let pull = response.pull.unwrap();
   let sub = &pull.subscriptions[0];
   assert_eq!(sub.status, SubscriptionStatus::Revoked);
   assert_eq!(sub.next_cursor, 5);
}

#[tokio::test]
async fn test_incremental_delivers_only_new_commits_in_order() {
   let (engine, _temp) = create_engine().await;
   push_task(&engine, "u1", "cc1", "t1", "one").await;

   // Bootstrap anchors at commit 1
   let auth = AuthContext::new("u1", "default");
   let request = pull_request("c-u1", json!([{"id": "s", "table": "tasks", "cursor": 0}]));
   let response = engine.handle_sync(&auth, &request).await.unwrap();
   let anchor = response.pull.unwrap().subscriptions[0].next_cursor;
   assert_eq!(anchor, 1);

   push_task(&engine, "u1", "cc2", "t2", "two").await;
   push_task(&engine, "u1", "cc3", "t1", "one-updated").await;

   // Incremental from the anchor: exactly commits 2 and 3, in order
   let request = pull_request(
      "c-u1",
      json!([{"id": "s", "table": "tasks", "cursor": anchor}]),
   );
   let response = engine.handle_sync(&auth, &request).await.unwrap();
   let pull = response.pull.unwrap();
   let sub = &pull.subscriptions[0];

   assert!(!sub.bootstrap);
   assert_eq!(sub.next_cursor, 3);
   let commits = sub.commits.as_ref().unwrap();
   assert_eq!(
      commits.iter().map(|c| c.commit_seq).collect::<Vec<_>>(),
      vec![2, 3]
   );
   assert_eq!(commits[0].actor_id, "u1");
   assert_eq!(commits[0].changes[0].row_id, "t2");
   assert_eq!(commits[1].changes[0].row_id, "t1");
   assert_eq!(commits[1].changes[0].row_version, Some(2));

   // Nothing new: empty delivery, cursor stays
   let request = pull_request("c-u1", json!([{"id": "s", "table": "tasks", "cursor": 3}]));
   let response = engine.handle_sync(&auth, &request).await.unwrap();
   let pull = response.pull.unwrap();
   let sub = &pull.subscriptions[0];
   assert!(sub.commits.as_ref().unwrap().is_empty());
   assert_eq!(sub.next_cursor, 3);
}

#[tokio::test]
async fn test_incremental_filters_other_scopes_but_advances_cursor() {
   let (engine, _temp) = create_engine().await;
   push_task(&engine, "u1", "cc1", "t1", "mine").await;
   push_task(&engine, "u2", "cc2", "x1", "theirs").await;
   push_task(&engine, "u1", "cc3", "t2", "mine too").await;

   let auth = AuthContext::new("u1", "default");
   let request = pull_request("c-u1", json!([{"id": "s", "table": "tasks", "cursor": 1}]));
   let response = engine.handle_sync(&auth, &request).await.unwrap();
   let pull = response.pull.unwrap();
   let sub = &pull.subscriptions[0];

   // Commit 2 is out of scope: skipped but the cursor moves past it
   let commits = sub.commits.as_ref().unwrap();
   assert_eq!(commits.len(), 1);
   assert_eq!(commits[0].commit_seq, 3);
   assert_eq!(sub.next_cursor, 3);
}

#[tokio::test]
async fn test_limit_commits_paginates() {
   let (engine, _temp) = create_engine().await;
   for i in 1..=5 {
      push_task(&engine, "u1", &format!("cc{i}"), &format!("t{i}"), "x").await;
   }

   let auth = AuthContext::new("u1", "default");
   let request: SyncRequest = serde_json::from_value(json!({
      "clientId": "c-u1",
      "pull": {
         "limitCommits": 2,
         "subscriptions": [{"id": "s", "table": "tasks", "cursor": 1}]
      }
   }))
   .unwrap();

   let response = engine.handle_sync(&auth, &request).await.unwrap();
   let pull = response.pull.unwrap();
   let sub = &pull.subscriptions[0];
   let commits = sub.commits.as_ref().unwrap();
   assert_eq!(
      commits.iter().map(|c| c.commit_seq).collect::<Vec<_>>(),
      vec![2, 3]
   );
   assert_eq!(sub.next_cursor, 3);

   // The next page picks up where the last left off
   let request = pull_request("c-u1", json!([{"id": "s", "table": "tasks", "cursor": 3}]));
   let response = engine.handle_sync(&auth, &request).await.unwrap();
   let pull = response.pull.unwrap();
   let sub = &pull.subscriptions[0];
   assert_eq!(
      sub.commits.as_ref().unwrap().iter().map(|c| c.commit_seq).collect::<Vec<_>>(),
      vec![4, 5]
   );
}

#[tokio::test]
async fn test_forced_bootstrap_flag() {
   let (engine, _temp) = create_engine().await;
   push_task(&engine, "u1", "cc1", "t1", "x").await;

   let auth = AuthContext::new("u1", "default");
   let request = pull_request(
      "c-u1",
      json!([{"id": "s", "table": "tasks", "cursor": 1, "bootstrap": true}]),
   );
   let response = engine.handle_sync(&auth, &request).await.unwrap();
   let pull = response.pull.unwrap();
   let sub = &pull.subscriptions[0];
   assert!(sub.bootstrap);
   assert_eq!(sub.next_cursor, 1);
}

#[tokio::test]
async fn test_cursor_behind_retention_forces_bootstrap() {
   let (engine, _temp) = create_engine().await;
   for i in 1..=5 {
      push_task(&engine, "u1", &format!("cc{i}"), &format!("t{i}"), "x").await;
   }
   tokio::time::sleep(std::time::Duration::from_millis(15)).await;
   // Prune down to the last two commits (4 and 5)
   prune_commits(engine.store().db(), 2, 0).await.unwrap();
   assert_eq!(engine.store().oldest_retained_commit_seq("default").await.unwrap(), 4);

   let auth = AuthContext::new("u1", "default");

   // Cursor 1: commits 2 and 3 are gone, must re-bootstrap
   let request = pull_request("c-u1", json!([{"id": "s", "table": "tasks", "cursor": 1}]));
   let response = engine.handle_sync(&auth, &request).await.unwrap();
   assert!(response.pull.unwrap().subscriptions[0].bootstrap);

   // Cursor 3: nothing between 3 and the oldest retained commit was lost
   let request = pull_request("c-u1", json!([{"id": "s", "table": "tasks", "cursor": 3}]));
   let response = engine.handle_sync(&auth, &request).await.unwrap();
   let pull = response.pull.unwrap();
   let sub = &pull.subscriptions[0];
   assert!(!sub.bootstrap);
   assert_eq!(
      sub.commits.as_ref().unwrap().iter().map(|c| c.commit_seq).collect::<Vec<_>>(),
      vec![4, 5]
   );
}

#[tokio::test]
async fn test_snapshot_then_incremental_has_no_gap_or_overlap() {
   let (engine, _temp) = create_engine().await;
   for i in 1..=3 {
      push_task(&engine, "u1", &format!("cc{i}"), &format!("t{i}"), "x").await;
   }

   let auth = AuthContext::new("u1", "default");
   let request = pull_request("c-u1", json!([{"id": "s", "table": "tasks", "cursor": 0}]));
   let response = engine.handle_sync(&auth, &request).await.unwrap();
   let pull = response.pull.unwrap();
   let sub = &pull.subscriptions[0];

   // Snapshot covers the full state as of commit 3
   let rows = sub.snapshots.as_ref().unwrap()[0].rows.as_ref().unwrap();
   let mut ids: Vec<&str> = rows.iter().filter_map(|r| r.get("id")?.as_str()).collect();
   ids.sort_unstable();
   assert_eq!(ids, vec!["t1", "t2", "t3"]);
   let anchor = sub.next_cursor;

   push_task(&engine, "u1", "cc4", "t4", "x").await;

   // Incremental from the anchor delivers exactly commit 4
   let request = pull_request(
      "c-u1",
      json!([{"id": "s", "table": "tasks", "cursor": anchor}]),
   );
   let response = engine.handle_sync(&auth, &request).await.unwrap();
   let commits = response.pull.unwrap().subscriptions[0]
      .commits
      .clone()
      .unwrap();
   assert_eq!(commits.len(), 1);
   assert_eq!(commits[0].commit_seq, 4);
}

#[tokio::test]
async fn test_large_snapshot_pages_become_chunks() {
   let config = SyncEngineConfig::default().with_chunker(ChunkerConfig {
      ttl_ms: 60_000,
      inline_max_bytes: 0,
      compression: ChunkCompression::Gzip,
   });
   let (engine, _temp) = create_engine_with_config(config).await;
   push_task(&engine, "u1", "cc1", "t1", "chunked row").await;

   let auth = AuthContext::new("u1", "default");
   let request = pull_request("c-u1", json!([{"id": "s", "table": "tasks", "cursor": 0}]));
   let response = engine.handle_sync(&auth, &request).await.unwrap();
   let pull = response.pull.unwrap();
   let page = &pull.subscriptions[0].snapshots.as_ref().unwrap()[0];

   assert!(page.rows.is_none());
   let chunk_id = page.chunk_id.clone().unwrap();
   assert_eq!(page.sha256.as_ref().unwrap().len(), 64);
   assert!(page.byte_length.unwrap() > 0);

   // The chunk endpoint serves the body; decoding restores the rows
   let body = engine.fetch_snapshot_chunk(&chunk_id).await.unwrap();
   assert_eq!(body.compression, "gzip");
   assert_eq!(body.byte_length as usize, body.body.len());
   let rows = SnapshotChunker::decode_body(&body).unwrap();
   assert_eq!(rows.len(), 1);
   assert_eq!(rows[0].get("title"), Some(&json!("chunked row")));

   // Same state, same page key: the second bootstrap reuses the chunk
   let response = engine.handle_sync(&auth, &request).await.unwrap();
   let page2 = response.pull.unwrap().subscriptions[0]
      .snapshots
      .clone()
      .unwrap()[0]
      .clone();
   assert_eq!(page2.chunk_id.unwrap(), chunk_id);
   assert_eq!(page2.sha256, page.sha256);
   assert_eq!(page2.byte_length, page.byte_length);

   // Unknown chunk ids are indistinguishable from expired ones
   let err = engine.fetch_snapshot_chunk("does-not-exist").await.unwrap_err();
   assert_eq!(err.error_code(), "CHUNK_NOT_FOUND");
}

#[tokio::test]
async fn test_pull_records_client_cursor() {
   let (engine, _temp) = create_engine().await;
   push_task(&engine, "u1", "cc1", "t1", "x").await;

   let auth = AuthContext::new("u1", "default");
   let request = pull_request("c-u1", json!([{"id": "s", "table": "tasks", "cursor": 0}]));
   engine.handle_sync(&auth, &request).await.unwrap();

   let cursor = engine
      .cursors()
      .get("default", "c-u1")
      .await
      .unwrap()
      .unwrap();
   assert_eq!(cursor.cursor, 1);
   assert_eq!(cursor.actor_id, "u1");
   let scopes = cursor.effective_scopes.unwrap();
   assert_eq!(scopes.get("s").unwrap(), &json!({"user_id": "u1"}));

   // Admin eviction clears it; the next lookup is empty
   assert!(engine.evict_client_cursor("default", "c-u1").await.unwrap());
   assert!(engine.cursors().get("default", "c-u1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_partitions_are_isolated() {
   let (engine, _temp) = create_engine().await;
   push_task(&engine, "u1", "cc1", "t1", "default partition").await;

   // Same actor, different partition: empty log
   let auth = AuthContext::new("u1", "tenant-b");
   let request = pull_request("c-u1", json!([{"id": "s", "table": "tasks", "cursor": 0}]));
   let response = engine.handle_sync(&auth, &request).await.unwrap();
   let pull = response.pull.unwrap();
   let sub = &pull.subscriptions[0];
   assert!(sub.bootstrap);
   assert_eq!(sub.snapshots.as_ref().unwrap().len(), 0);
   assert_eq!(sub.next_cursor, 0);
}
