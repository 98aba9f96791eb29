use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tempfile::TempDir;

use sync_engine::{
   AuthContext, JsonTableHandler, OpResult, PushStatus, SyncDb, SyncEngine, SyncPlugin,
   SyncRequest, codes, push_commit,
};

async fn create_engine() -> (SyncEngine, TempDir) {
   let temp_dir = TempDir::new().expect("Failed to create temp directory");
   let db = SyncDb::connect_sqlite(temp_dir.path().join("sync.db"), None)
      .await
      .expect("Failed to open test database");
   let engine = SyncEngine::builder(db)
      .handler(Arc::new(JsonTableHandler::user_scoped("tasks").unwrap()))
      .build()
      .await
      .expect("Failed to build engine");
   (engine, temp_dir)
}

fn push_request(client_id: &str, client_commit_id: &str, operations: JsonValue) -> SyncRequest {
   serde_json::from_value(json!({
      "clientId": client_id,
      "push": {"clientCommitId": client_commit_id, "operations": operations}
   }))
   .unwrap()
}

fn upsert_op(row_id: &str, title: &str, user: &str, base_version: Option<i64>) -> JsonValue {
   json!({
      "table": "tasks",
      "row_id": row_id,
      "op": "upsert",
      "payload": {"id": row_id, "title": title, "user_id": user},
      "base_version": base_version
   })
}

async fn row_version(engine: &SyncEngine, row_id: &str) -> Option<i64> {
   engine
      .store()
      .db()
      .fetch_one(
         "SELECT row_version FROM sync_rows WHERE partition_id = 'default' AND table_name = 'tasks' AND row_id = $1",
         vec![row_id.into()],
      )
      .await
      .unwrap()
      .and_then(|r| r.get("row_version").and_then(|v| v.as_i64()))
}

#[tokio::test]
async fn test_happy_path_upsert_applies() {
   let (engine, _temp) = create_engine().await;
   let auth = AuthContext::new("u1", "default");

   let request = push_request(
      "c1",
      "cc1",
      json!([upsert_op("t1", "Buy milk", "u1", None)]),
   );
   let response = engine.handle_sync(&auth, &request).await.unwrap();

   let push = response.push.unwrap();
   assert_eq!(push.status, PushStatus::Applied);
   assert_eq!(push.commit_seq, Some(1));
   assert_eq!(push.results, vec![OpResult::Applied { op_index: 0 }]);

   assert_eq!(row_version(&engine, "t1").await, Some(1));
}

#[tokio::test]
async fn test_version_conflict_reports_server_state() {
   let (engine, _temp) = create_engine().await;
   let auth = AuthContext::new("u1", "default");

   // Bring the row to server_version 3
   for (i, title) in ["A0", "A1", "A"].iter().enumerate() {
      let request = push_request("c1", &format!("setup-{i}"), json!([upsert_op("t1", title, "u1", None)]));
      let response = engine.handle_sync(&auth, &request).await.unwrap();
      assert_eq!(response.push.unwrap().status, PushStatus::Applied);
   }

   // A stale base_version must conflict and change nothing
   let request = push_request("c1", "cc-stale", json!([upsert_op("t1", "B", "u1", Some(2))]));
   let response = engine.handle_sync(&auth, &request).await.unwrap();
   let push = response.push.unwrap();

   assert_eq!(push.status, PushStatus::Rejected);
   assert_eq!(push.commit_seq, None);
   match &push.results[0] {
      OpResult::Conflict {
         op_index,
         server_version,
         server_row,
      } => {
         assert_eq!(*op_index, 0);
         assert_eq!(*server_version, 3);
         let row = server_row.as_ref().unwrap();
         assert_eq!(row.get("title"), Some(&json!("A")));
         assert_eq!(row.get("server_version"), Some(&json!(3)));
      }
      other => panic!("expected conflict, got {other:?}"),
   }

   assert_eq!(row_version(&engine, "t1").await, Some(3));
   assert_eq!(engine.store().max_commit_seq("default").await.unwrap(), 3);
}

#[tokio::test]
async fn test_idempotent_retry_replays_cached_result() {
   let (engine, _temp) = create_engine().await;
   let auth = AuthContext::new("u1", "default");
   let request = push_request("c1", "cc1", json!([upsert_op("t1", "Buy milk", "u1", None)]));

   let first = engine.handle_sync(&auth, &request).await.unwrap().push.unwrap();
   assert_eq!(first.status, PushStatus::Applied);

   let second = engine.handle_sync(&auth, &request).await.unwrap().push.unwrap();
   assert_eq!(second.status, PushStatus::Cached);
   assert_eq!(second.commit_seq, first.commit_seq);
   assert_eq!(second.results, first.results);

   // Exactly one commit, and the row was not re-applied
   assert_eq!(engine.store().max_commit_seq("default").await.unwrap(), 1);
   assert_eq!(row_version(&engine, "t1").await, Some(1));
}

#[tokio::test]
async fn test_multi_op_partial_failure_writes_nothing() {
   let (engine, _temp) = create_engine().await;
   let auth = AuthContext::new("u1", "default");

   let request = push_request(
      "c1",
      "cc1",
      json!([
         upsert_op("t1", "ok", "u1", None),
         {"table": "foo", "row_id": "x1", "op": "upsert", "payload": {"user_id": "u1"}, "base_version": null}
      ]),
   );
   let response = engine.handle_sync(&auth, &request).await.unwrap();
   let push = response.push.unwrap();

   assert_eq!(push.status, PushStatus::Rejected);
   assert_eq!(push.results.len(), 2);
   assert_eq!(push.results[0], OpResult::Applied { op_index: 0 });
   match &push.results[1] {
      OpResult::Error { op_index, code, retriable, .. } => {
         assert_eq!(*op_index, 1);
         assert_eq!(code, codes::UNKNOWN_TABLE);
         assert!(!retriable);
      }
      other => panic!("expected error, got {other:?}"),
   }

   // Atomicity: no commit, no change rows, no routing rows, no app rows
   assert_eq!(engine.store().max_commit_seq("default").await.unwrap(), 0);
   assert_eq!(row_version(&engine, "t1").await, None);
   let changes = engine
      .store()
      .db()
      .fetch_one("SELECT COUNT(*) AS n FROM sync_changes", vec![])
      .await
      .unwrap()
      .unwrap();
   assert_eq!(changes.get("n"), Some(&json!(0)));
   let routing = engine
      .store()
      .db()
      .fetch_one("SELECT COUNT(*) AS n FROM sync_table_commits", vec![])
      .await
      .unwrap()
      .unwrap();
   assert_eq!(routing.get("n"), Some(&json!(0)));
}

#[tokio::test]
async fn test_conflict_mid_commit_discards_earlier_ops() {
   let (engine, _temp) = create_engine().await;
   let auth = AuthContext::new("u1", "default");

   // Seed t2 at version 1
   let seed = push_request("c1", "seed", json!([upsert_op("t2", "seed", "u1", None)]));
   engine.handle_sync(&auth, &seed).await.unwrap();

   // Op 0 would apply, op 1 conflicts; the savepoint discards op 0 too
   let request = push_request(
      "c1",
      "cc-mixed",
      json!([
         upsert_op("t1", "new row", "u1", None),
         upsert_op("t2", "stale write", "u1", Some(9)),
      ]),
   );
   let push = engine.handle_sync(&auth, &request).await.unwrap().push.unwrap();

   assert_eq!(push.status, PushStatus::Rejected);
   assert!(push.results[0].is_applied());
   assert!(matches!(push.results[1], OpResult::Conflict { .. }));

   assert_eq!(row_version(&engine, "t1").await, None);
   assert_eq!(row_version(&engine, "t2").await, Some(1));
   assert_eq!(engine.store().max_commit_seq("default").await.unwrap(), 1);
}

#[tokio::test]
async fn test_monotonic_row_versions_across_commits() {
   let (engine, _temp) = create_engine().await;
   let auth = AuthContext::new("u1", "default");

   for i in 0..3 {
      let request = push_request("c1", &format!("cc{i}"), json!([upsert_op("t1", &format!("v{i}"), "u1", None)]));
      engine.handle_sync(&auth, &request).await.unwrap();
   }

   let rows = engine
      .store()
      .read_changes_for_commits("default", &[1, 2, 3], "tasks", &Default::default())
      .await
      .unwrap();
   let versions: Vec<Option<i64>> = rows.iter().map(|r| r.change.row_version).collect();
   assert_eq!(versions, vec![Some(1), Some(2), Some(3)]);
}

#[tokio::test]
async fn test_empty_and_invalid_commits_rejected() {
   let (engine, _temp) = create_engine().await;
   let auth = AuthContext::new("u1", "default");

   let request = push_request("c1", "cc1", json!([]));
   let push = engine.handle_sync(&auth, &request).await.unwrap().push.unwrap();
   assert_eq!(push.status, PushStatus::Rejected);
   assert_eq!(push.results, vec![OpResult::error(0, codes::EMPTY_COMMIT, false)]);

   let request = push_request("c1", "", json!([upsert_op("t1", "x", "u1", None)]));
   let push = engine.handle_sync(&auth, &request).await.unwrap().push.unwrap();
   assert_eq!(push.results, vec![OpResult::error(0, codes::INVALID_REQUEST, false)]);

   // An empty client id fails validation before any transaction
   let outcome = push_commit(
      engine.store(),
      engine.handlers(),
      &Default::default(),
      &auth,
      "",
      &serde_json::from_value(json!({
         "clientCommitId": "cc1",
         "operations": [upsert_op("t1", "x", "u1", None)]
      }))
      .unwrap(),
   )
   .await
   .unwrap();
   assert_eq!(outcome.response.status, PushStatus::Rejected);
   assert_eq!(
      outcome.response.results,
      vec![OpResult::error(0, codes::INVALID_REQUEST, false)]
   );
}

#[tokio::test]
async fn test_base_version_for_missing_row() {
   let (engine, _temp) = create_engine().await;
   let auth = AuthContext::new("u1", "default");

   let request = push_request("c1", "cc1", json!([upsert_op("ghost", "x", "u1", Some(4))]));
   let push = engine.handle_sync(&auth, &request).await.unwrap().push.unwrap();
   assert_eq!(push.status, PushStatus::Rejected);
   match &push.results[0] {
      OpResult::Error { code, .. } => assert_eq!(code, codes::ROW_MISSING),
      other => panic!("expected ROW_MISSING, got {other:?}"),
   }

   // base_version 0 on a missing row creates it
   let request = push_request("c1", "cc2", json!([upsert_op("fresh", "x", "u1", Some(0))]));
   let push = engine.handle_sync(&auth, &request).await.unwrap().push.unwrap();
   assert_eq!(push.status, PushStatus::Applied);
   assert_eq!(row_version(&engine, "fresh").await, Some(1));
}

#[tokio::test]
async fn test_immutable_scope_key_rejects_cross_scope_move() {
   let temp_dir = TempDir::new().unwrap();
   let db = SyncDb::connect_sqlite(temp_dir.path().join("sync.db"), None).await.unwrap();
   // A wildcard authorizer so one actor can even attempt the move
   let handler = JsonTableHandler::builder("tasks")
      .scope_pattern("user:{user_id}")
      .unwrap()
      .immutable_scope_key("user_id")
      .authorizer(sync_engine::json_table::wildcard_authorizer("user_id"))
      .build()
      .unwrap();
   let engine = SyncEngine::builder(db)
      .handler(Arc::new(handler))
      .build()
      .await
      .unwrap();
   let auth = AuthContext::new("admin", "default");

   let request = push_request("c1", "cc1", json!([upsert_op("t1", "mine", "u1", None)]));
   engine.handle_sync(&auth, &request).await.unwrap();

   let request = push_request("c1", "cc2", json!([upsert_op("t1", "stolen", "u2", None)]));
   let push = engine.handle_sync(&auth, &request).await.unwrap().push.unwrap();

   assert_eq!(push.status, PushStatus::Rejected);
   match &push.results[0] {
      OpResult::Error { code, retriable, .. } => {
         assert_eq!(code, "CANNOT_MOVE_BETWEEN_USER_ID");
         assert!(!retriable);
      }
      other => panic!("expected cross-scope error, got {other:?}"),
   }
}

#[tokio::test]
async fn test_delete_semantics() {
   let (engine, _temp) = create_engine().await;
   let auth = AuthContext::new("u1", "default");

   let request = push_request("c1", "cc1", json!([upsert_op("t1", "x", "u1", None)]));
   engine.handle_sync(&auth, &request).await.unwrap();

   // Deleting an existing row emits a delete change
   let request = push_request(
      "c1",
      "cc2",
      json!([{"table": "tasks", "row_id": "t1", "op": "delete", "payload": null, "base_version": null}]),
   );
   let push = engine.handle_sync(&auth, &request).await.unwrap().push.unwrap();
   assert_eq!(push.status, PushStatus::Applied);
   assert_eq!(row_version(&engine, "t1").await, None);

   let rows = engine
      .store()
      .read_changes_for_commits("default", &[2], "tasks", &Default::default())
      .await
      .unwrap();
   assert_eq!(rows.len(), 1);
   assert_eq!(rows[0].change.op, sync_engine::ChangeOp::Delete);
   assert_eq!(rows[0].change.row_json, None);
   assert_eq!(rows[0].change.row_version, None);
   assert_eq!(rows[0].change.scopes.get("user_id"), Some(&"u1".to_string()));

   // Deleting an absent row applies with no emitted change (and no commit
   // is observable via routing since nothing was emitted)
   let request = push_request(
      "c1",
      "cc3",
      json!([{"table": "tasks", "row_id": "ghost", "op": "delete", "payload": null, "base_version": null}]),
   );
   let push = engine.handle_sync(&auth, &request).await.unwrap().push.unwrap();
   assert_eq!(push.status, PushStatus::Applied);
   assert_eq!(push.commit_seq, Some(3));
   let rows = engine
      .store()
      .read_changes_for_commits("default", &[3], "tasks", &Default::default())
      .await
      .unwrap();
   assert!(rows.is_empty());
}

struct TagPlugin {
   name: &'static str,
   priority: i32,
}

#[async_trait]
impl SyncPlugin for TagPlugin {
   fn name(&self) -> &str {
      self.name
   }

   fn priority(&self) -> i32 {
      self.priority
   }

   async fn before_apply_operation(
      &self,
      _auth: &AuthContext,
      op: &mut sync_engine::Operation,
   ) -> sync_engine::Result<()> {
      if let Some(obj) = op.payload.as_mut().and_then(JsonValue::as_object_mut) {
         let tags = obj.entry("tags").or_insert_with(|| json!([]));
         if let Some(list) = tags.as_array_mut() {
            list.push(json!(self.name));
         }
      }
      Ok(())
   }
}

#[tokio::test]
async fn test_plugins_rewrite_in_priority_order() {
   let temp_dir = TempDir::new().unwrap();
   let db = SyncDb::connect_sqlite(temp_dir.path().join("sync.db"), None).await.unwrap();
   let engine = SyncEngine::builder(db)
      .handler(Arc::new(JsonTableHandler::user_scoped("tasks").unwrap()))
      // Registered out of order; priority decides the chain
      .plugin(Arc::new(TagPlugin { name: "second", priority: 10 }))
      .plugin(Arc::new(TagPlugin { name: "first", priority: -10 }))
      .build()
      .await
      .unwrap();
   let auth = AuthContext::new("u1", "default");

   let request = push_request("c1", "cc1", json!([upsert_op("t1", "x", "u1", None)]));
   engine.handle_sync(&auth, &request).await.unwrap();

   let row = engine
      .store()
      .db()
      .fetch_one(
         "SELECT row_json FROM sync_rows WHERE row_id = $1",
         vec!["t1".into()],
      )
      .await
      .unwrap()
      .unwrap();
   let stored: JsonValue =
      serde_json::from_str(row.get("row_json").unwrap().as_str().unwrap()).unwrap();
   assert_eq!(stored.get("tags"), Some(&json!(["first", "second"])));
}
