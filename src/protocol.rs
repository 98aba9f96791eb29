//! Wire protocol types for the sync endpoint.
//!
//! One JSON envelope carries an optional push (a client commit) and an
//! optional pull (subscription deliveries). The envelope and response types
//! use camelCase field names; operation and change bodies keep their
//! snake_case spelling. Logical rejections are encoded in the body — the
//! transport returns 200 for them and reserves error statuses for auth and
//! infrastructure failures.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use sync_commit_log::{ChangeOp, ScopeMap, sanitize_partition_id};

/// Authenticated request identity, produced by the host's authenticate
/// callback. The engine consumes it, never mints it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
   pub actor_id: String,
   pub partition_id: String,
}

impl AuthContext {
   pub fn new(actor_id: impl Into<String>, partition_id: impl Into<String>) -> Self {
      Self {
         actor_id: actor_id.into(),
         partition_id: sanitize_partition_id(&partition_id.into()),
      }
   }
}

/// Resolve a partition id from its request sources, in precedence order:
/// header value, query parameter, default.
pub fn partition_from_sources(header: Option<&str>, query: Option<&str>) -> String {
   let raw = header.or(query).unwrap_or(sync_commit_log::DEFAULT_PARTITION);
   sanitize_partition_id(raw)
}

/// The request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
   pub client_id: String,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub push: Option<PushRequest>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub pull: Option<PullRequest>,
}

/// A client commit to apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
   pub client_commit_id: String,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub schema_version: Option<i64>,
   #[serde(default)]
   pub operations: Vec<Operation>,
}

/// One mutation within a client commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
   pub table: String,
   pub row_id: String,
   pub op: ChangeOp,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub payload: Option<JsonValue>,
   /// The client's last-seen server row version; `None` disables optimistic
   /// concurrency for this op.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub base_version: Option<i64>,
}

/// A pull over the client's subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub limit_commits: Option<i64>,
   #[serde(default)]
   pub subscriptions: Vec<SubscriptionRequest>,
   #[serde(
      default,
      rename = "maxPullLimitSnapshotRows",
      skip_serializing_if = "Option::is_none"
   )]
   pub max_snapshot_rows: Option<i64>,
   #[serde(
      default,
      rename = "maxPullMaxSnapshotPages",
      skip_serializing_if = "Option::is_none"
   )]
   pub max_snapshot_pages: Option<i64>,
}

/// One subscription within a pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
   pub id: String,
   pub table: String,
   /// Client-declared scope narrowing; intersected with the resolver's
   /// authorization, so declaring nothing means "everything I may see".
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub scopes: Option<ScopeMap>,
   #[serde(default)]
   pub cursor: i64,
   /// Force a snapshot even with a non-zero cursor.
   #[serde(default)]
   pub bootstrap: bool,
}

/// The response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
   pub ok: bool,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub push: Option<PushResponse>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub pull: Option<PullResponse>,
}

/// Push outcome status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushStatus {
   /// All operations applied; a commit was appended.
   Applied,
   /// The commit was already applied by an earlier request with the same
   /// idempotency key; the stored results are replayed.
   Cached,
   /// At least one operation failed; nothing was written.
   Rejected,
}

/// The push half of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
   pub ok: bool,
   pub status: PushStatus,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub commit_seq: Option<i64>,
   pub results: Vec<OpResult>,
}

/// Per-operation outcome, tagged by status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum OpResult {
   Applied {
      #[serde(rename = "opIndex")]
      op_index: usize,
   },
   Conflict {
      #[serde(rename = "opIndex")]
      op_index: usize,
      server_version: i64,
      #[serde(default, skip_serializing_if = "Option::is_none")]
      server_row: Option<JsonValue>,
   },
   Error {
      #[serde(rename = "opIndex")]
      op_index: usize,
      code: String,
      retriable: bool,
      #[serde(default, skip_serializing_if = "Option::is_none")]
      message: Option<String>,
   },
}

impl OpResult {
   pub fn op_index(&self) -> usize {
      match self {
         OpResult::Applied { op_index }
         | OpResult::Conflict { op_index, .. }
         | OpResult::Error { op_index, .. } => *op_index,
      }
   }

   pub fn is_applied(&self) -> bool {
      matches!(self, OpResult::Applied { .. })
   }

   pub fn error(op_index: usize, code: impl Into<String>, retriable: bool) -> Self {
      OpResult::Error {
         op_index,
         code: code.into(),
         retriable,
         message: None,
      }
   }

   pub fn error_with_message(
      op_index: usize,
      code: impl Into<String>,
      retriable: bool,
      message: impl Into<String>,
   ) -> Self {
      OpResult::Error {
         op_index,
         code: code.into(),
         retriable,
         message: Some(message.into()),
      }
   }
}

/// The pull half of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
   pub ok: bool,
   pub subscriptions: Vec<SubscriptionReply>,
}

/// Subscription delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
   Active,
   /// The effective scope intersection is empty: the client is not (or no
   /// longer) authorized for what it asked for. No data is delivered.
   Revoked,
}

/// Per-subscription delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionReply {
   pub id: String,
   pub status: SubscriptionStatus,
   pub scopes: ScopeMap,
   pub bootstrap: bool,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub snapshots: Option<Vec<SnapshotPage>>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub commits: Option<Vec<CommitEntry>>,
   pub next_cursor: i64,
}

impl SubscriptionReply {
   /// The no-data reply for an unauthorized subscription.
   pub fn revoked(id: impl Into<String>, cursor: i64) -> Self {
      Self {
         id: id.into(),
         status: SubscriptionStatus::Revoked,
         scopes: ScopeMap::new(),
         bootstrap: false,
         snapshots: None,
         commits: None,
         next_cursor: cursor,
      }
   }
}

/// One bootstrap snapshot page: either inline rows or a chunk reference the
/// client fetches out of band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPage {
   pub table: String,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub rows: Option<Vec<JsonValue>>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub chunk_id: Option<String>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub byte_length: Option<i64>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub sha256: Option<String>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub next_row_cursor: Option<String>,
}

/// One delivered commit with its visible changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEntry {
   pub commit_seq: i64,
   pub created_at: i64,
   pub actor_id: String,
   pub changes: Vec<ChangeEntry>,
}

/// One change as delivered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
   pub table: String,
   pub row_id: String,
   pub op: ChangeOp,
   pub row_json: Option<JsonValue>,
   pub row_version: Option<i64>,
   pub scopes: IndexMap<String, String>,
}

#[cfg(test)]
mod tests {
   use super::*;
   use serde_json::json;

   #[test]
   fn test_partition_from_sources_precedence() {
      assert_eq!(partition_from_sources(Some("team-a"), Some("ignored")), "team-a");
      assert_eq!(partition_from_sources(None, Some("demo 1")), "demo-1");
      assert_eq!(partition_from_sources(None, None), "default");
   }

   #[test]
   fn test_request_round_trip_field_names() {
      let request: SyncRequest = serde_json::from_value(json!({
         "clientId": "c1",
         "push": {
            "clientCommitId": "cc1",
            "schemaVersion": 3,
            "operations": [
               {"table": "tasks", "row_id": "t1", "op": "upsert",
                "payload": {"title": "Buy milk"}, "base_version": null}
            ]
         },
         "pull": {
            "limitCommits": 100,
            "maxPullLimitSnapshotRows": 2000,
            "subscriptions": [
               {"id": "s1", "table": "tasks", "cursor": 0}
            ]
         }
      }))
      .unwrap();

      assert_eq!(request.client_id, "c1");
      let push = request.push.as_ref().unwrap();
      assert_eq!(push.client_commit_id, "cc1");
      assert_eq!(push.operations[0].op, ChangeOp::Upsert);
      assert_eq!(push.operations[0].base_version, None);
      let pull = request.pull.as_ref().unwrap();
      assert_eq!(pull.limit_commits, Some(100));
      assert_eq!(pull.max_snapshot_rows, Some(2000));
      assert!(!pull.subscriptions[0].bootstrap);
   }

   #[test]
   fn test_op_result_wire_shape() {
      assert_eq!(
         serde_json::to_value(OpResult::Applied { op_index: 0 }).unwrap(),
         json!({"status": "applied", "opIndex": 0})
      );
      assert_eq!(
         serde_json::to_value(OpResult::Conflict {
            op_index: 1,
            server_version: 3,
            server_row: Some(json!({"id": "t1"})),
         })
         .unwrap(),
         json!({"status": "conflict", "opIndex": 1, "server_version": 3, "server_row": {"id": "t1"}})
      );
      assert_eq!(
         serde_json::to_value(OpResult::error(2, "UNKNOWN_TABLE", false)).unwrap(),
         json!({"status": "error", "opIndex": 2, "code": "UNKNOWN_TABLE", "retriable": false})
      );
   }

   #[test]
   fn test_push_status_serializes_lowercase() {
      assert_eq!(serde_json::to_value(PushStatus::Cached).unwrap(), json!("cached"));
      assert_eq!(
         serde_json::to_value(SubscriptionStatus::Revoked).unwrap(),
         json!("revoked")
      );
   }

   #[test]
   fn test_auth_context_sanitizes_partition() {
      let auth = AuthContext::new("u1", "bad partition!");
      assert_eq!(auth.partition_id, "bad-partition-");
   }
}
