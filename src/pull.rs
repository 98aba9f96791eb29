//! The pull planner: per-subscription bootstrap or incremental delivery.
//!
//! For each subscription the planner intersects client-declared scopes with
//! the resolver's authorization (empty intersection revokes the
//! subscription), then either streams incremental commits past the cursor or
//! builds a bootstrap snapshot anchored to a commit sequence captured before
//! paging starts. The client's maximum observed sequence is recorded
//! best-effort at the end; commits are always delivered in increasing
//! sequence order with changes in insertion order.

use serde_json::Value as JsonValue;
use tracing::{debug, trace, warn};

use sync_commit_log::{
   ChangeRecord, CommitLogStore, ScopeFilter, ScopeMap, SqlParam, SyncTxn,
};

use crate::cache::ScopeResolver;
use crate::chunk::{PageSpec, SnapshotChunker};
use crate::cursor::CursorTracker;
use crate::error::Result;
use crate::handler::{HandlerRegistry, TableHandler};
use crate::protocol::{
   AuthContext, ChangeEntry, CommitEntry, PullRequest, PullResponse, SnapshotPage,
   SubscriptionReply, SubscriptionRequest, SubscriptionStatus,
};

/// Server-side pull limits; request values can lower but never exceed them.
#[derive(Debug, Clone)]
pub struct PullSettings {
   /// Commits delivered per incremental subscription when the request names
   /// no limit.
   pub default_limit_commits: i64,
   /// Hard ceiling on commits per incremental subscription.
   pub max_limit_commits: i64,
   /// Rows requested from a handler per snapshot page.
   pub snapshot_page_size: i64,
   /// Ceiling on total snapshot rows per subscription.
   pub max_snapshot_rows: i64,
   /// Ceiling on snapshot pages per scope binding.
   pub max_snapshot_pages: i64,
   /// Commits per window of the incremental iterator.
   pub incremental_batch_commits: usize,
}

impl Default for PullSettings {
   fn default() -> Self {
      Self {
         default_limit_commits: 200,
         max_limit_commits: 1_000,
         snapshot_page_size: 500,
         max_snapshot_rows: 10_000,
         max_snapshot_pages: 20,
         incremental_batch_commits: 50,
      }
   }
}

/// Everything one pull produces: the response plus the cursor-tracking data.
#[derive(Debug, Clone)]
pub struct PullOutcome {
   pub response: PullResponse,
   /// Maximum commit sequence observed across subscriptions.
   pub client_cursor: i64,
   /// Effective scopes per subscription id, as recorded on the cursor row.
   pub effective_scopes: JsonValue,
}

/// Serve one pull request.
pub async fn pull(
   store: &CommitLogStore,
   handlers: &HandlerRegistry,
   resolver: &ScopeResolver,
   chunker: &SnapshotChunker,
   cursors: &CursorTracker,
   auth: &AuthContext,
   client_id: &str,
   request: &PullRequest,
   settings: &PullSettings,
) -> Result<PullOutcome> {
   let limits = EffectiveLimits::from_request(request, settings);

   let mut replies = Vec::with_capacity(request.subscriptions.len());
   let mut client_cursor: i64 = 0;
   let mut scopes_record = serde_json::Map::new();

   for sub in &request.subscriptions {
      let reply = pull_subscription(store, handlers, resolver, chunker, auth, sub, &limits).await?;
      client_cursor = client_cursor.max(reply.next_cursor);
      if reply.status == SubscriptionStatus::Active {
         scopes_record.insert(sub.id.clone(), serde_json::to_value(&reply.scopes)?);
      }
      replies.push(reply);
   }

   // Step 4: record the max observed sequence, best-effort.
   let effective_scopes = JsonValue::Object(scopes_record);
   cursors
      .record(
         &auth.partition_id,
         client_id,
         &auth.actor_id,
         client_cursor,
         &effective_scopes,
      )
      .await;

   Ok(PullOutcome {
      response: PullResponse {
         ok: true,
         subscriptions: replies,
      },
      client_cursor,
      effective_scopes,
   })
}

#[derive(Debug, Clone, Copy)]
struct EffectiveLimits {
   limit_commits: i64,
   max_snapshot_rows: i64,
   max_snapshot_pages: i64,
   snapshot_page_size: i64,
   batch_commits: usize,
}

impl EffectiveLimits {
   fn from_request(request: &PullRequest, settings: &PullSettings) -> Self {
      Self {
         limit_commits: request
            .limit_commits
            .unwrap_or(settings.default_limit_commits)
            .clamp(1, settings.max_limit_commits),
         max_snapshot_rows: request
            .max_snapshot_rows
            .unwrap_or(settings.max_snapshot_rows)
            .clamp(1, settings.max_snapshot_rows),
         max_snapshot_pages: request
            .max_snapshot_pages
            .unwrap_or(settings.max_snapshot_pages)
            .clamp(1, settings.max_snapshot_pages),
         snapshot_page_size: settings.snapshot_page_size.max(1),
         batch_commits: settings.incremental_batch_commits.max(1),
      }
   }
}

async fn pull_subscription(
   store: &CommitLogStore,
   handlers: &HandlerRegistry,
   resolver: &ScopeResolver,
   chunker: &SnapshotChunker,
   auth: &AuthContext,
   sub: &SubscriptionRequest,
   limits: &EffectiveLimits,
) -> Result<SubscriptionReply> {
   let Some(handler) = handlers.get(&sub.table) else {
      warn!(table = %sub.table, subscription = %sub.id, "subscription targets unregistered table");
      return Ok(SubscriptionReply::revoked(&sub.id, sub.cursor));
   };

   // Step 1: effective scopes = authorization ∩ declaration.
   let resolved = resolver.resolve(&handler, auth).await?;
   let declared = sub.scopes.clone().unwrap_or_default();
   let Some(effective) = resolved.intersect(&declared) else {
      debug!(subscription = %sub.id, table = %sub.table, "subscription revoked, empty scope intersection");
      return Ok(SubscriptionReply::revoked(&sub.id, sub.cursor));
   };

   // Step 2: bootstrap when starting fresh, when forced, or when the cursor
   // fell behind retention (commits after it were pruned).
   let oldest_retained = store.oldest_retained_commit_seq(&auth.partition_id).await?;
   let behind_retention = sub.cursor > 0 && oldest_retained > sub.cursor + 1;
   if behind_retention {
      debug!(
         subscription = %sub.id,
         cursor = sub.cursor,
         oldest_retained,
         "cursor behind retention, forcing bootstrap"
      );
   }

   if sub.cursor == 0 || sub.bootstrap || behind_retention {
      snapshot_subscription(store, chunker, auth, sub, &handler, effective, limits).await
   } else {
      incremental_subscription(store, auth, sub, effective, limits).await
   }
}

/// Step 3a: bootstrap snapshot, anchored to the sequence observed at the
/// start of the read transaction so a follow-up incremental pull from
/// `next_cursor` neither misses nor duplicates changes.
async fn snapshot_subscription(
   store: &CommitLogStore,
   chunker: &SnapshotChunker,
   auth: &AuthContext,
   sub: &SubscriptionRequest,
   handler: &std::sync::Arc<dyn TableHandler>,
   effective: ScopeMap,
   limits: &EffectiveLimits,
) -> Result<SubscriptionReply> {
   let mut read_txn = store.db().begin_read().await?;
   let as_of = txn_max_commit_seq(&mut read_txn, &auth.partition_id).await?;

   let mut snapshots: Vec<SnapshotPage> = Vec::new();
   let mut rows_total: i64 = 0;

   'bindings: for binding in effective.bindings() {
      let scope_json = binding.canonical_json();
      let scope_key = handler
         .scope_patterns()
         .first()
         .and_then(|p| p.expand(&binding).into_iter().next())
         .unwrap_or_else(|| scope_json.clone());

      let mut row_cursor: Option<String> = None;
      for _page in 0..limits.max_snapshot_pages {
         if rows_total >= limits.max_snapshot_rows {
            trace!(subscription = %sub.id, rows_total, "snapshot row cap reached");
            break 'bindings;
         }
         let page_size = limits
            .snapshot_page_size
            .min(limits.max_snapshot_rows - rows_total);
         let batch = handler
            .snapshot(&mut read_txn, auth, &binding, row_cursor.as_deref(), page_size)
            .await?;
         if batch.rows.is_empty() {
            break;
         }
         rows_total += batch.rows.len() as i64;

         let page = chunker
            .produce_page(
               PageSpec {
                  partition_id: &auth.partition_id,
                  scope_key: &scope_key,
                  scope_json: &scope_json,
                  as_of_commit_seq: as_of,
                  row_cursor: row_cursor.as_deref().unwrap_or(""),
                  row_limit: page_size,
               },
               &sub.table,
               batch.rows,
               batch.next_row_cursor.clone(),
            )
            .await?;
         snapshots.push(page);

         match batch.next_row_cursor {
            Some(cursor) => row_cursor = Some(cursor),
            None => break,
         }
      }
   }

   read_txn.rollback().await?;

   debug!(
      subscription = %sub.id,
      table = %sub.table,
      pages = snapshots.len(),
      rows = rows_total,
      as_of,
      "bootstrap snapshot built"
   );

   Ok(SubscriptionReply {
      id: sub.id.clone(),
      status: SubscriptionStatus::Active,
      scopes: effective,
      bootstrap: true,
      snapshots: Some(snapshots),
      commits: None,
      next_cursor: as_of,
   })
}

/// Step 3b: incremental change stream, grouped by commit.
async fn incremental_subscription(
   store: &CommitLogStore,
   auth: &AuthContext,
   sub: &SubscriptionRequest,
   effective: ScopeMap,
   limits: &EffectiveLimits,
) -> Result<SubscriptionReply> {
   let filter = ScopeFilter::from_scope_map(&effective);
   let mut iter = store
      .incremental_pull(
         &auth.partition_id,
         &sub.table,
         filter,
         sub.cursor,
         limits.limit_commits,
         limits.batch_commits,
      )
      .await?;

   let mut commits: Vec<CommitEntry> = Vec::new();
   while let Some(window) = iter.next_window().await? {
      for row in window {
         match commits.last_mut() {
            Some(entry) if entry.commit_seq == row.change.commit_seq => {
               entry.changes.push(change_entry(row.change));
            }
            _ => commits.push(CommitEntry {
               commit_seq: row.change.commit_seq,
               created_at: row.created_at,
               actor_id: row.actor_id,
               changes: vec![change_entry(row.change)],
            }),
         }
      }
   }

   // The cursor advances past every commit in range, including commits
   // whose changes were all filtered out of scope.
   let next_cursor = iter.last_commit_seq().unwrap_or(sub.cursor);

   debug!(
      subscription = %sub.id,
      table = %sub.table,
      commits = commits.len(),
      cursor = sub.cursor,
      next_cursor,
      "incremental pull served"
   );

   Ok(SubscriptionReply {
      id: sub.id.clone(),
      status: SubscriptionStatus::Active,
      scopes: effective,
      bootstrap: false,
      snapshots: None,
      commits: Some(commits),
      next_cursor,
   })
}

async fn txn_max_commit_seq(txn: &mut SyncTxn, partition_id: &str) -> Result<i64> {
   let row = txn
      .fetch_one(
         "SELECT COALESCE(MAX(commit_seq), 0) AS seq FROM sync_commits WHERE partition_id = $1",
         vec![SqlParam::Text(partition_id.to_string())],
      )
      .await?;
   Ok(row
      .and_then(|r| r.get("seq").and_then(JsonValue::as_i64))
      .unwrap_or(0))
}

fn change_entry(change: ChangeRecord) -> ChangeEntry {
   ChangeEntry {
      table: change.table,
      row_id: change.row_id,
      op: change.op,
      row_json: change.row_json,
      row_version: change.row_version,
      scopes: change.scopes,
   }
}
