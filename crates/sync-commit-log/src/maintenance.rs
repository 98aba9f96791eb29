//! Background maintenance: change-history compaction and commit pruning.
//!
//! Compaction deduplicates history: for every `(partition, table, row_id,
//! scopes)` group, change rows older than the retention window are deleted
//! except the newest of the group, then routing rows whose commit lost all
//! of its changes are removed. Pruning drops whole commits that are both
//! beyond the keep-newest count and older than the age floor, cascading to
//! change and routing rows.
//!
//! The `maybe_*` variants debounce per database handle: the last-run
//! timestamps live in a process-wide map keyed by [`SyncDb::handle_id`], so
//! two independent databases never suppress each other's maintenance.

use std::collections::HashMap;
use std::sync::LazyLock;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{SqlParam, SyncDb};
use crate::error::Result;
use crate::model::now_unix_ms;

/// Outcome of one compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
   pub deleted_changes: u64,
   pub deleted_routing: u64,
}

/// Outcome of one prune pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
   pub deleted_commits: u64,
   pub deleted_changes: u64,
   pub deleted_routing: u64,
}

static DEBOUNCE: LazyLock<Mutex<HashMap<(Uuid, &'static str), i64>>> =
   LazyLock::new(|| Mutex::new(HashMap::new()));

/// Claim a debounce slot for `(db, task)`. The timestamp is written at claim
/// time so overlapping callers in the same window run the task only once.
fn debounce_claim(handle_id: Uuid, task: &'static str, min_interval_ms: i64) -> bool {
   let now = now_unix_ms();
   let mut map = DEBOUNCE.lock();
   match map.get(&(handle_id, task)) {
      Some(last) if now - last < min_interval_ms => false,
      _ => {
         map.insert((handle_id, task), now);
         true
      }
   }
}

/// Delete superseded change history older than `full_history_hours`.
pub async fn compact_changes(db: &SyncDb, full_history_hours: i64) -> Result<CompactionStats> {
   let cutoff = now_unix_ms() - full_history_hours * 3_600_000;

   let deleted_changes = db
      .execute(
         "DELETE FROM sync_changes WHERE change_id IN (\
             SELECT change_id FROM (\
                SELECT ch.change_id AS change_id, \
                       ROW_NUMBER() OVER (\
                          PARTITION BY ch.partition_id, ch.table_name, ch.row_id, ch.scopes \
                          ORDER BY ch.commit_seq DESC\
                       ) AS rn, \
                       co.created_at AS created_at \
                FROM sync_changes ch \
                JOIN sync_commits co \
                  ON co.partition_id = ch.partition_id AND co.commit_seq = ch.commit_seq\
             ) ranked \
             WHERE ranked.rn > 1 AND ranked.created_at < $1\
          )",
         vec![SqlParam::I64(cutoff)],
      )
      .await?
      .rows_affected;

   let deleted_routing = if deleted_changes > 0 {
      sweep_orphan_routing_rows(db).await?
   } else {
      0
   };

   if deleted_changes > 0 {
      info!(deleted_changes, deleted_routing, "compacted change history");
   }
   Ok(CompactionStats {
      deleted_changes,
      deleted_routing,
   })
}

/// Remove routing rows whose commit no longer has any surviving changes.
async fn sweep_orphan_routing_rows(db: &SyncDb) -> Result<u64> {
   let result = db
      .execute(
         "DELETE FROM sync_table_commits WHERE NOT EXISTS (\
             SELECT 1 FROM sync_changes ch \
             WHERE ch.partition_id = sync_table_commits.partition_id \
               AND ch.table_name = sync_table_commits.table_name \
               AND ch.commit_seq = sync_table_commits.commit_seq\
          )",
         vec![],
      )
      .await?;
   Ok(result.rows_affected)
}

/// Debounced [`compact_changes`]: at most one pass per database per
/// `min_interval_ms`. Returns `None` when suppressed.
pub async fn maybe_compact_changes(
   db: &SyncDb,
   min_interval_ms: i64,
   full_history_hours: i64,
) -> Result<Option<CompactionStats>> {
   if !debounce_claim(db.handle_id(), "compact", min_interval_ms) {
      return Ok(None);
   }
   debug!(db = %db.handle_id(), "running debounced compaction");
   compact_changes(db, full_history_hours).await.map(Some)
}

/// Prune commits beyond `keep_newest_commits` that are also older than
/// `fallback_max_age_ms`, cascading to change and routing rows.
pub async fn prune_commits(
   db: &SyncDb,
   keep_newest_commits: i64,
   fallback_max_age_ms: i64,
) -> Result<PruneStats> {
   let age_cutoff = now_unix_ms() - fallback_max_age_ms;
   let mut stats = PruneStats::default();

   let partitions = db
      .fetch_all(
         "SELECT DISTINCT partition_id FROM sync_commits ORDER BY partition_id",
         vec![],
      )
      .await?;

   for row in &partitions {
      let Some(partition_id) = row.get("partition_id").and_then(|v| v.as_str()) else {
         continue;
      };

      // Lowest commit sequence that the keep-newest window retains. Absent
      // when the partition has fewer commits than the window.
      let floor = db
         .fetch_one(
            "SELECT commit_seq FROM sync_commits WHERE partition_id = $1 \
             ORDER BY commit_seq DESC LIMIT 1 OFFSET $2",
            vec![
               SqlParam::Text(partition_id.to_string()),
               SqlParam::I64((keep_newest_commits - 1).max(0)),
            ],
         )
         .await?
         .and_then(|r| r.get("commit_seq").and_then(|v| v.as_i64()));
      let Some(floor) = floor else { continue };

      let boundary = db
         .fetch_one(
            "SELECT COALESCE(MAX(commit_seq), 0) AS seq FROM sync_commits \
             WHERE partition_id = $1 AND commit_seq < $2 AND created_at < $3",
            vec![
               SqlParam::Text(partition_id.to_string()),
               SqlParam::I64(floor),
               SqlParam::I64(age_cutoff),
            ],
         )
         .await?
         .and_then(|r| r.get("seq").and_then(|v| v.as_i64()))
         .unwrap_or(0);
      if boundary == 0 {
         continue;
      }

      // Cascade order: changes, routing, then the commit headers.
      stats.deleted_changes += db
         .execute(
            "DELETE FROM sync_changes WHERE partition_id = $1 AND commit_seq <= $2",
            vec![
               SqlParam::Text(partition_id.to_string()),
               SqlParam::I64(boundary),
            ],
         )
         .await?
         .rows_affected;
      stats.deleted_routing += db
         .execute(
            "DELETE FROM sync_table_commits WHERE partition_id = $1 AND commit_seq <= $2",
            vec![
               SqlParam::Text(partition_id.to_string()),
               SqlParam::I64(boundary),
            ],
         )
         .await?
         .rows_affected;
      stats.deleted_commits += db
         .execute(
            "DELETE FROM sync_commits WHERE partition_id = $1 AND commit_seq <= $2",
            vec![
               SqlParam::Text(partition_id.to_string()),
               SqlParam::I64(boundary),
            ],
         )
         .await?
         .rows_affected;

      debug!(partition = partition_id, boundary, "pruned commit history");
   }

   if stats.deleted_commits > 0 {
      info!(
         deleted_commits = stats.deleted_commits,
         deleted_changes = stats.deleted_changes,
         "pruned commits"
      );
   }
   Ok(stats)
}

/// Debounced [`prune_commits`]; returns `None` when suppressed.
pub async fn maybe_prune_commits(
   db: &SyncDb,
   min_interval_ms: i64,
   keep_newest_commits: i64,
   fallback_max_age_ms: i64,
) -> Result<Option<PruneStats>> {
   if !debounce_claim(db.handle_id(), "prune", min_interval_ms) {
      return Ok(None);
   }
   debug!(db = %db.handle_id(), "running debounced prune");
   prune_commits(db, keep_newest_commits, fallback_max_age_ms)
      .await
      .map(Some)
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_debounce_is_per_database() {
      let a = Uuid::new_v4();
      let b = Uuid::new_v4();
      assert!(debounce_claim(a, "test-task", 60_000));
      // Same database inside the window: suppressed
      assert!(!debounce_claim(a, "test-task", 60_000));
      // A different database is unaffected
      assert!(debounce_claim(b, "test-task", 60_000));
      // A different task on the first database is unaffected too
      assert!(debounce_claim(a, "test-task-2", 60_000));
   }

   #[test]
   fn test_debounce_zero_interval_always_claims() {
      let id = Uuid::new_v4();
      assert!(debounce_claim(id, "zero", 0));
      assert!(debounce_claim(id, "zero", 0));
   }
}
