//! Client cursor tracking.
//!
//! Records the last-seen commit sequence and effective scopes per client,
//! for observability and fleet management only — recording is best-effort
//! and never blocks or fails a pull response. Evicting a cursor is the
//! admin-side reset: the client's local cursor then diverges from server
//! history and it re-bootstraps on its next pull.

use serde_json::Value as JsonValue;
use tracing::warn;

use sync_commit_log::{ClientCursor, CommitLogStore};

use crate::error::Result;

/// Best-effort cursor recorder over the commit-log store.
#[derive(Debug, Clone)]
pub struct CursorTracker {
   store: CommitLogStore,
}

impl CursorTracker {
   pub fn new(store: CommitLogStore) -> Self {
      Self { store }
   }

   /// Upsert the client's cursor row. Failures are logged, never surfaced.
   pub async fn record(
      &self,
      partition_id: &str,
      client_id: &str,
      actor_id: &str,
      cursor: i64,
      effective_scopes: &JsonValue,
   ) {
      if let Err(e) = self
         .store
         .record_client_cursor(partition_id, client_id, actor_id, cursor, Some(effective_scopes))
         .await
      {
         warn!(
            partition = partition_id,
            client = client_id,
            error = %e,
            "failed to record client cursor"
         );
      }
   }

   /// Read back a recorded cursor.
   pub async fn get(&self, partition_id: &str, client_id: &str) -> Result<Option<ClientCursor>> {
      Ok(self.store.get_client_cursor(partition_id, client_id).await?)
   }

   /// Remove a client's cursor row; returns whether one existed.
   pub async fn evict(&self, partition_id: &str, client_id: &str) -> Result<bool> {
      Ok(self.store.evict_client_cursor(partition_id, client_id).await?)
   }
}
