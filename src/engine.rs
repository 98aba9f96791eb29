//! The engine facade wiring storage, handlers, pipelines, and fan-out.

use std::sync::Arc;

use tracing::{debug, warn};

use sync_commit_log::{CommitLogStore, SyncDb, maintenance, now_unix_ms};
use sync_fanout::{ConnectionId, FanoutRegistry, SyncConnection, WakeBroadcaster};

use crate::cache::{MemoryScopeCache, ScopeCache, ScopeResolver};
use crate::chunk::{ChunkBody, SnapshotChunker};
use crate::config::SyncEngineConfig;
use crate::cursor::CursorTracker;
use crate::error::{Error, Result};
use crate::handler::{HandlerRegistry, TableHandler};
use crate::plugin::{PluginSet, SyncPlugin};
use crate::protocol::{AuthContext, SyncRequest, SyncResponse};
use crate::pull;
use crate::push::{self, PushOutcome};
use crate::scope::expand_patterns;

/// The server-side commit-and-subscription engine.
///
/// One instance serves one database. Cloning is cheap; clones share storage
/// pools, the fan-out registry, and all caches.
#[derive(Clone)]
pub struct SyncEngine {
   store: CommitLogStore,
   handlers: HandlerRegistry,
   plugins: PluginSet,
   resolver: ScopeResolver,
   chunker: SnapshotChunker,
   cursors: CursorTracker,
   fanout: Arc<FanoutRegistry>,
   broadcaster: WakeBroadcaster,
   config: Arc<SyncEngineConfig>,
}

impl SyncEngine {
   pub fn builder(db: SyncDb) -> SyncEngineBuilder {
      SyncEngineBuilder {
         db,
         config: SyncEngineConfig::default(),
         handlers: HandlerRegistry::new(),
         plugins: Vec::new(),
         cache: None,
         console_schema: false,
      }
   }

   /// Serve one sync envelope: apply the push (if any), then the pull.
   ///
   /// A successful applied push wakes subscribed connections and kicks
   /// debounced maintenance before the pull half runs, so a client pushing
   /// and pulling in one request observes its own commit.
   pub async fn handle_sync(&self, auth: &AuthContext, request: &SyncRequest) -> Result<SyncResponse> {
      if request.client_id.is_empty() {
         return Err(Error::InvalidRequest("clientId is required".into()));
      }

      let mut push_response = None;
      if let Some(push_request) = &request.push {
         let outcome = push::push_commit(
            &self.store,
            &self.handlers,
            &self.plugins,
            auth,
            &request.client_id,
            push_request,
         )
         .await?;
         self.after_push(&request.client_id, &outcome).await;
         push_response = Some(outcome.response);
      }

      let mut pull_response = None;
      if let Some(pull_request) = &request.pull {
         let outcome = pull::pull(
            &self.store,
            &self.handlers,
            &self.resolver,
            &self.chunker,
            &self.cursors,
            auth,
            &request.client_id,
            pull_request,
            &self.config.pull,
         )
         .await?;
         pull_response = Some(outcome.response);
      }

      Ok(SyncResponse {
         ok: true,
         push: push_response,
         pull: pull_response,
      })
   }

   /// Post-commit side effects: realtime wake and debounced maintenance.
   /// Both are best-effort and never fail the push.
   async fn after_push(&self, origin_client: &str, outcome: &PushOutcome) {
      let Some(commit_seq) = outcome.commit_seq else {
         return;
      };
      if outcome.scope_keys.is_empty() && outcome.emitted_changes.is_empty() {
         // Cached replays and empty commits fan out nothing.
         return;
      }

      let delivered = self
         .fanout
         .notify_scope_keys(&outcome.scope_keys, commit_seq, &[origin_client.to_string()])
         .await;
      let queued = self.broadcaster.publish(commit_seq, Some(origin_client));
      debug!(commit_seq, delivered, queued, "post-commit wake fan-out");

      if self.config.maintenance.enabled {
         self.run_maintenance().await;
      }
   }

   async fn run_maintenance(&self) {
      let m = &self.config.maintenance;
      if let Err(e) = maintenance::maybe_compact_changes(
         self.store.db(),
         m.compact_min_interval_ms,
         m.compact_full_history_hours,
      )
      .await
      {
         warn!(error = %e, "change compaction failed");
      }
      match maintenance::maybe_prune_commits(
         self.store.db(),
         m.prune_min_interval_ms,
         m.prune_keep_newest_commits,
         m.prune_fallback_max_age_ms,
      )
      .await
      {
         Ok(Some(_)) => {
            // Expired chunk sweep rides the prune cadence.
            if let Err(e) = self.store.delete_expired_chunks(now_unix_ms()).await {
               warn!(error = %e, "expired chunk sweep failed");
            }
         }
         Ok(None) => {}
         Err(e) => warn!(error = %e, "commit prune failed"),
      }
   }

   /// The stored body for `GET /sync/snapshot-chunks/{chunkId}`.
   pub async fn fetch_snapshot_chunk(&self, chunk_id: &str) -> Result<ChunkBody> {
      self.chunker.fetch_chunk(chunk_id).await
   }

   /// Register a live connection under every scope key the actor's resolved
   /// scopes can reach for the given tables.
   pub async fn register_connection(
      &self,
      conn: Arc<dyn SyncConnection>,
      auth: &AuthContext,
      tables: &[&str],
   ) -> Result<ConnectionId> {
      let scope_keys = self.connection_scope_keys(auth, tables).await?;
      Ok(self.fanout.register(conn, scope_keys))
   }

   /// Re-resolve and replace a connection's scope keys, e.g. after the
   /// client changes its subscriptions.
   pub async fn update_connection_scopes(
      &self,
      id: ConnectionId,
      auth: &AuthContext,
      tables: &[&str],
   ) -> Result<()> {
      let scope_keys = self.connection_scope_keys(auth, tables).await?;
      Ok(self.fanout.update_client_scope_keys(id, scope_keys)?)
   }

   async fn connection_scope_keys(
      &self,
      auth: &AuthContext,
      tables: &[&str],
   ) -> Result<Vec<String>> {
      let mut keys: Vec<String> = Vec::new();
      for table in tables {
         let Some(handler) = self.handlers.get(table) else {
            continue;
         };
         let scopes = self.resolver.resolve(&handler, auth).await?;
         for key in expand_patterns(handler.scope_patterns(), &scopes) {
            if !keys.contains(&key) {
               keys.push(key);
            }
         }
      }
      Ok(keys)
   }

   /// Drop a connection from the registry.
   pub fn unregister_connection(&self, id: ConnectionId) -> Option<Arc<dyn SyncConnection>> {
      self.fanout.unregister(id)
   }

   /// Admin eviction of a client's recorded cursor; the client re-bootstraps
   /// on its next pull.
   pub async fn evict_client_cursor(&self, partition_id: &str, client_id: &str) -> Result<bool> {
      self.cursors.evict(partition_id, client_id).await
   }

   pub fn store(&self) -> &CommitLogStore {
      &self.store
   }

   pub fn handlers(&self) -> &HandlerRegistry {
      &self.handlers
   }

   pub fn fanout(&self) -> &Arc<FanoutRegistry> {
      &self.fanout
   }

   pub fn wake_broadcaster(&self) -> &WakeBroadcaster {
      &self.broadcaster
   }

   pub fn cursors(&self) -> &CursorTracker {
      &self.cursors
   }

   pub fn config(&self) -> &SyncEngineConfig {
      &self.config
   }
}

impl std::fmt::Debug for SyncEngine {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("SyncEngine")
         .field("dialect", &self.store.db().dialect())
         .field("handlers", &self.handlers)
         .finish()
   }
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
   db: SyncDb,
   config: SyncEngineConfig,
   handlers: HandlerRegistry,
   plugins: Vec<Arc<dyn SyncPlugin>>,
   cache: Option<Arc<dyn ScopeCache>>,
   console_schema: bool,
}

impl SyncEngineBuilder {
   /// Register a table handler.
   pub fn handler(mut self, handler: Arc<dyn TableHandler>) -> Self {
      self.handlers.register(handler);
      self
   }

   /// Register a push plugin.
   pub fn plugin(mut self, plugin: Arc<dyn SyncPlugin>) -> Self {
      self.plugins.push(plugin);
      self
   }

   /// Replace the default in-memory scope cache.
   pub fn scope_cache(mut self, cache: Arc<dyn ScopeCache>) -> Self {
      self.cache = Some(cache);
      self
   }

   /// Override the engine configuration.
   pub fn config(mut self, config: SyncEngineConfig) -> Self {
      self.config = config;
      self
   }

   /// Also create the optional console/observability tables.
   pub fn with_console_schema(mut self) -> Self {
      self.console_schema = true;
      self
   }

   /// Ensure the schema and assemble the engine.
   pub async fn build(self) -> Result<SyncEngine> {
      sync_commit_log::ensure_sync_schema(&self.db).await?;
      if self.console_schema {
         sync_commit_log::ensure_console_schema(&self.db).await?;
      }

      let store = CommitLogStore::new(self.db);
      let cache = self
         .cache
         .unwrap_or_else(|| Arc::new(MemoryScopeCache::new()));
      let resolver = ScopeResolver::new(cache, self.config.scope_cache_ttl);
      let chunker = SnapshotChunker::new(store.clone(), self.config.chunker.clone());
      let cursors = CursorTracker::new(store.clone());
      let fanout = FanoutRegistry::new(self.config.fanout.clone());
      let broadcaster = WakeBroadcaster::new(self.config.fanout.broadcast_capacity);

      debug!(
         dialect = store.db().dialect().name(),
         tables = ?self.handlers.tables(),
         "sync engine ready"
      );

      Ok(SyncEngine {
         store,
         handlers: self.handlers,
         plugins: PluginSet::new(self.plugins),
         resolver,
         chunker,
         cursors,
         fanout,
         broadcaster,
         config: Arc::new(self.config),
      })
   }
}
