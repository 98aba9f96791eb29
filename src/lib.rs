//! Server-side commit-and-subscription engine for bidirectional data sync.
//!
//! Clients enqueue mutations locally and push them here as atomic commits;
//! the engine appends them to a monotonic per-partition commit log and
//! serves scope-filtered pulls against it — bootstrap snapshots for fresh
//! subscriptions, incremental change streams for established ones — while
//! waking live connections whose scope keys match new commits.
//!
//! The engine is table-shape agnostic: per-table [`TableHandler`]s declare
//! scope patterns, resolve authorization, apply operations, and paginate
//! snapshots. Transport concerns (HTTP/WebSocket framing, authentication)
//! live in the host; the engine consumes an [`AuthContext`] and JSON
//! request envelopes.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sync_engine::{AuthContext, JsonTableHandler, SyncDb, SyncEngine, SyncRequest};
//!
//! # async fn example() -> sync_engine::Result<()> {
//! let db = SyncDb::connect_sqlite("sync.db", None).await?;
//! let engine = SyncEngine::builder(db)
//!    .handler(Arc::new(JsonTableHandler::user_scoped("tasks")?))
//!    .build()
//!    .await?;
//!
//! let auth = AuthContext::new("u1", "default");
//! let request: SyncRequest = serde_json::from_str(r#"{
//!    "clientId": "c1",
//!    "pull": {"subscriptions": [{"id": "s", "table": "tasks", "cursor": 0}]}
//! }"#)?;
//! let response = engine.handle_sync(&auth, &request).await?;
//! # let _ = response;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod chunk;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod handler;
pub mod json_table;
pub mod plugin;
pub mod protocol;
pub mod pull;
pub mod push;
pub mod scope;

pub use cache::{MemoryScopeCache, ScopeCache, ScopeResolver};
pub use chunk::{ChunkBody, ChunkCompression, ChunkerConfig, SnapshotChunker};
pub use config::{MaintenanceSettings, SyncEngineConfig};
pub use cursor::CursorTracker;
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{Error, Result, codes};
pub use handler::{ApplyOutcome, HandlerRegistry, SnapshotBatch, TableHandler};
pub use json_table::{JsonTableHandler, JsonTableHandlerBuilder, ScopeAuthorizer};
pub use plugin::{PluginSet, SyncPlugin};
pub use protocol::{
   AuthContext, ChangeEntry, CommitEntry, OpResult, Operation, PullRequest, PullResponse,
   PushRequest, PushResponse, PushStatus, SnapshotPage, SubscriptionReply, SubscriptionRequest,
   SubscriptionStatus, SyncRequest, SyncResponse, partition_from_sources,
};
pub use pull::{PullOutcome, PullSettings};
pub use push::{PushOutcome, push_commit};
pub use scope::{ScopePattern, expand_patterns, scope_keys_for_changes};

// Storage and fan-out types callers commonly need alongside the engine.
pub use sync_commit_log::{
   ChangeOp, EmittedChange, ScopeFilter, ScopeMap, ScopeValue, SyncDb, SyncDbConfig, SyncDialect,
   SyncTxn,
};
pub use sync_fanout::{
   ConnectionId, FanoutConfig, FanoutRegistry, ServerEvent, SyncConnection, WakeBroadcaster,
   WakeMessage,
};
