//! Durable commit-log storage for the sync engine.
//!
//! One append-only commit log per partition, with per-commit change records
//! and scope tags, indexed for fast scope-filtered pulls. The same logical
//! schema and operations run on two dialect families — embedded SQL
//! (SQLite) and row-store-with-JSON (Postgres, behind the `postgres`
//! feature) — through a JSON-parameter execution layer: `$N` placeholder
//! SQL, [`SqlParam`] bindings, rows decoded to ordered JSON maps.
//!
//! # Layout
//!
//! - [`SyncDb`] / [`SyncTxn`] — pooled connections, write transactions with
//!   savepoints.
//! - [`schema`] — idempotent, additive DDL for the sync and console tables.
//! - [`CommitLogStore`] — append and scope-filtered read operations over the
//!   log, plus client-cursor and snapshot-chunk persistence.
//! - [`rows`] — the generic server-row table backing the default handler.
//! - [`maintenance`] — compaction and pruning, debounced per database.

pub mod db;
pub mod decode;
pub mod dialect;
pub mod error;
pub mod maintenance;
pub mod model;
pub mod rows;
pub mod schema;
pub mod store;

pub use db::{ExecResult, SqlParam, SyncDb, SyncDbConfig, SyncTxn};
pub use decode::JsonRow;
pub use dialect::SyncDialect;
pub use error::{Error, Result};
pub use model::{
   ChangeOp, ChangeRecord, CommitRecord, DEFAULT_PARTITION, EmittedChange, PullRow, ScopeFilter,
   ScopeMap, ScopeValue, now_unix_ms, sanitize_partition_id,
};
pub use schema::{SCHEMA_VERSION, ensure_console_schema, ensure_sync_schema};
pub use store::{
   ChunkRecord, ClientCursor, CommitLogStore, IncrementalPullIter, NewCommit,
};
