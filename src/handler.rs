//! The per-table handler contract and registry.
//!
//! A handler owns everything table-specific: which scope patterns the table
//! fans out under, what an actor is authorized to read, how a mutated row
//! projects back to concrete scope values, how bootstrap snapshots paginate,
//! and how operations apply. The engine pipelines stay table-shape agnostic
//! and talk only to this trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use sync_commit_log::{EmittedChange, ScopeMap, SyncTxn};

use crate::error::Result;
use crate::protocol::{AuthContext, Operation};
use crate::scope::ScopePattern;

/// Outcome of applying one operation.
///
/// `Conflict` and `Error` are logical outcomes recorded per op in the push
/// response; an infrastructure failure is returned as `Err` from
/// [`TableHandler::apply_operation`] instead and aborts the whole request.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
   Applied {
      /// Changes to persist and fan out. May be empty (e.g. deleting an
      /// absent row applies without emitting anything).
      emitted: Vec<EmittedChange>,
   },
   Conflict {
      server_version: i64,
      server_row: Option<JsonValue>,
   },
   Error {
      code: String,
      message: Option<String>,
      retriable: bool,
   },
}

impl ApplyOutcome {
   pub fn error(code: impl Into<String>) -> Self {
      ApplyOutcome::Error {
         code: code.into(),
         message: None,
         retriable: false,
      }
   }

   pub fn is_applied(&self) -> bool {
      matches!(self, ApplyOutcome::Applied { .. })
   }
}

/// One page of a bootstrap snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotBatch {
   pub rows: Vec<JsonValue>,
   /// Keyset cursor for the next page; `None` when the scope is exhausted.
   pub next_row_cursor: Option<String>,
}

/// The per-table plug-in contract.
#[async_trait]
pub trait TableHandler: Send + Sync {
   /// The table this handler serves.
   fn table(&self) -> &str;

   /// Scope-key templates this table fans out under, in declaration order.
   fn scope_patterns(&self) -> &[ScopePattern];

   /// Scope keys an upsert may never change on an existing row. The push
   /// pipeline reports a violation as `CANNOT_MOVE_BETWEEN_<KEY>`.
   fn immutable_scope_keys(&self) -> &[String] {
      &[]
   }

   /// The scope mapping this actor may read for this table.
   async fn resolve_scopes(&self, auth: &AuthContext) -> Result<ScopeMap>;

   /// Project a row to its concrete scope values.
   fn extract_scopes(&self, row: &JsonValue) -> IndexMap<String, String>;

   /// One keyset-paginated snapshot page under a fully materialized scope
   /// binding, ordered so that consecutive pages never overlap.
   async fn snapshot(
      &self,
      txn: &mut SyncTxn,
      auth: &AuthContext,
      binding: &ScopeMap,
      row_cursor: Option<&str>,
      limit: i64,
   ) -> Result<SnapshotBatch>;

   /// Apply one operation inside the push transaction.
   async fn apply_operation(
      &self,
      txn: &mut SyncTxn,
      auth: &AuthContext,
      op: &Operation,
   ) -> Result<ApplyOutcome>;

   /// Apply a contiguous run of operations for this table in one pass.
   ///
   /// Returning `Ok(None)` means "no batch support, apply one by one"; a
   /// `Some` result must carry exactly one outcome per input op, in order.
   /// The push applier only takes this path when the dialect supports
   /// insert-with-returning and no plugins are registered.
   async fn apply_operation_batch(
      &self,
      _txn: &mut SyncTxn,
      _auth: &AuthContext,
      _ops: &[Operation],
   ) -> Result<Option<Vec<ApplyOutcome>>> {
      Ok(None)
   }
}

/// The handler collection, keyed by table name.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
   handlers: HashMap<String, Arc<dyn TableHandler>>,
}

impl HandlerRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   /// Register a handler under its table name. A later registration for the
   /// same table replaces the earlier one.
   pub fn register(&mut self, handler: Arc<dyn TableHandler>) {
      self.handlers.insert(handler.table().to_string(), handler);
   }

   /// Look up the handler for a table. Pushed operations against an
   /// unregistered table fail fast with `UNKNOWN_TABLE`.
   pub fn get(&self, table: &str) -> Option<Arc<dyn TableHandler>> {
      self.handlers.get(table).cloned()
   }

   pub fn tables(&self) -> Vec<&str> {
      self.handlers.keys().map(String::as_str).collect()
   }

   pub fn is_empty(&self) -> bool {
      self.handlers.is_empty()
   }
}

impl std::fmt::Debug for HandlerRegistry {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("HandlerRegistry")
         .field("tables", &self.handlers.keys().collect::<Vec<_>>())
         .finish()
   }
}
