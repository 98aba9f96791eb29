//! The default table handler over the generic JSON row store.
//!
//! Rows are JSON documents in the shared `sync_rows` table with a
//! server-maintained `server_version` field. Scope values are extracted from
//! payload fields named after the scope patterns' placeholders. Optimistic
//! concurrency follows the standard contract: a stale `base_version` yields
//! a conflict carrying the authoritative row, and configured immutable scope
//! keys reject cross-scope moves.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use tracing::trace;

use sync_commit_log::rows::{self, StoredRow};
use sync_commit_log::{ChangeOp, EmittedChange, ScopeFilter, ScopeMap, ScopeValue, SyncTxn};

use crate::error::{Result, codes};
use crate::handler::{ApplyOutcome, SnapshotBatch, TableHandler};
use crate::protocol::{AuthContext, Operation};
use crate::scope::ScopePattern;

/// Field injected into stored rows carrying the server version.
pub const SERVER_VERSION_FIELD: &str = "server_version";

/// Authorization callback: the scope mapping an actor may read.
pub type ScopeAuthorizer = Arc<dyn Fn(&AuthContext) -> ScopeMap + Send + Sync>;

/// Generic JSON-document handler.
pub struct JsonTableHandler {
   table: String,
   scope_patterns: Vec<ScopePattern>,
   scope_keys: Vec<String>,
   immutable_scope_keys: Vec<String>,
   authorizer: ScopeAuthorizer,
}

impl JsonTableHandler {
   pub fn builder(table: impl Into<String>) -> JsonTableHandlerBuilder {
      JsonTableHandlerBuilder {
         table: table.into(),
         scope_patterns: Vec::new(),
         immutable_scope_keys: Vec::new(),
         authorizer: None,
      }
   }

   /// The common case: rows owned by a single user. Scope pattern
   /// `<key_prefix>:{<scope_key>}`, the scope key immutable, and actors
   /// authorized for exactly their own id.
   pub fn user_scoped(table: impl Into<String>) -> Result<Self> {
      Self::builder(table)
         .scope_pattern("user:{user_id}")?
         .immutable_scope_key("user_id")
         .authorizer(Arc::new(|auth: &AuthContext| {
            ScopeMap::single("user_id", auth.actor_id.clone())
         }))
         .build()
   }

   fn binding_filter(binding: &ScopeMap) -> ScopeFilter {
      ScopeFilter::from_scope_map(binding)
   }
}

/// Builder for [`JsonTableHandler`].
pub struct JsonTableHandlerBuilder {
   table: String,
   scope_patterns: Vec<ScopePattern>,
   immutable_scope_keys: Vec<String>,
   authorizer: Option<ScopeAuthorizer>,
}

impl JsonTableHandlerBuilder {
   /// Add a scope pattern; its placeholders become extracted payload fields.
   pub fn scope_pattern(mut self, pattern: &str) -> Result<Self> {
      self.scope_patterns.push(ScopePattern::parse(pattern)?);
      Ok(self)
   }

   /// Declare a scope key an upsert may never change on an existing row.
   pub fn immutable_scope_key(mut self, key: impl Into<String>) -> Self {
      self.immutable_scope_keys.push(key.into());
      self
   }

   /// Set the read-authorization callback.
   pub fn authorizer(mut self, authorizer: ScopeAuthorizer) -> Self {
      self.authorizer = Some(authorizer);
      self
   }

   pub fn build(self) -> Result<JsonTableHandler> {
      let mut scope_keys: Vec<String> = Vec::new();
      for pattern in &self.scope_patterns {
         for key in pattern.placeholder_keys() {
            if !scope_keys.iter().any(|k| k == key) {
               scope_keys.push(key.to_string());
            }
         }
      }
      // Default authorization: the first scope key is the actor id.
      let authorizer = self.authorizer.unwrap_or_else(|| {
         let key = scope_keys.first().cloned().unwrap_or_default();
         Arc::new(move |auth: &AuthContext| ScopeMap::single(key.clone(), auth.actor_id.clone()))
      });
      Ok(JsonTableHandler {
         table: self.table,
         scope_patterns: self.scope_patterns,
         scope_keys,
         immutable_scope_keys: self.immutable_scope_keys,
         authorizer,
      })
   }
}

#[async_trait]
impl TableHandler for JsonTableHandler {
   fn table(&self) -> &str {
      &self.table
   }

   fn scope_patterns(&self) -> &[ScopePattern] {
      &self.scope_patterns
   }

   fn immutable_scope_keys(&self) -> &[String] {
      &self.immutable_scope_keys
   }

   async fn resolve_scopes(&self, auth: &AuthContext) -> Result<ScopeMap> {
      Ok((self.authorizer)(auth))
   }

   fn extract_scopes(&self, row: &JsonValue) -> IndexMap<String, String> {
      let mut out = IndexMap::new();
      for key in &self.scope_keys {
         match row.get(key) {
            Some(JsonValue::String(s)) => {
               out.insert(key.clone(), s.clone());
            }
            Some(JsonValue::Number(n)) => {
               out.insert(key.clone(), n.to_string());
            }
            _ => {}
         }
      }
      out
   }

   async fn snapshot(
      &self,
      txn: &mut SyncTxn,
      auth: &AuthContext,
      binding: &ScopeMap,
      row_cursor: Option<&str>,
      limit: i64,
   ) -> Result<SnapshotBatch> {
      let filter = Self::binding_filter(binding);
      let page = rows::snapshot_page(
         txn,
         &auth.partition_id,
         &self.table,
         &filter,
         row_cursor,
         limit,
      )
      .await?;
      let next_row_cursor = if page.len() as i64 == limit {
         page.last().map(|row| row.row_id.clone())
      } else {
         None
      };
      Ok(SnapshotBatch {
         rows: page.into_iter().map(|row| row.row_json).collect(),
         next_row_cursor,
      })
   }

   async fn apply_operation(
      &self,
      txn: &mut SyncTxn,
      auth: &AuthContext,
      op: &Operation,
   ) -> Result<ApplyOutcome> {
      let authorized = (self.authorizer)(auth);
      let existing = rows::get_row(txn, &auth.partition_id, &self.table, &op.row_id).await?;
      let in_scope = existing.as_ref().is_none_or(|row| {
         row
            .scopes
            .iter()
            .all(|(key, value)| match authorized.get(key) {
               Some(scope) => scope.permits(value),
               None => true,
            })
      });

      match op.op {
         // A row outside the actor's authorization reads as absent, so its
         // delete is a no-op and its upsert cannot clobber it.
         ChangeOp::Delete if !in_scope => Ok(ApplyOutcome::Applied { emitted: vec![] }),
         ChangeOp::Upsert if !in_scope => Ok(ApplyOutcome::error(codes::ROW_MISSING)),
         ChangeOp::Delete => self.apply_delete(txn, auth, op, existing).await,
         ChangeOp::Upsert => self.apply_upsert(txn, auth, op, existing).await,
      }
   }
}

impl JsonTableHandler {
   async fn apply_delete(
      &self,
      txn: &mut SyncTxn,
      auth: &AuthContext,
      op: &Operation,
      existing: Option<StoredRow>,
   ) -> Result<ApplyOutcome> {
      let Some(existing) = existing else {
         // Deleting an absent row is a no-op that still applies.
         trace!(table = %self.table, row_id = %op.row_id, "delete of absent row");
         return Ok(ApplyOutcome::Applied { emitted: vec![] });
      };

      rows::delete_row(txn, &auth.partition_id, &self.table, &op.row_id).await?;
      Ok(ApplyOutcome::Applied {
         emitted: vec![EmittedChange {
            table: self.table.clone(),
            row_id: op.row_id.clone(),
            op: ChangeOp::Delete,
            row_json: None,
            row_version: None,
            scopes: existing.scopes,
         }],
      })
   }

   async fn apply_upsert(
      &self,
      txn: &mut SyncTxn,
      auth: &AuthContext,
      op: &Operation,
      existing: Option<StoredRow>,
   ) -> Result<ApplyOutcome> {
      let Some(JsonValue::Object(payload)) = op.payload.as_ref() else {
         return Ok(ApplyOutcome::Error {
            code: codes::INVALID_REQUEST.to_string(),
            message: Some("upsert payload must be a JSON object".to_string()),
            retriable: false,
         });
      };

      match (&existing, op.base_version) {
         (Some(row), Some(base)) if row.row_version != base => {
            return Ok(ApplyOutcome::Conflict {
               server_version: row.row_version,
               server_row: Some(row.row_json.clone()),
            });
         }
         (None, Some(base)) if base > 0 => {
            return Ok(ApplyOutcome::error(codes::ROW_MISSING));
         }
         _ => {}
      }

      let mut stored = payload.clone();
      let new_scopes = self.extract_scopes(&JsonValue::Object(stored.clone()));

      if let Some(row) = &existing {
         for key in &self.immutable_scope_keys {
            if let (Some(old), Some(new)) = (row.scopes.get(key), new_scopes.get(key))
               && old != new
            {
               return Ok(ApplyOutcome::error(codes::cannot_move_between(key)));
            }
         }
      }

      let new_version = existing.as_ref().map(|r| r.row_version + 1).unwrap_or(1);
      stored.insert(
         SERVER_VERSION_FIELD.to_string(),
         JsonValue::Number(new_version.into()),
      );
      let stored = JsonValue::Object(stored);

      rows::put_row(
         txn,
         &auth.partition_id,
         &self.table,
         &StoredRow {
            row_id: op.row_id.clone(),
            row_json: stored.clone(),
            row_version: new_version,
            scopes: new_scopes.clone(),
         },
      )
      .await?;

      Ok(ApplyOutcome::Applied {
         emitted: vec![EmittedChange {
            table: self.table.clone(),
            row_id: op.row_id.clone(),
            op: ChangeOp::Upsert,
            row_json: Some(stored),
            row_version: Some(new_version),
            scopes: new_scopes,
         }],
      })
   }
}

// Wildcard authorization helper for service/admin actors.
pub fn wildcard_authorizer(scope_key: impl Into<String>) -> ScopeAuthorizer {
   let key = scope_key.into();
   Arc::new(move |_auth: &AuthContext| {
      let mut map = ScopeMap::new();
      map.insert(key.clone(), ScopeValue::Wildcard);
      map
   })
}
