//! The push applier: validate, deduplicate, apply, and record one client
//! commit.
//!
//! One outer write transaction covers the whole commit. Each operation runs
//! under its own savepoint so a failing op discards only its own effects;
//! the commit decision is all-or-nothing: any error or conflict rejects the
//! whole commit (outer rollback, per-op results still returned), while a
//! fully applied commit is appended to the log together with the per-op
//! results so idempotent retries can replay them verbatim.
//!
//! Validation and handler failures are never raised out of here — they are
//! response data. Anything returned as `Err` is an infrastructure failure
//! and aborts the request with no observable partial commit.

use std::collections::BTreeSet;

use serde_json::json;
use tracing::{debug, trace, warn};

use sync_commit_log::{CommitLogStore, CommitRecord, EmittedChange, NewCommit, SyncTxn};

use crate::error::{Error, Result, codes};
use crate::handler::{ApplyOutcome, HandlerRegistry, TableHandler};
use crate::plugin::PluginSet;
use crate::protocol::{AuthContext, OpResult, Operation, PushRequest, PushResponse, PushStatus};
use crate::scope::scope_keys_for_changes;

/// Everything a successful push produces: the response for the client plus
/// the fan-out inputs (scope keys, emitted changes, affected tables).
#[derive(Debug, Clone)]
pub struct PushOutcome {
   pub response: PushResponse,
   pub commit_seq: Option<i64>,
   pub scope_keys: Vec<String>,
   pub emitted_changes: Vec<EmittedChange>,
   pub affected_tables: Vec<String>,
}

impl PushOutcome {
   fn rejected(results: Vec<OpResult>) -> Self {
      Self {
         response: PushResponse {
            ok: true,
            status: PushStatus::Rejected,
            commit_seq: None,
            results,
         },
         commit_seq: None,
         scope_keys: Vec::new(),
         emitted_changes: Vec::new(),
         affected_tables: Vec::new(),
      }
   }

   /// Replay of a previously applied commit. Cached pushes carry no fan-out
   /// data: the original request already notified.
   fn cached(commit: &CommitRecord) -> Self {
      let results: Vec<OpResult> = commit
         .result
         .clone()
         .and_then(|v| serde_json::from_value(v).ok())
         .unwrap_or_default();
      Self {
         response: PushResponse {
            ok: true,
            status: PushStatus::Cached,
            commit_seq: Some(commit.commit_seq),
            results,
         },
         commit_seq: Some(commit.commit_seq),
         scope_keys: Vec::new(),
         emitted_changes: Vec::new(),
         affected_tables: Vec::new(),
      }
   }
}

/// Apply one client commit.
pub async fn push_commit(
   store: &CommitLogStore,
   handlers: &HandlerRegistry,
   plugins: &PluginSet,
   auth: &AuthContext,
   client_id: &str,
   push: &PushRequest,
) -> Result<PushOutcome> {
   // Fail-fast validation, before any transaction.
   if client_id.is_empty() || push.client_commit_id.is_empty() {
      return Ok(PushOutcome::rejected(vec![OpResult::error(
         0,
         codes::INVALID_REQUEST,
         false,
      )]));
   }
   if push.operations.is_empty() {
      return Ok(PushOutcome::rejected(vec![OpResult::error(
         0,
         codes::EMPTY_COMMIT,
         false,
      )]));
   }

   // Idempotency probe: a commit with this key was already applied, so
   // replay its stored results without reopening the write path.
   if let Some(existing) = store
      .find_commit_by_idempotency_key(&auth.partition_id, client_id, &push.client_commit_id)
      .await?
   {
      debug!(
         partition = %auth.partition_id,
         client = client_id,
         client_commit = %push.client_commit_id,
         commit_seq = existing.commit_seq,
         "push replayed from idempotency cache"
      );
      return Ok(PushOutcome::cached(&existing));
   }

   let mut txn = store.db().begin().await?;
   let dialect = txn.dialect();
   let use_savepoints = dialect.supports_savepoints();
   let batch_eligible = plugins.is_empty() && dialect.supports_insert_returning();

   let ops = &push.operations;
   let mut results: Vec<OpResult> = Vec::with_capacity(ops.len());
   let mut emitted: Vec<EmittedChange> = Vec::new();

   let mut index = 0;
   'runs: while index < ops.len() {
      // A maximal contiguous run of ops against the same table.
      let table = ops[index].table.as_str();
      let mut run_end = index + 1;
      while run_end < ops.len() && ops[run_end].table == table {
         run_end += 1;
      }

      let Some(handler) = handlers.get(table) else {
         for i in index..run_end {
            trace!(table, op_index = i, "operation targets unregistered table");
            results.push(OpResult::error(i, codes::UNKNOWN_TABLE, false));
         }
         index = run_end;
         continue;
      };

      if batch_eligible && run_end - index > 1 {
         let name = format!("ops_{index}");
         if use_savepoints {
            txn.savepoint(&name).await?;
         }
         match handler
            .apply_operation_batch(&mut txn, auth, &ops[index..run_end])
            .await?
         {
            Some(outcomes) => {
               if outcomes.len() != run_end - index {
                  return Err(Error::Other(format!(
                     "handler for {table} returned {} batch outcomes for {} operations",
                     outcomes.len(),
                     run_end - index
                  )));
               }
               let any_failed = outcomes.iter().any(|o| !o.is_applied());
               if any_failed && use_savepoints {
                  txn.rollback_to_savepoint(&name).await?;
               } else if use_savepoints {
                  txn.release_savepoint(&name).await?;
               }
               for (offset, outcome) in outcomes.into_iter().enumerate() {
                  let i = index + offset;
                  // A failed batch had every effect rolled back, so only
                  // collect emitted changes from a fully applied batch.
                  record_outcome(outcome, i, !any_failed, &mut results, &mut emitted);
               }
               if any_failed && !use_savepoints {
                  return reject_without_savepoints(txn, results).await;
               }
               index = run_end;
               continue 'runs;
            }
            None => {
               // No batch support: release the (unused) savepoint and fall
               // through to the per-op path.
               if use_savepoints {
                  txn.release_savepoint(&name).await?;
               }
            }
         }
      }

      for i in index..run_end {
         let (result, op_emitted) =
            apply_one(&mut txn, &handler, plugins, auth, i, &ops[i], use_savepoints).await?;
         let applied = result.is_applied();
         results.push(result);
         emitted.extend(op_emitted);
         if !applied && !use_savepoints {
            // Savepoint-less downgrade: the failing op may have left side
            // effects in the transaction, so abort the whole commit at the
            // first failure.
            return reject_without_savepoints(txn, results).await;
         }
      }
      index = run_end;
   }

   if results.iter().any(|r| !r.is_applied()) {
      txn.rollback().await?;
      debug!(
         partition = %auth.partition_id,
         client = client_id,
         ops = ops.len(),
         "push rejected, transaction rolled back"
      );
      return Ok(PushOutcome::rejected(results));
   }

   let result_json = serde_json::to_value(&results)?;
   let meta = push.schema_version.map(|v| json!({ "schemaVersion": v }));
   let new_commit = NewCommit {
      partition_id: &auth.partition_id,
      actor_id: &auth.actor_id,
      client_id,
      client_commit_id: &push.client_commit_id,
      changes: &emitted,
      meta: meta.as_ref(),
      result: Some(&result_json),
   };

   let commit_seq = match store.append_commit(&mut txn, new_commit).await {
      Ok(seq) => seq,
      Err(sync_commit_log::Error::IdempotencyViolation { .. }) => {
         // A concurrent request with the same key won the race; replay it.
         txn.rollback().await?;
         let existing = store
            .find_commit_by_idempotency_key(&auth.partition_id, client_id, &push.client_commit_id)
            .await?
            .ok_or_else(|| {
               Error::Other("idempotency collision but no stored commit found".into())
            })?;
         return Ok(PushOutcome::cached(&existing));
      }
      Err(e) => return Err(e.into()),
   };

   txn.commit().await?;

   let scope_keys = scope_keys_for_changes(
      |table| {
         handlers
            .get(table)
            .map(|h| h.scope_patterns().to_vec())
            .unwrap_or_default()
      },
      &emitted,
   );
   let affected_tables: Vec<String> = emitted
      .iter()
      .map(|c| c.table.clone())
      .collect::<BTreeSet<_>>()
      .into_iter()
      .collect();

   debug!(
      partition = %auth.partition_id,
      client = client_id,
      commit_seq,
      changes = emitted.len(),
      scope_keys = scope_keys.len(),
      "push applied"
   );

   Ok(PushOutcome {
      response: PushResponse {
         ok: true,
         status: PushStatus::Applied,
         commit_seq: Some(commit_seq),
         results,
      },
      commit_seq: Some(commit_seq),
      scope_keys,
      emitted_changes: emitted,
      affected_tables,
   })
}

/// Apply a single operation under its own savepoint.
async fn apply_one(
   txn: &mut SyncTxn,
   handler: &std::sync::Arc<dyn TableHandler>,
   plugins: &PluginSet,
   auth: &AuthContext,
   index: usize,
   op: &Operation,
   use_savepoints: bool,
) -> Result<(OpResult, Vec<EmittedChange>)> {
   let mut op = op.clone();
   // Ascending priority: later plugins see earlier plugins' rewrites.
   for plugin in plugins.iter() {
      plugin.before_apply_operation(auth, &mut op).await?;
   }

   let name = format!("op_{index}");
   if use_savepoints {
      txn.savepoint(&name).await?;
   }

   let outcome = handler.apply_operation(txn, auth, &op).await?;
   match outcome {
      ApplyOutcome::Applied { emitted } => {
         if use_savepoints {
            txn.release_savepoint(&name).await?;
         }
         for plugin in plugins.iter() {
            plugin.after_apply_operation(auth, &op, &emitted).await?;
         }
         trace!(op_index = index, table = %op.table, row_id = %op.row_id, "operation applied");
         Ok((OpResult::Applied { op_index: index }, emitted))
      }
      ApplyOutcome::Conflict {
         server_version,
         server_row,
      } => {
         if use_savepoints {
            txn.rollback_to_savepoint(&name).await?;
         }
         trace!(op_index = index, table = %op.table, row_id = %op.row_id, server_version, "operation conflicted");
         Ok((
            OpResult::Conflict {
               op_index: index,
               server_version,
               server_row,
            },
            Vec::new(),
         ))
      }
      ApplyOutcome::Error {
         code,
         message,
         retriable,
      } => {
         if use_savepoints {
            txn.rollback_to_savepoint(&name).await?;
         }
         trace!(op_index = index, table = %op.table, code = %code, "operation errored");
         Ok((
            OpResult::Error {
               op_index: index,
               code,
               retriable,
               message,
            },
            Vec::new(),
         ))
      }
   }
}

/// Abort path for dialects without savepoints: the first failure rejects the
/// commit with the results gathered so far (coarser semantics than the
/// savepoint path, which evaluates every op).
async fn reject_without_savepoints(txn: SyncTxn, results: Vec<OpResult>) -> Result<PushOutcome> {
   warn!("rejecting commit at first failure (dialect without savepoints)");
   txn.rollback().await?;
   Ok(PushOutcome::rejected(results))
}

fn record_outcome(
   outcome: ApplyOutcome,
   op_index: usize,
   collect_emitted: bool,
   results: &mut Vec<OpResult>,
   emitted: &mut Vec<EmittedChange>,
) {
   match outcome {
      ApplyOutcome::Applied { emitted: changes } => {
         if collect_emitted {
            emitted.extend(changes);
         }
         results.push(OpResult::Applied { op_index });
      }
      ApplyOutcome::Conflict {
         server_version,
         server_row,
      } => results.push(OpResult::Conflict {
         op_index,
         server_version,
         server_row,
      }),
      ApplyOutcome::Error {
         code,
         message,
         retriable,
      } => results.push(OpResult::Error {
         op_index,
         code,
         retriable,
         message,
      }),
   }
}
