//! The append-only commit log store.
//!
//! One durable commit log per partition: commit headers in `sync_commits`,
//! a `(partition, table, commit_seq)` routing index in `sync_table_commits`
//! so pulls never scan the full log, and per-commit change rows in
//! `sync_changes`. Also owns the storage half of client cursors and snapshot
//! chunks.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use tracing::trace;

use crate::db::{ExecResult, SqlParam, SyncDb, SyncTxn};
use crate::decode::{JsonRow, base64_decode};
use crate::error::{Error, Result};
use crate::model::{
   ChangeOp, ChangeRecord, CommitRecord, EmittedChange, PullRow, ScopeFilter, now_unix_ms,
};

/// Input to [`CommitLogStore::append_commit`].
#[derive(Debug, Clone)]
pub struct NewCommit<'a> {
   pub partition_id: &'a str,
   pub actor_id: &'a str,
   pub client_id: &'a str,
   pub client_commit_id: &'a str,
   pub changes: &'a [EmittedChange],
   pub meta: Option<&'a JsonValue>,
   pub result: Option<&'a JsonValue>,
}

/// A recorded client cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientCursor {
   pub partition_id: String,
   pub client_id: String,
   pub actor_id: String,
   pub cursor: i64,
   pub effective_scopes: Option<JsonValue>,
   pub updated_at: i64,
}

/// A persisted snapshot chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
   pub chunk_id: String,
   pub partition_id: String,
   pub scope_key: String,
   pub scope: String,
   pub as_of_commit_seq: i64,
   pub row_cursor: String,
   pub row_limit: i64,
   pub encoding: String,
   pub compression: String,
   pub sha256: String,
   pub byte_length: i64,
   pub body: Vec<u8>,
   pub blob_hash: Option<String>,
   pub created_at: i64,
   pub expires_at: i64,
}

/// Handle over the commit-log tables of one database.
#[derive(Debug, Clone)]
pub struct CommitLogStore {
   db: SyncDb,
}

impl CommitLogStore {
   pub fn new(db: SyncDb) -> Self {
      Self { db }
   }

   pub fn db(&self) -> &SyncDb {
      &self.db
   }

   /// Append a commit with its routing and change rows, atomically within
   /// the caller's write transaction. Returns the allocated commit sequence.
   ///
   /// Sequence allocation is serialized per partition: SQLite through the
   /// single write connection, Postgres through a partition-keyed advisory
   /// transaction lock. A collision on the idempotency key surfaces as
   /// [`Error::IdempotencyViolation`]; callers treat it as "already applied".
   pub async fn append_commit(&self, txn: &mut SyncTxn, commit: NewCommit<'_>) -> Result<i64> {
      if txn.dialect().supports_advisory_locks() {
         txn
            .execute(
               "SELECT pg_advisory_xact_lock(hashtext($1))",
               vec![SqlParam::Text(commit.partition_id.to_string())],
            )
            .await?;
      }

      let row = txn
         .fetch_one(
            "SELECT COALESCE(MAX(commit_seq), 0) + 1 AS next_seq FROM sync_commits WHERE partition_id = $1",
            vec![SqlParam::Text(commit.partition_id.to_string())],
         )
         .await?
         .ok_or_else(|| Error::Other("commit sequence query returned no row".into()))?;
      let commit_seq = row_i64(&row, "next_seq")?;

      let affected_tables: BTreeSet<&str> =
         commit.changes.iter().map(|c| c.table.as_str()).collect();
      let affected_json = JsonValue::Array(
         affected_tables
            .iter()
            .map(|t| JsonValue::String(t.to_string()))
            .collect(),
      );

      let inserted = txn
         .execute(
            "INSERT INTO sync_commits \
             (partition_id, commit_seq, actor_id, client_id, client_commit_id, created_at, change_count, affected_tables, meta, result) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            vec![
               SqlParam::Text(commit.partition_id.to_string()),
               SqlParam::I64(commit_seq),
               SqlParam::Text(commit.actor_id.to_string()),
               SqlParam::Text(commit.client_id.to_string()),
               SqlParam::Text(commit.client_commit_id.to_string()),
               SqlParam::I64(now_unix_ms()),
               SqlParam::I64(commit.changes.len() as i64),
               SqlParam::Json(affected_json),
               commit
                  .meta
                  .map(|m| SqlParam::Json(m.clone()))
                  .unwrap_or(SqlParam::Null),
               commit
                  .result
                  .map(|r| SqlParam::Json(r.clone()))
                  .unwrap_or(SqlParam::Null),
            ],
         )
         .await;

      match inserted {
         Ok(_) => {}
         Err(Error::Sqlx(e)) if Error::is_unique_violation(&e) => {
            return Err(Error::IdempotencyViolation {
               partition_id: commit.partition_id.to_string(),
               client_id: commit.client_id.to_string(),
               client_commit_id: commit.client_commit_id.to_string(),
            });
         }
         Err(e) => return Err(e),
      }

      for table in &affected_tables {
         txn
            .execute(
               "INSERT INTO sync_table_commits (partition_id, table_name, commit_seq) VALUES ($1, $2, $3)",
               vec![
                  SqlParam::Text(commit.partition_id.to_string()),
                  SqlParam::Text(table.to_string()),
                  SqlParam::I64(commit_seq),
               ],
            )
            .await?;
      }

      for change in commit.changes {
         let scopes_json = JsonValue::Object(
            change
               .scopes
               .iter()
               .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
               .collect(),
         );
         txn
            .execute(
               "INSERT INTO sync_changes \
                (partition_id, commit_seq, table_name, row_id, op, row_json, row_version, scopes) \
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
               vec![
                  SqlParam::Text(commit.partition_id.to_string()),
                  SqlParam::I64(commit_seq),
                  SqlParam::Text(change.table.clone()),
                  SqlParam::Text(change.row_id.clone()),
                  SqlParam::Text(change.op.as_str().to_string()),
                  change
                     .row_json
                     .clone()
                     .map(SqlParam::Json)
                     .unwrap_or(SqlParam::Null),
                  change.row_version.into(),
                  SqlParam::Json(scopes_json),
               ],
            )
            .await?;
      }

      trace!(
         partition = commit.partition_id,
         commit_seq,
         changes = commit.changes.len(),
         "appended commit"
      );
      Ok(commit_seq)
   }

   /// Look up a prior commit by its idempotency key.
   pub async fn find_commit_by_idempotency_key(
      &self,
      partition_id: &str,
      client_id: &str,
      client_commit_id: &str,
   ) -> Result<Option<CommitRecord>> {
      let row = self
         .db
         .fetch_one(
            "SELECT partition_id, commit_seq, actor_id, client_id, client_commit_id, created_at, change_count, affected_tables, meta, result \
             FROM sync_commits \
             WHERE partition_id = $1 AND client_id = $2 AND client_commit_id = $3",
            vec![
               SqlParam::Text(partition_id.to_string()),
               SqlParam::Text(client_id.to_string()),
               SqlParam::Text(client_commit_id.to_string()),
            ],
         )
         .await?;
      row.map(|r| commit_from_row(&r)).transpose()
   }

   /// Commit sequences strictly greater than `cursor` touching any of the
   /// given tables, in increasing order, at most `limit` of them.
   ///
   /// The single-table fast path skips de-duplication: the routing PK makes
   /// `(partition, table, commit_seq)` unique already.
   pub async fn read_commit_seqs_for_pull(
      &self,
      partition_id: &str,
      tables: &[String],
      cursor: i64,
      limit: i64,
   ) -> Result<Vec<i64>> {
      if tables.is_empty() || limit <= 0 {
         return Ok(Vec::new());
      }
      let dialect = self.db.dialect();
      let (sql, params) = if tables.len() == 1 {
         (
            "SELECT commit_seq FROM sync_table_commits \
             WHERE partition_id = $1 AND table_name = $2 AND commit_seq > $3 \
             ORDER BY commit_seq LIMIT $4"
               .to_string(),
            vec![
               SqlParam::Text(partition_id.to_string()),
               SqlParam::Text(tables[0].clone()),
               SqlParam::I64(cursor),
               SqlParam::I64(limit),
            ],
         )
      } else if dialect.supports_array_params() {
         (
            "SELECT DISTINCT commit_seq FROM sync_table_commits \
             WHERE partition_id = $1 AND table_name = ANY($2) AND commit_seq > $3 \
             ORDER BY commit_seq LIMIT $4"
               .to_string(),
            vec![
               SqlParam::Text(partition_id.to_string()),
               SqlParam::TextArray(tables.to_vec()),
               SqlParam::I64(cursor),
               SqlParam::I64(limit),
            ],
         )
      } else {
         let list = dialect.placeholder_list(2, tables.len());
         let after = 2 + tables.len();
         let mut params = vec![SqlParam::Text(partition_id.to_string())];
         params.extend(tables.iter().cloned().map(SqlParam::Text));
         params.push(SqlParam::I64(cursor));
         params.push(SqlParam::I64(limit));
         (
            format!(
               "SELECT DISTINCT commit_seq FROM sync_table_commits \
                WHERE partition_id = $1 AND table_name IN ({list}) AND commit_seq > ${after} \
                ORDER BY commit_seq LIMIT ${}",
               after + 1
            ),
            params,
         )
      };

      let rows = self.db.fetch_all(&sql, params).await?;
      rows.iter().map(|r| row_i64(r, "commit_seq")).collect()
   }

   /// All changes of the given commits matching table and scope filter,
   /// joined with their commit headers, ordered by `(commit_seq, change_id)`.
   pub async fn read_changes_for_commits(
      &self,
      partition_id: &str,
      commit_seqs: &[i64],
      table: &str,
      scope_filter: &ScopeFilter,
   ) -> Result<Vec<PullRow>> {
      if commit_seqs.is_empty() {
         return Ok(Vec::new());
      }
      let dialect = self.db.dialect();
      let mut params = vec![
         SqlParam::Text(partition_id.to_string()),
         SqlParam::Text(table.to_string()),
      ];
      let mut next_idx = 3;

      let seq_fragment = if dialect.supports_array_params() {
         let fragment = format!("ch.commit_seq = ANY(${next_idx})");
         next_idx += 1;
         params.push(SqlParam::I64Array(commit_seqs.to_vec()));
         fragment
      } else {
         let list = dialect.placeholder_list(next_idx, commit_seqs.len());
         next_idx += commit_seqs.len();
         params.extend(commit_seqs.iter().copied().map(SqlParam::I64));
         format!("ch.commit_seq IN ({list})")
      };

      let (scope_fragments, scope_params) = scope_filter.to_sql(dialect, "ch.scopes", &mut next_idx);
      params.extend(scope_params);

      let mut conditions = vec![
         "ch.partition_id = $1".to_string(),
         "ch.table_name = $2".to_string(),
         seq_fragment,
      ];
      conditions.extend(scope_fragments);

      let sql = format!(
         "SELECT ch.change_id, ch.commit_seq, ch.partition_id, ch.table_name, ch.row_id, ch.op, \
                 ch.row_json, ch.row_version, ch.scopes, co.created_at, co.actor_id \
          FROM sync_changes ch \
          JOIN sync_commits co ON co.partition_id = ch.partition_id AND co.commit_seq = ch.commit_seq \
          WHERE {} \
          ORDER BY ch.commit_seq, ch.change_id",
         conditions.join(" AND ")
      );

      let rows = self.db.fetch_all(&sql, params).await?;
      rows.iter().map(pull_row_from_row).collect()
   }

   /// Begin a lazy windowed iteration over incremental pull rows.
   ///
   /// The commit sequences in range are resolved once, up front and bounded
   /// by `limit_commits`; change rows are then fetched window by window, in
   /// windows of `batch_commits` whole commits, so page boundaries always
   /// align with commit boundaries.
   pub async fn incremental_pull(
      &self,
      partition_id: &str,
      table: &str,
      scope_filter: ScopeFilter,
      cursor: i64,
      limit_commits: i64,
      batch_commits: usize,
   ) -> Result<IncrementalPullIter> {
      let tables = [table.to_string()];
      let seqs = self
         .read_commit_seqs_for_pull(partition_id, &tables, cursor, limit_commits)
         .await?;
      Ok(IncrementalPullIter {
         store: self.clone(),
         partition_id: partition_id.to_string(),
         table: table.to_string(),
         scope_filter,
         seqs,
         pos: 0,
         batch_commits: batch_commits.max(1),
      })
   }

   /// Highest commit sequence in the partition, 0 when empty.
   pub async fn max_commit_seq(&self, partition_id: &str) -> Result<i64> {
      let row = self
         .db
         .fetch_one(
            "SELECT COALESCE(MAX(commit_seq), 0) AS seq FROM sync_commits WHERE partition_id = $1",
            vec![SqlParam::Text(partition_id.to_string())],
         )
         .await?;
      row.map(|r| row_i64(&r, "seq")).transpose().map(|v| v.unwrap_or(0))
   }

   /// Oldest commit sequence still retained in the partition, 0 when empty.
   /// A client whose cursor is below this has fallen behind retention and
   /// must re-bootstrap.
   pub async fn oldest_retained_commit_seq(&self, partition_id: &str) -> Result<i64> {
      let row = self
         .db
         .fetch_one(
            "SELECT COALESCE(MIN(commit_seq), 0) AS seq FROM sync_commits WHERE partition_id = $1",
            vec![SqlParam::Text(partition_id.to_string())],
         )
         .await?;
      row.map(|r| row_i64(&r, "seq")).transpose().map(|v| v.unwrap_or(0))
   }

   /// Distinct partitions present in the log.
   pub async fn list_partitions(&self) -> Result<Vec<String>> {
      let rows = self
         .db
         .fetch_all("SELECT DISTINCT partition_id FROM sync_commits ORDER BY partition_id", vec![])
         .await?;
      rows.iter().map(|r| row_string(r, "partition_id")).collect()
   }

   // --- client cursors -----------------------------------------------------

   /// Upsert the last-seen cursor and effective scopes for a client.
   pub async fn record_client_cursor(
      &self,
      partition_id: &str,
      client_id: &str,
      actor_id: &str,
      cursor: i64,
      effective_scopes: Option<&JsonValue>,
   ) -> Result<()> {
      self
         .db
         .execute(
            "INSERT INTO sync_client_cursors (partition_id, client_id, actor_id, cursor, effective_scopes, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (partition_id, client_id) DO UPDATE SET \
                actor_id = excluded.actor_id, \
                cursor = excluded.cursor, \
                effective_scopes = excluded.effective_scopes, \
                updated_at = excluded.updated_at",
            vec![
               SqlParam::Text(partition_id.to_string()),
               SqlParam::Text(client_id.to_string()),
               SqlParam::Text(actor_id.to_string()),
               SqlParam::I64(cursor),
               effective_scopes
                  .map(|s| SqlParam::Json(s.clone()))
                  .unwrap_or(SqlParam::Null),
               SqlParam::I64(now_unix_ms()),
            ],
         )
         .await?;
      Ok(())
   }

   /// Read back a recorded client cursor.
   pub async fn get_client_cursor(
      &self,
      partition_id: &str,
      client_id: &str,
   ) -> Result<Option<ClientCursor>> {
      let row = self
         .db
         .fetch_one(
            "SELECT partition_id, client_id, actor_id, cursor, effective_scopes, updated_at \
             FROM sync_client_cursors WHERE partition_id = $1 AND client_id = $2",
            vec![
               SqlParam::Text(partition_id.to_string()),
               SqlParam::Text(client_id.to_string()),
            ],
         )
         .await?;
      row
         .map(|r| {
            Ok(ClientCursor {
               partition_id: row_string(&r, "partition_id")?,
               client_id: row_string(&r, "client_id")?,
               actor_id: row_string(&r, "actor_id")?,
               cursor: row_i64(&r, "cursor")?,
               effective_scopes: row_json_value(&r, "effective_scopes")?,
               updated_at: row_i64(&r, "updated_at")?,
            })
         })
         .transpose()
   }

   /// Remove a client's cursor row. The client re-bootstraps on its next
   /// pull once its local cursor diverges from server history.
   pub async fn evict_client_cursor(&self, partition_id: &str, client_id: &str) -> Result<bool> {
      let result: ExecResult = self
         .db
         .execute(
            "DELETE FROM sync_client_cursors WHERE partition_id = $1 AND client_id = $2",
            vec![
               SqlParam::Text(partition_id.to_string()),
               SqlParam::Text(client_id.to_string()),
            ],
         )
         .await?;
      Ok(result.rows_affected > 0)
   }

   // --- snapshot chunks ----------------------------------------------------

   /// Persist a chunk unless a chunk with the same page key already exists,
   /// and return the stored row either way. Two chunks with the same page
   /// key are interchangeable, so concurrent producers are safe: one insert
   /// wins and the other reads the existing row back.
   pub async fn insert_chunk_if_absent(&self, chunk: &ChunkRecord) -> Result<ChunkRecord> {
      let dialect = self.db.dialect();
      let sql = format!(
         "{} sync_snapshot_chunks \
          (chunk_id, partition_id, scope_key, scope, as_of_commit_seq, row_cursor, row_limit, \
           encoding, compression, sha256, byte_length, body, blob_hash, created_at, expires_at) \
          VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15){}",
         dialect.insert_ignore_verb(),
         dialect.insert_ignore_clause()
      );
      self
         .db
         .execute(
            &sql,
            vec![
               SqlParam::Text(chunk.chunk_id.clone()),
               SqlParam::Text(chunk.partition_id.clone()),
               SqlParam::Text(chunk.scope_key.clone()),
               SqlParam::Text(chunk.scope.clone()),
               SqlParam::I64(chunk.as_of_commit_seq),
               SqlParam::Text(chunk.row_cursor.clone()),
               SqlParam::I64(chunk.row_limit),
               SqlParam::Text(chunk.encoding.clone()),
               SqlParam::Text(chunk.compression.clone()),
               SqlParam::Text(chunk.sha256.clone()),
               SqlParam::I64(chunk.byte_length),
               SqlParam::Bytes(chunk.body.clone()),
               chunk.blob_hash.clone().into(),
               SqlParam::I64(chunk.created_at),
               SqlParam::I64(chunk.expires_at),
            ],
         )
         .await?;

      let row = self
         .db
         .fetch_one(
            "SELECT chunk_id, partition_id, scope_key, scope, as_of_commit_seq, row_cursor, row_limit, \
                    encoding, compression, sha256, byte_length, body, blob_hash, created_at, expires_at \
             FROM sync_snapshot_chunks \
             WHERE partition_id = $1 AND scope_key = $2 AND scope = $3 AND as_of_commit_seq = $4 \
               AND row_cursor = $5 AND row_limit = $6 AND encoding = $7 AND compression = $8",
            vec![
               SqlParam::Text(chunk.partition_id.clone()),
               SqlParam::Text(chunk.scope_key.clone()),
               SqlParam::Text(chunk.scope.clone()),
               SqlParam::I64(chunk.as_of_commit_seq),
               SqlParam::Text(chunk.row_cursor.clone()),
               SqlParam::I64(chunk.row_limit),
               SqlParam::Text(chunk.encoding.clone()),
               SqlParam::Text(chunk.compression.clone()),
            ],
         )
         .await?
         .ok_or_else(|| Error::Other("chunk vanished between insert and read-back".into()))?;
      chunk_from_row(&row)
   }

   /// Fetch a live chunk by id; expired chunks read as missing.
   pub async fn get_chunk(&self, chunk_id: &str, now_ms: i64) -> Result<Option<ChunkRecord>> {
      let row = self
         .db
         .fetch_one(
            "SELECT chunk_id, partition_id, scope_key, scope, as_of_commit_seq, row_cursor, row_limit, \
                    encoding, compression, sha256, byte_length, body, blob_hash, created_at, expires_at \
             FROM sync_snapshot_chunks WHERE chunk_id = $1 AND expires_at > $2",
            vec![SqlParam::Text(chunk_id.to_string()), SqlParam::I64(now_ms)],
         )
         .await?;
      row.map(|r| chunk_from_row(&r)).transpose()
   }

   /// Remove chunks whose retention window has elapsed.
   pub async fn delete_expired_chunks(&self, now_ms: i64) -> Result<u64> {
      let result = self
         .db
         .execute(
            "DELETE FROM sync_snapshot_chunks WHERE expires_at <= $1",
            vec![SqlParam::I64(now_ms)],
         )
         .await?;
      Ok(result.rows_affected)
   }
}

/// Lazy, finite iterator over incremental pull rows.
///
/// Windows advance in whole commits (`batch_commits` per window), never by
/// row count, so a window boundary is always a commit boundary.
pub struct IncrementalPullIter {
   store: CommitLogStore,
   partition_id: String,
   table: String,
   scope_filter: ScopeFilter,
   seqs: Vec<i64>,
   pos: usize,
   batch_commits: usize,
}

impl IncrementalPullIter {
   /// The commit sequences this iteration will cover, in order.
   pub fn commit_seqs(&self) -> &[i64] {
      &self.seqs
   }

   /// The highest commit sequence in range, or `None` when there is nothing
   /// to deliver.
   pub fn last_commit_seq(&self) -> Option<i64> {
      self.seqs.last().copied()
   }

   /// Fetch the next window of joined rows; `None` when exhausted. Windows
   /// may be empty of rows (every change filtered out by scope) while still
   /// advancing the commit cursor.
   pub async fn next_window(&mut self) -> Result<Option<Vec<PullRow>>> {
      if self.pos >= self.seqs.len() {
         return Ok(None);
      }
      let end = (self.pos + self.batch_commits).min(self.seqs.len());
      let window = &self.seqs[self.pos..end];
      self.pos = end;
      let rows = self
         .store
         .read_changes_for_commits(&self.partition_id, window, &self.table, &self.scope_filter)
         .await?;
      Ok(Some(rows))
   }
}

// --- row parsing helpers ---------------------------------------------------

pub(crate) fn row_i64(row: &JsonRow, key: &str) -> Result<i64> {
   row
      .get(key)
      .and_then(JsonValue::as_i64)
      .ok_or_else(|| Error::CorruptValue {
         context: "integer column",
         message: format!("missing or non-integer column {key}"),
      })
}

pub(crate) fn row_opt_i64(row: &JsonRow, key: &str) -> Option<i64> {
   row.get(key).and_then(JsonValue::as_i64)
}

pub(crate) fn row_string(row: &JsonRow, key: &str) -> Result<String> {
   row
      .get(key)
      .and_then(JsonValue::as_str)
      .map(str::to_string)
      .ok_or_else(|| Error::CorruptValue {
         context: "text column",
         message: format!("missing or non-text column {key}"),
      })
}

/// Read a JSON-typed column. The embedded dialect stores JSON as TEXT, so a
/// string value is parsed; the row-store dialect returns structured values
/// directly.
pub(crate) fn row_json_value(row: &JsonRow, key: &str) -> Result<Option<JsonValue>> {
   match row.get(key) {
      None | Some(JsonValue::Null) => Ok(None),
      Some(JsonValue::String(text)) => {
         serde_json::from_str(text).map(Some).map_err(|e| Error::CorruptValue {
            context: "json column",
            message: format!("column {key}: {e}"),
         })
      }
      Some(value) => Ok(Some(value.clone())),
   }
}

fn row_scope_strings(row: &JsonRow, key: &str) -> Result<IndexMap<String, String>> {
   let Some(value) = row_json_value(row, key)? else {
      return Ok(IndexMap::new());
   };
   let JsonValue::Object(map) = value else {
      return Err(Error::CorruptValue {
         context: "scopes column",
         message: format!("column {key} is not a JSON object"),
      });
   };
   let mut out = IndexMap::with_capacity(map.len());
   for (k, v) in map {
      match v {
         JsonValue::String(s) => {
            out.insert(k, s);
         }
         other => {
            out.insert(k, other.to_string());
         }
      }
   }
   Ok(out)
}

fn commit_from_row(row: &JsonRow) -> Result<CommitRecord> {
   let affected = match row_json_value(row, "affected_tables")? {
      Some(JsonValue::Array(values)) => values
         .into_iter()
         .filter_map(|v| v.as_str().map(str::to_string))
         .collect(),
      _ => Vec::new(),
   };
   Ok(CommitRecord {
      commit_seq: row_i64(row, "commit_seq")?,
      partition_id: row_string(row, "partition_id")?,
      actor_id: row_string(row, "actor_id")?,
      client_id: row_string(row, "client_id")?,
      client_commit_id: row_string(row, "client_commit_id")?,
      created_at: row_i64(row, "created_at")?,
      change_count: row_i64(row, "change_count")?,
      affected_tables: affected,
      meta: row_json_value(row, "meta")?,
      result: row_json_value(row, "result")?,
   })
}

fn change_from_row(row: &JsonRow) -> Result<ChangeRecord> {
   let op_text = row_string(row, "op")?;
   let op = ChangeOp::parse(&op_text).ok_or_else(|| Error::CorruptValue {
      context: "change op",
      message: format!("unknown op {op_text:?}"),
   })?;
   Ok(ChangeRecord {
      change_id: row_i64(row, "change_id")?,
      commit_seq: row_i64(row, "commit_seq")?,
      partition_id: row_string(row, "partition_id")?,
      table: row_string(row, "table_name")?,
      row_id: row_string(row, "row_id")?,
      op,
      row_json: row_json_value(row, "row_json")?,
      row_version: row_opt_i64(row, "row_version"),
      scopes: row_scope_strings(row, "scopes")?,
   })
}

fn pull_row_from_row(row: &JsonRow) -> Result<PullRow> {
   Ok(PullRow {
      change: change_from_row(row)?,
      created_at: row_i64(row, "created_at")?,
      actor_id: row_string(row, "actor_id")?,
   })
}

fn chunk_from_row(row: &JsonRow) -> Result<ChunkRecord> {
   let body_b64 = row_string(row, "body")?;
   Ok(ChunkRecord {
      chunk_id: row_string(row, "chunk_id")?,
      partition_id: row_string(row, "partition_id")?,
      scope_key: row_string(row, "scope_key")?,
      scope: row_string(row, "scope")?,
      as_of_commit_seq: row_i64(row, "as_of_commit_seq")?,
      row_cursor: row_string(row, "row_cursor")?,
      row_limit: row_i64(row, "row_limit")?,
      encoding: row_string(row, "encoding")?,
      compression: row_string(row, "compression")?,
      sha256: row_string(row, "sha256")?,
      byte_length: row_i64(row, "byte_length")?,
      body: base64_decode(&body_b64)?,
      blob_hash: row.get("blob_hash").and_then(JsonValue::as_str).map(str::to_string),
      created_at: row_i64(row, "created_at")?,
      expires_at: row_i64(row, "expires_at")?,
   })
}
