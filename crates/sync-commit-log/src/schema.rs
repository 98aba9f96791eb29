//! Idempotent schema management for the sync tables.
//!
//! All DDL is additive: `CREATE TABLE IF NOT EXISTS` plus column additions
//! that tolerate already-present columns, so `ensure_sync_schema` is safe to
//! run on every startup and safe to run concurrently. On Postgres the whole
//! pass runs inside a transaction holding an advisory lock so concurrent
//! deployers serialize; SQLite writes are serialized by the write connection.
//!
//! The two dialect families produce structurally identical schemas: the
//! embedded family stores JSON as TEXT with B-tree indexes, the row-store
//! family uses JSONB (with a GIN index on change scopes), BIGINT sequences,
//! and BYTEA chunk bodies.

use tracing::{debug, warn};

use crate::db::{SqlParam, SyncDb};
use crate::dialect::SyncDialect;
use crate::error::Result;
use crate::model::now_unix_ms;

/// Version stamp recorded in `sync_schema_info`. Bump when adding DDL.
pub const SCHEMA_VERSION: i64 = 2;

/// Advisory lock key for Postgres DDL serialization.
const DDL_LOCK_KEY: i64 = 0x73796e_63; // "sync"

/// Ensure the core sync tables exist and are up to date.
pub async fn ensure_sync_schema(db: &SyncDb) -> Result<()> {
   let statements = sync_schema_statements(db.dialect());
   apply_ddl(db, &statements).await?;

   // v2 additive upgrades: no-ops on fresh installs, tolerated on re-runs.
   add_column_if_missing(db, "sync_commits", "meta", json_column_type(db.dialect())).await?;
   add_column_if_missing(db, "sync_snapshot_chunks", "blob_hash", "TEXT").await?;

   record_schema_version(db).await?;
   debug!(dialect = db.dialect().name(), version = SCHEMA_VERSION, "sync schema ensured");
   Ok(())
}

/// Ensure the optional console/observability tables exist.
pub async fn ensure_console_schema(db: &SyncDb) -> Result<()> {
   let statements = console_schema_statements(db.dialect());
   apply_ddl(db, &statements).await?;
   debug!(dialect = db.dialect().name(), "console schema ensured");
   Ok(())
}

async fn apply_ddl(db: &SyncDb, statements: &[String]) -> Result<()> {
   if db.dialect().supports_advisory_locks() {
      let mut txn = db.begin().await?;
      txn
         .execute("SELECT pg_advisory_xact_lock($1)", vec![SqlParam::I64(DDL_LOCK_KEY)])
         .await?;
      for sql in statements {
         txn.execute(sql, vec![]).await?;
      }
      txn.commit().await?;
   } else {
      for sql in statements {
         db.execute(sql, vec![]).await?;
      }
   }
   Ok(())
}

/// Add a column, treating "duplicate column" as success.
///
/// Neither dialect family universally supports `ADD COLUMN IF NOT EXISTS`
/// (SQLite has no form of it), so the duplicate error is the portable
/// idempotency signal.
async fn add_column_if_missing(
   db: &SyncDb,
   table: &str,
   column: &str,
   column_type: &str,
) -> Result<()> {
   let sql = format!("ALTER TABLE {table} ADD COLUMN {column} {column_type}");
   match db.execute(&sql, vec![]).await {
      Ok(_) => Ok(()),
      Err(e) => {
         let message = e.to_string().to_ascii_lowercase();
         if message.contains("duplicate column") || message.contains("already exists") {
            Ok(())
         } else {
            warn!(table, column, error = %e, "additive column upgrade failed");
            Err(e)
         }
      }
   }
}

async fn record_schema_version(db: &SyncDb) -> Result<()> {
   db.execute(
      "INSERT INTO sync_schema_info (id, schema_version, updated_at) VALUES (1, $1, $2) \
       ON CONFLICT (id) DO UPDATE SET schema_version = excluded.schema_version, updated_at = excluded.updated_at",
      vec![SqlParam::I64(SCHEMA_VERSION), SqlParam::I64(now_unix_ms())],
   )
   .await?;
   Ok(())
}

fn json_column_type(dialect: SyncDialect) -> &'static str {
   match dialect {
      SyncDialect::Sqlite => "TEXT",
      SyncDialect::Postgres => "JSONB",
   }
}

fn sync_schema_statements(dialect: SyncDialect) -> Vec<String> {
   match dialect {
      SyncDialect::Sqlite => vec![
         "CREATE TABLE IF NOT EXISTS sync_schema_info (\
            id INTEGER PRIMARY KEY CHECK (id = 1), \
            schema_version INTEGER NOT NULL, \
            updated_at INTEGER NOT NULL\
         )"
         .into(),
         "CREATE TABLE IF NOT EXISTS sync_commits (\
            partition_id TEXT NOT NULL DEFAULT 'default', \
            commit_seq INTEGER NOT NULL, \
            actor_id TEXT NOT NULL, \
            client_id TEXT NOT NULL, \
            client_commit_id TEXT NOT NULL, \
            created_at INTEGER NOT NULL, \
            change_count INTEGER NOT NULL DEFAULT 0, \
            affected_tables TEXT NOT NULL DEFAULT '[]', \
            meta TEXT, \
            result TEXT, \
            PRIMARY KEY (partition_id, commit_seq)\
         )"
         .into(),
         "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_commits_idempotency \
          ON sync_commits (partition_id, client_id, client_commit_id)"
            .into(),
         "CREATE TABLE IF NOT EXISTS sync_table_commits (\
            partition_id TEXT NOT NULL DEFAULT 'default', \
            table_name TEXT NOT NULL, \
            commit_seq INTEGER NOT NULL, \
            PRIMARY KEY (partition_id, table_name, commit_seq)\
         )"
         .into(),
         "CREATE TABLE IF NOT EXISTS sync_changes (\
            change_id INTEGER PRIMARY KEY AUTOINCREMENT, \
            partition_id TEXT NOT NULL DEFAULT 'default', \
            commit_seq INTEGER NOT NULL, \
            table_name TEXT NOT NULL, \
            row_id TEXT NOT NULL, \
            op TEXT NOT NULL, \
            row_json TEXT, \
            row_version INTEGER, \
            scopes TEXT NOT NULL DEFAULT '{}'\
         )"
         .into(),
         "CREATE INDEX IF NOT EXISTS idx_sync_changes_pull \
          ON sync_changes (partition_id, table_name, commit_seq)"
            .into(),
         "CREATE TABLE IF NOT EXISTS sync_client_cursors (\
            partition_id TEXT NOT NULL DEFAULT 'default', \
            client_id TEXT NOT NULL, \
            actor_id TEXT NOT NULL, \
            cursor INTEGER NOT NULL DEFAULT 0, \
            effective_scopes TEXT, \
            updated_at INTEGER NOT NULL, \
            PRIMARY KEY (partition_id, client_id)\
         )"
         .into(),
         "CREATE TABLE IF NOT EXISTS sync_snapshot_chunks (\
            chunk_id TEXT PRIMARY KEY, \
            partition_id TEXT NOT NULL DEFAULT 'default', \
            scope_key TEXT NOT NULL, \
            scope TEXT NOT NULL, \
            as_of_commit_seq INTEGER NOT NULL, \
            row_cursor TEXT NOT NULL DEFAULT '', \
            row_limit INTEGER NOT NULL, \
            encoding TEXT NOT NULL, \
            compression TEXT NOT NULL, \
            sha256 TEXT NOT NULL, \
            byte_length INTEGER NOT NULL, \
            body BLOB NOT NULL, \
            created_at INTEGER NOT NULL, \
            expires_at INTEGER NOT NULL\
         )"
         .into(),
         "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_snapshot_chunks_page_key \
          ON sync_snapshot_chunks (partition_id, scope_key, scope, as_of_commit_seq, row_cursor, row_limit, encoding, compression)"
            .into(),
         "CREATE TABLE IF NOT EXISTS sync_rows (\
            partition_id TEXT NOT NULL DEFAULT 'default', \
            table_name TEXT NOT NULL, \
            row_id TEXT NOT NULL, \
            row_json TEXT NOT NULL, \
            row_version INTEGER NOT NULL DEFAULT 1, \
            scopes TEXT NOT NULL DEFAULT '{}', \
            updated_at INTEGER NOT NULL, \
            PRIMARY KEY (partition_id, table_name, row_id)\
         )"
         .into(),
      ],
      SyncDialect::Postgres => vec![
         "CREATE TABLE IF NOT EXISTS sync_schema_info (\
            id BIGINT PRIMARY KEY CHECK (id = 1), \
            schema_version BIGINT NOT NULL, \
            updated_at BIGINT NOT NULL\
         )"
         .into(),
         "CREATE TABLE IF NOT EXISTS sync_commits (\
            partition_id TEXT NOT NULL DEFAULT 'default', \
            commit_seq BIGINT NOT NULL, \
            actor_id TEXT NOT NULL, \
            client_id TEXT NOT NULL, \
            client_commit_id TEXT NOT NULL, \
            created_at BIGINT NOT NULL, \
            change_count BIGINT NOT NULL DEFAULT 0, \
            affected_tables JSONB NOT NULL DEFAULT '[]', \
            meta JSONB, \
            result JSONB, \
            PRIMARY KEY (partition_id, commit_seq)\
         )"
         .into(),
         "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_commits_idempotency \
          ON sync_commits (partition_id, client_id, client_commit_id)"
            .into(),
         "CREATE TABLE IF NOT EXISTS sync_table_commits (\
            partition_id TEXT NOT NULL DEFAULT 'default', \
            table_name TEXT NOT NULL, \
            commit_seq BIGINT NOT NULL, \
            PRIMARY KEY (partition_id, table_name, commit_seq)\
         )"
         .into(),
         "CREATE TABLE IF NOT EXISTS sync_changes (\
            change_id BIGSERIAL PRIMARY KEY, \
            partition_id TEXT NOT NULL DEFAULT 'default', \
            commit_seq BIGINT NOT NULL, \
            table_name TEXT NOT NULL, \
            row_id TEXT NOT NULL, \
            op TEXT NOT NULL, \
            row_json JSONB, \
            row_version BIGINT, \
            scopes JSONB NOT NULL DEFAULT '{}'\
         )"
         .into(),
         "CREATE INDEX IF NOT EXISTS idx_sync_changes_pull \
          ON sync_changes (partition_id, table_name, commit_seq)"
            .into(),
         "CREATE INDEX IF NOT EXISTS idx_sync_changes_scopes \
          ON sync_changes USING GIN (scopes)"
            .into(),
         "CREATE TABLE IF NOT EXISTS sync_client_cursors (\
            partition_id TEXT NOT NULL DEFAULT 'default', \
            client_id TEXT NOT NULL, \
            actor_id TEXT NOT NULL, \
            cursor BIGINT NOT NULL DEFAULT 0, \
            effective_scopes JSONB, \
            updated_at BIGINT NOT NULL, \
            PRIMARY KEY (partition_id, client_id)\
         )"
         .into(),
         "CREATE TABLE IF NOT EXISTS sync_snapshot_chunks (\
            chunk_id TEXT PRIMARY KEY, \
            partition_id TEXT NOT NULL DEFAULT 'default', \
            scope_key TEXT NOT NULL, \
            scope TEXT NOT NULL, \
            as_of_commit_seq BIGINT NOT NULL, \
            row_cursor TEXT NOT NULL DEFAULT '', \
            row_limit BIGINT NOT NULL, \
            encoding TEXT NOT NULL, \
            compression TEXT NOT NULL, \
            sha256 TEXT NOT NULL, \
            byte_length BIGINT NOT NULL, \
            body BYTEA NOT NULL, \
            created_at BIGINT NOT NULL, \
            expires_at BIGINT NOT NULL\
         )"
         .into(),
         "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_snapshot_chunks_page_key \
          ON sync_snapshot_chunks (partition_id, scope_key, scope, as_of_commit_seq, row_cursor, row_limit, encoding, compression)"
            .into(),
         "CREATE TABLE IF NOT EXISTS sync_rows (\
            partition_id TEXT NOT NULL DEFAULT 'default', \
            table_name TEXT NOT NULL, \
            row_id TEXT NOT NULL, \
            row_json JSONB NOT NULL, \
            row_version BIGINT NOT NULL DEFAULT 1, \
            scopes JSONB NOT NULL DEFAULT '{}', \
            updated_at BIGINT NOT NULL, \
            PRIMARY KEY (partition_id, table_name, row_id)\
         )"
         .into(),
      ],
   }
}

fn console_schema_statements(dialect: SyncDialect) -> Vec<String> {
   let (pk, bigint, json, bytes) = match dialect {
      SyncDialect::Sqlite => ("INTEGER PRIMARY KEY AUTOINCREMENT", "INTEGER", "TEXT", "BLOB"),
      SyncDialect::Postgres => ("BIGSERIAL PRIMARY KEY", "BIGINT", "JSONB", "BYTEA"),
   };
   vec![
      format!(
         "CREATE TABLE IF NOT EXISTS sync_request_events (\
            event_id {pk}, \
            partition_id TEXT NOT NULL DEFAULT 'default', \
            client_id TEXT, \
            actor_id TEXT, \
            kind TEXT NOT NULL, \
            commit_seq {bigint}, \
            detail {json}, \
            created_at {bigint} NOT NULL\
         )"
      ),
      format!(
         "CREATE TABLE IF NOT EXISTS sync_request_payloads (\
            payload_id {pk}, \
            event_id {bigint} NOT NULL, \
            body {bytes} NOT NULL, \
            created_at {bigint} NOT NULL\
         )"
      ),
      format!(
         "CREATE TABLE IF NOT EXISTS sync_operation_events (\
            op_event_id {pk}, \
            partition_id TEXT NOT NULL DEFAULT 'default', \
            table_name TEXT NOT NULL, \
            row_id TEXT NOT NULL, \
            op TEXT NOT NULL, \
            status TEXT NOT NULL, \
            code TEXT, \
            created_at {bigint} NOT NULL\
         )"
      ),
      format!(
         "CREATE TABLE IF NOT EXISTS sync_api_keys (\
            key_id TEXT PRIMARY KEY, \
            partition_id TEXT NOT NULL DEFAULT 'default', \
            label TEXT NOT NULL, \
            secret_hash TEXT NOT NULL, \
            created_at {bigint} NOT NULL, \
            revoked_at {bigint}\
         )"
      ),
   ]
}
