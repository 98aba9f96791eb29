//! Database handle with dialect-portable execution.
//!
//! `SyncDb` wraps the driver pools behind a JSON-parameter query interface:
//! SQL strings with `$N` placeholders, parameters bound from [`SqlParam`]
//! values, rows decoded to ordered JSON maps. The SQLite arm keeps the
//! read-pool/single-writer split (WAL enabled on first write); the Postgres
//! arm uses one shared pool. Write paths go through [`SyncTxn`], which adds
//! savepoint control for per-operation isolation.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{ConnectOptions, Pool, Sqlite};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::decode::{JsonRow, sqlite_row_to_json};
use crate::dialect::{SyncDialect, sanitize_identifier};
use crate::error::{Error, Result};

/// Parameter value for a portable query.
///
/// Most call sites construct these through `From<JsonValue>`, which follows
/// the integer-precision rules of the JSON binding layer: integral numbers
/// bind as `i64`, everything else numeric as `f64`, arrays and objects as
/// JSON. The array variants are only accepted by array-capable dialects.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
   Null,
   I64(i64),
   F64(f64),
   Bool(bool),
   Text(String),
   Bytes(Vec<u8>),
   Json(JsonValue),
   TextArray(Vec<String>),
   I64Array(Vec<i64>),
}

impl From<JsonValue> for SqlParam {
   fn from(value: JsonValue) -> Self {
      match value {
         JsonValue::Null => SqlParam::Null,
         JsonValue::Bool(b) => SqlParam::Bool(b),
         JsonValue::String(s) => SqlParam::Text(s),
         JsonValue::Number(number) => {
            // Preserve integer precision by binding as i64 when possible
            if let Some(int_val) = number.as_i64() {
               SqlParam::I64(int_val)
            } else if let Some(uint_val) = number.as_u64() {
               if uint_val <= i64::MAX as u64 {
                  SqlParam::I64(uint_val as i64)
               } else {
                  SqlParam::F64(uint_val as f64)
               }
            } else {
               SqlParam::F64(number.as_f64().unwrap_or_default())
            }
         }
         other => SqlParam::Json(other),
      }
   }
}

impl From<i64> for SqlParam {
   fn from(value: i64) -> Self {
      SqlParam::I64(value)
   }
}

impl From<&str> for SqlParam {
   fn from(value: &str) -> Self {
      SqlParam::Text(value.to_string())
   }
}

impl From<String> for SqlParam {
   fn from(value: String) -> Self {
      SqlParam::Text(value)
   }
}

impl From<Option<String>> for SqlParam {
   fn from(value: Option<String>) -> Self {
      match value {
         Some(s) => SqlParam::Text(s),
         None => SqlParam::Null,
      }
   }
}

impl From<Option<i64>> for SqlParam {
   fn from(value: Option<i64>) -> Self {
      match value {
         Some(v) => SqlParam::I64(v),
         None => SqlParam::Null,
      }
   }
}

/// Result returned from write statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
   /// The number of rows affected by the statement.
   pub rows_affected: u64,
   /// The last inserted rowid. Only meaningful for SQLite INSERTs on rowid
   /// tables; 0 elsewhere.
   pub last_insert_id: i64,
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct SyncDbConfig {
   /// Maximum read connections (SQLite read pool / Postgres shared pool).
   pub max_read_connections: u32,
   /// Idle timeout before pooled connections are released.
   pub idle_timeout_secs: u64,
}

impl Default for SyncDbConfig {
   fn default() -> Self {
      Self {
         max_read_connections: 6,
         idle_timeout_secs: 30,
      }
   }
}

enum DbInner {
   Sqlite {
      read_pool: Pool<Sqlite>,
      write_pool: Pool<Sqlite>,
      wal_initialized: AtomicBool,
   },
   #[cfg(feature = "postgres")]
   Postgres { pool: sqlx::PgPool },
}

/// Dialect-portable database handle.
///
/// Cloning is cheap; all clones share the same pools and the same handle
/// identity (used to key per-database maintenance debounce state).
#[derive(Clone)]
pub struct SyncDb {
   inner: Arc<DbInner>,
   dialect: SyncDialect,
   handle_id: Uuid,
}

impl std::fmt::Debug for SyncDb {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("SyncDb")
         .field("dialect", &self.dialect)
         .field("handle_id", &self.handle_id)
         .finish()
   }
}

fn is_memory_path(path: &Path) -> bool {
   path.to_str().is_some_and(|p| p.contains(":memory:"))
}

impl SyncDb {
   /// Open (creating if missing) a SQLite database.
   ///
   /// File databases get a read-only connection pool for concurrent reads
   /// plus a single read-write connection for serialized writes; WAL mode is
   /// enabled lazily on the first write. `:memory:` databases use one shared
   /// connection, since separate pools would each see their own database.
   pub async fn connect_sqlite(
      path: impl AsRef<Path>,
      custom_config: Option<SyncDbConfig>,
   ) -> Result<Self> {
      let config = custom_config.unwrap_or_default();
      let path = path.as_ref();

      if path.as_os_str().is_empty() {
         return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "database path cannot be empty",
         )));
      }

      if is_memory_path(path) {
         let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().filename(path).read_only(false))
            .await?;
         debug!("opened in-memory sqlite database");
         return Ok(Self {
            inner: Arc::new(DbInner::Sqlite {
               read_pool: pool.clone(),
               write_pool: pool,
               // No WAL for memory databases
               wal_initialized: AtomicBool::new(true),
            }),
            dialect: SyncDialect::Sqlite,
            handle_id: Uuid::new_v4(),
         });
      }

      // Create the file up front with a temporary read-write connection so
      // the read-only pool can open it even when the first query is a read.
      if !path.exists() {
         let create_options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .read_only(false);
         let conn = create_options.connect().await?;
         drop(conn);
      }

      let read_options = SqliteConnectOptions::new().filename(path).read_only(true);
      let read_pool = SqlitePoolOptions::new()
         .max_connections(config.max_read_connections)
         .min_connections(0)
         .idle_timeout(Some(std::time::Duration::from_secs(
            config.idle_timeout_secs,
         )))
         .connect_with(read_options)
         .await?;

      let write_options = SqliteConnectOptions::new().filename(path).read_only(false);
      let write_pool = SqlitePoolOptions::new()
         .max_connections(1)
         .min_connections(0)
         .idle_timeout(Some(std::time::Duration::from_secs(
            config.idle_timeout_secs,
         )))
         .connect_with(write_options)
         .await?;

      debug!(path = %path.display(), "opened sqlite database");

      Ok(Self {
         inner: Arc::new(DbInner::Sqlite {
            read_pool,
            write_pool,
            wal_initialized: AtomicBool::new(false),
         }),
         dialect: SyncDialect::Sqlite,
         handle_id: Uuid::new_v4(),
      })
   }

   /// Connect to a Postgres database.
   #[cfg(feature = "postgres")]
   pub async fn connect_postgres(
      url: &str,
      custom_config: Option<SyncDbConfig>,
   ) -> Result<Self> {
      let config = custom_config.unwrap_or_default();
      let pool = sqlx::postgres::PgPoolOptions::new()
         .max_connections(config.max_read_connections)
         .idle_timeout(Some(std::time::Duration::from_secs(
            config.idle_timeout_secs,
         )))
         .connect(url)
         .await?;
      debug!("opened postgres database");
      Ok(Self {
         inner: Arc::new(DbInner::Postgres { pool }),
         dialect: SyncDialect::Postgres,
         handle_id: Uuid::new_v4(),
      })
   }

   /// The dialect family this handle speaks.
   pub fn dialect(&self) -> SyncDialect {
      self.dialect
   }

   /// Stable identity of this database handle. Maintenance debounce state is
   /// keyed by this id, so independent databases never share debounce
   /// windows.
   pub fn handle_id(&self) -> Uuid {
      self.handle_id
   }

   /// Execute a write statement outside a transaction.
   pub async fn execute(&self, sql: &str, params: Vec<SqlParam>) -> Result<ExecResult> {
      trace!(sql, "execute");
      match &*self.inner {
         DbInner::Sqlite { write_pool, .. } => {
            self.ensure_wal().await?;
            let mut query = sqlx::query(sql);
            for param in params {
               query = bind_sqlite(query, param)?;
            }
            let result = query.execute(write_pool).await?;
            Ok(ExecResult {
               rows_affected: result.rows_affected(),
               last_insert_id: result.last_insert_rowid(),
            })
         }
         #[cfg(feature = "postgres")]
         DbInner::Postgres { pool } => {
            let mut query = sqlx::query(sql);
            for param in params {
               query = bind_pg(query, param)?;
            }
            let result = query.execute(pool).await?;
            Ok(ExecResult {
               rows_affected: result.rows_affected(),
               last_insert_id: 0,
            })
         }
      }
   }

   /// Fetch all rows of a read query.
   pub async fn fetch_all(&self, sql: &str, params: Vec<SqlParam>) -> Result<Vec<JsonRow>> {
      trace!(sql, "fetch_all");
      match &*self.inner {
         DbInner::Sqlite { read_pool, .. } => {
            let mut query = sqlx::query(sql);
            for param in params {
               query = bind_sqlite(query, param)?;
            }
            let rows = query.fetch_all(read_pool).await?;
            rows.iter().map(sqlite_row_to_json).collect()
         }
         #[cfg(feature = "postgres")]
         DbInner::Postgres { pool } => {
            let mut query = sqlx::query(sql);
            for param in params {
               query = bind_pg(query, param)?;
            }
            let rows = query.fetch_all(pool).await?;
            rows.iter().map(crate::decode::pg_row_to_json).collect()
         }
      }
   }

   /// Fetch zero or one rows; more than one is an error.
   pub async fn fetch_one(&self, sql: &str, params: Vec<SqlParam>) -> Result<Option<JsonRow>> {
      let mut rows = self.fetch_all(sql, params).await?;
      match rows.len() {
         0 => Ok(None),
         1 => Ok(Some(rows.remove(0))),
         n => Err(Error::MultipleRowsReturned(n)),
      }
   }

   /// Begin a write transaction.
   ///
   /// SQLite serializes writers through the single-connection write pool;
   /// Postgres opens the transaction at REPEATABLE READ per the write-path
   /// transaction discipline.
   pub async fn begin(&self) -> Result<SyncTxn> {
      match &*self.inner {
         DbInner::Sqlite { write_pool, .. } => {
            self.ensure_wal().await?;
            Ok(SyncTxn::Sqlite(write_pool.begin().await?))
         }
         #[cfg(feature = "postgres")]
         DbInner::Postgres { pool } => {
            let mut txn = pool.begin().await?;
            sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
               .execute(&mut *txn)
               .await?;
            Ok(SyncTxn::Postgres(txn))
         }
      }
   }

   /// Begin a read-only snapshot transaction, used by bootstrap paging so
   /// every page observes the same database state.
   pub async fn begin_read(&self) -> Result<SyncTxn> {
      match &*self.inner {
         DbInner::Sqlite { read_pool, .. } => Ok(SyncTxn::Sqlite(read_pool.begin().await?)),
         #[cfg(feature = "postgres")]
         DbInner::Postgres { pool } => {
            let mut txn = pool.begin().await?;
            sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
               .execute(&mut *txn)
               .await?;
            Ok(SyncTxn::Postgres(txn))
         }
      }
   }

   /// Close all pools. Outstanding borrowed connections are awaited.
   pub async fn close(&self) {
      match &*self.inner {
         DbInner::Sqlite {
            read_pool,
            write_pool,
            ..
         } => {
            read_pool.close().await;
            write_pool.close().await;
         }
         #[cfg(feature = "postgres")]
         DbInner::Postgres { pool } => pool.close().await,
      }
   }

   /// Initialize WAL mode on first write (atomic check-and-set).
   async fn ensure_wal(&self) -> Result<()> {
      if let DbInner::Sqlite {
         write_pool,
         wal_initialized,
         ..
      } = &*self.inner
         && wal_initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
      {
         sqlx::query("PRAGMA journal_mode = WAL")
            .execute(write_pool)
            .await?;
         // https://www.sqlite.org/wal.html#performance_considerations
         sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(write_pool)
            .await?;
      }
      Ok(())
   }
}

/// An open transaction on a [`SyncDb`], with savepoint control.
pub enum SyncTxn {
   Sqlite(sqlx::Transaction<'static, Sqlite>),
   #[cfg(feature = "postgres")]
   Postgres(sqlx::Transaction<'static, sqlx::Postgres>),
}

impl SyncTxn {
   /// The dialect family of the underlying connection.
   pub fn dialect(&self) -> SyncDialect {
      match self {
         SyncTxn::Sqlite(_) => SyncDialect::Sqlite,
         #[cfg(feature = "postgres")]
         SyncTxn::Postgres(_) => SyncDialect::Postgres,
      }
   }

   /// Execute a write statement inside the transaction.
   pub async fn execute(&mut self, sql: &str, params: Vec<SqlParam>) -> Result<ExecResult> {
      trace!(sql, "txn execute");
      match self {
         SyncTxn::Sqlite(txn) => {
            let mut query = sqlx::query(sql);
            for param in params {
               query = bind_sqlite(query, param)?;
            }
            let result = query.execute(&mut **txn).await?;
            Ok(ExecResult {
               rows_affected: result.rows_affected(),
               last_insert_id: result.last_insert_rowid(),
            })
         }
         #[cfg(feature = "postgres")]
         SyncTxn::Postgres(txn) => {
            let mut query = sqlx::query(sql);
            for param in params {
               query = bind_pg(query, param)?;
            }
            let result = query.execute(&mut **txn).await?;
            Ok(ExecResult {
               rows_affected: result.rows_affected(),
               last_insert_id: 0,
            })
         }
      }
   }

   /// Fetch all rows of a query inside the transaction (sees uncommitted
   /// writes of this transaction).
   pub async fn fetch_all(&mut self, sql: &str, params: Vec<SqlParam>) -> Result<Vec<JsonRow>> {
      trace!(sql, "txn fetch_all");
      match self {
         SyncTxn::Sqlite(txn) => {
            let mut query = sqlx::query(sql);
            for param in params {
               query = bind_sqlite(query, param)?;
            }
            let rows = query.fetch_all(&mut **txn).await?;
            rows.iter().map(sqlite_row_to_json).collect()
         }
         #[cfg(feature = "postgres")]
         SyncTxn::Postgres(txn) => {
            let mut query = sqlx::query(sql);
            for param in params {
               query = bind_pg(query, param)?;
            }
            let rows = query.fetch_all(&mut **txn).await?;
            rows.iter().map(crate::decode::pg_row_to_json).collect()
         }
      }
   }

   /// Fetch zero or one rows; more than one is an error.
   pub async fn fetch_one(&mut self, sql: &str, params: Vec<SqlParam>) -> Result<Option<JsonRow>> {
      let mut rows = self.fetch_all(sql, params).await?;
      match rows.len() {
         0 => Ok(None),
         1 => Ok(Some(rows.remove(0))),
         n => Err(Error::MultipleRowsReturned(n)),
      }
   }

   /// Open a named savepoint.
   pub async fn savepoint(&mut self, name: &str) -> Result<()> {
      let ident = savepoint_ident(name)?;
      self.execute(&format!("SAVEPOINT {ident}"), vec![]).await?;
      Ok(())
   }

   /// Release (commit) a named savepoint.
   pub async fn release_savepoint(&mut self, name: &str) -> Result<()> {
      let ident = savepoint_ident(name)?;
      self
         .execute(&format!("RELEASE SAVEPOINT {ident}"), vec![])
         .await?;
      Ok(())
   }

   /// Roll back to a named savepoint, discarding everything since it was
   /// opened, then release it so the name can be reused.
   pub async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
      let ident = savepoint_ident(name)?;
      self
         .execute(&format!("ROLLBACK TO SAVEPOINT {ident}"), vec![])
         .await?;
      self
         .execute(&format!("RELEASE SAVEPOINT {ident}"), vec![])
         .await?;
      Ok(())
   }

   /// Commit the transaction.
   pub async fn commit(self) -> Result<()> {
      match self {
         SyncTxn::Sqlite(txn) => txn.commit().await?,
         #[cfg(feature = "postgres")]
         SyncTxn::Postgres(txn) => txn.commit().await?,
      }
      Ok(())
   }

   /// Roll back the transaction. Dropping an uncommitted `SyncTxn` rolls it
   /// back as well; this form surfaces rollback errors.
   pub async fn rollback(self) -> Result<()> {
      match self {
         SyncTxn::Sqlite(txn) => txn.rollback().await?,
         #[cfg(feature = "postgres")]
         SyncTxn::Postgres(txn) => txn.rollback().await?,
      }
      Ok(())
   }
}

fn savepoint_ident(name: &str) -> Result<String> {
   let ident = sanitize_identifier(name);
   if ident.is_empty() {
      return Err(Error::Other(format!("invalid savepoint name: {name:?}")));
   }
   Ok(ident)
}

/// Bind one parameter to a SQLite query.
fn bind_sqlite<'a>(
   query: sqlx::query::Query<'a, Sqlite, sqlx::sqlite::SqliteArguments<'a>>,
   param: SqlParam,
) -> Result<sqlx::query::Query<'a, Sqlite, sqlx::sqlite::SqliteArguments<'a>>> {
   Ok(match param {
      SqlParam::Null => query.bind(None::<String>),
      SqlParam::I64(v) => query.bind(v),
      SqlParam::F64(v) => query.bind(v),
      SqlParam::Bool(v) => query.bind(v),
      SqlParam::Text(v) => query.bind(v),
      SqlParam::Bytes(v) => query.bind(v),
      SqlParam::Json(v) => query.bind(v),
      SqlParam::TextArray(_) => {
         return Err(Error::UnsupportedParameter {
            dialect: "sqlite",
            kind: "text array",
         });
      }
      SqlParam::I64Array(_) => {
         return Err(Error::UnsupportedParameter {
            dialect: "sqlite",
            kind: "integer array",
         });
      }
   })
}

/// Bind one parameter to a Postgres query.
#[cfg(feature = "postgres")]
fn bind_pg<'a>(
   query: sqlx::query::Query<'a, sqlx::Postgres, sqlx::postgres::PgArguments>,
   param: SqlParam,
) -> Result<sqlx::query::Query<'a, sqlx::Postgres, sqlx::postgres::PgArguments>> {
   Ok(match param {
      SqlParam::Null => query.bind(None::<String>),
      SqlParam::I64(v) => query.bind(v),
      SqlParam::F64(v) => query.bind(v),
      SqlParam::Bool(v) => query.bind(v),
      SqlParam::Text(v) => query.bind(v),
      SqlParam::Bytes(v) => query.bind(v),
      SqlParam::Json(v) => query.bind(v),
      SqlParam::TextArray(v) => query.bind(v),
      SqlParam::I64Array(v) => query.bind(v),
   })
}

#[cfg(test)]
mod tests {
   use super::*;
   use serde_json::json;

   #[test]
   fn test_sql_param_from_json() {
      assert_eq!(SqlParam::from(json!(null)), SqlParam::Null);
      assert_eq!(SqlParam::from(json!(true)), SqlParam::Bool(true));
      assert_eq!(SqlParam::from(json!("hi")), SqlParam::Text("hi".into()));
      assert_eq!(SqlParam::from(json!(42)), SqlParam::I64(42));
      assert_eq!(SqlParam::from(json!(1.5)), SqlParam::F64(1.5));
      assert_eq!(
         SqlParam::from(json!({"a": 1})),
         SqlParam::Json(json!({"a": 1}))
      );
      assert_eq!(SqlParam::from(json!([1, 2])), SqlParam::Json(json!([1, 2])));
   }

   #[test]
   fn test_sql_param_preserves_large_integers() {
      let large: i64 = 9_007_199_254_740_992; // 2^53
      assert_eq!(SqlParam::from(json!(large)), SqlParam::I64(large));
   }

   #[test]
   fn test_savepoint_ident_rejects_empty() {
      assert!(savepoint_ident("op 1").is_ok());
      assert!(savepoint_ident("--").is_err());
   }
}
