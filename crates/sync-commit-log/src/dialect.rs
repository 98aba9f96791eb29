//! Dialect family abstraction for the commit log.
//!
//! Two families are supported: the embedded dialect (SQLite) and the
//! row-store-with-JSON dialect (Postgres). Both use `$N` placeholders and the
//! same logical schema; they differ in DDL type names, JSON extraction
//! syntax, set-membership encoding, and capability flags. Handlers and the
//! pull/push pipelines only ever see the fragment builders below — the
//! dialect never leaks into them as an enum match.

/// The dialect family a [`SyncDb`](crate::SyncDb) speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncDialect {
   /// Embedded SQL family: JSON stored as TEXT, `json_extract` lookups,
   /// comma-joined IN-lists, B-tree indexes only.
   Sqlite,
   /// Row-store family: JSONB columns, `->>` lookups, array parameters with
   /// `= ANY`, GIN index on change scopes.
   Postgres,
}

impl SyncDialect {
   /// Short name used in logs and error messages.
   pub fn name(self) -> &'static str {
      match self {
         SyncDialect::Sqlite => "sqlite",
         SyncDialect::Postgres => "postgres",
      }
   }

   /// Whether `SAVEPOINT` / `ROLLBACK TO SAVEPOINT` are available inside a
   /// write transaction. Both shipped families support them; the push
   /// applier degrades to probe-then-abort semantics when this is false.
   pub fn supports_savepoints(self) -> bool {
      true
   }

   /// Whether `SELECT ... FOR UPDATE` row locking is available.
   pub fn supports_for_update(self) -> bool {
      matches!(self, SyncDialect::Postgres)
   }

   /// Whether `INSERT ... RETURNING` is available. Required for the batched
   /// operation-apply path.
   pub fn supports_insert_returning(self) -> bool {
      true
   }

   /// Whether transaction-scoped advisory locks are available. Used to
   /// serialize commit-sequence allocation and concurrent DDL.
   pub fn supports_advisory_locks(self) -> bool {
      matches!(self, SyncDialect::Postgres)
   }

   /// Whether array parameters (`= ANY($n)`) are available. When false,
   /// set-membership filters expand to comma-joined placeholder lists.
   pub fn supports_array_params(self) -> bool {
      matches!(self, SyncDialect::Postgres)
   }

   /// SQL expression extracting a scope value from the JSON `scopes` column
   /// of the given (already table-qualified) column expression.
   ///
   /// The scope key is interpolated into SQL, so it is sanitized to
   /// `[A-Za-z0-9_]` first; values are always bound parameters.
   pub fn json_scope_expr(self, column: &str, scope_key: &str) -> String {
      let key = sanitize_identifier(scope_key);
      match self {
         SyncDialect::Sqlite => format!("json_extract({column}, '$.\"{key}\"')"),
         SyncDialect::Postgres => format!("{column}->>'{key}'"),
      }
   }

   /// Comma-joined placeholder list `$start, $start+1, ...` of `count`
   /// entries. `count` must be non-zero.
   pub fn placeholder_list(self, start: usize, count: usize) -> String {
      (start..start + count)
         .map(|i| format!("${i}"))
         .collect::<Vec<_>>()
         .join(", ")
   }

   /// Fragment for "insert, ignoring a pre-existing row with the same key".
   /// Appended after the VALUES clause of a full INSERT statement.
   pub fn insert_ignore_clause(self) -> &'static str {
      match self {
         SyncDialect::Sqlite => "",
         SyncDialect::Postgres => " ON CONFLICT DO NOTHING",
      }
   }

   /// INSERT verb honoring [`insert_ignore_clause`](Self::insert_ignore_clause):
   /// SQLite spells the ignore up front, Postgres as a conflict clause.
   pub fn insert_ignore_verb(self) -> &'static str {
      match self {
         SyncDialect::Sqlite => "INSERT OR IGNORE INTO",
         SyncDialect::Postgres => "INSERT INTO",
      }
   }
}

/// Strip a scope key or savepoint name down to `[A-Za-z0-9_]`.
///
/// Scope keys come from handler declarations and are trusted in principle,
/// but they are interpolated into SQL text, so anything else is dropped.
pub fn sanitize_identifier(raw: &str) -> String {
   raw.chars()
      .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
      .collect()
}
