/// Result type alias for commit-log operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for commit-log storage operations.
///
/// These are infrastructure errors: anything that reaches a caller as this
/// type is retriable or fatal at the transport layer. Per-operation outcomes
/// (conflicts, unknown tables, validation failures) are response data owned
/// by the engine crate, never raised through here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from SQLx operations.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// A commit with the same `(partition_id, client_id, client_commit_id)`
   /// already exists. Callers treat this as "already applied" and return the
   /// stored result of the prior commit.
   #[error("commit already exists for partition {partition_id}, client {client_id}, client commit {client_commit_id}")]
   IdempotencyViolation {
      partition_id: String,
      client_id: String,
      client_commit_id: String,
   },

   /// Multiple rows returned from a fetch_one query.
   #[error("fetch_one() query returned {0} rows, expected 0 or 1")]
   MultipleRowsReturned(usize),

   /// A parameter kind the active dialect cannot bind (e.g. an array
   /// parameter on the embedded dialect).
   #[error("parameter not supported by the {dialect} dialect: {kind}")]
   UnsupportedParameter { dialect: &'static str, kind: &'static str },

   /// Column value that cannot be mapped to JSON.
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// A persisted value failed to decode into its expected shape.
   #[error("corrupt stored value in {context}: {message}")]
   CorruptValue { context: &'static str, message: String },

   /// Database has been closed and cannot be used.
   #[error("database has been closed")]
   DatabaseClosed,

   /// I/O error when accessing database files.
   #[error("io error: {0}")]
   Io(#[from] std::io::Error),

   /// Generic error for operations that don't fit other categories.
   #[error("{0}")]
   Other(String),
}

impl Error {
   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      match self {
         Error::Sqlx(e) => {
            if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
               return format!("DB_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
         Error::IdempotencyViolation { .. } => "IDEMPOTENCY_VIOLATION".to_string(),
         Error::MultipleRowsReturned(_) => "MULTIPLE_ROWS_RETURNED".to_string(),
         Error::UnsupportedParameter { .. } => "UNSUPPORTED_PARAMETER".to_string(),
         Error::UnsupportedDatatype(_) => "UNSUPPORTED_DATATYPE".to_string(),
         Error::CorruptValue { .. } => "CORRUPT_VALUE".to_string(),
         Error::DatabaseClosed => "DATABASE_CLOSED".to_string(),
         Error::Io(_) => "IO_ERROR".to_string(),
         Error::Other(_) => "ERROR".to_string(),
      }
   }

   /// Whether the failure is worth retrying at the transport layer.
   ///
   /// Infrastructure failures (connection loss, pool exhaustion, I/O) are
   /// retriable; idempotency collisions are handled by the caller; the rest
   /// indicate a bug or a malformed request and are not.
   pub fn is_retriable(&self) -> bool {
      matches!(self, Error::Sqlx(_) | Error::Io(_))
   }

   /// True when the underlying database error is a unique-constraint
   /// violation. Used by the commit appender to map PK/idempotency-index
   /// collisions onto [`Error::IdempotencyViolation`].
   pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
      err.as_database_error()
         .map(|db_err| db_err.is_unique_violation())
         .unwrap_or(false)
   }
}
