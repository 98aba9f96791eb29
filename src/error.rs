/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the sync engine.
///
/// Only infrastructure failures surface as this type: validation and handler
/// outcomes (conflicts, unknown tables, scope violations) are encoded per
/// operation in the push/pull responses and never thrown. The transport
/// layer maps these errors to 5xx (retriable) or 4xx (not).
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from commit-log storage.
   #[error(transparent)]
   CommitLog(#[from] sync_commit_log::Error),

   /// Error from the realtime fan-out layer.
   #[error(transparent)]
   Fanout(#[from] sync_fanout::Error),

   /// The request envelope is malformed beyond per-op reporting.
   #[error("invalid request: {0}")]
   InvalidRequest(String),

   /// A scope pattern failed to parse at handler construction.
   #[error("invalid scope pattern {pattern:?}: {message}")]
   InvalidScopePattern { pattern: String, message: String },

   /// The requested snapshot chunk does not exist or has expired.
   #[error("snapshot chunk not found: {0}")]
   ChunkNotFound(String),

   /// JSON (de)serialization failure.
   #[error(transparent)]
   Serialization(#[from] serde_json::Error),

   /// Generic error for operations that don't fit other categories.
   #[error("{0}")]
   Other(String),
}

impl Error {
   /// Extract a structured error code from the error type.
   pub fn error_code(&self) -> String {
      match self {
         Error::CommitLog(e) => e.error_code(),
         Error::Fanout(e) => e.error_code().to_string(),
         Error::InvalidRequest(_) => codes::INVALID_REQUEST.to_string(),
         Error::InvalidScopePattern { .. } => "INVALID_SCOPE_PATTERN".to_string(),
         Error::ChunkNotFound(_) => "CHUNK_NOT_FOUND".to_string(),
         Error::Serialization(_) => "SERIALIZATION_ERROR".to_string(),
         Error::Other(_) => "ERROR".to_string(),
      }
   }

   /// Whether the failure is worth retrying at the transport layer.
   pub fn is_retriable(&self) -> bool {
      match self {
         Error::CommitLog(e) => e.is_retriable(),
         _ => false,
      }
   }
}

/// Per-operation failure codes carried in push results.
///
/// These are response data, not Rust errors; clients branch on them to
/// decide between rebasing, dropping the op, or surfacing the failure.
pub mod codes {
   /// Missing required input field or violated invariant.
   pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
   /// Operations list missing or empty.
   pub const EMPTY_COMMIT: &str = "EMPTY_COMMIT";
   /// Operation targets a table with no registered handler.
   pub const UNKNOWN_TABLE: &str = "UNKNOWN_TABLE";
   /// Non-zero base version for a row that does not exist.
   pub const ROW_MISSING: &str = "ROW_MISSING";
   /// Base version mismatch; the result carries `server_version` and
   /// `server_row` so the client can rebase and retry.
   pub const CONFLICT: &str = "CONFLICT";

   /// Code for an upsert that tries to change an immutable scope field,
   /// e.g. `CANNOT_MOVE_BETWEEN_USER_ID`.
   pub fn cannot_move_between(scope_key: &str) -> String {
      let suffix: String = scope_key
         .chars()
         .map(|c| {
            if c.is_ascii_alphanumeric() {
               c.to_ascii_uppercase()
            } else {
               '_'
            }
         })
         .collect();
      format!("CANNOT_MOVE_BETWEEN_{suffix}")
   }

   /// Whether a client may retry an op failing with this code (after
   /// rebasing, for conflicts).
   pub fn is_retriable(code: &str) -> bool {
      code == CONFLICT
   }
}
