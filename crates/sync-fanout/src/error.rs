/// Result type alias for fan-out operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for realtime fan-out.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// A send to a connection failed; the connection is closed and evicted.
   #[error("send failed: {0}")]
   SendFailed(String),

   /// The connection is no longer open.
   #[error("connection closed")]
   ConnectionClosed,

   /// The connection id is not registered.
   #[error("unknown connection")]
   UnknownConnection,
}

impl Error {
   /// Machine-readable error code.
   pub fn error_code(&self) -> &'static str {
      match self {
         Error::SendFailed(_) => "SEND_FAILED",
         Error::ConnectionClosed => "CONNECTION_CLOSED",
         Error::UnknownConnection => "UNKNOWN_CONNECTION",
      }
   }
}
