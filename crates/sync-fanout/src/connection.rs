//! The connection contract and server-to-client message shapes.
//!
//! Transport adapters (WebSocket upgrade handlers, test doubles) implement
//! [`SyncConnection`]; the registry only ever talks to this trait. Messages
//! on the wire are JSON `{event, data}` envelopes built from [`ServerEvent`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Close code sent when a connection fails on send.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// A live client connection the registry can deliver to.
///
/// Implementations are expected to be cheap to call into: the registry
/// collects targets under its lock but performs every send *after* releasing
/// it, so a slow connection delays only its own delivery.
#[async_trait]
pub trait SyncConnection: Send + Sync {
   /// The client this connection belongs to.
   fn client_id(&self) -> &str;

   /// Whether the transport is still open. Closed connections are swept on
   /// the next heartbeat tick.
   fn is_open(&self) -> bool;

   /// Deliver a wake event carrying the new commit cursor.
   async fn send_sync(&self, cursor: i64) -> Result<()>;

   /// Deliver a heartbeat.
   async fn send_heartbeat(&self) -> Result<()>;

   /// Deliver an error notice.
   async fn send_error(&self, message: &str) -> Result<()>;

   /// Close the transport. Must be idempotent.
   async fn close(&self, code: u16, reason: &str);
}

/// Server-to-client events as they appear on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ServerEvent {
   Sync(SyncEventData),
   Heartbeat(HeartbeatEventData),
   Error(ErrorEventData),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEventData {
   /// The commit sequence the client should pull up to.
   pub cursor: i64,
   /// Unix milliseconds at emit time.
   pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatEventData {
   pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEventData {
   pub message: String,
}

impl ServerEvent {
   pub fn sync(cursor: i64, timestamp: i64) -> Self {
      ServerEvent::Sync(SyncEventData { cursor, timestamp })
   }

   pub fn heartbeat(timestamp: i64) -> Self {
      ServerEvent::Heartbeat(HeartbeatEventData { timestamp })
   }

   pub fn error(message: impl Into<String>) -> Self {
      ServerEvent::Error(ErrorEventData {
         message: message.into(),
      })
   }
}
