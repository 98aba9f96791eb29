//! Realtime wake fan-out for sync clients.
//!
//! Tracks live connections subscribed to scope keys and wakes them when a
//! scope-matching commit lands. Two delivery shapes are provided:
//!
//! - [`FanoutRegistry`] — per-connection delivery over a transport
//!   implementing [`SyncConnection`] (the WebSocket deployment), with
//!   demand-driven heartbeats and automatic eviction of failed connections.
//! - [`WakeBroadcaster`] — an in-process broadcast channel with the same
//!   payload shape (the service-worker deployment), where consumers filter
//!   their own client id to avoid self-wakes.
//!
//! Registry index mutation is mutually exclusive behind one lock; message
//! delivery never runs under it.

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod error;
mod heartbeat;
pub mod registry;

pub use broadcast::{WAKE_MESSAGE_TYPE, WakeBroadcaster, WakeMessage, WakeStream};
pub use config::FanoutConfig;
pub use connection::{
   CLOSE_INTERNAL_ERROR, ErrorEventData, HeartbeatEventData, ServerEvent, SyncConnection,
   SyncEventData,
};
pub use error::{Error, Result};
pub use registry::{ConnectionId, FanoutRegistry};

/// Current unix time in milliseconds.
pub fn now_unix_ms() -> i64 {
   (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
