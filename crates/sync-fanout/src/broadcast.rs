//! In-process wake broadcasting, the service-worker deployment variant.
//!
//! Where the WebSocket registry delivers to individual connections, this
//! channel broadcasts one [`WakeMessage`] per committed push to every
//! subscriber. Consumers filter out messages carrying their own client id so
//! a client never wakes itself for a commit it just pushed.

use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use crate::now_unix_ms;

/// The `type` discriminator of wake messages.
pub const WAKE_MESSAGE_TYPE: &str = "sync-wake";

/// Broadcast payload waking subscribed clients after a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeMessage {
   #[serde(rename = "type")]
   pub kind: String,
   pub timestamp: i64,
   /// The new commit sequence; clients pull up to this cursor.
   pub cursor: i64,
   /// The client whose push produced the commit; that client skips the wake.
   pub source_client_id: Option<String>,
}

/// Broadcast sender for wake messages.
#[derive(Debug, Clone)]
pub struct WakeBroadcaster {
   tx: broadcast::Sender<WakeMessage>,
}

impl WakeBroadcaster {
   pub fn new(capacity: usize) -> Self {
      let (tx, _) = broadcast::channel(capacity);
      Self { tx }
   }

   /// Publish a wake for the given commit sequence. Returns the number of
   /// active subscribers the message was queued for.
   pub fn publish(&self, cursor: i64, source_client_id: Option<&str>) -> usize {
      let message = WakeMessage {
         kind: WAKE_MESSAGE_TYPE.to_string(),
         timestamp: now_unix_ms(),
         cursor,
         source_client_id: source_client_id.map(str::to_string),
      };
      self.tx.send(message).unwrap_or(0)
   }

   /// Subscribe to raw wake messages, including self-wakes.
   pub fn subscribe(&self) -> broadcast::Receiver<WakeMessage> {
      self.tx.subscribe()
   }

   /// Subscribe as a stream. When `own_client_id` is given, wakes sourced
   /// from that client are filtered out.
   pub fn subscribe_stream(&self, own_client_id: Option<String>) -> WakeStream {
      WakeStream {
         inner: BroadcastStream::new(self.tx.subscribe()),
         own_client_id,
      }
   }
}

/// A filtered stream of wake messages.
pub struct WakeStream {
   inner: BroadcastStream<WakeMessage>,
   own_client_id: Option<String>,
}

impl Stream for WakeStream {
   type Item = WakeMessage;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      loop {
         let inner = Pin::new(&mut self.inner);
         match inner.poll_next(cx) {
            Poll::Ready(Some(Ok(message))) => {
               if let (Some(own), Some(source)) =
                  (self.own_client_id.as_deref(), message.source_client_id.as_deref())
                  && own == source
               {
                  continue;
               }
               return Poll::Ready(Some(message));
            }
            Poll::Ready(Some(Err(err))) => {
               // Lagged: missed wakes. The client should pull regardless on
               // its next cycle, so just note it and keep going.
               warn!(error = %err, "wake stream lagged, missed notifications");
               continue;
            }
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => return Poll::Pending,
         }
      }
   }
}
