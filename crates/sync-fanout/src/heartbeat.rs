//! Heartbeat timer for registered connections.
//!
//! The timer is demand-driven: it starts when the first connection registers
//! and stops when the registry drains (or the registry itself is dropped —
//! the task only holds a weak reference).

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::registry::FanoutRegistry;

pub(crate) fn spawn_heartbeat(
   registry: Weak<FanoutRegistry>,
   interval: Duration,
) -> JoinHandle<()> {
   tokio::spawn(async move {
      debug!(interval_ms = interval.as_millis() as u64, "heartbeat timer started");
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick completes immediately; consume it so the first
      // heartbeat lands one full interval after registration.
      ticker.tick().await;
      loop {
         ticker.tick().await;
         let Some(registry) = registry.upgrade() else {
            break;
         };
         if !registry.heartbeat_tick().await {
            break;
         }
      }
      debug!("heartbeat timer stopped");
   })
}
