use std::time::Duration;

/// Configuration for the fan-out registry.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
   /// Interval between heartbeats to open connections. The heartbeat timer
   /// only runs while at least one connection is registered.
   ///
   /// Default: 30 seconds.
   pub heartbeat_interval: Duration,

   /// Capacity of the broadcast channel used by the in-process wake
   /// broadcaster. Subscribers that fall more than this many messages
   /// behind receive a lag notice and should re-pull.
   ///
   /// Default: 256.
   pub broadcast_capacity: usize,
}

impl Default for FanoutConfig {
   fn default() -> Self {
      Self {
         heartbeat_interval: Duration::from_secs(30),
         broadcast_capacity: 256,
      }
   }
}

impl FanoutConfig {
   /// Creates a new configuration with default settings.
   pub fn new() -> Self {
      Self::default()
   }

   /// Sets the heartbeat interval.
   pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
      self.heartbeat_interval = interval;
      self
   }

   /// Sets the broadcast channel capacity.
   pub fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
      self.broadcast_capacity = capacity;
      self
   }
}
