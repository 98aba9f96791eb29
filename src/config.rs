//! Engine configuration.

use std::time::Duration;

use sync_fanout::FanoutConfig;

use crate::chunk::ChunkerConfig;
use crate::pull::PullSettings;

/// Background maintenance settings.
#[derive(Debug, Clone)]
pub struct MaintenanceSettings {
   /// Master switch; when off, pushes never trigger maintenance.
   pub enabled: bool,
   /// Minimum interval between compaction passes per database.
   pub compact_min_interval_ms: i64,
   /// Change history younger than this many hours is never compacted.
   pub compact_full_history_hours: i64,
   /// Minimum interval between prune passes per database.
   pub prune_min_interval_ms: i64,
   /// Commits always retained per partition, newest first.
   pub prune_keep_newest_commits: i64,
   /// Commits younger than this are never pruned even beyond the keep
   /// count.
   pub prune_fallback_max_age_ms: i64,
}

impl Default for MaintenanceSettings {
   fn default() -> Self {
      Self {
         enabled: true,
         compact_min_interval_ms: 60_000,
         compact_full_history_hours: 24,
         prune_min_interval_ms: 300_000,
         prune_keep_newest_commits: 10_000,
         prune_fallback_max_age_ms: 30 * 24 * 3_600_000,
      }
   }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
   /// Request header carrying the partition id.
   pub partition_header: String,
   /// Pull pipeline limits.
   pub pull: PullSettings,
   /// Snapshot chunker settings.
   pub chunker: ChunkerConfig,
   /// TTL of cached scope resolutions.
   pub scope_cache_ttl: Duration,
   /// Background maintenance.
   pub maintenance: MaintenanceSettings,
   /// Realtime fan-out settings.
   pub fanout: FanoutConfig,
}

impl Default for SyncEngineConfig {
   fn default() -> Self {
      Self {
         partition_header: "x-demo-id".to_string(),
         pull: PullSettings::default(),
         chunker: ChunkerConfig::default(),
         scope_cache_ttl: Duration::from_secs(30),
         maintenance: MaintenanceSettings::default(),
         fanout: FanoutConfig::default(),
      }
   }
}

impl SyncEngineConfig {
   pub fn new() -> Self {
      Self::default()
   }

   /// Sets the partition header name.
   pub fn with_partition_header(mut self, header: impl Into<String>) -> Self {
      self.partition_header = header.into();
      self
   }

   /// Sets the pull limits.
   pub fn with_pull(mut self, pull: PullSettings) -> Self {
      self.pull = pull;
      self
   }

   /// Sets the chunker configuration.
   pub fn with_chunker(mut self, chunker: ChunkerConfig) -> Self {
      self.chunker = chunker;
      self
   }

   /// Sets the scope-cache TTL.
   pub fn with_scope_cache_ttl(mut self, ttl: Duration) -> Self {
      self.scope_cache_ttl = ttl;
      self
   }

   /// Sets the maintenance settings.
   pub fn with_maintenance(mut self, maintenance: MaintenanceSettings) -> Self {
      self.maintenance = maintenance;
      self
   }

   /// Sets the fan-out configuration.
   pub fn with_fanout(mut self, fanout: FanoutConfig) -> Self {
      self.fanout = fanout;
      self
   }
}
