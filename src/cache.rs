//! Scope resolution with bounded-TTL caching.
//!
//! The cache is advisory: resolving twice is idempotent, so there is no
//! stampede prevention, and a failed or stale read only costs an extra
//! handler resolve. Any backend must return values only before their
//! expiry, treat a non-positive TTL as a delete, and read missing or
//! expired entries as `None`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use sync_commit_log::ScopeMap;

use crate::error::Result;
use crate::handler::TableHandler;
use crate::protocol::AuthContext;

/// Abstract get/set/delete cache for resolved scope mappings.
#[async_trait]
pub trait ScopeCache: Send + Sync {
   /// The cached mapping, or `None` when missing or expired.
   async fn get(&self, key: &str) -> Option<ScopeMap>;

   /// Store a mapping for `ttl`. A zero TTL is equivalent to a delete.
   async fn set(&self, key: &str, scopes: ScopeMap, ttl: Duration);

   /// Remove an entry.
   async fn delete(&self, key: &str);
}

/// Soft bound after which expired entries are swept opportunistically.
const SWEEP_THRESHOLD: usize = 1024;

/// In-memory scope cache with per-entry expiry.
#[derive(Default)]
pub struct MemoryScopeCache {
   entries: Mutex<HashMap<String, (ScopeMap, Instant)>>,
}

impl MemoryScopeCache {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn len(&self) -> usize {
      self.entries.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.entries.lock().is_empty()
   }
}

#[async_trait]
impl ScopeCache for MemoryScopeCache {
   async fn get(&self, key: &str) -> Option<ScopeMap> {
      let mut entries = self.entries.lock();
      match entries.get(key) {
         Some((scopes, expires_at)) if *expires_at > Instant::now() => Some(scopes.clone()),
         Some(_) => {
            entries.remove(key);
            None
         }
         None => None,
      }
   }

   async fn set(&self, key: &str, scopes: ScopeMap, ttl: Duration) {
      if ttl.is_zero() {
         self.delete(key).await;
         return;
      }
      let mut entries = self.entries.lock();
      if entries.len() >= SWEEP_THRESHOLD {
         let now = Instant::now();
         entries.retain(|_, (_, expires_at)| *expires_at > now);
      }
      entries.insert(key.to_string(), (scopes, Instant::now() + ttl));
   }

   async fn delete(&self, key: &str) {
      self.entries.lock().remove(key);
   }
}

/// Resolves the authorized scope mapping for `(partition, table, actor)`,
/// caching results for a bounded TTL.
#[derive(Clone)]
pub struct ScopeResolver {
   cache: Arc<dyn ScopeCache>,
   ttl: Duration,
}

impl ScopeResolver {
   pub fn new(cache: Arc<dyn ScopeCache>, ttl: Duration) -> Self {
      Self { cache, ttl }
   }

   fn cache_key(partition_id: &str, table: &str, actor_id: &str) -> String {
      format!("{partition_id}\u{1f}{table}\u{1f}{actor_id}")
   }

   /// Resolve via the cache, falling back to the handler.
   pub async fn resolve(
      &self,
      handler: &Arc<dyn TableHandler>,
      auth: &AuthContext,
   ) -> Result<ScopeMap> {
      let key = Self::cache_key(&auth.partition_id, handler.table(), &auth.actor_id);
      if let Some(hit) = self.cache.get(&key).await {
         trace!(table = handler.table(), actor = %auth.actor_id, "scope cache hit");
         return Ok(hit);
      }
      let scopes = handler.resolve_scopes(auth).await?;
      self.cache.set(&key, scopes.clone(), self.ttl).await;
      Ok(scopes)
   }

   /// Drop the cached mapping for one `(partition, table, actor)` triple,
   /// e.g. after a sharing change.
   pub async fn invalidate(&self, partition_id: &str, table: &str, actor_id: &str) {
      self
         .cache
         .delete(&Self::cache_key(partition_id, table, actor_id))
         .await;
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[tokio::test]
   async fn test_memory_cache_expiry() {
      let cache = MemoryScopeCache::new();
      cache
         .set("k", ScopeMap::single("user_id", "u1"), Duration::from_secs(60))
         .await;
      assert_eq!(cache.get("k").await, Some(ScopeMap::single("user_id", "u1")));

      cache
         .set("k", ScopeMap::single("user_id", "u1"), Duration::from_millis(1))
         .await;
      tokio::time::sleep(Duration::from_millis(10)).await;
      assert_eq!(cache.get("k").await, None);
   }

   #[tokio::test]
   async fn test_zero_ttl_is_delete() {
      let cache = MemoryScopeCache::new();
      cache
         .set("k", ScopeMap::single("user_id", "u1"), Duration::from_secs(60))
         .await;
      cache.set("k", ScopeMap::single("user_id", "u2"), Duration::ZERO).await;
      assert_eq!(cache.get("k").await, None);
      assert!(cache.is_empty());
   }

   #[tokio::test]
   async fn test_delete_missing_is_noop() {
      let cache = MemoryScopeCache::new();
      cache.delete("missing").await;
      assert_eq!(cache.get("missing").await, None);
   }
}
