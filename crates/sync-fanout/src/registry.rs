//! The connection registry and wake protocol.
//!
//! A single process-wide registry maps scope keys and client ids to live
//! connections. All index mutation happens under one mutex; message delivery
//! to individual connections always runs after the lock is released, so a
//! slow or failing send never blocks registration or other deliveries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::FanoutConfig;
use crate::connection::{CLOSE_INTERNAL_ERROR, SyncConnection};
use crate::error::{Error, Result};
use crate::heartbeat::spawn_heartbeat;

/// Opaque id of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl std::fmt::Display for ConnectionId {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      self.0.fmt(f)
   }
}

struct ConnectionEntry {
   conn: Arc<dyn SyncConnection>,
   client_id: String,
   scope_keys: HashSet<String>,
}

#[derive(Default)]
struct Indexes {
   connections: HashMap<ConnectionId, ConnectionEntry>,
   by_scope_key: HashMap<String, HashSet<ConnectionId>>,
   by_client: HashMap<String, HashSet<ConnectionId>>,
   heartbeat_running: bool,
}

impl Indexes {
   fn insert(&mut self, id: ConnectionId, entry: ConnectionEntry) {
      for key in &entry.scope_keys {
         self.by_scope_key.entry(key.clone()).or_default().insert(id);
      }
      self
         .by_client
         .entry(entry.client_id.clone())
         .or_default()
         .insert(id);
      self.connections.insert(id, entry);
   }

   fn remove(&mut self, id: ConnectionId) -> Option<ConnectionEntry> {
      let entry = self.connections.remove(&id)?;
      for key in &entry.scope_keys {
         if let Some(set) = self.by_scope_key.get_mut(key) {
            set.remove(&id);
            if set.is_empty() {
               self.by_scope_key.remove(key);
            }
         }
      }
      if let Some(set) = self.by_client.get_mut(&entry.client_id) {
         set.remove(&id);
         if set.is_empty() {
            self.by_client.remove(&entry.client_id);
         }
      }
      Some(entry)
   }
}

/// Process-wide registry of live connections, indexed by scope key and by
/// client id.
pub struct FanoutRegistry {
   indexes: Mutex<Indexes>,
   config: FanoutConfig,
}

impl FanoutRegistry {
   pub fn new(config: FanoutConfig) -> Arc<Self> {
      Arc::new(Self {
         indexes: Mutex::new(Indexes::default()),
         config,
      })
   }

   pub fn config(&self) -> &FanoutConfig {
      &self.config
   }

   /// Register a connection under the given scope keys.
   ///
   /// Starts the heartbeat timer when this is the first live connection.
   pub fn register(
      self: &Arc<Self>,
      conn: Arc<dyn SyncConnection>,
      scope_keys: impl IntoIterator<Item = String>,
   ) -> ConnectionId {
      let id = ConnectionId(Uuid::new_v4());
      let entry = ConnectionEntry {
         client_id: conn.client_id().to_string(),
         scope_keys: scope_keys.into_iter().collect(),
         conn,
      };
      let mut indexes = self.indexes.lock();
      debug!(
         connection = %id,
         client = %entry.client_id,
         scope_keys = entry.scope_keys.len(),
         "registering connection"
      );
      indexes.insert(id, entry);
      if !indexes.heartbeat_running {
         indexes.heartbeat_running = true;
         spawn_heartbeat(Arc::downgrade(self), self.config.heartbeat_interval);
      }
      id
   }

   /// Remove a connection from both indexes. Returns the connection so the
   /// caller can close the transport if it is still open.
   pub fn unregister(&self, id: ConnectionId) -> Option<Arc<dyn SyncConnection>> {
      let entry = self.indexes.lock().remove(id)?;
      debug!(connection = %id, client = %entry.client_id, "unregistered connection");
      Some(entry.conn)
   }

   /// Replace the scope keys a connection is subscribed under, e.g. after
   /// the client changes its subscriptions.
   pub fn update_client_scope_keys(
      &self,
      id: ConnectionId,
      scope_keys: impl IntoIterator<Item = String>,
   ) -> Result<()> {
      let mut indexes = self.indexes.lock();
      let mut entry = indexes.remove(id).ok_or(Error::UnknownConnection)?;
      entry.scope_keys = scope_keys.into_iter().collect();
      trace!(connection = %id, scope_keys = entry.scope_keys.len(), "updated scope keys");
      indexes.insert(id, entry);
      Ok(())
   }

   /// Wake every connection subscribed to any of the given scope keys with a
   /// single `sync` event carrying the new commit sequence.
   ///
   /// Connections belonging to `exclude_client_ids` (normally the commit's
   /// origin client) are skipped. Delivery is best-effort: a connection that
   /// fails its send is closed with code 1011 and evicted. Returns the
   /// number of successful deliveries.
   pub async fn notify_scope_keys(
      &self,
      scope_keys: &[String],
      cursor: i64,
      exclude_client_ids: &[String],
   ) -> usize {
      let targets: Vec<(ConnectionId, Arc<dyn SyncConnection>)> = {
         let indexes = self.indexes.lock();
         let mut ids: HashSet<ConnectionId> = HashSet::new();
         for key in scope_keys {
            if let Some(set) = indexes.by_scope_key.get(key) {
               ids.extend(set.iter().copied());
            }
         }
         ids.into_iter()
            .filter_map(|id| {
               let entry = indexes.connections.get(&id)?;
               if exclude_client_ids.iter().any(|c| c == &entry.client_id) {
                  return None;
               }
               Some((id, Arc::clone(&entry.conn)))
            })
            .collect()
      };

      let mut delivered = 0;
      for (id, conn) in targets {
         if !conn.is_open() {
            self.unregister(id);
            continue;
         }
         match conn.send_sync(cursor).await {
            Ok(()) => delivered += 1,
            Err(e) => {
               warn!(connection = %id, error = %e, "sync delivery failed, evicting connection");
               conn.close(CLOSE_INTERNAL_ERROR, "send failed").await;
               self.unregister(id);
            }
         }
      }
      trace!(cursor, delivered, "fan-out complete");
      delivered
   }

   /// One heartbeat pass: sweep closed connections, ping the rest. Returns
   /// false when the registry drained and the timer should stop.
   pub(crate) async fn heartbeat_tick(&self) -> bool {
      let targets: Vec<(ConnectionId, Arc<dyn SyncConnection>)> = {
         let indexes = self.indexes.lock();
         indexes
            .connections
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(&entry.conn)))
            .collect()
      };

      for (id, conn) in targets {
         if !conn.is_open() {
            self.unregister(id);
            continue;
         }
         if let Err(e) = conn.send_heartbeat().await {
            warn!(connection = %id, error = %e, "heartbeat failed, evicting connection");
            conn.close(CLOSE_INTERNAL_ERROR, "heartbeat failed").await;
            self.unregister(id);
         }
      }

      let mut indexes = self.indexes.lock();
      if indexes.connections.is_empty() {
         indexes.heartbeat_running = false;
         debug!("heartbeat timer stopping, no connections remain");
         false
      } else {
         true
      }
   }

   /// Number of registered connections.
   pub fn connection_count(&self) -> usize {
      self.indexes.lock().connections.len()
   }

   /// Number of distinct scope keys with at least one subscriber.
   pub fn scope_key_count(&self) -> usize {
      self.indexes.lock().by_scope_key.len()
   }

   /// Connection ids registered for a client.
   pub fn connections_for_client(&self, client_id: &str) -> Vec<ConnectionId> {
      self
         .indexes
         .lock()
         .by_client
         .get(client_id)
         .map(|set| set.iter().copied().collect())
         .unwrap_or_default()
   }
}

impl std::fmt::Debug for FanoutRegistry {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      let indexes = self.indexes.lock();
      f.debug_struct("FanoutRegistry")
         .field("connections", &indexes.connections.len())
         .field("scope_keys", &indexes.by_scope_key.len())
         .finish()
   }
}
