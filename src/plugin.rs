//! Push-pipeline plugin hooks.
//!
//! Plugins observe and rewrite operations as they flow through the push
//! applier. The before-hook chain runs in ascending priority order, so a
//! later plugin sees the rewrites of earlier ones; the after-hook runs for
//! applied operations only, with the changes the handler emitted. A hook
//! returning an error aborts the whole request as an infrastructure
//! failure — logical rejections belong to handlers, not plugins.

use std::sync::Arc;

use async_trait::async_trait;

use sync_commit_log::EmittedChange;

use crate::error::Result;
use crate::protocol::{AuthContext, Operation};

/// A push-pipeline plugin.
#[async_trait]
pub trait SyncPlugin: Send + Sync {
   /// Stable name for logs.
   fn name(&self) -> &str;

   /// Chain position; lower runs first. Defaults to 0.
   fn priority(&self) -> i32 {
      0
   }

   /// Called before the handler applies the operation. May rewrite the op
   /// in place (e.g. decrypt a payload field, stamp server-side defaults).
   async fn before_apply_operation(&self, _auth: &AuthContext, _op: &mut Operation) -> Result<()> {
      Ok(())
   }

   /// Called after the handler applied the operation, with the emitted
   /// changes.
   async fn after_apply_operation(
      &self,
      _auth: &AuthContext,
      _op: &Operation,
      _emitted: &[EmittedChange],
   ) -> Result<()> {
      Ok(())
   }
}

/// An ordered set of plugins, sorted by priority once at construction.
#[derive(Default, Clone)]
pub struct PluginSet {
   plugins: Vec<Arc<dyn SyncPlugin>>,
}

impl PluginSet {
   pub fn new(mut plugins: Vec<Arc<dyn SyncPlugin>>) -> Self {
      plugins.sort_by_key(|p| p.priority());
      Self { plugins }
   }

   pub fn is_empty(&self) -> bool {
      self.plugins.is_empty()
   }

   pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SyncPlugin>> {
      self.plugins.iter()
   }
}

impl std::fmt::Debug for PluginSet {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_list()
         .entries(self.plugins.iter().map(|p| p.name()))
         .finish()
   }
}
