//! Adapter registry — channel id → adapter lookups for the delivery path.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::ChannelAdapter;

/// Registered channel adapters, keyed by channel id.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter. A later registration with the same id shadows
    /// the earlier one.
    pub fn register(&self, adapter: Arc<dyn ChannelAdapter>) {
        let id = adapter.id().to_owned();
        let shadowed = self.adapters.write().insert(id.clone(), adapter).is_some();
        if shadowed {
            tracing::warn!(channel = %id, "adapter re-registered, shadowing earlier one");
        } else {
            tracing::info!(channel = %id, "channel adapter registered");
        }
    }

    pub fn get(&self, channel_id: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.read().get(channel_id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.adapters.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.read().is_empty()
    }
}
