//! Plugin-scoped view of the shared event bus.

use kiln_runtime::{Event, EventBus, EventCallback, Subscription};
use serde_json::Value;
use std::sync::Arc;

/// Tags everything a plugin emits or subscribes with its id, so its
/// subscriptions can be dropped in bulk when it unloads.
#[derive(Clone)]
pub struct PluginEventBus {
    plugin_id: String,
    bus: Arc<EventBus>,
}

impl PluginEventBus {
    pub fn new(plugin_id: impl Into<String>, bus: Arc<EventBus>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            bus,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Emit with `source_plugin` set to this plugin.
    pub fn emit(&self, topic: &str, payload: Value) {
        self.bus.emit(topic, payload, Some(&self.plugin_id));
    }

    pub fn subscribe(&self, topic: &str, callback: EventCallback) -> Subscription {
        self.bus.subscribe(topic, callback, Some(&self.plugin_id))
    }

    pub fn unsubscribe(&self, topic: &str, callback: &EventCallback) -> bool {
        self.bus.unsubscribe(topic, callback)
    }

    /// Drop every subscription this plugin holds.
    pub fn unsubscribe_all(&self) -> usize {
        self.bus.unsubscribe_plugin(&self.plugin_id)
    }

    pub fn get_history(&self, topic: Option<&str>, limit: usize) -> Vec<Event> {
        self.bus.get_history(topic, limit)
    }
}
