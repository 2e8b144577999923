//! In-process publish/subscribe event bus.
//!
//! Events are delivered synchronously on the emitting task, in this order:
//!
//! 1. subscribers of the exact topic,
//! 2. wildcard (`"*"`) subscribers,
//! 3. external propagation hooks (e.g. a UI gateway fanning events out).
//!
//! Each group is invoked in registration order. A callback that returns an
//! error or panics is logged and skipped; delivery continues with the next
//! callback. Callbacks are never run while the bus lock is held, so a
//! callback may subscribe, unsubscribe or emit re-entrantly.
//!
//! While the bus is paused, emitted events are recorded in history and queued;
//! [`EventBus::resume`] flushes the queue in FIFO order through the normal
//! dispatch path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

/// Topic that matches every event.
pub const WILDCARD: &str = "*";

/// Event payload: a JSON object.
pub type Payload = Map<String, Value>;

/// Error type callbacks may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Subscriber and hook callback.
pub type EventCallback = Arc<dyn Fn(&Event) -> Result<(), BoxError> + Send + Sync>;

/// An emitted event. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    pub source_plugin: Option<String>,
}

impl Event {
    fn new(topic: &str, payload: Value, source_plugin: Option<&str>) -> Self {
        Self {
            topic: topic.to_string(),
            payload: into_payload(payload),
            timestamp: Utc::now(),
            source_plugin: source_plugin.map(str::to_string),
        }
    }
}

/// Objects are used as-is, `null` becomes an empty payload and any other
/// value is wrapped as `{"value": ...}`.
fn into_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// A registered subscriber.
#[derive(Clone)]
pub struct Subscription {
    pub topic: String,
    pub plugin_id: Option<String>,
    pub callback: EventCallback,
}

impl Subscription {
    fn matches(&self, callback: &EventCallback) -> bool {
        Arc::ptr_eq(&self.callback, callback)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("plugin_id", &self.plugin_id)
            .finish_non_exhaustive()
    }
}

/// Event bus configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBusConfig {
    /// Number of events kept in history before the oldest are evicted.
    pub max_history: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { max_history: 1000 }
    }
}

#[derive(Default)]
struct BusState {
    /// Subscribers keyed by topic; wildcard subscribers live under `"*"`.
    subscriptions: HashMap<String, Vec<Subscription>>,
    hooks: Vec<EventCallback>,
    history: VecDeque<Event>,
    paused: bool,
    queued: VecDeque<Event>,
}

/// Topic-based publish/subscribe bus shared by all plugins.
pub struct EventBus {
    config: EventBusConfig,
    state: RwLock<BusState>,
}

impl EventBus {
    /// Create a bus with the default history size.
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    pub fn with_config(config: EventBusConfig) -> Self {
        Self {
            config,
            state: RwLock::new(BusState::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BusState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BusState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `callback` for `topic` (or every topic with [`WILDCARD`]).
    ///
    /// The same callback may be registered several times; each registration
    /// is invoked.
    pub fn subscribe(
        &self,
        topic: &str,
        callback: EventCallback,
        plugin_id: Option<&str>,
    ) -> Subscription {
        let subscription = Subscription {
            topic: topic.to_string(),
            plugin_id: plugin_id.map(str::to_string),
            callback,
        };

        self.write()
            .subscriptions
            .entry(topic.to_string())
            .or_default()
            .push(subscription.clone());

        debug!(topic = %topic, plugin = ?plugin_id, "Subscribed");
        subscription
    }

    /// Remove one registration of `callback` from `topic`.
    ///
    /// Returns whether anything was removed.
    pub fn unsubscribe(&self, topic: &str, callback: &EventCallback) -> bool {
        let mut state = self.write();
        let Some(subscribers) = state.subscriptions.get_mut(topic) else {
            return false;
        };

        match subscribers.iter().position(|s| s.matches(callback)) {
            Some(index) => {
                subscribers.remove(index);
                if subscribers.is_empty() {
                    state.subscriptions.remove(topic);
                }
                true
            }
            None => false,
        }
    }

    /// Remove every subscription owned by `plugin_id`, topic and wildcard alike.
    ///
    /// Returns the number of subscriptions removed.
    pub fn unsubscribe_plugin(&self, plugin_id: &str) -> usize {
        let mut state = self.write();
        let mut removed = 0;

        for subscribers in state.subscriptions.values_mut() {
            let before = subscribers.len();
            subscribers.retain(|s| s.plugin_id.as_deref() != Some(plugin_id));
            removed += before - subscribers.len();
        }
        state.subscriptions.retain(|_, subscribers| !subscribers.is_empty());

        if removed > 0 {
            debug!(plugin = %plugin_id, removed, "Removed plugin subscriptions");
        }
        removed
    }

    /// Publish an event.
    ///
    /// The event is recorded in history, then dispatched (or queued while the
    /// bus is paused). Never fails: subscriber errors are logged and swallowed.
    pub fn emit(&self, topic: &str, payload: Value, source_plugin: Option<&str>) {
        let event = Event::new(topic, payload, source_plugin);

        {
            let mut state = self.write();
            state.history.push_back(event.clone());
            while state.history.len() > self.config.max_history {
                state.history.pop_front();
            }

            if state.paused {
                debug!(topic = %topic, "Bus paused, event queued");
                state.queued.push_back(event);
                return;
            }
        }

        self.dispatch(&event);
    }

    /// Queue all subsequent emits until [`EventBus::resume`].
    pub fn pause(&self) {
        self.write().paused = true;
        debug!("Event bus paused");
    }

    /// Stop queueing and deliver queued events in emission order.
    pub fn resume(&self) {
        let queued: Vec<Event> = {
            let mut state = self.write();
            state.paused = false;
            state.queued.drain(..).collect()
        };

        debug!(count = queued.len(), "Event bus resumed, flushing queue");
        for event in &queued {
            self.dispatch(event);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.read().paused
    }

    /// Number of events waiting for [`EventBus::resume`].
    pub fn queued_len(&self) -> usize {
        self.read().queued.len()
    }

    /// Up to `limit` most recent events, oldest first, optionally filtered by topic.
    pub fn get_history(&self, topic: Option<&str>, limit: usize) -> Vec<Event> {
        let state = self.read();
        let mut events: Vec<Event> = state
            .history
            .iter()
            .rev()
            .filter(|event| topic.map_or(true, |t| event.topic == t))
            .take(limit)
            .cloned()
            .collect();
        events.reverse();
        events
    }

    pub fn clear_history(&self) {
        self.write().history.clear();
    }

    /// Register an external propagation sink, notified after subscribers.
    pub fn add_websocket_hook(&self, hook: EventCallback) {
        self.write().hooks.push(hook);
    }

    /// Remove a previously registered hook. Returns whether it was found.
    pub fn remove_websocket_hook(&self, hook: &EventCallback) -> bool {
        let mut state = self.write();
        match state.hooks.iter().position(|h| Arc::ptr_eq(h, hook)) {
            Some(index) => {
                state.hooks.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of subscribers registered for exactly `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.read()
            .subscriptions
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Drop every subscription and hook. Used on runtime shutdown.
    pub fn clear_subscriptions(&self) {
        let mut state = self.write();
        state.subscriptions.clear();
        state.hooks.clear();
    }

    fn dispatch(&self, event: &Event) {
        // Copy the callback lists so no lock is held while user code runs.
        let (topic_subscribers, wildcard_subscribers, hooks) = {
            let state = self.read();
            let topic_subscribers = if event.topic == WILDCARD {
                Vec::new()
            } else {
                state
                    .subscriptions
                    .get(&event.topic)
                    .cloned()
                    .unwrap_or_default()
            };
            let wildcard_subscribers = state
                .subscriptions
                .get(WILDCARD)
                .cloned()
                .unwrap_or_default();
            (topic_subscribers, wildcard_subscribers, state.hooks.clone())
        };

        for subscription in topic_subscribers.iter().chain(&wildcard_subscribers) {
            invoke_isolated("subscriber", event, &subscription.callback);
        }
        for hook in &hooks {
            invoke_isolated("hook", event, hook);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn invoke_isolated(kind: &str, event: &Event, callback: &EventCallback) {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(topic = %event.topic, "Event {} failed: {}", kind, e);
        }
        Err(_) => {
            warn!(topic = %event.topic, "Event {} panicked", kind);
        }
    }
}

/// Wrap a closure as an [`EventCallback`].
pub fn callback<F>(f: F) -> EventCallback
where
    F: Fn(&Event) -> Result<(), BoxError> + Send + Sync + 'static,
{
    Arc::new(f)
}
