//! Named metric values recorded by plugins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

use crate::serializable::Serializable;

/// One recorded metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub value: Value,
    pub recorded_at: DateTime<Utc>,
}

/// Per-plugin metric store. Later records under the same name replace
/// earlier ones.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    metrics: RwLock<HashMap<String, BTreeMap<String, MetricValue>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, plugin_id: &str, name: &str, value: &dyn Serializable) {
        let metric = MetricValue {
            value: value.to_value(),
            recorded_at: Utc::now(),
        };
        debug!(plugin = %plugin_id, metric = %name, "Recorded metric");
        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(plugin_id.to_string())
            .or_default()
            .insert(name.to_string(), metric);
    }

    pub fn get(&self, plugin_id: &str, name: &str) -> Option<MetricValue> {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin_id)
            .and_then(|metrics| metrics.get(name))
            .cloned()
    }

    /// `{plugin_id: {name: value}}`, restricted to one plugin when given.
    pub fn snapshot(&self, plugin_id: Option<&str>) -> Value {
        let metrics = self.metrics.read().unwrap_or_else(PoisonError::into_inner);
        let mut plugins: Vec<_> = metrics
            .iter()
            .filter(|(id, _)| plugin_id.map_or(true, |wanted| wanted == id.as_str()))
            .collect();
        plugins.sort_by(|a, b| a.0.cmp(b.0));

        let mut out = Map::new();
        for (id, values) in plugins {
            let values: Map<String, Value> = values
                .iter()
                .map(|(name, metric)| (name.clone(), metric.value.clone()))
                .collect();
            out.insert(id.clone(), Value::Object(values));
        }
        Value::Object(out)
    }

    /// Forget everything recorded for `plugin_id`. Returns how many metrics
    /// were dropped.
    pub fn clear_plugin(&self, plugin_id: &str) -> usize {
        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(plugin_id)
            .map_or(0, |metrics| metrics.len())
    }
}
