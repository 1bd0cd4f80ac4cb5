use std::collections::BTreeMap;

use serde_json::{Value, json};

/// Per-service counters and recorded value series, snapshotted into the
/// `statistics` reply.
#[derive(Clone, Debug, Default)]
pub struct ServiceStatistics {
    name: String,
    counters: BTreeMap<String, i64>,
    series: BTreeMap<String, Vec<f64>>,
}

impl ServiceStatistics {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn record_counter(&mut self, key: &str, count: i64) {
        *self.counters.entry(key.to_string()).or_default() += count;
    }

    pub fn record_value(&mut self, key: &str, value: f64) {
        self.series.entry(key.to_string()).or_default().push(value);
    }

    pub fn to_json(&self) -> Value {
        let mut object = serde_json::Map::new();
        object.insert("name".into(), json!(self.name));
        for (key, count) in &self.counters {
            object.insert(key.clone(), json!(count));
        }
        for (key, values) in &self.series {
            object.insert(key.clone(), summarize(values));
        }
        Value::Object(object)
    }
}

/// Summary of a value series: count, min, max, mean, total.
pub fn summarize(values: &[f64]) -> Value {
    if values.is_empty() {
        return json!({"count": 0});
    }
    let total: f64 = values.iter().sum();
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    json!({
        "count": values.len(),
        "min": min,
        "max": max,
        "mean": total / values.len() as f64,
        "total": total,
    })
}
