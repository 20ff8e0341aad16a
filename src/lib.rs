pub mod actors;
pub mod checks;
pub mod cluster;
pub mod config;
pub mod daemon;
pub mod storage;
pub mod triggers;

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Latest data reported by one monitored host.
///
/// `data` is the flattened form of the agent payload: nested objects are
/// joined with `.` below their top-level path, so
/// `{"/stuff": {"Score": 100}}` becomes `"/stuff.Score" -> 100`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub hostname: String,
    pub updated: DateTime<Utc>,
    pub data: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl HostSnapshot {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            updated: Utc::now(),
            data: BTreeMap::new(),
            tags: HashMap::new(),
        }
    }

    /// Build a snapshot from a nested agent payload.
    pub fn from_nested(hostname: impl Into<String>, payload: &serde_json::Value) -> Self {
        let mut snapshot = Self::new(hostname);
        if let serde_json::Value::Object(paths) = payload {
            for (path, inner) in paths {
                flatten_into(&mut snapshot.data, path, inner);
            }
        }
        snapshot
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Look up a numeric metric by its full path.
    ///
    /// An exact key wins; otherwise a key that is both a prefix and a suffix of
    /// `path` is accepted, matching how agents historically reported keys.
    /// Numeric strings are parsed. Missing or non-numeric values yield `None`.
    pub fn metric(&self, path: &str) -> Option<f64> {
        let value = self.data.get(path).or_else(|| {
            self.data
                .iter()
                .find(|(key, _)| path.starts_with(key.as_str()) && path.ends_with(key.as_str()))
                .map(|(_, value)| value)
        })?;

        match value {
            serde_json::Value::Number(number) => number.as_f64(),
            serde_json::Value::String(text) => text.trim().parse().ok(),
            serde_json::Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

fn flatten_into(out: &mut BTreeMap<String, serde_json::Value>, prefix: &str, value: &serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, inner) in map {
                flatten_into(out, &format!("{prefix}.{key}"), inner);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}
