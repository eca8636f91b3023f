//! Tracked events.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fixed overhead charged to every event when sizing the queue.
pub const EVENT_BASE_SIZE: usize = 1024;

/// A custom event reported through `track`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub key: String,
    pub traffic_type_name: String,
    pub event_type_id: String,
    pub value: Option<f64>,
    /// Milliseconds since the epoch
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
}

impl Event {
    /// Approximate in-memory size used for queue accounting.
    pub fn size(&self) -> usize {
        let properties = self.properties.as_ref().map_or(0, |props| {
            props
                .iter()
                .map(|(k, v)| {
                    k.len()
                        + match v {
                            Value::String(s) => s.len(),
                            _ => 8,
                        }
                })
                .sum()
        });
        EVENT_BASE_SIZE + properties
    }
}
