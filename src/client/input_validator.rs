//! Checks applied to caller input before it reaches the engine.
//!
//! Client-side validators never fail hard: they log and hand back `None`
//! (or a cleaned-up value) so the client can fall back to control.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::LazyLock;

/// Longest traffic key accepted.
pub const MAX_KEY_LENGTH: usize = 250;

/// Properties beyond this count are accepted with a warning.
pub const MAX_PROPERTIES: usize = 300;

/// Largest accepted property payload, in bytes.
pub const MAX_PROPERTIES_SIZE: usize = 32 * 1024;

#[allow(clippy::expect_used)] // constant pattern
static EVENT_TYPE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][-_.:a-zA-Z0-9]{0,79}$").expect("event type regex is valid")
});

/// Check an API key. Returns the reason it was rejected.
pub fn validate_api_key(api_key: &str) -> Result<(), &'static str> {
    if api_key.is_empty() {
        return Err("you passed an empty api key");
    }
    if api_key.trim() != api_key {
        return Err("api key has leading or trailing whitespace");
    }
    Ok(())
}

/// Check a traffic key. Returns the reason it was rejected.
pub fn validate_traffic_key(key: &str) -> Result<(), &'static str> {
    if key.is_empty() {
        return Err("you passed an empty traffic key, it must be a non-empty string");
    }
    if key.chars().count() > MAX_KEY_LENGTH {
        return Err("traffic key too long, it must be 250 characters or less");
    }
    Ok(())
}

/// Check a feature name, trimming surrounding whitespace.
pub fn validate_feature_name(method: &str, feature: &str) -> Option<String> {
    if feature.is_empty() {
        tracing::error!(method, "you passed an empty feature name");
        return None;
    }
    let trimmed = feature.trim();
    if trimmed.is_empty() {
        tracing::error!(method, "you passed a blank feature name");
        return None;
    }
    if trimmed != feature {
        tracing::warn!(method, feature, "feature name has extra whitespace, trimming");
    }
    Some(trimmed.to_string())
}

/// Check a list of feature names, dropping invalid ones and duplicates.
pub fn validate_feature_names(method: &str, features: &[&str]) -> Vec<String> {
    if features.is_empty() {
        tracing::error!(method, "feature names must be a non-empty list");
        return Vec::new();
    }
    let mut seen = HashSet::new();
    features
        .iter()
        .filter_map(|feature| validate_feature_name(method, feature))
        .filter(|feature| seen.insert(feature.clone()))
        .collect()
}

/// Check a traffic type name, lowercasing it.
pub fn validate_traffic_type(traffic_type: &str) -> Option<String> {
    if traffic_type.is_empty() {
        tracing::error!("track: you passed an empty traffic_type_name");
        return None;
    }
    let lowered = traffic_type.to_lowercase();
    if lowered != traffic_type {
        tracing::warn!(
            traffic_type,
            "track: traffic_type_name should be all lowercase, converting"
        );
    }
    Some(lowered)
}

pub fn validate_event_type(event_type: &str) -> bool {
    if event_type.is_empty() {
        tracing::error!("track: you passed an empty event_type");
        return false;
    }
    if !EVENT_TYPE_REGEX.is_match(event_type) {
        tracing::error!(
            event_type,
            "track: event_type must adhere to the regular expression {}",
            EVENT_TYPE_REGEX.as_str()
        );
        return false;
    }
    true
}

pub fn validate_value(value: Option<f64>) -> bool {
    match value {
        Some(v) if !v.is_finite() => {
            tracing::error!("track: value must be a finite number");
            false
        }
        _ => true,
    }
}

/// Check event properties. Nested values are replaced with null; payloads
/// over [`MAX_PROPERTIES_SIZE`] are rejected.
pub fn validate_properties(
    properties: Option<Map<String, Value>>,
) -> Option<Option<Map<String, Value>>> {
    let Some(properties) = properties else {
        return Some(None);
    };
    if properties.len() > MAX_PROPERTIES {
        tracing::warn!(
            count = properties.len(),
            "track: event has more than {MAX_PROPERTIES} properties, \
             some of them will be trimmed when processed"
        );
    }

    let mut size = 0;
    let mut cleaned = Map::with_capacity(properties.len());
    for (name, value) in properties {
        size += name.len();
        let value = match value {
            Value::String(s) => {
                size += s.len();
                Value::String(s)
            }
            v @ (Value::Null | Value::Bool(_) | Value::Number(_)) => v,
            Value::Array(_) | Value::Object(_) => {
                tracing::warn!(
                    property = %name,
                    "track: property values must be strings, numbers, booleans or null, \
                     replacing with null"
                );
                Value::Null
            }
        };
        if size > MAX_PROPERTIES_SIZE {
            tracing::error!(
                "track: event properties must be less than {MAX_PROPERTIES_SIZE} bytes"
            );
            return None;
        }
        cleaned.insert(name, value);
    }
    Some(Some(cleaned))
}
