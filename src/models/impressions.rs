//! Impression records produced by evaluations.

use serde::{Deserialize, Serialize};

/// Evaluation labels attached to impressions.
pub mod label {
    pub const KILLED: &str = "killed";
    pub const NO_CONDITION_MATCHED: &str = "default rule";
    pub const SPLIT_NOT_FOUND: &str = "definition not found";
    pub const NOT_IN_SPLIT: &str = "not in split";
    pub const NOT_READY: &str = "not ready";
    pub const EXCEPTION: &str = "exception";
    pub const UNSUPPORTED_MATCHER: &str = "targeting rule type unsupported by sdk";
}

/// A record of one flag evaluation for the bound key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Impression {
    pub matching_key: String,
    pub feature_name: String,
    pub treatment: String,
    pub label: Option<String>,
    pub change_number: Option<i64>,
    pub bucketing_key: Option<String>,
    /// Evaluation time, milliseconds since the epoch
    pub time: i64,
    /// Time an identical impression was last seen, when deduplicating
    pub previous_time: Option<i64>,
}

/// Number of impressions for one feature within one hour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpressionCount {
    #[serde(rename = "f")]
    pub feature: String,
    /// Start of the hour, milliseconds since the epoch
    #[serde(rename = "m")]
    pub timeframe: i64,
    #[serde(rename = "rc")]
    pub count: u64,
}

/// Truncate a millisecond timestamp to the start of its hour.
pub fn truncate_to_hour(time_ms: i64) -> i64 {
    const HOUR_MS: i64 = 3_600_000;
    time_ms - time_ms.rem_euclid(HOUR_MS)
}
