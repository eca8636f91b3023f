//! Segment definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A named set of keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub name: String,
    pub keys: BTreeSet<String>,
    pub change_number: i64,
}

impl Segment {
    pub fn new<I, S>(name: impl Into<String>, keys: I, change_number: i64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            keys: keys.into_iter().map(Into::into).collect(),
            change_number,
        }
    }
}

/// A `segmentChanges` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentChanges {
    pub name: String,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
    pub since: i64,
    pub till: i64,
}
