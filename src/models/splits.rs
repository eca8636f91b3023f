//! Split (feature flag) definitions.
//!
//! These types mirror the backend's `splitChanges` JSON document so that a
//! document exported from the control plane can be stored and evaluated
//! without translation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Lifecycle status of a split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Active,
    Archived,
}

/// Hash function used to bucket keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Legacy,
    Murmur,
}

/// A feature flag definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Split {
    pub name: String,
    pub traffic_type_name: String,
    #[serde(default = "full_allocation")]
    pub traffic_allocation: u32,
    #[serde(default)]
    pub traffic_allocation_seed: Option<i32>,
    pub seed: i32,
    pub status: Status,
    #[serde(default)]
    pub killed: bool,
    pub default_treatment: String,
    #[serde(default)]
    pub change_number: i64,
    #[serde(default)]
    pub algo: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configurations: Option<HashMap<String, String>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

fn full_allocation() -> u32 {
    100
}

impl Split {
    /// Minimal active split with no conditions.
    pub fn new(
        name: impl Into<String>,
        traffic_type_name: impl Into<String>,
        default_treatment: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            traffic_type_name: traffic_type_name.into(),
            traffic_allocation: 100,
            traffic_allocation_seed: None,
            seed: 0,
            status: Status::Active,
            killed: false,
            default_treatment: default_treatment.into(),
            change_number: 0,
            algo: Some(2),
            configurations: None,
            conditions: Vec::new(),
        }
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        match self.algo {
            Some(2) => HashAlgorithm::Murmur,
            _ => HashAlgorithm::Legacy,
        }
    }

    /// Names of all segments referenced by this split's matchers.
    pub fn segment_names(&self) -> BTreeSet<String> {
        self.conditions
            .iter()
            .flat_map(|c| c.matcher_group.matchers.iter())
            .filter_map(|m| m.user_defined_segment_matcher_data.as_ref())
            .map(|d| d.segment_name.clone())
            .collect()
    }

    /// Configuration attached to a treatment, if any.
    pub fn config_for(&self, treatment: &str) -> Option<String> {
        self.configurations
            .as_ref()
            .and_then(|c| c.get(treatment))
            .cloned()
    }

    /// Kill the split locally, serving `default_treatment` from now on.
    pub fn local_kill(&mut self, default_treatment: impl Into<String>, change_number: i64) {
        self.killed = true;
        self.default_treatment = default_treatment.into();
        self.change_number = change_number;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionType {
    Rollout,
    Whitelist,
}

impl Default for ConditionType {
    fn default() -> Self {
        ConditionType::Whitelist
    }
}

/// A targeting rule: when every matcher matches, the partitions decide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default)]
    pub condition_type: ConditionType,
    pub matcher_group: MatcherGroup,
    pub partitions: Vec<Partition>,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Combiner {
    And,
}

impl Default for Combiner {
    fn default() -> Self {
        Combiner::And
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatcherGroup {
    #[serde(default)]
    pub combiner: Combiner,
    pub matchers: Vec<Matcher>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub treatment: String,
    pub size: u32,
}

/// Matcher kinds understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatcherType {
    AllKeys,
    InSegment,
    Whitelist,
    EqualTo,
    GreaterThanOrEqualTo,
    LessThanOrEqualTo,
    Between,
    EqualToSet,
    PartOfSet,
    ContainsAnyOfSet,
    ContainsAllOfSet,
    StartsWith,
    EndsWith,
    ContainsString,
    MatchesString,
    EqualToBoolean,
    InSplitTreatment,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Number,
    Datetime,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySelector {
    #[serde(default)]
    pub traffic_type: Option<String>,
    #[serde(default)]
    pub attribute: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMatcherData {
    pub segment_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistMatcherData {
    pub whitelist: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnaryNumericMatcherData {
    #[serde(default)]
    pub data_type: Option<DataType>,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetweenMatcherData {
    #[serde(default)]
    pub data_type: Option<DataType>,
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyMatcherData {
    pub split: String,
    pub treatments: Vec<String>,
}

/// A single matcher as it appears in the definition document.
///
/// Only the `*Data` field that corresponds to `matcher_type` is read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Matcher {
    pub matcher_type: MatcherType,
    #[serde(default)]
    pub negate: bool,
    #[serde(default)]
    pub key_selector: Option<KeySelector>,
    #[serde(default)]
    pub user_defined_segment_matcher_data: Option<SegmentMatcherData>,
    #[serde(default)]
    pub whitelist_matcher_data: Option<WhitelistMatcherData>,
    #[serde(default)]
    pub unary_numeric_matcher_data: Option<UnaryNumericMatcherData>,
    #[serde(default)]
    pub between_matcher_data: Option<BetweenMatcherData>,
    #[serde(default)]
    pub boolean_matcher_data: Option<bool>,
    #[serde(default)]
    pub dependency_matcher_data: Option<DependencyMatcherData>,
    #[serde(default)]
    pub string_matcher_data: Option<String>,
}

impl Matcher {
    /// Matcher of the given type with every data field empty.
    pub fn of(matcher_type: MatcherType) -> Self {
        Self {
            matcher_type,
            negate: false,
            key_selector: None,
            user_defined_segment_matcher_data: None,
            whitelist_matcher_data: None,
            unary_numeric_matcher_data: None,
            between_matcher_data: None,
            boolean_matcher_data: None,
            dependency_matcher_data: None,
            string_matcher_data: None,
        }
    }

    /// Attribute this matcher reads, or `None` when it matches on the key.
    pub fn attribute(&self) -> Option<&str> {
        self.key_selector
            .as_ref()
            .and_then(|s| s.attribute.as_deref())
    }
}

/// A `splitChanges` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitChanges {
    pub splits: Vec<Split>,
    pub since: i64,
    pub till: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPLIT_JSON: &str = r#"{
        "trafficTypeName": "user",
        "name": "new_checkout",
        "trafficAllocation": 100,
        "trafficAllocationSeed": -1364119282,
        "seed": -605938843,
        "status": "ACTIVE",
        "killed": false,
        "defaultTreatment": "off",
        "changeNumber": 1660326991072,
        "algo": 2,
        "configurations": {"on": "{\"color\":\"blue\"}"},
        "conditions": [
            {
                "conditionType": "ROLLOUT",
                "matcherGroup": {
                    "combiner": "AND",
                    "matchers": [
                        {
                            "keySelector": {"trafficType": "user", "attribute": null},
                            "matcherType": "IN_SEGMENT",
                            "negate": false,
                            "userDefinedSegmentMatcherData": {"segmentName": "beta_users"}
                        },
                        {
                            "keySelector": {"trafficType": "user", "attribute": "plan"},
                            "matcherType": "IN_LARGE_SEGMENT",
                            "negate": true
                        }
                    ]
                },
                "partitions": [
                    {"treatment": "on", "size": 50},
                    {"treatment": "off", "size": 50}
                ],
                "label": "in segment beta_users"
            }
        ]
    }"#;

    #[test]
    fn test_parse_backend_document() {
        let split: Split = serde_json::from_str(SPLIT_JSON).unwrap();
        assert_eq!(split.name, "new_checkout");
        assert_eq!(split.status, Status::Active);
        assert_eq!(split.hash_algorithm(), HashAlgorithm::Murmur);
        assert_eq!(split.conditions.len(), 1);

        let condition = &split.conditions[0];
        assert_eq!(condition.condition_type, ConditionType::Rollout);
        assert_eq!(
            condition.matcher_group.matchers[0].matcher_type,
            MatcherType::InSegment
        );
        // Matcher kinds this engine doesn't know still parse.
        assert_eq!(
            condition.matcher_group.matchers[1].matcher_type,
            MatcherType::Unsupported
        );
        assert_eq!(condition.matcher_group.matchers[1].attribute(), Some("plan"));
    }

    #[test]
    fn test_segment_names_and_config() {
        let split: Split = serde_json::from_str(SPLIT_JSON).unwrap();
        let names: Vec<_> = split.segment_names().into_iter().collect();
        assert_eq!(names, vec!["beta_users".to_string()]);
        assert_eq!(split.config_for("on").as_deref(), Some("{\"color\":\"blue\"}"));
        assert_eq!(split.config_for("off"), None);
    }

    #[test]
    fn test_local_kill() {
        let mut split = Split::new("flag", "user", "off");
        split.local_kill("safe", 42);
        assert!(split.killed);
        assert_eq!(split.default_treatment, "safe");
        assert_eq!(split.change_number, 42);
    }

    #[test]
    fn test_missing_algo_is_legacy() {
        let mut split = Split::new("flag", "user", "off");
        split.algo = None;
        assert_eq!(split.hash_algorithm(), HashAlgorithm::Legacy);
    }
}
