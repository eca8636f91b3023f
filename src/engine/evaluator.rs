//! Split evaluation.

use super::hashing::bucket;
use super::{matchers, Attributes, EvaluationContext, EvaluationError, CONTROL};
use crate::models::{label, ConditionType, MatcherType, Partition, Split};

/// Dependency chains (IN_SPLIT_TREATMENT) deeper than this are rejected.
const MAX_DEPENDENCY_DEPTH: usize = 10;

/// Outcome of evaluating one split for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationResult {
    pub treatment: String,
    pub label: String,
    pub change_number: Option<i64>,
    pub config: Option<String>,
}

impl EvaluationResult {
    /// Control treatment with the given label.
    pub fn control(label: &str) -> Self {
        Self {
            treatment: CONTROL.to_string(),
            label: label.to_string(),
            change_number: None,
            config: None,
        }
    }
}

/// Evaluates splits against a context.
pub struct Evaluator<'a, C: EvaluationContext> {
    context: &'a C,
}

impl<'a, C: EvaluationContext> Evaluator<'a, C> {
    pub fn new(context: &'a C) -> Self {
        Self { context }
    }

    pub(crate) fn context(&self) -> &C {
        self.context
    }

    /// Evaluate `feature` for `key`.
    pub fn evaluate(
        &self,
        feature: &str,
        key: &str,
        attributes: Option<&Attributes>,
    ) -> Result<EvaluationResult, EvaluationError> {
        self.evaluate_at_depth(feature, key, attributes, 0)
    }

    pub(crate) fn evaluate_at_depth(
        &self,
        feature: &str,
        key: &str,
        attributes: Option<&Attributes>,
        depth: usize,
    ) -> Result<EvaluationResult, EvaluationError> {
        if depth > MAX_DEPENDENCY_DEPTH {
            return Err(EvaluationError::DependencyTooDeep(MAX_DEPENDENCY_DEPTH));
        }

        let split = match self.context.split(feature)? {
            Some(split) => split,
            None => return Ok(EvaluationResult::control(label::SPLIT_NOT_FOUND)),
        };

        if has_unsupported_matcher(&split) {
            return Ok(EvaluationResult {
                change_number: Some(split.change_number),
                ..EvaluationResult::control(label::UNSUPPORTED_MATCHER)
            });
        }

        let (treatment, label) = self.treatment_for(&split, key, attributes, depth)?;
        let config = split.config_for(&treatment);
        Ok(EvaluationResult {
            treatment,
            label,
            change_number: Some(split.change_number),
            config,
        })
    }

    fn treatment_for(
        &self,
        split: &Split,
        key: &str,
        attributes: Option<&Attributes>,
        depth: usize,
    ) -> Result<(String, String), EvaluationError> {
        if split.killed {
            return Ok((split.default_treatment.clone(), label::KILLED.to_string()));
        }

        let algorithm = split.hash_algorithm();
        let mut in_rollout = false;

        for condition in &split.conditions {
            if !in_rollout && condition.condition_type == ConditionType::Rollout {
                if split.traffic_allocation < 100 {
                    let seed = split.traffic_allocation_seed.unwrap_or(split.seed);
                    if bucket(key, seed, algorithm) > split.traffic_allocation {
                        return Ok((
                            split.default_treatment.clone(),
                            label::NOT_IN_SPLIT.to_string(),
                        ));
                    }
                }
                in_rollout = true;
            }

            let mut all_match = true;
            for matcher in &condition.matcher_group.matchers {
                if !matchers::evaluate(matcher, key, attributes, self, depth)? {
                    all_match = false;
                    break;
                }
            }

            if all_match {
                let treatment =
                    select_partition(&condition.partitions, bucket(key, split.seed, algorithm));
                return Ok((treatment, condition.label.clone()));
            }
        }

        Ok((
            split.default_treatment.clone(),
            label::NO_CONDITION_MATCHED.to_string(),
        ))
    }
}

fn has_unsupported_matcher(split: &Split) -> bool {
    split
        .conditions
        .iter()
        .flat_map(|c| c.matcher_group.matchers.iter())
        .any(|m| m.matcher_type == MatcherType::Unsupported)
}

/// Treatment whose cumulative partition size first covers `bucket`.
fn select_partition(partitions: &[Partition], bucket: u32) -> String {
    // Single 100% partition needs no hashing.
    if let [only] = partitions {
        if only.size == 100 {
            return only.treatment.clone();
        }
    }

    let mut covered = 0;
    for partition in partitions {
        covered += partition.size;
        if bucket <= covered {
            return partition.treatment.clone();
        }
    }
    CONTROL.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::splits::{Matcher, MatcherGroup, WhitelistMatcherData};
    use crate::models::{Condition, Split};
    use crate::storage::StorageError;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Splits(HashMap<String, Split>);

    impl EvaluationContext for Splits {
        fn split(&self, name: &str) -> Result<Option<Split>, StorageError> {
            Ok(self.0.get(name).cloned())
        }

        fn segment_contains(&self, _segment: &str, _key: &str) -> Result<bool, StorageError> {
            Ok(false)
        }
    }

    impl Splits {
        fn with(mut self, split: Split) -> Self {
            self.0.insert(split.name.clone(), split);
            self
        }
    }

    fn rollout(treatments: &[(&str, u32)], label: &str) -> Condition {
        Condition {
            condition_type: ConditionType::Rollout,
            matcher_group: MatcherGroup {
                combiner: Default::default(),
                matchers: vec![Matcher::of(MatcherType::AllKeys)],
            },
            partitions: treatments
                .iter()
                .map(|(t, size)| Partition {
                    treatment: t.to_string(),
                    size: *size,
                })
                .collect(),
            label: label.to_string(),
        }
    }

    fn whitelisted(keys: &[&str], treatment: &str) -> Condition {
        let mut matcher = Matcher::of(MatcherType::Whitelist);
        matcher.whitelist_matcher_data = Some(WhitelistMatcherData {
            whitelist: keys.iter().map(|k| k.to_string()).collect(),
        });
        Condition {
            condition_type: ConditionType::Whitelist,
            matcher_group: MatcherGroup {
                combiner: Default::default(),
                matchers: vec![matcher],
            },
            partitions: vec![Partition {
                treatment: treatment.to_string(),
                size: 100,
            }],
            label: "whitelisted".to_string(),
        }
    }

    #[test]
    fn test_not_found_is_control() {
        let ctx = Splits::default();
        let result = Evaluator::new(&ctx).evaluate("missing", "user-1", None).unwrap();
        assert_eq!(result.treatment, CONTROL);
        assert_eq!(result.label, label::SPLIT_NOT_FOUND);
        assert_eq!(result.change_number, None);
    }

    #[test]
    fn test_killed_serves_default() {
        let mut split = Split::new("flag", "user", "off");
        split.conditions.push(rollout(&[("on", 100)], "default rule"));
        split.local_kill("off", 7);
        let ctx = Splits::default().with(split);

        let result = Evaluator::new(&ctx).evaluate("flag", "user-1", None).unwrap();
        assert_eq!(result.treatment, "off");
        assert_eq!(result.label, label::KILLED);
        assert_eq!(result.change_number, Some(7));
    }

    #[test]
    fn test_whitelist_before_rollout() {
        let mut split = Split::new("flag", "user", "off");
        split.conditions.push(whitelisted(&["user-2"], "on"));
        split.conditions.push(rollout(&[("off", 100)], "default rule"));
        let ctx = Splits::default().with(split);
        let evaluator = Evaluator::new(&ctx);

        assert_eq!(evaluator.evaluate("flag", "user-2", None).unwrap().treatment, "on");
        let other = evaluator.evaluate("flag", "user-1", None).unwrap();
        assert_eq!(other.treatment, "off");
        assert_eq!(other.label, "default rule");
    }

    #[test]
    fn test_zero_allocation_is_not_in_split() {
        let mut split = Split::new("flag", "user", "off");
        split.traffic_allocation = 0;
        split.conditions.push(rollout(&[("on", 100)], "default rule"));
        let ctx = Splits::default().with(split);

        let result = Evaluator::new(&ctx).evaluate("flag", "anyone", None).unwrap();
        assert_eq!(result.treatment, "off");
        assert_eq!(result.label, label::NOT_IN_SPLIT);
    }

    #[test]
    fn test_partitions_split_traffic() {
        let mut split = Split::new("flag", "user", "off");
        split.seed = 1_234;
        split.conditions.push(rollout(&[("on", 50), ("off", 50)], "default rule"));
        let ctx = Splits::default().with(split);
        let evaluator = Evaluator::new(&ctx);

        let on = (0..1000)
            .filter(|i| {
                evaluator
                    .evaluate("flag", &format!("user-{i}"), None)
                    .unwrap()
                    .treatment
                    == "on"
            })
            .count();
        assert!((350..650).contains(&on), "on count {on} far from 50%");
    }

    #[test]
    fn test_no_condition_matched_and_config() {
        let mut split = Split::new("flag", "user", "off");
        split.configurations = Some(HashMap::from([(
            "off".to_string(),
            "{\"size\":1}".to_string(),
        )]));
        split.conditions.push(whitelisted(&["vip"], "on"));
        let ctx = Splits::default().with(split);

        let result = Evaluator::new(&ctx).evaluate("flag", "user-1", None).unwrap();
        assert_eq!(result.treatment, "off");
        assert_eq!(result.label, label::NO_CONDITION_MATCHED);
        assert_eq!(result.config.as_deref(), Some("{\"size\":1}"));
    }

    #[test]
    fn test_unsupported_matcher_is_control() {
        let mut split = Split::new("flag", "user", "off");
        let mut condition = rollout(&[("on", 100)], "default rule");
        condition.matcher_group.matchers = vec![Matcher::of(MatcherType::Unsupported)];
        split.conditions.push(condition);
        let ctx = Splits::default().with(split);

        let result = Evaluator::new(&ctx).evaluate("flag", "user-1", None).unwrap();
        assert_eq!(result.treatment, CONTROL);
        assert_eq!(result.label, label::UNSUPPORTED_MATCHER);
    }

    #[test]
    fn test_dependency_matcher() {
        let mut parent = Split::new("parent", "user", "off");
        parent.conditions.push(whitelisted(&["user-1"], "on"));

        let mut child = Split::new("child", "user", "off");
        let mut matcher = Matcher::of(MatcherType::InSplitTreatment);
        matcher.dependency_matcher_data = Some(crate::models::splits::DependencyMatcherData {
            split: "parent".to_string(),
            treatments: vec!["on".to_string()],
        });
        let mut condition = rollout(&[("v2", 100)], "parent on");
        condition.matcher_group.matchers = vec![matcher];
        child.conditions.push(condition);

        let ctx = Splits::default().with(parent).with(child);
        let evaluator = Evaluator::new(&ctx);
        assert_eq!(evaluator.evaluate("child", "user-1", None).unwrap().treatment, "v2");
        assert_eq!(evaluator.evaluate("child", "user-9", None).unwrap().treatment, "off");
    }

    #[test]
    fn test_dependency_cycle_is_rejected() {
        let mut looping = Split::new("loop", "user", "off");
        let mut matcher = Matcher::of(MatcherType::InSplitTreatment);
        matcher.dependency_matcher_data = Some(crate::models::splits::DependencyMatcherData {
            split: "loop".to_string(),
            treatments: vec!["on".to_string()],
        });
        let mut condition = rollout(&[("on", 100)], "self");
        condition.matcher_group.matchers = vec![matcher];
        looping.conditions.push(condition);
        let ctx = Splits::default().with(looping);

        let err = Evaluator::new(&ctx).evaluate("loop", "user-1", None).unwrap_err();
        assert!(matches!(err, EvaluationError::DependencyTooDeep(_)));
    }
}
