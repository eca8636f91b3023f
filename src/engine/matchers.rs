//! Matcher semantics.

use super::{Attributes, EvaluationContext, EvaluationError, Evaluator};
use crate::models::splits::{DataType, Matcher, MatcherType};
use serde_json::Value;
use std::collections::HashSet;

const DAY_MS: i64 = 86_400_000;
const MINUTE_MS: i64 = 60_000;

/// Evaluate one matcher, applying `negate`.
///
/// A matcher whose input is missing or of the wrong type does not match.
pub(crate) fn evaluate<C: EvaluationContext>(
    matcher: &Matcher,
    key: &str,
    attributes: Option<&Attributes>,
    evaluator: &Evaluator<'_, C>,
    depth: usize,
) -> Result<bool, EvaluationError> {
    let key_value = Value::String(key.to_string());
    let input = match matcher.attribute() {
        Some(name) => attributes.and_then(|a| a.get(name)),
        None => Some(&key_value),
    };

    let matched = match input {
        Some(input) => matches(matcher, key, input, attributes, evaluator, depth)?,
        None => false,
    };
    Ok(matched != matcher.negate)
}

fn matches<C: EvaluationContext>(
    matcher: &Matcher,
    key: &str,
    input: &Value,
    attributes: Option<&Attributes>,
    evaluator: &Evaluator<'_, C>,
    depth: usize,
) -> Result<bool, EvaluationError> {
    let whitelist = || {
        matcher
            .whitelist_matcher_data
            .as_ref()
            .map(|d| d.whitelist.as_slice())
            .unwrap_or_default()
    };

    let matched = match matcher.matcher_type {
        MatcherType::AllKeys => true,
        MatcherType::InSegment => match (&matcher.user_defined_segment_matcher_data, input.as_str())
        {
            (Some(data), Some(value)) => evaluator
                .context()
                .segment_contains(&data.segment_name, value)?,
            _ => false,
        },
        MatcherType::Whitelist => input
            .as_str()
            .map(|value| whitelist().iter().any(|w| w == value))
            .unwrap_or(false),
        MatcherType::EqualTo => match (&matcher.unary_numeric_matcher_data, as_i64(input)) {
            (Some(data), Some(value)) => match data.data_type {
                Some(DataType::Datetime) => {
                    truncate(value, DAY_MS) == truncate(data.value, DAY_MS)
                }
                _ => value == data.value,
            },
            _ => false,
        },
        MatcherType::GreaterThanOrEqualTo => {
            match (&matcher.unary_numeric_matcher_data, as_i64(input)) {
                (Some(data), Some(value)) => {
                    let (value, target) = normalize(data.data_type, value, data.value);
                    value >= target
                }
                _ => false,
            }
        }
        MatcherType::LessThanOrEqualTo => {
            match (&matcher.unary_numeric_matcher_data, as_i64(input)) {
                (Some(data), Some(value)) => {
                    let (value, target) = normalize(data.data_type, value, data.value);
                    value <= target
                }
                _ => false,
            }
        }
        MatcherType::Between => match (&matcher.between_matcher_data, as_i64(input)) {
            (Some(data), Some(value)) => {
                let (value, start) = normalize(data.data_type, value, data.start);
                let (_, end) = normalize(data.data_type, 0, data.end);
                start <= value && value <= end
            }
            _ => false,
        },
        MatcherType::EqualToSet => match as_string_set(input) {
            Some(values) => {
                values == whitelist().iter().map(String::as_str).collect::<HashSet<_>>()
            }
            None => false,
        },
        MatcherType::PartOfSet => match as_string_set(input) {
            Some(values) => {
                let allowed: HashSet<&str> = whitelist().iter().map(String::as_str).collect();
                !values.is_empty() && values.is_subset(&allowed)
            }
            None => false,
        },
        MatcherType::ContainsAnyOfSet => match as_string_set(input) {
            Some(values) => whitelist().iter().any(|w| values.contains(w.as_str())),
            None => false,
        },
        MatcherType::ContainsAllOfSet => match as_string_set(input) {
            Some(values) => {
                let required = whitelist();
                !required.is_empty() && required.iter().all(|w| values.contains(w.as_str()))
            }
            None => false,
        },
        MatcherType::StartsWith => input
            .as_str()
            .map(|value| whitelist().iter().any(|w| value.starts_with(w.as_str())))
            .unwrap_or(false),
        MatcherType::EndsWith => input
            .as_str()
            .map(|value| whitelist().iter().any(|w| value.ends_with(w.as_str())))
            .unwrap_or(false),
        MatcherType::ContainsString => input
            .as_str()
            .map(|value| whitelist().iter().any(|w| value.contains(w.as_str())))
            .unwrap_or(false),
        MatcherType::MatchesString => match (&matcher.string_matcher_data, input.as_str()) {
            (Some(pattern), Some(value)) => match regex::Regex::new(pattern) {
                Ok(re) => re.is_match(value),
                Err(e) => {
                    tracing::warn!(pattern, error = %e, "invalid MATCHES_STRING pattern");
                    false
                }
            },
            _ => false,
        },
        MatcherType::EqualToBoolean => match (matcher.boolean_matcher_data, as_bool(input)) {
            (Some(expected), Some(value)) => expected == value,
            _ => false,
        },
        MatcherType::InSplitTreatment => match &matcher.dependency_matcher_data {
            Some(data) => {
                let result = evaluator.evaluate_at_depth(&data.split, key, attributes, depth + 1)?;
                data.treatments.iter().any(|t| *t == result.treatment)
            }
            None => false,
        },
        // Splits containing unsupported matchers are rejected before conditions run.
        MatcherType::Unsupported => false,
    };
    Ok(matched)
}

fn truncate(value: i64, unit: i64) -> i64 {
    value - value.rem_euclid(unit)
}

fn normalize(data_type: Option<DataType>, value: i64, target: i64) -> (i64, i64) {
    match data_type {
        Some(DataType::Datetime) => (truncate(value, MINUTE_MS), truncate(target, MINUTE_MS)),
        _ => (value, target),
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

fn as_string_set(value: &Value) -> Option<HashSet<&str>> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(Value::as_str).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::splits::{
        BetweenMatcherData, KeySelector, SegmentMatcherData, UnaryNumericMatcherData,
        WhitelistMatcherData,
    };
    use crate::models::Split;
    use crate::storage::StorageError;
    use serde_json::json;

    struct Fixture {
        segment: &'static str,
        members: Vec<&'static str>,
    }

    impl EvaluationContext for Fixture {
        fn split(&self, _name: &str) -> Result<Option<Split>, StorageError> {
            Ok(None)
        }

        fn segment_contains(&self, segment: &str, key: &str) -> Result<bool, StorageError> {
            Ok(segment == self.segment && self.members.iter().any(|m| *m == key))
        }
    }

    fn fixture() -> Fixture {
        Fixture {
            segment: "beta",
            members: vec!["user-1"],
        }
    }

    fn on_attribute(mut matcher: Matcher, attribute: &str) -> Matcher {
        matcher.key_selector = Some(KeySelector {
            traffic_type: Some("user".to_string()),
            attribute: Some(attribute.to_string()),
        });
        matcher
    }

    fn with_whitelist(matcher_type: MatcherType, items: &[&str]) -> Matcher {
        let mut matcher = Matcher::of(matcher_type);
        matcher.whitelist_matcher_data = Some(WhitelistMatcherData {
            whitelist: items.iter().map(|s| s.to_string()).collect(),
        });
        matcher
    }

    fn check(matcher: &Matcher, key: &str, attributes: Option<&Attributes>) -> bool {
        let ctx = fixture();
        let evaluator = Evaluator::new(&ctx);
        evaluate(matcher, key, attributes, &evaluator, 0).unwrap()
    }

    fn attrs(value: serde_json::Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_segment_and_whitelist_on_key() {
        let mut segment = Matcher::of(MatcherType::InSegment);
        segment.user_defined_segment_matcher_data = Some(SegmentMatcherData {
            segment_name: "beta".to_string(),
        });
        assert!(check(&segment, "user-1", None));
        assert!(!check(&segment, "user-2", None));

        segment.negate = true;
        assert!(!check(&segment, "user-1", None));

        let whitelist = with_whitelist(MatcherType::Whitelist, &["user-2"]);
        assert!(check(&whitelist, "user-2", None));
        assert!(!check(&whitelist, "user-1", None));
    }

    #[test]
    fn test_missing_attribute_does_not_match() {
        let matcher = on_attribute(with_whitelist(MatcherType::Whitelist, &["pro"]), "plan");
        assert!(!check(&matcher, "user-1", None));
        assert!(check(&matcher, "user-1", Some(&attrs(json!({"plan": "pro"})))));

        let mut negated = matcher.clone();
        negated.negate = true;
        assert!(check(&negated, "user-1", None));
    }

    #[test]
    fn test_numeric_matchers() {
        let mut gte = on_attribute(Matcher::of(MatcherType::GreaterThanOrEqualTo), "age");
        gte.unary_numeric_matcher_data = Some(UnaryNumericMatcherData {
            data_type: Some(DataType::Number),
            value: 18,
        });
        assert!(check(&gte, "k", Some(&attrs(json!({"age": 18})))));
        assert!(!check(&gte, "k", Some(&attrs(json!({"age": 17})))));
        assert!(!check(&gte, "k", Some(&attrs(json!({"age": "18"})))));

        let mut between = on_attribute(Matcher::of(MatcherType::Between), "age");
        between.between_matcher_data = Some(BetweenMatcherData {
            data_type: Some(DataType::Number),
            start: 10,
            end: 20,
        });
        assert!(check(&between, "k", Some(&attrs(json!({"age": 10})))));
        assert!(check(&between, "k", Some(&attrs(json!({"age": 20.7})))));
        assert!(!check(&between, "k", Some(&attrs(json!({"age": 21})))));
    }

    #[test]
    fn test_datetime_equal_to_truncates_to_day() {
        let mut matcher = on_attribute(Matcher::of(MatcherType::EqualTo), "signup");
        matcher.unary_numeric_matcher_data = Some(UnaryNumericMatcherData {
            data_type: Some(DataType::Datetime),
            value: 1_660_262_400_000, // 2022-08-12T00:00:00Z
        });
        assert!(check(
            &matcher,
            "k",
            Some(&attrs(json!({"signup": 1_660_262_400_000i64 + 5 * 3_600_000})))
        ));
        assert!(!check(
            &matcher,
            "k",
            Some(&attrs(json!({"signup": 1_660_262_400_000i64 + 86_400_000})))
        ));
    }

    #[test]
    fn test_set_matchers() {
        let input = attrs(json!({"perms": ["read", "write"]}));

        let perms = |matcher_type, values: &[&str]| {
            on_attribute(with_whitelist(matcher_type, values), "perms")
        };

        let equal = perms(MatcherType::EqualToSet, &["write", "read"]);
        assert!(check(&equal, "k", Some(&input)));

        let part_of = perms(MatcherType::PartOfSet, &["read", "write", "admin"]);
        assert!(check(&part_of, "k", Some(&input)));

        let any = perms(MatcherType::ContainsAnyOfSet, &["admin", "write"]);
        assert!(check(&any, "k", Some(&input)));

        let all = perms(MatcherType::ContainsAllOfSet, &["admin", "write"]);
        assert!(!check(&all, "k", Some(&input)));
    }

    #[test]
    fn test_string_and_boolean_matchers() {
        let input = attrs(json!({"email": "jane@example.com", "beta": "TRUE"}));

        let ends = on_attribute(with_whitelist(MatcherType::EndsWith, &["@example.com"]), "email");
        assert!(check(&ends, "k", Some(&input)));

        let starts = on_attribute(with_whitelist(MatcherType::StartsWith, &["bob"]), "email");
        assert!(!check(&starts, "k", Some(&input)));

        let mut regex = on_attribute(Matcher::of(MatcherType::MatchesString), "email");
        regex.string_matcher_data = Some(r"^[a-z]+@example\.com$".to_string());
        assert!(check(&regex, "k", Some(&input)));

        let mut boolean = on_attribute(Matcher::of(MatcherType::EqualToBoolean), "beta");
        boolean.boolean_matcher_data = Some(true);
        assert!(check(&boolean, "k", Some(&input)));
    }
}
