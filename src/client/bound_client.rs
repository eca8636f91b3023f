//! Flag evaluation for the bound traffic key.

use crate::client::factory::FactoryCore;
use crate::client::input_validator;
use crate::engine::{Attributes, EvaluationContext, EvaluationResult, Evaluator, CONTROL};
use crate::models::{label, Event, Impression, Split};
use crate::storage::StorageError;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Treatment and optional configuration for one flag.
pub type TreatmentWithConfig = (String, Option<String>);

/// Reads definitions and segment membership from the factory's store.
struct StoreContext<'a> {
    core: &'a FactoryCore,
}

impl EvaluationContext for StoreContext<'_> {
    fn split(&self, name: &str) -> Result<Option<Split>, StorageError> {
        self.core.splits.get(name)
    }

    fn segment_contains(&self, segment: &str, key: &str) -> Result<bool, StorageError> {
        if self.core.my_segments.segment_contains(segment, key)? {
            return Ok(true);
        }
        self.core.segments.segment_contains(segment, key)
    }
}

/// Client bound to the factory's traffic key.
///
/// No method takes a key: every evaluation and every tracked event is for
/// the key the factory was built with. Methods never panic or return errors;
/// problems are logged and answered with `"control"` (or `false` for
/// [`track`](Self::track)).
#[derive(Clone)]
pub struct BoundClient {
    core: Arc<FactoryCore>,
}

impl std::fmt::Debug for BoundClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundClient")
            .field("traffic_key", &self.core.traffic_key)
            .finish_non_exhaustive()
    }
}

impl BoundClient {
    pub(crate) fn new(core: Arc<FactoryCore>) -> Self {
        Self { core }
    }

    pub fn traffic_key(&self) -> &str {
        &self.core.traffic_key
    }

    /// Treatment for `feature`.
    pub fn get_treatment(&self, feature: &str, attributes: Option<&Attributes>) -> String {
        self.make_evaluation("get_treatment", "sdk.getTreatment", feature, attributes)
            .0
    }

    /// Treatment for `feature` and the configuration attached to it.
    pub fn get_treatment_with_config(
        &self,
        feature: &str,
        attributes: Option<&Attributes>,
    ) -> TreatmentWithConfig {
        self.make_evaluation(
            "get_treatment_with_config",
            "sdk.getTreatmentWithConfig",
            feature,
            attributes,
        )
    }

    /// Treatments for several features.
    pub fn get_treatments(
        &self,
        features: &[&str],
        attributes: Option<&Attributes>,
    ) -> HashMap<String, String> {
        self.make_evaluations("get_treatments", "sdk.getTreatments", features, attributes)
            .into_iter()
            .map(|(feature, (treatment, _))| (feature, treatment))
            .collect()
    }

    pub fn get_treatments_with_config(
        &self,
        features: &[&str],
        attributes: Option<&Attributes>,
    ) -> HashMap<String, TreatmentWithConfig> {
        self.make_evaluations(
            "get_treatments_with_config",
            "sdk.getTreatmentsWithConfig",
            features,
            attributes,
        )
    }

    /// Queue an event for the bound key. Returns whether it was queued.
    pub fn track(
        &self,
        traffic_type: &str,
        event_type: &str,
        value: Option<f64>,
        properties: Option<Map<String, Value>>,
    ) -> bool {
        if self.core.is_destroyed() {
            tracing::error!("client has already been destroyed - no calls possible");
            return false;
        }
        let Some(traffic_type) = input_validator::validate_traffic_type(traffic_type) else {
            return false;
        };
        if !input_validator::validate_event_type(event_type)
            || !input_validator::validate_value(value)
        {
            return false;
        }
        let Some(properties) = input_validator::validate_properties(properties) else {
            return false;
        };

        if self.core.is_ready() {
            match self.core.splits.is_valid_traffic_type(&traffic_type) {
                Ok(true) => {}
                Ok(false) => tracing::warn!(
                    traffic_type = %traffic_type,
                    "track: traffic type does not have any corresponding feature flags in this \
                     environment, make sure you're tracking your events to a valid traffic type"
                ),
                Err(e) => tracing::error!(error = %e, "track: failed to check traffic type"),
            }
        }

        let event = Event {
            key: self.core.traffic_key.clone(),
            traffic_type_name: traffic_type,
            event_type_id: event_type.to_string(),
            value,
            timestamp: Utc::now().timestamp_millis(),
            properties,
        };
        self.core.recorder.record_track_stats(&[event])
    }

    fn make_evaluation(
        &self,
        method: &str,
        operation: &str,
        feature: &str,
        attributes: Option<&Attributes>,
    ) -> TreatmentWithConfig {
        let start = Instant::now();
        if self.core.is_destroyed() {
            tracing::error!(method, "client has already been destroyed - no calls possible");
            return (CONTROL.to_string(), None);
        }
        let Some(feature) = input_validator::validate_feature_name(method, feature) else {
            return (CONTROL.to_string(), None);
        };

        let result = self.evaluate(method, &feature, attributes);
        let impressions = self.impression(&feature, &result).into_iter().collect();
        self.core
            .recorder
            .record_treatment_stats(impressions, attributes, start.elapsed(), operation);
        (result.treatment, result.config)
    }

    fn make_evaluations(
        &self,
        method: &str,
        operation: &str,
        features: &[&str],
        attributes: Option<&Attributes>,
    ) -> HashMap<String, TreatmentWithConfig> {
        let start = Instant::now();
        let features = input_validator::validate_feature_names(method, features);
        if self.core.is_destroyed() {
            tracing::error!(method, "client has already been destroyed - no calls possible");
            return features
                .into_iter()
                .map(|feature| (feature, (CONTROL.to_string(), None)))
                .collect();
        }

        let mut impressions = Vec::with_capacity(features.len());
        let mut treatments = HashMap::with_capacity(features.len());
        for feature in features {
            let result = self.evaluate(method, &feature, attributes);
            impressions.extend(self.impression(&feature, &result));
            treatments.insert(feature, (result.treatment, result.config));
        }
        if !treatments.is_empty() {
            self.core.recorder.record_treatment_stats(
                impressions,
                attributes,
                start.elapsed(),
                operation,
            );
        }
        treatments
    }

    fn evaluate(
        &self,
        method: &str,
        feature: &str,
        attributes: Option<&Attributes>,
    ) -> EvaluationResult {
        if !self.core.is_ready() {
            tracing::warn!(
                method,
                feature,
                "the SDK is not ready, results may be incorrect. Make sure to wait for \
                 readiness using block_until_ready"
            );
            return EvaluationResult::control(label::NOT_READY);
        }

        let context = StoreContext { core: &self.core };
        match Evaluator::new(&context).evaluate(feature, &self.core.traffic_key, attributes) {
            Ok(result) => {
                if result.label == label::SPLIT_NOT_FOUND {
                    tracing::warn!(
                        method,
                        feature,
                        "you passed a feature flag that does not exist in this environment, \
                         please double check what feature flags exist"
                    );
                }
                result
            }
            Err(e) => {
                tracing::error!(method, feature, error = %e, "evaluation failed, serving control");
                EvaluationResult::control(label::EXCEPTION)
            }
        }
    }

    /// Impression for an evaluation. Unknown features produce none.
    fn impression(&self, feature: &str, result: &EvaluationResult) -> Option<Impression> {
        if result.label == label::SPLIT_NOT_FOUND {
            return None;
        }
        Some(Impression {
            matching_key: self.core.traffic_key.clone(),
            feature_name: feature.to_string(),
            treatment: result.treatment.clone(),
            label: self.core.labels_enabled.then(|| result.label.clone()),
            change_number: result.change_number,
            bucketing_key: None,
            time: Utc::now().timestamp_millis(),
            previous_time: None,
        })
    }
}
