//! Integration tests for bound factories over an on-disk flag store

use serde_json::json;
use split_client_side::import::{import_my_segments, import_split_changes};
use split_client_side::storage::{
    DbClient, SqlImpressionStorage, SqlMySegmentsStorage, SqlSplitStorage,
};
use split_client_side::tasks::DiscardSink;
use split_client_side::{
    build_factory_with_sink, Attributes, BoundFactory, Config, FactoryError, ImpressionData,
    ImpressionListener, CONTROL,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const SPLIT_CHANGES: &str = r#"{
    "since": -1,
    "till": 1700000000000,
    "splits": [
        {
            "name": "new_checkout",
            "trafficTypeName": "user",
            "seed": 1314112417,
            "status": "ACTIVE",
            "killed": false,
            "defaultTreatment": "off",
            "changeNumber": 1700000000000,
            "algo": 2,
            "configurations": {"on": "{\"color\":\"green\"}"},
            "conditions": [
                {
                    "conditionType": "WHITELIST",
                    "matcherGroup": {
                        "combiner": "AND",
                        "matchers": [
                            {
                                "matcherType": "WHITELIST",
                                "negate": false,
                                "whitelistMatcherData": {"whitelist": ["user-2"]}
                            }
                        ]
                    },
                    "partitions": [{"treatment": "on", "size": 100}],
                    "label": "whitelisted"
                },
                {
                    "conditionType": "ROLLOUT",
                    "matcherGroup": {
                        "combiner": "AND",
                        "matchers": [
                            {
                                "keySelector": {"trafficType": "user", "attribute": null},
                                "matcherType": "ALL_KEYS",
                                "negate": false
                            }
                        ]
                    },
                    "partitions": [{"treatment": "on", "size": 0}, {"treatment": "off", "size": 100}],
                    "label": "default rule"
                }
            ]
        },
        {
            "name": "beta_banner",
            "trafficTypeName": "user",
            "seed": 42,
            "status": "ACTIVE",
            "killed": false,
            "defaultTreatment": "hidden",
            "changeNumber": 1700000000000,
            "algo": 2,
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
                                "userDefinedSegmentMatcherData": {"segmentName": "beta"}
                            }
                        ]
                    },
                    "partitions": [{"treatment": "shown", "size": 100}],
                    "label": "in segment beta"
                }
            ]
        },
        {
            "name": "plan_gate",
            "trafficTypeName": "user",
            "seed": 7,
            "status": "ACTIVE",
            "killed": false,
            "defaultTreatment": "basic",
            "changeNumber": 1700000000000,
            "algo": 2,
            "conditions": [
                {
                    "conditionType": "ROLLOUT",
                    "matcherGroup": {
                        "combiner": "AND",
                        "matchers": [
                            {
                                "keySelector": {"trafficType": "user", "attribute": "plan"},
                                "matcherType": "WHITELIST",
                                "negate": false,
                                "whitelistMatcherData": {"whitelist": ["pro", "enterprise"]}
                            }
                        ]
                    },
                    "partitions": [{"treatment": "premium", "size": 100}],
                    "label": "paying plans"
                }
            ]
        }
    ]
}"#;

fn store_url(path: &Path) -> String {
    format!("sqlite:///{}", path.display())
}

/// Store file holding the test definitions, with `user-1` in the beta segment.
fn populated_store(dir: &TempDir) -> String {
    let path = dir.path().join("split.sqlite");
    let db = DbClient::open_path(&path).expect("failed to open store");
    import_split_changes(&SqlSplitStorage::new(db.clone()), SPLIT_CHANGES)
        .expect("failed to import definitions");
    import_my_segments(&SqlMySegmentsStorage::new(db), "user-1", &["beta".to_string()])
        .expect("failed to import segments");
    store_url(&path)
}

fn factory(sql_url: &str, traffic_key: &str) -> Result<BoundFactory, FactoryError> {
    let config = Config {
        definitions_poll_interval: Duration::from_millis(50),
        ..Config::with_sql_url(sql_url)
    };
    build_factory_with_sink(
        "integration-test-key",
        config,
        traffic_key,
        Box::new(DiscardSink),
        None,
    )
}

fn ready_factory(sql_url: &str, traffic_key: &str) -> BoundFactory {
    let factory = factory(sql_url, traffic_key).expect("failed to build factory");
    factory
        .block_until_ready(Duration::from_secs(5))
        .expect("factory should become ready");
    factory
}

#[test]
fn test_factory_is_bound_to_its_key() {
    let dir = TempDir::new().unwrap();
    let url = populated_store(&dir);

    let first = ready_factory(&url, "user-1");
    let second = ready_factory(&url, "user-2");

    assert_eq!(first.traffic_key(), "user-1");
    assert_eq!(first.client().traffic_key(), "user-1");
    assert_eq!(first.client().get_treatment("new_checkout", None), "off");
    assert_eq!(second.client().get_treatment("new_checkout", None), "on");

    // Every client from the same factory answers for the same key.
    for _ in 0..3 {
        assert_eq!(second.client().get_treatment("new_checkout", None), "on");
    }
}

#[test]
fn test_zero_timeout_on_empty_store() {
    let dir = TempDir::new().unwrap();
    let url = store_url(&dir.path().join("empty.sqlite"));
    let factory = factory(&url, "user-1").unwrap();

    let err = factory.block_until_ready(Duration::ZERO).unwrap_err();
    assert_eq!(err.timeout, Duration::ZERO);
    assert!(!factory.ready());

    // A timed-out factory is still usable.
    assert_eq!(factory.client().get_treatment("new_checkout", None), CONTROL);
}

#[test]
fn test_becomes_ready_after_timeout() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("late.sqlite");
    let url = store_url(&path);
    let factory = factory(&url, "user-2").unwrap();
    assert!(factory.block_until_ready(Duration::from_millis(10)).is_err());

    let db = DbClient::open_path(&path).unwrap();
    import_split_changes(&SqlSplitStorage::new(db), SPLIT_CHANGES).unwrap();

    factory
        .block_until_ready(Duration::from_secs(5))
        .expect("factory should turn ready once definitions land");
    assert_eq!(factory.client().get_treatment("new_checkout", None), "on");
}

#[test]
fn test_unreachable_store_is_a_factory_error() {
    let dir = TempDir::new().unwrap();
    let url = store_url(&dir.path().join("missing").join("split.sqlite"));
    assert!(matches!(factory(&url, "user-1"), Err(FactoryError::Storage(_))));
}

#[test]
fn test_unknown_flag_is_control() {
    let dir = TempDir::new().unwrap();
    let url = populated_store(&dir);
    let factory = ready_factory(&url, "user-1");
    let client = factory.client();

    assert_eq!(client.get_treatment("does_not_exist", None), CONTROL);
    assert_eq!(client.get_treatment("", None), CONTROL);
    assert_eq!(
        client.get_treatment_with_config("does_not_exist", None),
        (CONTROL.to_string(), None)
    );
}

#[test]
fn test_segments_attributes_and_configs() {
    let dir = TempDir::new().unwrap();
    let url = populated_store(&dir);
    let member = ready_factory(&url, "user-1");
    let outsider = ready_factory(&url, "user-3");

    assert_eq!(member.client().get_treatment("beta_banner", None), "shown");
    assert_eq!(outsider.client().get_treatment("beta_banner", None), "hidden");

    let pro: Attributes = [("plan".to_string(), json!("pro"))].into_iter().collect();
    let free: Attributes = [("plan".to_string(), json!("free"))].into_iter().collect();
    let client = outsider.client();
    assert_eq!(client.get_treatment("plan_gate", Some(&pro)), "premium");
    assert_eq!(client.get_treatment("plan_gate", Some(&free)), "basic");
    assert_eq!(client.get_treatment("plan_gate", None), "basic");

    let whitelisted = ready_factory(&url, "user-2");
    assert_eq!(
        whitelisted.client().get_treatment_with_config("new_checkout", None),
        ("on".to_string(), Some(r#"{"color":"green"}"#.to_string()))
    );
}

#[test]
fn test_get_treatments() {
    let dir = TempDir::new().unwrap();
    let url = populated_store(&dir);
    let factory = ready_factory(&url, "user-1");

    let treatments = factory
        .client()
        .get_treatments(&["new_checkout", "beta_banner", "missing", "new_checkout"], None);
    assert_eq!(treatments.len(), 3);
    assert_eq!(treatments["new_checkout"], "off");
    assert_eq!(treatments["beta_banner"], "shown");
    assert_eq!(treatments["missing"], CONTROL);

    let with_config = factory
        .client()
        .get_treatments_with_config(&["beta_banner"], None);
    assert_eq!(with_config["beta_banner"], ("shown".to_string(), None));
}

#[test]
fn test_impressions_carry_the_bound_key() {
    let dir = TempDir::new().unwrap();
    let url = populated_store(&dir);
    let factory = ready_factory(&url, "user-1");
    let client = factory.client();

    client.get_treatment("new_checkout", None);
    client.get_treatment("beta_banner", None);
    client.get_treatment("missing", None);

    let db = DbClient::open(&url).unwrap();
    let impressions = SqlImpressionStorage::new(db, 100).pop_many(100).unwrap();
    assert_eq!(impressions.len(), 2);
    assert!(impressions.iter().all(|i| i.matching_key == "user-1"));
    assert_eq!(impressions[0].label.as_deref(), Some("default rule"));
    assert_eq!(impressions[0].change_number, Some(1_700_000_000_000));
}

#[test]
fn test_track() {
    let dir = TempDir::new().unwrap();
    let url = populated_store(&dir);
    let factory = ready_factory(&url, "user-1");
    let client = factory.client();

    let properties = json!({"plan": "pro"}).as_object().cloned();
    assert!(client.track("user", "checkout.completed", Some(19.99), properties));
    assert!(client.track("User", "page_view", None, None));
    assert!(!client.track("user", "bad event type!", None, None));
    assert!(!client.track("", "page_view", None, None));
    assert!(!client.track("user", "page_view", Some(f64::INFINITY), None));
}

#[test]
fn test_destroyed_factory_serves_control() {
    let dir = TempDir::new().unwrap();
    let url = populated_store(&dir);
    let factory = ready_factory(&url, "user-2");
    let client = factory.client();
    assert_eq!(client.get_treatment("new_checkout", None), "on");

    factory.destroy();
    assert!(factory.destroyed());
    assert_eq!(client.get_treatment("new_checkout", None), CONTROL);
    assert!(!client.track("user", "page_view", None, None));
    assert!(factory.manager().split_names().is_empty());
}

#[test]
fn test_manager_lists_definitions() {
    let dir = TempDir::new().unwrap();
    let url = populated_store(&dir);
    let factory = ready_factory(&url, "user-1");
    let manager = factory.manager();

    assert_eq!(
        manager.split_names(),
        vec!["beta_banner", "new_checkout", "plan_gate"]
    );
    let view = manager.split("new_checkout").unwrap();
    assert_eq!(view.treatments, vec!["on", "off"]);
    assert_eq!(view.change_number, 1_700_000_000_000);
    assert!(manager.split("missing").is_none());
    assert_eq!(manager.splits().len(), 3);
}

#[derive(Default)]
struct RecordingListener {
    seen: Mutex<Vec<(String, String, Option<Attributes>, String)>>,
}

impl ImpressionListener for RecordingListener {
    fn log_impression(&self, data: ImpressionData<'_>) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push((
            data.impression.matching_key.clone(),
            data.impression.feature_name.clone(),
            data.attributes.cloned(),
            data.metadata.sdk_version.clone(),
        ));
        Ok(())
    }
}

#[test]
fn test_impression_listener_sees_the_bound_key() {
    let dir = TempDir::new().unwrap();
    let url = populated_store(&dir);
    let listener = Arc::new(RecordingListener::default());
    let handle: Arc<dyn ImpressionListener> = listener.clone();
    let config = Config {
        definitions_poll_interval: Duration::from_millis(50),
        machine_ip: Some("10.0.0.9".to_string()),
        ..Config::with_sql_url(&url)
    };
    let factory = build_factory_with_sink(
        "listener-test-key",
        config,
        "user-1",
        Box::new(DiscardSink),
        Some(handle),
    )
    .unwrap();
    factory.block_until_ready(Duration::from_secs(5)).unwrap();

    let pro: Attributes = [("plan".to_string(), json!("pro"))].into_iter().collect();
    let client = factory.client();
    client.get_treatment("plan_gate", Some(&pro));
    client.get_treatment("plan_gate", Some(&pro));
    client.get_treatment("missing", None);

    let seen = listener.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    for (key, feature, attributes, sdk_version) in seen.iter() {
        assert_eq!(key, "user-1");
        assert_eq!(feature, "plan_gate");
        assert_eq!(attributes.as_ref().unwrap()["plan"], "pro");
        assert!(sdk_version.starts_with("rust-"));
    }
}
