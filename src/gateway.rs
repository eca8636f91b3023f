//! Client for the Split events API.
//!
//! Ships flushed impressions, impression counts, events and telemetry. Only
//! records flow out; definitions are never fetched from here.

use crate::client::metadata::SdkMetadata;
use crate::config::{Config, ImpressionsMode};
use crate::models::{Event, Impression, ImpressionCount};
use crate::tasks::{RecordSink, TelemetrySnapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Events API base URL, without a trailing slash
    pub events_url: String,
    /// API key sent as a bearer token
    pub api_key: String,
    /// Request timeout
    pub timeout: Duration,
    pub impressions_mode: ImpressionsMode,
    pub metadata: SdkMetadata,
}

impl GatewayConfig {
    /// Create a new gateway configuration.
    pub fn new(
        events_url: impl Into<String>,
        api_key: impl Into<String>,
        metadata: SdkMetadata,
    ) -> Self {
        Self {
            events_url: events_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_millis(1500),
            impressions_mode: ImpressionsMode::Optimized,
            metadata,
        }
    }

    /// Gateway configuration matching a factory's settings.
    pub fn from_config(api_key: &str, config: &Config) -> Self {
        Self {
            timeout: config.connection_timeout,
            impressions_mode: config.impressions_mode,
            ..Self::new(
                config.events_url.as_str(),
                api_key,
                SdkMetadata::from_config(config),
            )
        }
    }

    pub fn impressions_url(&self) -> String {
        format!("{}/testImpressions/bulk", self.events_url)
    }

    pub fn impression_counts_url(&self) -> String {
        format!("{}/testImpressions/count", self.events_url)
    }

    pub fn events_url(&self) -> String {
        format!("{}/events/bulk", self.events_url)
    }

    pub fn times_url(&self) -> String {
        format!("{}/metrics/times", self.events_url)
    }

    pub fn counters_url(&self) -> String {
        format!("{}/metrics/counters", self.events_url)
    }

    pub fn gauge_url(&self) -> String {
        format!("{}/metrics/gauge", self.events_url)
    }
}

/// Gateway client error types.
#[derive(Debug)]
pub enum GatewayError {
    /// Configuration error
    Config(String),
    /// Network/HTTP error
    Network(String),
    /// Server returned an error response
    Server { status: u16, message: String },
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Config(msg) => write!(f, "Gateway config error: {msg}"),
            GatewayError::Network(msg) => write!(f, "Gateway network error: {msg}"),
            GatewayError::Server { status, message } => {
                write!(f, "Gateway server error ({status}): {message}")
            }
        }
    }
}

impl std::error::Error for GatewayError {}

/// Impressions of one feature, as posted to `/testImpressions/bulk`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureImpressions {
    #[serde(rename = "f")]
    pub feature: String,
    #[serde(rename = "i")]
    pub impressions: Vec<KeyImpression>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyImpression {
    #[serde(rename = "k")]
    pub key: String,
    #[serde(rename = "t")]
    pub treatment: String,
    #[serde(rename = "m")]
    pub time: i64,
    #[serde(rename = "c", skip_serializing_if = "Option::is_none")]
    pub change_number: Option<i64>,
    #[serde(rename = "r", skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "b", skip_serializing_if = "Option::is_none")]
    pub bucketing_key: Option<String>,
    #[serde(rename = "pt", skip_serializing_if = "Option::is_none")]
    pub previous_time: Option<i64>,
}

/// Group impressions by feature, keeping their order within each feature.
pub fn group_impressions(impressions: &[Impression]) -> Vec<FeatureImpressions> {
    let mut grouped: BTreeMap<&str, Vec<KeyImpression>> = BTreeMap::new();
    for imp in impressions {
        grouped
            .entry(imp.feature_name.as_str())
            .or_default()
            .push(KeyImpression {
                key: imp.matching_key.clone(),
                treatment: imp.treatment.clone(),
                time: imp.time,
                change_number: imp.change_number,
                label: imp.label.clone(),
                bucketing_key: imp.bucketing_key.clone(),
                previous_time: imp.previous_time,
            });
    }
    grouped
        .into_iter()
        .map(|(feature, impressions)| FeatureImpressions {
            feature: feature.to_string(),
            impressions,
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct CountsPayload<'a> {
    pf: &'a [ImpressionCount],
}

#[derive(Debug, Serialize)]
struct LatencyPayload<'a> {
    name: &'a str,
    latencies: &'a [u64],
}

#[derive(Debug, Serialize)]
struct CounterPayload<'a> {
    name: &'a str,
    delta: i64,
}

#[derive(Debug, Serialize)]
struct GaugePayload<'a> {
    name: &'a str,
    value: i64,
}

/// Async client for the events API.
#[cfg(feature = "gateway")]
pub struct GatewayClient {
    config: GatewayConfig,
    client: reqwest::Client,
}

#[cfg(feature = "gateway")]
impl GatewayClient {
    /// Create a new gateway client.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Post impressions grouped by feature.
    pub async fn post_impressions(&self, impressions: &[Impression]) -> Result<(), GatewayError> {
        let mode = match self.config.impressions_mode {
            ImpressionsMode::Optimized => "OPTIMIZED",
            ImpressionsMode::Debug => "DEBUG",
        };
        let request = self
            .client
            .post(self.config.impressions_url())
            .header("SplitSDKImpressionsMode", mode)
            .json(&group_impressions(impressions));
        self.send(request).await
    }

    pub async fn post_impression_counts(
        &self,
        counts: &[ImpressionCount],
    ) -> Result<(), GatewayError> {
        let request = self
            .client
            .post(self.config.impression_counts_url())
            .json(&CountsPayload { pf: counts });
        self.send(request).await
    }

    pub async fn post_events(&self, events: &[Event]) -> Result<(), GatewayError> {
        let request = self.client.post(self.config.events_url()).json(events);
        self.send(request).await
    }

    /// Post latencies, counters and gauges.
    pub async fn post_telemetry(&self, telemetry: &TelemetrySnapshot) -> Result<(), GatewayError> {
        if !telemetry.latencies.is_empty() {
            let times: Vec<LatencyPayload<'_>> = telemetry
                .latencies
                .iter()
                .map(|(name, latencies)| LatencyPayload { name, latencies })
                .collect();
            let request = self.client.post(self.config.times_url()).json(&times);
            self.send(request).await?;
        }

        if !telemetry.counters.is_empty() {
            let counters: Vec<CounterPayload<'_>> = telemetry
                .counters
                .iter()
                .map(|(name, delta)| CounterPayload { name, delta: *delta })
                .collect();
            let request = self.client.post(self.config.counters_url()).json(&counters);
            self.send(request).await?;
        }

        for (name, value) in &telemetry.gauges {
            let request = self.client.post(self.config.gauge_url()).json(&GaugePayload {
                name,
                value: *value,
            });
            self.send(request).await?;
        }
        Ok(())
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<(), GatewayError> {
        let metadata = &self.config.metadata;
        let response = request
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("SplitSDKVersion", metadata.sdk_version.as_str())
            .header("SplitSDKMachineName", metadata.machine_name.as_str())
            .header("SplitSDKMachineIP", metadata.machine_ip.as_str())
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GatewayError::Server {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

/// Blocking gateway client for use in synchronous contexts.
///
/// The runtime is built on first use, so the client can be created and
/// dropped from async code as long as it only sends from a plain thread.
#[cfg(feature = "gateway")]
pub struct BlockingGatewayClient {
    inner: GatewayClient,
    runtime: std::sync::OnceLock<tokio::runtime::Runtime>,
}

#[cfg(feature = "gateway")]
impl BlockingGatewayClient {
    /// Create a new blocking gateway client.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        Ok(Self {
            inner: GatewayClient::new(config)?,
            runtime: std::sync::OnceLock::new(),
        })
    }

    fn runtime(&self) -> Result<&tokio::runtime::Runtime, GatewayError> {
        if let Some(runtime) = self.runtime.get() {
            return Ok(runtime);
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to create runtime: {e}")))?;
        Ok(self.runtime.get_or_init(|| runtime))
    }

    pub fn post_impressions(&self, impressions: &[Impression]) -> Result<(), GatewayError> {
        self.runtime()?
            .block_on(self.inner.post_impressions(impressions))
    }

    pub fn post_impression_counts(&self, counts: &[ImpressionCount]) -> Result<(), GatewayError> {
        self.runtime()?
            .block_on(self.inner.post_impression_counts(counts))
    }

    pub fn post_events(&self, events: &[Event]) -> Result<(), GatewayError> {
        self.runtime()?.block_on(self.inner.post_events(events))
    }

    pub fn post_telemetry(&self, telemetry: &TelemetrySnapshot) -> Result<(), GatewayError> {
        self.runtime()?.block_on(self.inner.post_telemetry(telemetry))
    }
}

#[cfg(feature = "gateway")]
impl RecordSink for BlockingGatewayClient {
    fn send_impressions(&self, impressions: &[Impression]) -> anyhow::Result<()> {
        Ok(self.post_impressions(impressions)?)
    }

    fn send_impression_counts(&self, counts: &[ImpressionCount]) -> anyhow::Result<()> {
        Ok(self.post_impression_counts(counts)?)
    }

    fn send_events(&self, events: &[Event]) -> anyhow::Result<()> {
        Ok(self.post_events(events)?)
    }

    fn send_telemetry(&self, telemetry: &TelemetrySnapshot) -> anyhow::Result<()> {
        Ok(self.post_telemetry(telemetry)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> SdkMetadata {
        SdkMetadata {
            sdk_version: "rust-0.1.0".to_string(),
            machine_name: "host".to_string(),
            machine_ip: "unknown".to_string(),
        }
    }

    #[test]
    fn test_gateway_config_urls() {
        let config = GatewayConfig::new("https://events.example.com/api/", "key", metadata());
        assert_eq!(
            config.impressions_url(),
            "https://events.example.com/api/testImpressions/bulk"
        );
        assert_eq!(
            config.impression_counts_url(),
            "https://events.example.com/api/testImpressions/count"
        );
        assert_eq!(config.events_url(), "https://events.example.com/api/events/bulk");
        assert_eq!(config.times_url(), "https://events.example.com/api/metrics/times");
        assert_eq!(
            config.counters_url(),
            "https://events.example.com/api/metrics/counters"
        );
    }

    #[test]
    fn test_group_impressions_by_feature() {
        let imp = |feature: &str, time: i64| Impression {
            matching_key: "user-1".to_string(),
            feature_name: feature.to_string(),
            treatment: "on".to_string(),
            label: Some("default rule".to_string()),
            change_number: Some(7),
            bucketing_key: None,
            time,
            previous_time: None,
        };

        let grouped = group_impressions(&[imp("b", 1), imp("a", 2), imp("b", 3)]);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].feature, "a");
        assert_eq!(grouped[1].impressions.len(), 2);
        assert_eq!(grouped[1].impressions[1].time, 3);

        let json = serde_json::to_value(&grouped[0]).unwrap();
        assert_eq!(json["f"], "a");
        assert_eq!(json["i"][0]["k"], "user-1");
        assert_eq!(json["i"][0]["r"], "default rule");
        assert!(json["i"][0].get("pt").is_none());
    }

    #[test]
    fn test_error_display() {
        let err = GatewayError::Server {
            status: 401,
            message: "unauthorized".to_string(),
        };
        assert_eq!(err.to_string(), "Gateway server error (401): unauthorized");
    }
}
