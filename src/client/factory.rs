//! Bound factory construction and lifecycle.

use crate::client::input_validator;
use crate::client::{BoundClient, SplitManager};
use crate::config::{Config, ConfigError};
use crate::gateway::GatewayError;
use crate::client::metadata::SdkMetadata;
use crate::recorder::{ImpressionListener, ImpressionsManager, StandardRecorder};
use crate::storage::{
    DbClient, SqlEventStorage, SqlImpressionStorage, SqlMySegmentsStorage, SqlSegmentStorage,
    SqlSplitStorage, SqlTelemetryStorage, StorageError,
};
use crate::tasks::{
    flush_channel, table_full_hook, FlushQueues, FlushSettings, FlushSignal, Flusher,
    ReadinessWatcher, ReadyFlag, RecordSink,
};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Live factories per API key.
static ACTIVE_FACTORIES: LazyLock<Mutex<HashMap<String, usize>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Errors that prevent a factory from being built.
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("invalid API key: {0}")]
    InvalidApiKey(&'static str),

    #[error("invalid traffic key: {0}")]
    InvalidTrafficKey(&'static str),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to open flag store: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to start background task: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to create events API client: {0}")]
    Gateway(#[from] GatewayError),
}

/// The factory did not become ready in time. It stays usable and may
/// still become ready later.
#[derive(Debug, Error)]
#[error("factory not ready after {timeout:?}")]
pub struct TimeoutError {
    pub timeout: Duration,
}

/// Build a factory bound to `traffic_key`.
///
/// Records are shipped to the events API when the `gateway` feature is
/// enabled and discarded otherwise.
pub fn build_factory(
    api_key: &str,
    config: Config,
    traffic_key: &str,
) -> Result<BoundFactory, FactoryError> {
    build(api_key, config, traffic_key, None, |config| default_sink(api_key, config))
}

/// Build a factory bound to `traffic_key` that hands flushed records to
/// `sink` and, if given, every impression to `listener`.
pub fn build_factory_with_sink(
    api_key: &str,
    config: Config,
    traffic_key: &str,
    sink: Box<dyn RecordSink>,
    listener: Option<Arc<dyn ImpressionListener>>,
) -> Result<BoundFactory, FactoryError> {
    build(api_key, config, traffic_key, listener, |_| Ok(sink))
}

#[cfg(feature = "gateway")]
fn default_sink(api_key: &str, config: &Config) -> Result<Box<dyn RecordSink>, FactoryError> {
    let gateway = crate::gateway::GatewayConfig::from_config(api_key, config);
    Ok(Box::new(crate::gateway::BlockingGatewayClient::new(gateway)?))
}

#[cfg(not(feature = "gateway"))]
#[allow(clippy::unnecessary_wraps)]
fn default_sink(_api_key: &str, _config: &Config) -> Result<Box<dyn RecordSink>, FactoryError> {
    Ok(Box::new(crate::tasks::DiscardSink))
}

/// Inputs are validated and the store opened before the sink is made.
fn build(
    api_key: &str,
    config: Config,
    traffic_key: &str,
    listener: Option<Arc<dyn ImpressionListener>>,
    make_sink: impl FnOnce(&Config) -> Result<Box<dyn RecordSink>, FactoryError>,
) -> Result<BoundFactory, FactoryError> {
    input_validator::validate_api_key(api_key).map_err(FactoryError::InvalidApiKey)?;
    input_validator::validate_traffic_key(traffic_key).map_err(FactoryError::InvalidTrafficKey)?;
    let config = config.sanitize()?;

    let db = DbClient::open(&config.sql_url)?;
    let sink = make_sink(&config)?;
    let (trigger, signals) = flush_channel();

    let splits = SqlSplitStorage::new(db.clone());
    let impressions = SqlImpressionStorage::new(db.clone(), config.impressions_queue_size)
        .with_table_full_hook(table_full_hook(&trigger, FlushSignal::Impressions));
    let events = SqlEventStorage::new(db.clone(), config.events_queue_size)
        .with_table_full_hook(table_full_hook(&trigger, FlushSignal::Events));
    let telemetry = SqlTelemetryStorage::new(db.clone());
    let impressions_manager = Arc::new(ImpressionsManager::new(config.impressions_mode));

    let mut recorder = StandardRecorder::new(
        Arc::clone(&impressions_manager),
        impressions.clone(),
        events.clone(),
        telemetry.clone(),
    );
    if let Some(listener) = listener {
        recorder = recorder.with_listener(listener, SdkMetadata::from_config(&config));
    }

    let ready = Arc::new(ReadyFlag::new());
    let watcher = ReadinessWatcher::spawn(
        splits.clone(),
        Arc::clone(&ready),
        config.definitions_poll_interval,
    )
    .map_err(FactoryError::Spawn)?;
    let flusher = Flusher::spawn(
        FlushQueues {
            impressions,
            events,
            telemetry,
            impressions_manager,
        },
        FlushSettings::from_config(&config),
        sink,
        trigger,
        signals,
    )
    .map_err(FactoryError::Spawn)?;

    register(api_key);
    let instance_id = Uuid::new_v4();
    tracing::info!(%instance_id, store = ?db.location(), "factory created");

    Ok(BoundFactory {
        core: Arc::new(FactoryCore {
            api_key: api_key.to_string(),
            traffic_key: traffic_key.to_string(),
            instance_id,
            labels_enabled: config.labels_enabled,
            splits,
            segments: SqlSegmentStorage::new(db.clone()),
            my_segments: SqlMySegmentsStorage::new(db),
            recorder,
            ready,
            destroyed: AtomicBool::new(false),
            tasks: Mutex::new(Some(BackgroundTasks { watcher, flusher })),
        }),
    })
}

fn register(api_key: &str) {
    let mut active = ACTIVE_FACTORIES
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let others = active.values().sum::<usize>();
    let count = active.entry(api_key.to_string()).or_insert(0);
    if *count > 0 {
        tracing::warn!(
            "factory instantiation: you already have {} factories with this API key. \
             We recommend keeping only one instance of the factory at all times",
            count
        );
    } else if others > 0 {
        tracing::warn!(
            "factory instantiation: you already have an instance of the factory \
             with another API key"
        );
    }
    *count += 1;
}

fn unregister(api_key: &str) {
    let mut active = ACTIVE_FACTORIES
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(count) = active.get_mut(api_key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            active.remove(api_key);
        }
    }
}

struct BackgroundTasks {
    watcher: ReadinessWatcher,
    flusher: Flusher,
}

/// State shared by a factory and the clients and managers it hands out.
pub(crate) struct FactoryCore {
    api_key: String,
    pub(crate) traffic_key: String,
    instance_id: Uuid,
    pub(crate) labels_enabled: bool,
    pub(crate) splits: SqlSplitStorage,
    pub(crate) segments: SqlSegmentStorage,
    pub(crate) my_segments: SqlMySegmentsStorage,
    pub(crate) recorder: StandardRecorder,
    ready: Arc<ReadyFlag>,
    destroyed: AtomicBool,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl FactoryCore {
    pub(crate) fn is_ready(&self) -> bool {
        self.ready.is_set()
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut tasks) = tasks {
            tasks.watcher.stop();
            tasks.flusher.stop();
        }
        unregister(&self.api_key);
        tracing::info!(instance_id = %self.instance_id, "factory destroyed");
    }
}

/// A factory permanently bound to one traffic key.
///
/// Dropping the factory destroys it; clients obtained from it keep working
/// but only ever serve control afterwards.
pub struct BoundFactory {
    core: Arc<FactoryCore>,
}

impl std::fmt::Debug for BoundFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundFactory")
            .field("traffic_key", &self.core.traffic_key)
            .field("instance_id", &self.core.instance_id)
            .field("ready", &self.ready())
            .field("destroyed", &self.destroyed())
            .finish_non_exhaustive()
    }
}

impl BoundFactory {
    /// Client that evaluates flags for the bound traffic key.
    pub fn client(&self) -> BoundClient {
        BoundClient::new(Arc::clone(&self.core))
    }

    /// Read-only view of the stored definitions.
    pub fn manager(&self) -> SplitManager {
        SplitManager::new(Arc::clone(&self.core))
    }

    pub fn traffic_key(&self) -> &str {
        &self.core.traffic_key
    }

    /// Unique id of this factory instance, as it appears in logs.
    pub fn instance_id(&self) -> Uuid {
        self.core.instance_id
    }

    pub fn ready(&self) -> bool {
        self.core.is_ready()
    }

    pub fn destroyed(&self) -> bool {
        self.core.is_destroyed()
    }

    /// Block until flag definitions are available or `timeout` elapses.
    pub fn block_until_ready(&self, timeout: Duration) -> Result<(), TimeoutError> {
        if self.core.ready.wait(timeout) {
            Ok(())
        } else {
            Err(TimeoutError { timeout })
        }
    }

    /// Stop background tasks after a final flush. Idempotent.
    pub fn destroy(&self) {
        self.core.destroy();
    }
}

impl Drop for BoundFactory {
    fn drop(&mut self) {
        self.destroy();
    }
}
