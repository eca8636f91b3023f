//! Impression, event and latency recording.
//!
//! Every evaluation produces impressions that pass through the
//! [`ImpressionsManager`] before being queued in the store. In optimized mode
//! only the first identical impression of each hour is queued; the rest are
//! folded into per-hour counts that the flusher ships separately.
//!
//! An optional [`ImpressionListener`] sees every impression, deduplicated or
//! not, together with the attributes and the SDK identity.

use crate::client::metadata::SdkMetadata;
use crate::config::ImpressionsMode;
use crate::engine::Attributes;
use crate::models::impressions::truncate_to_hour;
use crate::models::{Event, Impression, ImpressionCount};
use crate::storage::sql::MAX_LATENCY_BUCKET;
use crate::storage::{SqlEventStorage, SqlImpressionStorage, SqlTelemetryStorage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Upper bounds, in microseconds, of each latency bucket.
const LATENCY_BUCKETS: [u64; MAX_LATENCY_BUCKET + 1] = [
    1_000, 1_500, 2_250, 3_375, 5_063, 7_594, 11_391, 17_086, 25_629, 38_443, 57_665, 86_498,
    129_746, 194_620, 291_929, 437_894, 656_841, 985_261, 1_477_892, 2_216_838, 3_325_257,
    4_987_885,
];

/// Identical impressions remembered for deduplication before the cache resets.
const OBSERVER_CAPACITY: usize = 500_000;

/// Bucket index for a latency. Anything slower than the last bound lands in
/// the last bucket.
pub fn latency_bucket(latency: Duration) -> usize {
    let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
    LATENCY_BUCKETS
        .partition_point(|bound| *bound < micros)
        .min(MAX_LATENCY_BUCKET)
}

/// Deduplicates and counts impressions.
#[derive(Debug)]
pub struct ImpressionsManager {
    mode: ImpressionsMode,
    /// Last time each distinct impression was seen.
    observer: Mutex<HashMap<String, i64>>,
    /// Impressions per (feature, hour).
    counts: Mutex<HashMap<(String, i64), u64>>,
}

impl ImpressionsManager {
    pub fn new(mode: ImpressionsMode) -> Self {
        Self {
            mode,
            observer: Mutex::new(HashMap::new()),
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> ImpressionsMode {
        self.mode
    }

    /// Annotate impressions with the previous time they were seen and return
    /// the ones that should be queued.
    pub fn process(&self, impressions: Vec<Impression>) -> Vec<Impression> {
        self.process_all(impressions).0
    }

    /// Like [`process`](Self::process), also returning every annotated
    /// impression.
    pub fn process_all(&self, impressions: Vec<Impression>) -> (Vec<Impression>, Vec<Impression>) {
        let observed: Vec<Impression> = {
            let mut observer = self.observer.lock().unwrap_or_else(PoisonError::into_inner);
            if observer.len() >= OBSERVER_CAPACITY {
                observer.clear();
            }
            impressions
                .into_iter()
                .map(|mut impression| {
                    impression.previous_time =
                        observer.insert(impression_hash(&impression), impression.time);
                    impression
                })
                .collect()
        };

        match self.mode {
            ImpressionsMode::Debug => (observed.clone(), observed),
            ImpressionsMode::Optimized => {
                let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
                for impression in &observed {
                    *counts
                        .entry((
                            impression.feature_name.clone(),
                            truncate_to_hour(impression.time),
                        ))
                        .or_insert(0) += 1;
                }
                let queued = observed
                    .iter()
                    .filter(|imp| match imp.previous_time {
                        Some(previous) => truncate_to_hour(previous) != truncate_to_hour(imp.time),
                        None => true,
                    })
                    .cloned()
                    .collect();
                (queued, observed)
            }
        }
    }

    /// Take the accumulated per-hour counts.
    pub fn pop_counts(&self) -> Vec<ImpressionCount> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let mut popped: Vec<ImpressionCount> = counts
            .drain()
            .map(|((feature, timeframe), count)| ImpressionCount {
                feature,
                timeframe,
                count,
            })
            .collect();
        popped.sort_by(|a, b| (a.timeframe, &a.feature).cmp(&(b.timeframe, &b.feature)));
        popped
    }
}

fn impression_hash(impression: &Impression) -> String {
    format!(
        "{}:{}:{}:{}:{}",
        impression.matching_key,
        impression.feature_name,
        impression.treatment,
        impression.label.as_deref().unwrap_or_default(),
        impression.change_number.unwrap_or_default()
    )
}

/// What an [`ImpressionListener`] receives for each impression.
#[derive(Debug, Clone, Copy)]
pub struct ImpressionData<'a> {
    pub impression: &'a Impression,
    pub attributes: Option<&'a Attributes>,
    pub metadata: &'a SdkMetadata,
}

/// User callback notified of every impression.
///
/// Called on the evaluating thread. Errors are logged and otherwise ignored.
pub trait ImpressionListener: Send + Sync {
    fn log_impression(&self, data: ImpressionData<'_>) -> anyhow::Result<()>;
}

/// Writes evaluation and tracking results to the store.
#[derive(Clone)]
pub struct StandardRecorder {
    impressions_manager: Arc<ImpressionsManager>,
    impressions: SqlImpressionStorage,
    events: SqlEventStorage,
    telemetry: SqlTelemetryStorage,
    listener: Option<(Arc<dyn ImpressionListener>, SdkMetadata)>,
}

impl StandardRecorder {
    pub fn new(
        impressions_manager: Arc<ImpressionsManager>,
        impressions: SqlImpressionStorage,
        events: SqlEventStorage,
        telemetry: SqlTelemetryStorage,
    ) -> Self {
        Self {
            impressions_manager,
            impressions,
            events,
            telemetry,
            listener: None,
        }
    }

    /// Forward every impression to `listener`, tagged with `metadata`.
    pub fn with_listener(
        mut self,
        listener: Arc<dyn ImpressionListener>,
        metadata: SdkMetadata,
    ) -> Self {
        self.listener = Some((listener, metadata));
        self
    }

    /// Record impressions and the latency of the operation that produced them.
    ///
    /// Failures are logged; the caller has already served its treatment.
    pub fn record_treatment_stats(
        &self,
        impressions: Vec<Impression>,
        attributes: Option<&Attributes>,
        latency: Duration,
        operation: &str,
    ) {
        let (impressions, observed) = self.impressions_manager.process_all(impressions);
        if let Err(e) = self.telemetry.inc_latency(operation, latency_bucket(latency)) {
            tracing::error!(operation, error = %e, "failed to record latency");
        }
        if let Some((listener, metadata)) = &self.listener {
            for impression in &observed {
                let data = ImpressionData {
                    impression,
                    attributes,
                    metadata,
                };
                if let Err(e) = listener.log_impression(data) {
                    tracing::error!(
                        operation,
                        error = %e,
                        "impression listener failed, the impression was still recorded"
                    );
                }
            }
        }
        if impressions.is_empty() {
            return;
        }
        match self.impressions.put(&impressions) {
            Ok(()) => tracing::debug!(count = impressions.len(), "queued impressions"),
            Err(e) => tracing::error!(operation, error = %e, "failed to store impressions"),
        }
    }

    /// Queue tracked events. Returns whether they were stored.
    pub fn record_track_stats(&self, events: &[Event]) -> bool {
        match self.events.put(events) {
            Ok(()) => {
                tracing::debug!(count = events.len(), "queued events");
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to store events");
                false
            }
        }
    }

    pub fn impressions_manager(&self) -> &Arc<ImpressionsManager> {
        &self.impressions_manager
    }
}
