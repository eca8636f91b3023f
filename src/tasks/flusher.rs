//! Periodic flushing of queued records.
//!
//! The flusher thread drains the impression, event and telemetry queues on
//! their configured intervals, and earlier when a queue reports itself full
//! through a [`FlushSignal`]. What happens to the drained records is up to
//! the [`RecordSink`].

use crate::config::Config;
use crate::models::{Event, Impression, ImpressionCount};
use crate::recorder::ImpressionsManager;
use crate::storage::{SqlEventStorage, SqlImpressionStorage, SqlTelemetryStorage, TableFullHook};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Interval between impression count flushes.
const IMPRESSION_COUNT_PERIOD: Duration = Duration::from_secs(30 * 60);

/// Pending signals beyond this are dropped; one queued flush is as good as many.
const SIGNAL_CAPACITY: usize = 16;

/// Requests sent to the flusher thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushSignal {
    Impressions,
    Events,
    Shutdown,
}

/// Create the channel the flusher listens on.
pub fn flush_channel() -> (Sender<FlushSignal>, Receiver<FlushSignal>) {
    bounded(SIGNAL_CAPACITY)
}

/// Table-full hook that asks the flusher to drain a queue.
pub fn table_full_hook(trigger: &Sender<FlushSignal>, signal: FlushSignal) -> TableFullHook {
    let trigger = trigger.clone();
    Arc::new(move || {
        // A full channel already holds a pending flush.
        let _ = trigger.try_send(signal);
    })
}

/// Telemetry drained in one flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetrySnapshot {
    /// Counts per latency bucket, per operation
    pub latencies: HashMap<String, Vec<u64>>,
    pub counters: HashMap<String, i64>,
    pub gauges: HashMap<String, i64>,
}

impl TelemetrySnapshot {
    pub fn is_empty(&self) -> bool {
        self.latencies.is_empty() && self.counters.is_empty() && self.gauges.is_empty()
    }
}

/// Destination for flushed records.
pub trait RecordSink: Send {
    fn send_impressions(&self, impressions: &[Impression]) -> anyhow::Result<()>;
    fn send_impression_counts(&self, counts: &[ImpressionCount]) -> anyhow::Result<()>;
    fn send_events(&self, events: &[Event]) -> anyhow::Result<()>;
    fn send_telemetry(&self, telemetry: &TelemetrySnapshot) -> anyhow::Result<()>;
}

/// Sink that drops everything. Used when no events API is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl RecordSink for DiscardSink {
    fn send_impressions(&self, impressions: &[Impression]) -> anyhow::Result<()> {
        tracing::debug!(count = impressions.len(), "discarding impressions");
        Ok(())
    }

    fn send_impression_counts(&self, counts: &[ImpressionCount]) -> anyhow::Result<()> {
        tracing::debug!(count = counts.len(), "discarding impression counts");
        Ok(())
    }

    fn send_events(&self, events: &[Event]) -> anyhow::Result<()> {
        tracing::debug!(count = events.len(), "discarding events");
        Ok(())
    }

    fn send_telemetry(&self, telemetry: &TelemetrySnapshot) -> anyhow::Result<()> {
        tracing::debug!(
            latencies = telemetry.latencies.len(),
            counters = telemetry.counters.len(),
            "discarding telemetry"
        );
        Ok(())
    }
}

/// Queues the flusher drains.
#[derive(Clone)]
pub struct FlushQueues {
    pub impressions: SqlImpressionStorage,
    pub events: SqlEventStorage,
    pub telemetry: SqlTelemetryStorage,
    pub impressions_manager: Arc<ImpressionsManager>,
}

/// Bulk sizes and intervals.
#[derive(Debug, Clone)]
pub struct FlushSettings {
    pub impressions_bulk_size: usize,
    pub events_bulk_size: usize,
    pub impressions_refresh_rate: Duration,
    pub events_push_rate: Duration,
    pub metrics_refresh_rate: Duration,
}

impl FlushSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            impressions_bulk_size: config.impressions_bulk_size,
            events_bulk_size: config.events_bulk_size,
            impressions_refresh_rate: config.impressions_refresh_rate,
            events_push_rate: config.events_push_rate,
            metrics_refresh_rate: config.metrics_refresh_rate,
        }
    }
}

/// Handle to the flusher thread.
pub struct Flusher {
    trigger: Sender<FlushSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Flusher {
    /// Start the flusher. `trigger` and `signals` come from [`flush_channel`].
    pub fn spawn(
        queues: FlushQueues,
        settings: FlushSettings,
        sink: Box<dyn RecordSink>,
        trigger: Sender<FlushSignal>,
        signals: Receiver<FlushSignal>,
    ) -> io::Result<Self> {
        let worker = FlushWorker {
            queues,
            settings,
            sink,
        };
        let handle = thread::Builder::new()
            .name("SDKFlusher".to_string())
            .spawn(move || worker.run(&signals))?;

        Ok(Self {
            trigger,
            handle: Some(handle),
        })
    }

    /// Ask for an immediate flush of one queue.
    pub fn flush(&self, signal: FlushSignal) {
        let _ = self.trigger.try_send(signal);
    }

    /// Flush everything that is left and stop the thread.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // Blocks while the channel is full; the thread is draining it.
            let _ = self.trigger.send(FlushSignal::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct FlushWorker {
    queues: FlushQueues,
    settings: FlushSettings,
    sink: Box<dyn RecordSink>,
}

impl FlushWorker {
    fn run(self, signals: &Receiver<FlushSignal>) {
        let now = Instant::now();
        let mut next_impressions = now + self.settings.impressions_refresh_rate;
        let mut next_events = now + self.settings.events_push_rate;
        let mut next_metrics = now + self.settings.metrics_refresh_rate;
        let mut next_counts = now + IMPRESSION_COUNT_PERIOD;

        loop {
            let deadline = next_impressions
                .min(next_events)
                .min(next_metrics)
                .min(next_counts);

            match signals.recv_deadline(deadline) {
                Ok(FlushSignal::Impressions) => {
                    self.flush_impressions();
                }
                Ok(FlushSignal::Events) => {
                    self.flush_events();
                }
                Ok(FlushSignal::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    self.flush_all();
                    tracing::debug!("flusher stopped");
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    if now >= next_impressions {
                        self.flush_impressions();
                        next_impressions = now + self.settings.impressions_refresh_rate;
                    }
                    if now >= next_events {
                        self.flush_events();
                        next_events = now + self.settings.events_push_rate;
                    }
                    if now >= next_metrics {
                        self.flush_telemetry();
                        next_metrics = now + self.settings.metrics_refresh_rate;
                    }
                    if now >= next_counts {
                        self.flush_impression_counts();
                        next_counts = now + IMPRESSION_COUNT_PERIOD;
                    }
                }
            }
        }
    }

    /// Send one bulk of impressions. Returns how many were popped.
    fn flush_impressions(&self) -> usize {
        let impressions = match self
            .queues
            .impressions
            .pop_many(self.settings.impressions_bulk_size)
        {
            Ok(impressions) => impressions,
            Err(e) => {
                tracing::error!(error = %e, "failed to read queued impressions");
                return 0;
            }
        };
        if impressions.is_empty() {
            return 0;
        }

        if let Err(e) = self.sink.send_impressions(&impressions) {
            tracing::warn!(count = impressions.len(), error = %e, "dropping impressions");
            self.count_dropped("impressions.dropped");
        } else {
            tracing::debug!(count = impressions.len(), "flushed impressions");
        }
        impressions.len()
    }

    /// Send one bulk of events. Returns how many were popped.
    fn flush_events(&self) -> usize {
        let events = match self.queues.events.pop_many(self.settings.events_bulk_size) {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(error = %e, "failed to read queued events");
                return 0;
            }
        };
        if events.is_empty() {
            return 0;
        }

        if let Err(e) = self.sink.send_events(&events) {
            tracing::warn!(count = events.len(), error = %e, "dropping events");
            self.count_dropped("events.dropped");
        } else {
            tracing::debug!(count = events.len(), "flushed events");
        }
        events.len()
    }

    fn flush_impression_counts(&self) {
        let counts = self.queues.impressions_manager.pop_counts();
        if counts.is_empty() {
            return;
        }
        if let Err(e) = self.sink.send_impression_counts(&counts) {
            tracing::warn!(error = %e, "dropping impression counts");
        }
    }

    fn flush_telemetry(&self) {
        let telemetry = &self.queues.telemetry;
        let snapshot = match (
            telemetry.pop_latencies(),
            telemetry.pop_counters(),
            telemetry.pop_gauges(),
        ) {
            (Ok(latencies), Ok(counters), Ok(gauges)) => TelemetrySnapshot {
                latencies,
                counters,
                gauges,
            },
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                tracing::error!(error = %e, "failed to read telemetry");
                return;
            }
        };
        if snapshot.is_empty() {
            return;
        }
        if let Err(e) = self.sink.send_telemetry(&snapshot) {
            tracing::warn!(error = %e, "dropping telemetry");
        }
    }

    fn flush_all(&self) {
        while self.flush_impressions() >= self.settings.impressions_bulk_size {}
        while self.flush_events() >= self.settings.events_bulk_size {}
        self.flush_impression_counts();
        self.flush_telemetry();
    }

    fn count_dropped(&self, counter: &str) {
        if let Err(e) = self.queues.telemetry.inc_counter(counter) {
            tracing::error!(counter, error = %e, "failed to record counter");
        }
    }
}
