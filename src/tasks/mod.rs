//! Background threads owned by a factory.

pub mod flusher;
pub mod readiness;

pub use flusher::{
    flush_channel, table_full_hook, DiscardSink, FlushQueues, FlushSettings, FlushSignal,
    Flusher, RecordSink, TelemetrySnapshot,
};
pub use readiness::{ReadinessWatcher, ReadyFlag};
