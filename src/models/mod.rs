//! Data model shared by the engine, storages and recorder.

pub mod events;
pub mod impressions;
pub mod segments;
pub mod splits;

pub use events::Event;
pub use impressions::{label, Impression, ImpressionCount};
pub use segments::{Segment, SegmentChanges};
pub use splits::{
    Condition, ConditionType, HashAlgorithm, Matcher, MatcherType, Partition, Split,
    SplitChanges, Status,
};
