//! Loading exported backend documents into the flag store.
//!
//! The client side never fetches definitions itself. Whoever owns the store
//! fills it from `splitChanges`, `segmentChanges` and `mySegments` documents
//! through these functions (or the `import` and `segments` CLI commands).

use crate::models::{SegmentChanges, Split, SplitChanges, Status};
use crate::storage::{SqlMySegmentsStorage, SqlSegmentStorage, SqlSplitStorage, StorageError};
use serde::Deserialize;

/// What an import changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub stored: usize,
    pub removed: usize,
    pub change_number: i64,
}

/// Apply a `splitChanges` document: active splits are stored, archived ones
/// removed, and the store's change number set to `till`. A failure leaves
/// the store untouched.
pub fn import_split_changes(
    storage: &SqlSplitStorage,
    json: &str,
) -> Result<ImportSummary, StorageError> {
    let changes: SplitChanges = serde_json::from_str(json)?;
    let (active, archived): (Vec<Split>, Vec<Split>) = changes
        .splits
        .into_iter()
        .partition(|split| split.status == Status::Active);
    let archived: Vec<&str> = archived.iter().map(|split| split.name.as_str()).collect();

    let removed = storage.update(&active, &archived, changes.till)?;
    let summary = ImportSummary {
        stored: active.len(),
        removed,
        change_number: changes.till,
    };

    tracing::info!(
        stored = summary.stored,
        removed = summary.removed,
        change_number = changes.till,
        "imported split changes"
    );
    Ok(summary)
}

/// Apply a `segmentChanges` document to a full segment.
pub fn import_segment_changes(
    storage: &SqlSegmentStorage,
    json: &str,
) -> Result<ImportSummary, StorageError> {
    let changes: SegmentChanges = serde_json::from_str(json)?;
    storage.update(&changes.name, &changes.added, &changes.removed, Some(changes.till))?;

    tracing::info!(
        segment = %changes.name,
        added = changes.added.len(),
        removed = changes.removed.len(),
        change_number = changes.till,
        "imported segment changes"
    );
    Ok(ImportSummary {
        stored: changes.added.len(),
        removed: changes.removed.len(),
        change_number: changes.till,
    })
}

/// Replace the segments `traffic_key` belongs to.
pub fn import_my_segments(
    storage: &SqlMySegmentsStorage,
    traffic_key: &str,
    segment_names: &[String],
) -> Result<(), StorageError> {
    storage.put(traffic_key, segment_names)?;
    tracing::info!(traffic_key, count = segment_names.len(), "imported segment membership");
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MySegmentsResponse {
    my_segments: Vec<SegmentName>,
}

#[derive(Debug, Deserialize)]
struct SegmentName {
    name: String,
}

/// Replace the segments `traffic_key` belongs to from a `mySegments` document.
pub fn import_my_segments_json(
    storage: &SqlMySegmentsStorage,
    traffic_key: &str,
    json: &str,
) -> Result<Vec<String>, StorageError> {
    let response: MySegmentsResponse = serde_json::from_str(json)?;
    let names: Vec<String> = response.my_segments.into_iter().map(|s| s.name).collect();
    import_my_segments(storage, traffic_key, &names)?;
    Ok(names)
}
