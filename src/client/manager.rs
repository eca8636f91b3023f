//! Read-only view of stored flag definitions.

use crate::client::factory::FactoryCore;
use crate::models::Split;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Summary of one split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplitView {
    pub name: String,
    pub traffic_type: String,
    pub killed: bool,
    /// Treatments the split can serve, in first-seen order
    pub treatments: Vec<String>,
    pub change_number: i64,
    pub configs: HashMap<String, String>,
}

impl From<&Split> for SplitView {
    fn from(split: &Split) -> Self {
        let mut treatments: Vec<String> = Vec::new();
        for partition in split.conditions.iter().flat_map(|c| c.partitions.iter()) {
            if !treatments.contains(&partition.treatment) {
                treatments.push(partition.treatment.clone());
            }
        }
        Self {
            name: split.name.clone(),
            traffic_type: split.traffic_type_name.clone(),
            killed: split.killed,
            treatments,
            change_number: split.change_number,
            configs: split.configurations.clone().unwrap_or_default(),
        }
    }
}

/// Lists the splits a factory can evaluate.
#[derive(Clone)]
pub struct SplitManager {
    core: Arc<FactoryCore>,
}

impl SplitManager {
    pub(crate) fn new(core: Arc<FactoryCore>) -> Self {
        Self { core }
    }

    /// Names of all stored splits.
    pub fn split_names(&self) -> Vec<String> {
        if !self.check_usable("split_names") {
            return Vec::new();
        }
        self.core.splits.get_split_names().unwrap_or_else(|e| {
            tracing::error!(error = %e, "split_names: failed to read flag store");
            Vec::new()
        })
    }

    /// Summaries of all stored splits.
    pub fn splits(&self) -> Vec<SplitView> {
        if !self.check_usable("splits") {
            return Vec::new();
        }
        match self.core.splits.get_all_splits() {
            Ok(splits) => splits.iter().map(SplitView::from).collect(),
            Err(e) => {
                tracing::error!(error = %e, "splits: failed to read flag store");
                Vec::new()
            }
        }
    }

    /// Summary of one split.
    pub fn split(&self, name: &str) -> Option<SplitView> {
        if !self.check_usable("split") {
            return None;
        }
        match self.core.splits.get(name) {
            Ok(split) => split.as_ref().map(SplitView::from),
            Err(e) => {
                tracing::error!(error = %e, "split: failed to read flag store");
                None
            }
        }
    }

    fn check_usable(&self, method: &str) -> bool {
        if self.core.is_destroyed() {
            tracing::error!(method, "client has already been destroyed - no calls possible");
            return false;
        }
        if !self.core.is_ready() {
            tracing::warn!(method, "the SDK is not ready, results may be incorrect");
        }
        true
    }
}
