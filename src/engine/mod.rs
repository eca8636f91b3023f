//! Flag evaluation engine.
//!
//! The engine is storage-agnostic: it reads definitions and segment
//! membership through [`EvaluationContext`], which the SQL storages
//! implement for the client.

pub mod evaluator;
pub mod hashing;
pub mod matchers;

use crate::models::Split;
use crate::storage::StorageError;
use std::collections::HashMap;
use thiserror::Error;

pub use evaluator::{EvaluationResult, Evaluator};

/// Treatment served whenever a defined outcome cannot be determined.
pub const CONTROL: &str = "control";

/// Attributes supplied with an evaluation.
pub type Attributes = HashMap<String, serde_json::Value>;

/// Read access the engine needs while evaluating.
pub trait EvaluationContext {
    /// Look up a split definition by name.
    fn split(&self, name: &str) -> Result<Option<Split>, StorageError>;

    /// Whether `key` belongs to the named segment.
    fn segment_contains(&self, segment: &str, key: &str) -> Result<bool, StorageError>;
}

/// Failures that abort an evaluation.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("storage error during evaluation: {0}")]
    Storage(#[from] StorageError),
    #[error("split dependency chain deeper than {0} levels")]
    DependencyTooDeep(usize),
}
