//! Caller-facing API: the bound factory and what it hands out.

pub mod bound_client;
pub mod factory;
pub mod input_validator;
pub mod manager;
pub mod metadata;

pub use bound_client::{BoundClient, TreatmentWithConfig};
pub use factory::{build_factory, build_factory_with_sink, BoundFactory, FactoryError, TimeoutError};
pub use manager::{SplitManager, SplitView};
pub use metadata::SdkMetadata;
