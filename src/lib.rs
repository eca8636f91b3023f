//! Split client-side SDK - feature flags for a single end user.
//!
//! A [`BoundFactory`] is built for exactly one traffic key. Its client takes
//! no key argument, so it cannot evaluate flags for anyone else, which makes
//! it safe to hand to untrusted code. Flag definitions come from a local
//! `SQLite` store filled through [`import`] rather than from the backend.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       BoundFactory                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐       │
//! │  │ BoundClient │──▶│   Engine    │──▶│  SQL store  │       │
//! │  │ (one key)   │   │ (evaluate)  │   │ (splits)    │       │
//! │  └─────────────┘   └─────────────┘   └─────────────┘       │
//! │         │                                    ▲              │
//! │         ▼                                    │              │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐       │
//! │  │  Recorder   │──▶│  Flusher    │   │  Readiness  │       │
//! │  │(impressions)│   │ (thread)    │   │  watcher    │       │
//! │  └─────────────┘   └─────────────┘   └─────────────┘       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use split_client_side::{build_factory, Config};
//! use std::time::Duration;
//!
//! let config = Config::with_sql_url("sqlite:///split.sqlite");
//! let factory = build_factory("YOUR_API_KEY", config, "user-42").expect("factory");
//!
//! if factory.block_until_ready(Duration::from_secs(5)).is_err() {
//!     // Still usable; evaluations return "control" until definitions arrive.
//! }
//!
//! let treatment = factory.client().get_treatment("new_checkout", None);
//! ```

pub mod client;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod import;
pub mod models;
pub mod recorder;
pub mod storage;
pub mod tasks;

// Re-export key types at crate root for convenience
pub use client::{
    build_factory, build_factory_with_sink, BoundClient, BoundFactory, FactoryError, SplitManager,
    SplitView, TimeoutError, TreatmentWithConfig,
};
pub use config::{Config, ConfigError, ImpressionsMode};
pub use engine::{Attributes, CONTROL};
pub use recorder::{ImpressionData, ImpressionListener};
pub use storage::StorageError;

// Gateway re-exports (when enabled)
#[cfg(feature = "gateway")]
pub use gateway::{BlockingGatewayClient, GatewayClient};
pub use gateway::{GatewayConfig, GatewayError};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
