//! Scenario Library
//!
//! Split testing for applications that want one call to get a visitor's
//! treatment and one call to record a conversion.
//!
//! # Key Features
//! - Weighted random assignment, sticky per identity
//! - Multivariate experiments composed from declarative input
//! - Batched consolidation of raw results with sibling joins
//! - Conversion rate, standard error and z-score per treatment
//!
//! # Storage
//! - `InMemoryStorage` for tests and embedding
//! - RocksDB embedded storage (no external database)

pub mod analyzer;
pub mod config;
pub mod consolidator;
pub mod constants;
pub mod errors;
pub mod experiment;
pub mod identity;
pub mod manager;
pub mod metrics;
pub mod resolver;
pub mod storage;
pub mod tracing_setup;

pub use analyzer::{AnalysisRecord, AnalysisReport, ExperimentAnalyzer, TreatmentAnalysis};
pub use config::{ScenarioConfig, TableNames, WriteMode};
pub use consolidator::{CounterTable, ExperimentCounters, TreatmentCounter};
pub use errors::{Result, ScenarioError};
pub use experiment::{Experiment, Treatment, Weighting};
pub use identity::Identity;
pub use manager::ScenarioManager;
pub use resolver::Assignment;
pub use storage::{InMemoryStorage, RocksStorage, StorageAdapter};

// Re-export dependencies to ensure tests/benchmarks use the same version
pub use chrono;
pub use serde_json;
