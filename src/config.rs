//! Configuration management for Scenario
//!
//! All configurable parameters in one place with environment variable overrides.
//! Sensible defaults, configurable in production.

use std::env;
use std::path::PathBuf;
use tracing::info;

use crate::constants::{DEFAULT_CONTROL_NAME, DEFAULT_RESULTS_BATCH_SIZE, MAX_RESULTS_BATCH_SIZE};

/// Names of the storage tables (key spaces for the embedded store)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    /// Experiment definitions (default: experiments)
    pub experiments: String,
    /// Treatments per experiment (default: treatments)
    pub treatments: String,
    /// Identity to treatment assignments with completion flag (default: users_treatments)
    pub users_treatments: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            experiments: "experiments".to_string(),
            treatments: "treatments".to_string(),
            users_treatments: "users_treatments".to_string(),
        }
    }
}

impl TableNames {
    pub fn from_env() -> Self {
        let mut tables = Self::default();
        if let Ok(val) = env::var("SCENARIO_TABLE_EXPERIMENTS") {
            if !val.trim().is_empty() {
                tables.experiments = val.trim().to_string();
            }
        }
        if let Ok(val) = env::var("SCENARIO_TABLE_TREATMENTS") {
            if !val.trim().is_empty() {
                tables.treatments = val.trim().to_string();
            }
        }
        if let Ok(val) = env::var("SCENARIO_TABLE_USERS_TREATMENTS") {
            if !val.trim().is_empty() {
                tables.users_treatments = val.trim().to_string();
            }
        }
        tables
    }

    /// Table names must be distinct and must not contain the key separator
    pub fn is_valid(&self) -> bool {
        let names = [&self.experiments, &self.treatments, &self.users_treatments];
        names.iter().all(|n| !n.is_empty() && !n.contains(':'))
            && self.experiments != self.treatments
            && self.experiments != self.users_treatments
            && self.treatments != self.users_treatments
    }
}

/// Write mode for storage operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// fsync on every write: durable across power loss, 2-10ms per write
    Sync,
    /// Buffered in the OS page cache: survives process crashes, <1ms per write
    #[default]
    Async,
}

/// Engine configuration loaded from environment with defaults
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    /// Storage path for RocksDB (default: ./scenario_data)
    pub storage_path: PathBuf,

    /// Raw results fetched per storage page during consolidation (default: 1000)
    pub results_batch_size: usize,

    /// Control treatment for experiments created on first use (default: "default")
    pub control_name: String,

    /// Create unknown experiments on first lookup (default: true)
    pub create_missing_experiments: bool,

    /// Storage table names
    pub tables: TableNames,

    /// Storage write durability
    pub write_mode: WriteMode,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./scenario_data"),
            results_batch_size: DEFAULT_RESULTS_BATCH_SIZE,
            control_name: DEFAULT_CONTROL_NAME.to_string(),
            create_missing_experiments: true,
            tables: TableNames::default(),
            write_mode: WriteMode::Async,
        }
    }
}

impl ScenarioConfig {
    /// Load configuration from environment variables with defaults
    #[allow(clippy::field_reassign_with_default)] // Environment overrides require mutable config
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("SCENARIO_STORAGE_PATH") {
            config.storage_path = PathBuf::from(val);
        }

        if let Ok(val) = env::var("SCENARIO_RESULTS_BATCH") {
            if let Ok(n) = val.parse::<usize>() {
                config.results_batch_size = n.clamp(1, MAX_RESULTS_BATCH_SIZE);
            }
        }

        if let Ok(val) = env::var("SCENARIO_CONTROL_NAME") {
            if !val.trim().is_empty() {
                config.control_name = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("SCENARIO_CREATE_MISSING") {
            config.create_missing_experiments = val.to_lowercase() == "true" || val == "1";
        }

        config.tables = TableNames::from_env();
        if !config.tables.is_valid() {
            tracing::warn!(
                "Invalid SCENARIO_TABLE_* settings {:?}, falling back to default table names",
                config.tables
            );
            config.tables = TableNames::default();
        }

        if let Ok(mode) = env::var("SCENARIO_WRITE_MODE") {
            config.write_mode = if mode.to_lowercase() == "sync" {
                WriteMode::Sync
            } else {
                WriteMode::Async
            };
        }

        config
    }

    /// Log the current configuration
    pub fn log(&self) {
        info!("Configuration:");
        info!("   Storage: {:?} ({:?} writes)", self.storage_path, self.write_mode);
        info!("   Results batch size: {}", self.results_batch_size);
        info!("   Control treatment: {}", self.control_name);
        info!(
            "   Missing experiments: {}",
            if self.create_missing_experiments {
                "created on first use"
            } else {
                "rejected"
            }
        );
        info!(
            "   Tables: {} / {} / {}",
            self.tables.experiments, self.tables.treatments, self.tables.users_treatments
        );
    }
}

/// Environment variable documentation
pub fn print_env_help() {
    println!("Scenario Configuration Environment Variables:");
    println!();
    println!("  SCENARIO_STORAGE_PATH  - Storage directory (default: ./scenario_data)");
    println!("  SCENARIO_RESULTS_BATCH - Results per page in consolidation (default: 1000)");
    println!("  SCENARIO_CONTROL_NAME  - Control treatment for new experiments (default: default)");
    println!("  SCENARIO_CREATE_MISSING - Create unknown experiments on use (default: true)");
    println!("  SCENARIO_WRITE_MODE    - 'sync' for fsync on every write (default: async)");
    println!();
    println!("Storage Tables:");
    println!("  SCENARIO_TABLE_EXPERIMENTS       - Experiments table (default: experiments)");
    println!("  SCENARIO_TABLE_TREATMENTS        - Treatments table (default: treatments)");
    println!("  SCENARIO_TABLE_USERS_TREATMENTS  - Assignments table (default: users_treatments)");
    println!();
    println!("  RUST_LOG               - Log level (e.g., info, debug, trace)");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ScenarioConfig::default();
        assert_eq!(config.results_batch_size, 1000);
        assert_eq!(config.control_name, "default");
        assert!(config.create_missing_experiments);
        assert_eq!(config.tables.users_treatments, "users_treatments");
        assert_eq!(config.write_mode, WriteMode::Async);
    }

    #[test]
    fn test_env_override() {
        env::set_var("SCENARIO_RESULTS_BATCH", "250");
        env::set_var("SCENARIO_TABLE_TREATMENTS", "ab_treatments");
        env::set_var("SCENARIO_CREATE_MISSING", "false");

        let config = ScenarioConfig::from_env();
        assert_eq!(config.results_batch_size, 250);
        assert_eq!(config.tables.treatments, "ab_treatments");
        assert!(!config.create_missing_experiments);

        env::remove_var("SCENARIO_RESULTS_BATCH");
        env::remove_var("SCENARIO_TABLE_TREATMENTS");
        env::remove_var("SCENARIO_CREATE_MISSING");
    }

    #[test]
    fn test_table_name_validation() {
        assert!(TableNames::default().is_valid());
        let clash = TableNames {
            treatments: "experiments".to_string(),
            ..Default::default()
        };
        assert!(!clash.is_valid());
        let bad = TableNames {
            experiments: "a:b".to_string(),
            ..Default::default()
        };
        assert!(!bad.is_valid());
    }
}
