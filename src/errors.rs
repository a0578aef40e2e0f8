//! Structured error types and codes for the split-testing engine
//! Provides detailed error information for callers and for rendered reports

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error payload for report consumers
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Additional error context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Engine error types with proper categorization
#[derive(Debug)]
pub enum ScenarioError {
    // Caller errors
    InvalidArgument(String),

    // Definition errors
    InvalidExperiment { experiment: String, reason: String },
    ExperimentNotFound(String),

    // Collaborator failures
    Storage(anyhow::Error),
    SerializationError(String),

    // Aggregation errors
    Consolidation(String),

    // Generic wrapper for external errors
    Internal(anyhow::Error),
}

impl ScenarioError {
    /// Wrap a storage adapter failure
    pub fn storage(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }

    /// Create an invalid experiment error
    pub fn invalid_experiment(experiment: &str, reason: impl Into<String>) -> Self {
        Self::InvalidExperiment {
            experiment: experiment.to_string(),
            reason: reason.into(),
        }
    }

    /// Get error code for caller identification
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::InvalidExperiment { .. } => "INVALID_EXPERIMENT",
            Self::ExperimentNotFound(_) => "EXPERIMENT_NOT_FOUND",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::SerializationError(_) => "SERIALIZATION_ERROR",
            Self::Consolidation(_) => "CONSOLIDATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the error was caused by caller input rather than a collaborator
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_)
                | Self::InvalidExperiment { .. }
                | Self::ExperimentNotFound(_)
        )
    }

    /// Get detailed error message
    pub fn message(&self) -> String {
        match self {
            Self::InvalidArgument(msg) => format!("Invalid argument: {msg}"),
            Self::InvalidExperiment { experiment, reason } => {
                format!("Invalid experiment '{experiment}': {reason}")
            }
            Self::ExperimentNotFound(name) => format!("Experiment not found: {name}"),
            Self::Storage(err) => format!("Storage error: {err:#}"),
            Self::SerializationError(msg) => format!("Serialization error: {msg}"),
            Self::Consolidation(msg) => format!("Consolidation error: {msg}"),
            Self::Internal(err) => format!("Internal error: {err}"),
        }
    }

    /// Convert to structured error response
    pub fn to_response(&self) -> ErrorResponse {
        let details = match self {
            Self::Storage(err) | Self::Internal(err) => {
                err.chain().nth(1).map(|cause| cause.to_string())
            }
            _ => None,
        };
        ErrorResponse {
            code: self.code().to_string(),
            message: self.message(),
            details,
        }
    }
}

impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ScenarioError {}

/// Convert from anyhow::Error to ScenarioError
impl From<anyhow::Error> for ScenarioError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<serde_json::Error> for ScenarioError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Helper trait to tag storage adapter results at the engine boundary
pub trait StorageResultExt<T> {
    fn map_storage_err(self) -> Result<T>;
}

impl<T> StorageResultExt<T> for anyhow::Result<T> {
    fn map_storage_err(self) -> Result<T> {
        self.map_err(ScenarioError::Storage)
    }
}

/// Type alias for Results using ScenarioError
pub type Result<T> = std::result::Result<T, ScenarioError>;
