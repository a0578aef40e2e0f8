//! Visitor identities
//!
//! An identity is the opaque key under which assignments are stored. How a
//! request maps to an identity (session cookie, account id, device id) is the
//! caller's business; the engine only needs stable equality.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::{Result, ScenarioError};

/// Maximum identity length accepted as a storage key
pub const MAX_IDENTITY_LEN: usize = 512;

/// Opaque visitor/session key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Validate and wrap an identity key
    ///
    /// Keys are trimmed; empty keys and keys longer than [`MAX_IDENTITY_LEN`]
    /// are rejected with `InvalidArgument`.
    pub fn new(key: impl AsRef<str>) -> Result<Self> {
        let key = key.as_ref().trim();
        if key.is_empty() {
            return Err(ScenarioError::InvalidArgument(
                "identity key must not be empty".to_string(),
            ));
        }
        if key.len() > MAX_IDENTITY_LEN {
            return Err(ScenarioError::InvalidArgument(format!(
                "identity key is {} bytes (max: {MAX_IDENTITY_LEN})",
                key.len()
            )));
        }
        Ok(Self(key.to_string()))
    }

    /// Issue a fresh random identity (UUID v4)
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
