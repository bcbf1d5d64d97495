//! Manager Configuration
//!
//! Timeouts and channel sizing, loadable from TOML.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Session manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Upper bound for a single profile read
    pub profile_load_timeout_ms: u64,
    /// Upper bound for sign-in, sign-out and profile writes
    pub operation_timeout_ms: u64,
    /// Buffer size of the broadcast event channel
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            profile_load_timeout_ms: 10_000,
            operation_timeout_ms: 15_000,
            event_capacity: 256,
        }
    }
}

impl ManagerConfig {
    /// Parse configuration from a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Reject values that would make the manager unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.profile_load_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "profile_load_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "operation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Set profile load timeout, rounded up to whole milliseconds
    pub fn with_profile_load_timeout(mut self, timeout: Duration) -> Self {
        self.profile_load_timeout_ms = ceil_millis(timeout);
        self
    }

    /// Set operation timeout, rounded up to whole milliseconds
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = ceil_millis(timeout);
        self
    }

    /// Set event channel capacity
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn profile_load_timeout(&self) -> Duration {
        Duration::from_millis(self.profile_load_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Whole milliseconds, never rounding a non-zero duration down to zero
fn ceil_millis(duration: Duration) -> u64 {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if duration > Duration::from_millis(millis) {
        millis.saturating_add(1)
    } else {
        millis
    }
}
