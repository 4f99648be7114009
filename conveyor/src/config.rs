//! Engine configuration and execution profiles.

use crate::errors::EngineError;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};

/// Named execution profile a run must be submitted with.
///
/// The engine refuses to run with implicit defaults: callers always state
/// which profile a run executes under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionProfile(String);

impl ExecutionProfile {
    /// Creates a profile.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingProfile`] for an empty or
    /// whitespace-only name.
    pub fn new(name: impl Into<String>) -> Result<Self, EngineError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(EngineError::MissingProfile);
        }
        Ok(Self(name))
    }

    /// Returns the profile name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExecutionProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Engine-wide defaults applied where a step descriptor does not override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default step execution timeout in milliseconds.
    pub step_timeout_ms: u64,
    /// Default retry behavior.
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 60_000,
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default step timeout.
    #[must_use]
    pub fn with_step_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.step_timeout_ms = timeout_ms;
        self
    }

    /// Sets the default retry behavior.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_rejects_blank_names() {
        assert!(matches!(
            ExecutionProfile::new(""),
            Err(EngineError::MissingProfile)
        ));
        assert!(matches!(
            ExecutionProfile::new("   "),
            Err(EngineError::MissingProfile)
        ));
    }

    #[test]
    fn test_profile_name() {
        let profile = ExecutionProfile::new("prod-eu").unwrap();
        assert_eq!(profile.name(), "prod-eu");
        assert_eq!(profile.to_string(), "prod-eu");
    }

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.step_timeout_ms, 60_000);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .with_step_timeout_ms(5_000)
            .with_retry(RetryConfig::new().with_max_retries(1));

        assert_eq!(config.step_timeout_ms, 5_000);
        assert_eq!(config.retry.max_retries, 1);
    }
}
