//! Error types for the conveyor orchestration core.
//!
//! The taxonomy separates what step logic raises ([`StepError`]) from what
//! the orchestration layer surfaces ([`EngineError`]). Classification of a
//! step failure into a retry category is a pure function of the error value.

use crate::core::{RunStatus, StepId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Retry category assigned to every step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Transient failure; eligible for retry within the budget.
    Retryable,
    /// Structural failure; retrying cannot help.
    NonRetryable,
    /// The step ran but its output failed a correctness check.
    ValidationFailure,
}

impl ErrorCategory {
    /// Returns true if the category permits another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retryable => write!(f, "RETRYABLE"),
            Self::NonRetryable => write!(f, "NON_RETRYABLE"),
            Self::ValidationFailure => write!(f, "VALIDATION_FAILURE"),
        }
    }
}

/// Error raised by step business logic or by the executor around it.
///
/// Each variant carries enough detail to produce a useful [`ErrorRecord`];
/// the variant alone determines the retry category.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum StepError {
    /// The step exceeded its execution timeout.
    #[error("step timed out after {timeout_ms}ms")]
    Timeout {
        /// The enforced timeout in milliseconds.
        timeout_ms: u64,
    },

    /// An upstream service rejected the call due to rate limiting.
    #[error("rate limited: {message}")]
    RateLimited {
        /// Details from the upstream service.
        message: String,
    },

    /// A transient I/O failure (network blip, connection reset).
    #[error("transient I/O failure: {message}")]
    TransientIo {
        /// Details of the failure.
        message: String,
    },

    /// The step's configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What was wrong with the configuration.
        message: String,
    },

    /// A required upstream artifact is missing.
    #[error("missing upstream artifact: {path}")]
    MissingArtifact {
        /// Logical path of the missing artifact.
        path: String,
    },

    /// The step was not authorized to perform its work.
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Details of the authorization failure.
        message: String,
    },

    /// The step produced output that failed a correctness check.
    #[error("output failed validation: {message}")]
    OutputValidation {
        /// Why the output was rejected.
        message: String,
    },

    /// Artifact or checkpoint storage failed in a non-transient way.
    #[error("storage failure: {message}")]
    Storage {
        /// Details of the storage failure.
        message: String,
    },

    /// The step declared its partial work unsafe to retry.
    #[error("{message}")]
    Fatal {
        /// Why the step must not be retried.
        message: String,
    },

    /// An unclassified failure; treated as transient.
    #[error("{message}")]
    Other {
        /// Details of the failure.
        message: String,
    },
}

impl StepError {
    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates a rate-limited error.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
        }
    }

    /// Creates a transient I/O error.
    #[must_use]
    pub fn transient_io(message: impl Into<String>) -> Self {
        Self::TransientIo {
            message: message.into(),
        }
    }

    /// Creates an invalid-configuration error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a missing-artifact error.
    #[must_use]
    pub fn missing_artifact(path: impl Into<String>) -> Self {
        Self::MissingArtifact { path: path.into() }
    }

    /// Creates an output-validation error.
    #[must_use]
    pub fn output_validation(message: impl Into<String>) -> Self {
        Self::OutputValidation {
            message: message.into(),
        }
    }

    /// Creates a fatal, never-retry error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Creates an unclassified error.
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Classifies this error into a retry category.
    ///
    /// This is the error classifier: a pure mapping from the raised failure
    /// to `RETRYABLE`, `NON_RETRYABLE`, or `VALIDATION_FAILURE`.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::TransientIo { .. }
            | Self::Other { .. } => ErrorCategory::Retryable,
            Self::InvalidConfig { .. }
            | Self::MissingArtifact { .. }
            | Self::Unauthorized { .. }
            | Self::Storage { .. }
            | Self::Fatal { .. } => ErrorCategory::NonRetryable,
            Self::OutputValidation { .. } => ErrorCategory::ValidationFailure,
        }
    }

    /// Returns structured details for the error record.
    #[must_use]
    pub fn details(&self) -> serde_json::Value {
        match self {
            Self::Timeout { timeout_ms } => {
                serde_json::json!({ "kind": "timeout", "timeout_ms": timeout_ms })
            }
            Self::RateLimited { message } => {
                serde_json::json!({ "kind": "rate_limited", "message": message })
            }
            Self::TransientIo { message } => {
                serde_json::json!({ "kind": "transient_io", "message": message })
            }
            Self::InvalidConfig { message } => {
                serde_json::json!({ "kind": "invalid_config", "message": message })
            }
            Self::MissingArtifact { path } => {
                serde_json::json!({ "kind": "missing_artifact", "path": path })
            }
            Self::Unauthorized { message } => {
                serde_json::json!({ "kind": "unauthorized", "message": message })
            }
            Self::OutputValidation { message } => {
                serde_json::json!({ "kind": "output_validation", "message": message })
            }
            Self::Storage { message } => {
                serde_json::json!({ "kind": "storage", "message": message })
            }
            Self::Fatal { message } => serde_json::json!({ "kind": "fatal", "message": message }),
            Self::Other { message } => serde_json::json!({ "kind": "other", "message": message }),
        }
    }
}

/// Immutable record of one failed attempt.
///
/// Each retry that also fails produces its own record; records are never
/// mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// The retry category assigned by the classifier.
    pub category: ErrorCategory,
    /// Human-readable failure message.
    pub message: String,
    /// Structured failure details.
    pub details: serde_json::Value,
    /// The attempt number this record belongs to.
    pub attempt: u32,
    /// When the failure was recorded.
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

impl ErrorRecord {
    /// Builds a record from a raised step error.
    #[must_use]
    pub fn from_step_error(error: &StepError, attempt: u32) -> Self {
        Self {
            category: error.category(),
            message: error.to_string(),
            details: error.details(),
            attempt,
            recorded_at: chrono::Utc::now(),
        }
    }
}

/// Terminal failure of a single step, after classification and retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailure {
    /// The failing step.
    pub step_id: StepId,
    /// Total attempts consumed, including the first.
    pub attempts: u32,
    /// Category of the final failure.
    pub category: ErrorCategory,
    /// Message of the final failure.
    pub message: String,
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "step '{}' failed after {} attempt(s) [{}]: {}",
            self.step_id, self.attempts, self.category, self.message
        )
    }
}

/// Aggregated failure of a fan-out group.
///
/// Lists every member that exhausted its own retry budget; members that
/// succeeded are not included and their artifacts remain valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupFailure {
    /// The failed members.
    pub members: Vec<StepFailure>,
}

impl GroupFailure {
    /// Wraps a single step failure.
    #[must_use]
    pub fn single(failure: StepFailure) -> Self {
        Self {
            members: vec![failure],
        }
    }
}

impl std::fmt::Display for GroupFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fan-out group failed: ")?;
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{member}")?;
        }
        Ok(())
    }
}

/// The orchestration-level error type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The run id is unknown.
    #[error("run not found: {run_id}")]
    RunNotFound {
        /// The unknown run id.
        run_id: Uuid,
    },

    /// The step id does not appear in the run's topology.
    #[error("step not found in topology: {step_id}")]
    StepNotFound {
        /// The unknown step id.
        step_id: StepId,
    },

    /// No step implementation is registered for the id.
    #[error("no step implementation registered for '{step_id}'")]
    UnknownStep {
        /// The unresolved step id.
        step_id: StepId,
    },

    /// A run was submitted without an execution profile.
    #[error("execution profile is required and was not provided")]
    MissingProfile,

    /// A status transition was attempted from the wrong state.
    #[error("invalid transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        /// The run being transitioned.
        run_id: Uuid,
        /// The status the run was expected to be in.
        from: RunStatus,
        /// The requested target status.
        to: RunStatus,
    },

    /// An attempt was started while a prior attempt was still running.
    #[error("an attempt for step '{step_id}' is already running")]
    AttemptInProgress {
        /// The contended step.
        step_id: StepId,
    },

    /// A second approval decision was delivered for the same run.
    #[error("approval for run {run_id} was already decided")]
    DecisionConflict {
        /// The already-decided run.
        run_id: Uuid,
    },

    /// An approval decision arrived while the run was not waiting for one.
    #[error("run {run_id} is not awaiting approval (status: {status})")]
    NotAwaitingDecision {
        /// The targeted run.
        run_id: Uuid,
        /// The run's current status.
        status: RunStatus,
    },

    /// A manual step retry was requested in an ineligible state.
    #[error("retry of step '{step_id}' not allowed: {reason}")]
    RetryNotAllowed {
        /// The targeted step.
        step_id: StepId,
        /// Why the retry was refused.
        reason: String,
    },

    /// A resume could not be satisfied from the ancestor run's artifacts.
    #[error("cannot resume from run {run_id}: {reason}")]
    CannotResume {
        /// The ancestor run.
        run_id: Uuid,
        /// Why the resume was refused.
        reason: String,
    },

    /// A step reached its terminal failed state.
    #[error("{0}")]
    StepFailed(StepFailure),

    /// A fan-out group reached its terminal failed state.
    #[error("{0}")]
    GroupFailed(GroupFailure),

    /// The run was cancelled.
    #[error("run {run_id} cancelled: {reason}")]
    Cancelled {
        /// The cancelled run.
        run_id: Uuid,
        /// The cancellation reason.
        reason: String,
    },

    /// The step topology is malformed.
    #[error("{0}")]
    Topology(#[from] crate::core::TopologyError),

    /// Artifact storage failed.
    #[error("{0}")]
    Artifact(#[from] crate::artifact::ArtifactError),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
