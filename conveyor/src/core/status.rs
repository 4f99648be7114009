//! Run and attempt status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The overall status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run accepted, not yet started.
    Pending,
    /// Run is executing steps.
    Running,
    /// Run is suspended at the approval gate.
    PausedForApproval,
    /// Run finished successfully.
    Completed,
    /// Run failed terminally.
    Failed,
    /// Run was cancelled by an operator.
    Cancelled,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::PausedForApproval => write!(f, "paused_for_approval"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl RunStatus {
    /// Returns true if the status is terminal; terminal statuses are absorbing.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the run is actively executing or suspended mid-flight.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::PausedForApproval)
    }
}

/// The status of a single step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Attempt created, not yet started.
    Pending,
    /// Attempt is executing.
    Running,
    /// Attempt finished successfully.
    Succeeded,
    /// Attempt failed.
    Failed,
}

impl Default for AttemptStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl AttemptStatus {
    /// Returns true if the attempt has reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_display() {
        assert_eq!(RunStatus::Pending.to_string(), "pending");
        assert_eq!(
            RunStatus::PausedForApproval.to_string(),
            "paused_for_approval"
        );
        assert_eq!(RunStatus::Completed.to_string(), "completed");
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::PausedForApproval.is_terminal());
    }

    #[test]
    fn test_run_status_active() {
        assert!(RunStatus::Running.is_active());
        assert!(RunStatus::PausedForApproval.is_active());
        assert!(!RunStatus::Pending.is_active());
        assert!(!RunStatus::Failed.is_active());
    }

    #[test]
    fn test_attempt_status_terminal() {
        assert!(AttemptStatus::Succeeded.is_terminal());
        assert!(AttemptStatus::Failed.is_terminal());
        assert!(!AttemptStatus::Pending.is_terminal());
        assert!(!AttemptStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_serialize() {
        let json = serde_json::to_string(&RunStatus::PausedForApproval).unwrap();
        assert_eq!(json, r#""paused_for_approval""#);

        let json = serde_json::to_string(&AttemptStatus::Succeeded).unwrap();
        assert_eq!(json, r#""succeeded""#);
    }
}
