//! Single-shot human approval gate.
//!
//! The gate is a cooperative barrier between the fan-out stage and the rest
//! of the pipeline: the run suspends on [`ApprovalGate::wait_for_decision`]
//! holding no locks, until an external signal records a decision. A
//! decision is accepted exactly once; a second signal is a conflict, never
//! a silent overwrite.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

/// The outcome of an approval decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The reviewer approved; the pipeline continues.
    Approved,
    /// The reviewer rejected; the run terminates.
    Rejected,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// A recorded approval decision. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    /// The verdict.
    pub verdict: Verdict,
    /// Who decided.
    pub actor: String,
    /// Optional free-form reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the decision was recorded.
    pub decided_at: chrono::DateTime<chrono::Utc>,
}

/// Error returned when a second decision targets an already-decided gate.
#[derive(Debug, Clone, Error)]
#[error("approval already decided: {existing}")]
pub struct ApprovalConflict {
    /// The verdict that was already recorded.
    pub existing: Verdict,
}

/// One-time externally-signaled barrier.
#[derive(Default)]
pub struct ApprovalGate {
    decision: Mutex<Option<ApprovalDecision>>,
    notify: Notify,
}

impl ApprovalGate {
    /// Creates an undecided gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a decision exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalConflict`] if a decision was already recorded; the
    /// existing decision is left intact.
    pub fn record_decision(
        &self,
        verdict: Verdict,
        actor: impl Into<String>,
        reason: Option<String>,
    ) -> Result<ApprovalDecision, ApprovalConflict> {
        let mut slot = self.decision.lock();

        if let Some(existing) = slot.as_ref() {
            return Err(ApprovalConflict {
                existing: existing.verdict,
            });
        }

        let decision = ApprovalDecision {
            verdict,
            actor: actor.into(),
            reason,
            decided_at: chrono::Utc::now(),
        };
        *slot = Some(decision.clone());
        drop(slot);

        self.notify.notify_waiters();
        Ok(decision)
    }

    /// Returns the recorded decision, if any.
    #[must_use]
    pub fn decision(&self) -> Option<ApprovalDecision> {
        self.decision.lock().clone()
    }

    /// Returns true once a decision has been recorded.
    #[must_use]
    pub fn is_decided(&self) -> bool {
        self.decision.lock().is_some()
    }

    /// Suspends until a decision is recorded; no timeout.
    pub async fn wait_for_decision(&self) -> ApprovalDecision {
        loop {
            let notified = self.notify.notified();
            if let Some(decision) = self.decision() {
                return decision;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("decision", &self.decision())
            .finish()
    }
}
