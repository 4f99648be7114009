//! Step attempts and the append-only attempt ledger.

use crate::artifact::ArtifactRef;
use crate::core::{AttemptStatus, StepId};
use crate::errors::{EngineError, ErrorRecord};
use crate::fingerprint::Fingerprint;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One invocation of one step within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAttempt {
    /// The step being attempted.
    pub step_id: StepId,
    /// Attempt number, starting at 1.
    pub number: u32,
    /// Current status.
    pub status: AttemptStatus,
    /// Digest of the inputs this attempt consumed.
    pub fingerprint: Fingerprint,
    /// The artifact produced, when the attempt succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    /// The failure record, when the attempt failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    /// When the attempt started.
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// When the attempt reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl StepAttempt {
    fn running(step_id: StepId, number: u32, fingerprint: Fingerprint) -> Self {
        Self {
            step_id,
            number,
            status: AttemptStatus::Running,
            fingerprint,
            artifact: None,
            error: None,
            started_at: chrono::Utc::now(),
            finished_at: None,
        }
    }
}

/// Append-only log of attempts, keyed by (run, step).
///
/// Enforces the attempt invariants: numbers are monotonic from 1, and a new
/// attempt may only begin once the previous one is terminal.
#[derive(Debug, Default)]
pub struct AttemptLedger {
    attempts: DashMap<(Uuid, StepId), Vec<StepAttempt>>,
}

impl AttemptLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins a new attempt and returns its number.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AttemptInProgress`] if the latest attempt for
    /// the (run, step) pair has not reached a terminal status.
    pub fn begin(
        &self,
        run: Uuid,
        step_id: &StepId,
        fingerprint: Fingerprint,
    ) -> Result<u32, EngineError> {
        let mut entry = self
            .attempts
            .entry((run, step_id.clone()))
            .or_default();

        if let Some(last) = entry.last() {
            if !last.status.is_terminal() {
                return Err(EngineError::AttemptInProgress {
                    step_id: step_id.clone(),
                });
            }
        }

        let number = entry.len() as u32 + 1;
        entry.push(StepAttempt::running(step_id.clone(), number, fingerprint));
        Ok(number)
    }

    /// Marks an attempt succeeded and records the artifact it produced.
    pub fn succeed(&self, run: Uuid, step_id: &StepId, number: u32, artifact: ArtifactRef) {
        self.finish(run, step_id, number, |attempt| {
            attempt.status = AttemptStatus::Succeeded;
            attempt.artifact = Some(artifact);
        });
    }

    /// Marks an attempt failed and attaches its error record.
    pub fn fail(&self, run: Uuid, step_id: &StepId, number: u32, record: ErrorRecord) {
        self.finish(run, step_id, number, |attempt| {
            attempt.status = AttemptStatus::Failed;
            attempt.error = Some(record);
        });
    }

    fn finish<F>(&self, run: Uuid, step_id: &StepId, number: u32, apply: F)
    where
        F: FnOnce(&mut StepAttempt),
    {
        if let Some(mut entry) = self.attempts.get_mut(&(run, step_id.clone())) {
            if let Some(attempt) = entry.iter_mut().find(|a| a.number == number) {
                apply(attempt);
                attempt.finished_at = Some(chrono::Utc::now());
            }
        }
    }

    /// Returns the latest attempt for a (run, step).
    #[must_use]
    pub fn latest(&self, run: Uuid, step_id: &StepId) -> Option<StepAttempt> {
        self.attempts
            .get(&(run, step_id.clone()))
            .and_then(|entry| entry.last().cloned())
    }

    /// Returns the full attempt history for a (run, step).
    #[must_use]
    pub fn history(&self, run: Uuid, step_id: &StepId) -> Vec<StepAttempt> {
        self.attempts
            .get(&(run, step_id.clone()))
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// Returns the number of attempts made for a (run, step).
    #[must_use]
    pub fn attempt_count(&self, run: Uuid, step_id: &StepId) -> u32 {
        self.attempts
            .get(&(run, step_id.clone()))
            .map(|entry| entry.len() as u32)
            .unwrap_or(0)
    }

    /// Finds a succeeded attempt whose input fingerprint matches.
    ///
    /// This is the idempotency lookup: a hit means the step already ran to
    /// completion against semantically identical inputs.
    #[must_use]
    pub fn find_succeeded(
        &self,
        run: Uuid,
        step_id: &StepId,
        fingerprint: &Fingerprint,
    ) -> Option<StepAttempt> {
        self.attempts.get(&(run, step_id.clone())).and_then(|entry| {
            entry
                .iter()
                .find(|a| a.status == AttemptStatus::Succeeded && &a.fingerprint == fingerprint)
                .cloned()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactPath;
    use crate::errors::StepError;
    use crate::fingerprint::digest_bytes;

    fn fp() -> Fingerprint {
        digest_bytes(b"inputs")
    }

    fn artifact(run: Uuid, step: &str) -> ArtifactRef {
        ArtifactRef {
            path: ArtifactPath::new("t", run, step),
            digest: digest_bytes(b"output"),
            content_type: "application/json".to_string(),
        }
    }

    #[test]
    fn test_begin_numbers_are_monotonic() {
        let ledger = AttemptLedger::new();
        let run = Uuid::new_v4();
        let step = StepId::new("a");

        let first = ledger.begin(run, &step, fp()).unwrap();
        assert_eq!(first, 1);
        ledger.fail(
            run,
            &step,
            first,
            ErrorRecord::from_step_error(&StepError::timeout(10), first),
        );

        let second = ledger.begin(run, &step, fp()).unwrap();
        assert_eq!(second, 2);
    }

    #[test]
    fn test_begin_rejects_concurrent_attempt() {
        let ledger = AttemptLedger::new();
        let run = Uuid::new_v4();
        let step = StepId::new("a");

        ledger.begin(run, &step, fp()).unwrap();
        let result = ledger.begin(run, &step, fp());
        assert!(matches!(result, Err(EngineError::AttemptInProgress { .. })));
    }

    #[test]
    fn test_succeed_records_artifact() {
        let ledger = AttemptLedger::new();
        let run = Uuid::new_v4();
        let step = StepId::new("a");

        let number = ledger.begin(run, &step, fp()).unwrap();
        ledger.succeed(run, &step, number, artifact(run, "a"));

        let latest = ledger.latest(run, &step).unwrap();
        assert_eq!(latest.status, AttemptStatus::Succeeded);
        assert!(latest.artifact.is_some());
        assert!(latest.finished_at.is_some());
    }

    #[test]
    fn test_find_succeeded_matches_fingerprint() {
        let ledger = AttemptLedger::new();
        let run = Uuid::new_v4();
        let step = StepId::new("a");

        let number = ledger.begin(run, &step, fp()).unwrap();
        ledger.succeed(run, &step, number, artifact(run, "a"));

        assert!(ledger.find_succeeded(run, &step, &fp()).is_some());
        assert!(ledger
            .find_succeeded(run, &step, &digest_bytes(b"different"))
            .is_none());
    }

    #[test]
    fn test_failed_attempt_keeps_error_record() {
        let ledger = AttemptLedger::new();
        let run = Uuid::new_v4();
        let step = StepId::new("a");

        let number = ledger.begin(run, &step, fp()).unwrap();
        ledger.fail(
            run,
            &step,
            number,
            ErrorRecord::from_step_error(&StepError::rate_limited("429"), number),
        );

        let history = ledger.history(run, &step);
        assert_eq!(history.len(), 1);
        let record = history[0].error.as_ref().unwrap();
        assert_eq!(record.attempt, 1);
        assert!(record.message.contains("429"));
    }

    #[test]
    fn test_attempt_count() {
        let ledger = AttemptLedger::new();
        let run = Uuid::new_v4();
        let step = StepId::new("a");

        assert_eq!(ledger.attempt_count(run, &step), 0);

        for _ in 0..3 {
            let n = ledger.begin(run, &step, fp()).unwrap();
            ledger.fail(
                run,
                &step,
                n,
                ErrorRecord::from_step_error(&StepError::timeout(1), n),
            );
        }

        assert_eq!(ledger.attempt_count(run, &step), 3);
    }
}
