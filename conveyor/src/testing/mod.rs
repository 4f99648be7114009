//! Step doubles and fixtures for exercising the orchestration core.

use crate::core::{StageNode, StepDescriptor, StepId, Topology};
use crate::errors::StepError;
use crate::executor::{Step, StepContext, StepInputs, StepOutput};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// A step that returns a fixed JSON payload and counts invocations.
#[derive(Debug)]
pub struct RecordingStep {
    id: StepId,
    payload: Value,
    calls: AtomicU32,
}

impl RecordingStep {
    /// Creates a recording step.
    #[must_use]
    pub fn new(id: impl Into<StepId>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
            calls: AtomicU32::new(0),
        }
    }

    /// Returns how many times the business logic ran.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Step for RecordingStep {
    fn id(&self) -> &StepId {
        &self.id
    }

    async fn execute(
        &self,
        _ctx: &StepContext,
        _inputs: &StepInputs,
    ) -> Result<StepOutput, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        StepOutput::json(&self.payload)
    }
}

/// A step that fails a fixed number of times, then succeeds.
#[derive(Debug)]
pub struct FlakyStep {
    id: StepId,
    failures_before_success: u32,
    calls: AtomicU32,
    payload: Value,
}

impl FlakyStep {
    /// Creates a step that fails `failures_before_success` times with a
    /// transient error before succeeding.
    #[must_use]
    pub fn new(id: impl Into<StepId>, failures_before_success: u32, payload: Value) -> Self {
        Self {
            id: id.into(),
            failures_before_success,
            calls: AtomicU32::new(0),
            payload,
        }
    }

    /// Returns how many times the business logic ran.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Step for FlakyStep {
    fn id(&self) -> &StepId {
        &self.id
    }

    async fn execute(
        &self,
        _ctx: &StepContext,
        _inputs: &StepInputs,
    ) -> Result<StepOutput, StepError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures_before_success {
            return Err(StepError::transient_io(format!(
                "simulated transient failure on call {call}"
            )));
        }
        StepOutput::json(&self.payload)
    }
}

/// A step that always fails with a chosen error.
#[derive(Debug)]
pub struct FailingStep {
    id: StepId,
    error: StepError,
    calls: AtomicU32,
}

impl FailingStep {
    /// Creates an always-failing step.
    #[must_use]
    pub fn new(id: impl Into<StepId>, error: StepError) -> Self {
        Self {
            id: id.into(),
            error,
            calls: AtomicU32::new(0),
        }
    }

    /// Returns how many times the business logic ran.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Step for FailingStep {
    fn id(&self) -> &StepId {
        &self.id
    }

    async fn execute(
        &self,
        _ctx: &StepContext,
        _inputs: &StepInputs,
    ) -> Result<StepOutput, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// A step that sleeps, for exercising timeout enforcement.
#[derive(Debug)]
pub struct SlowStep {
    id: StepId,
    delay: Duration,
}

impl SlowStep {
    /// Creates a step that sleeps for `delay` before succeeding.
    #[must_use]
    pub fn new(id: impl Into<StepId>, delay: Duration) -> Self {
        Self {
            id: id.into(),
            delay,
        }
    }
}

#[async_trait]
impl Step for SlowStep {
    fn id(&self) -> &StepId {
        &self.id
    }

    async fn execute(
        &self,
        _ctx: &StepContext,
        _inputs: &StepInputs,
    ) -> Result<StepOutput, StepError> {
        tokio::time::sleep(self.delay).await;
        StepOutput::json(&json!({"slept_ms": self.delay.as_millis() as u64}))
    }
}

/// A step that processes items one at a time, checkpointing after each.
///
/// Optionally fails once with a transient error when it reaches a chosen
/// item, so tests can observe a retried attempt resuming from the
/// checkpoint instead of restarting from zero.
#[derive(Debug)]
pub struct BatchStep {
    id: StepId,
    total: u64,
    fail_once_at: Option<u64>,
    failed: AtomicBool,
    processed: Mutex<Vec<u64>>,
}

impl BatchStep {
    /// Creates a batch step over `total` items.
    #[must_use]
    pub fn new(id: impl Into<StepId>, total: u64) -> Self {
        Self {
            id: id.into(),
            total,
            fail_once_at: None,
            failed: AtomicBool::new(false),
            processed: Mutex::new(Vec::new()),
        }
    }

    /// Makes the first invocation fail when it reaches `item`.
    #[must_use]
    pub fn fail_once_at(mut self, item: u64) -> Self {
        self.fail_once_at = Some(item);
        self
    }

    /// Returns every item processed across all invocations, in order.
    #[must_use]
    pub fn processed(&self) -> Vec<u64> {
        self.processed.lock().clone()
    }
}

#[async_trait]
impl Step for BatchStep {
    fn id(&self) -> &StepId {
        &self.id
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        _inputs: &StepInputs,
    ) -> Result<StepOutput, StepError> {
        let start = ctx
            .checkpoints()
            .load("progress")
            .await
            .and_then(|v| v.get("done").and_then(Value::as_u64))
            .unwrap_or(0);

        for item in start..self.total {
            if let Some(fail_at) = self.fail_once_at {
                if item == fail_at && !self.failed.swap(true, Ordering::SeqCst) {
                    return Err(StepError::transient_io("worker lost mid-batch"));
                }
            }

            self.processed.lock().push(item);
            ctx.checkpoints()
                .save("progress", json!({"done": item + 1}))
                .await;
        }

        StepOutput::json(&json!({"items": self.total}))
    }
}

/// Builds a purely linear topology from step ids.
#[must_use]
pub fn linear_topology(name: &str, ids: &[&str]) -> Topology {
    let stages = ids
        .iter()
        .map(|id| StageNode::Step(StepDescriptor::new(*id)))
        .collect();
    Topology::new(name, stages).expect("linear topology is well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_topology_fixture() {
        let topology = linear_topology("t", &["a", "b", "c"]);
        assert_eq!(topology.descriptors().len(), 3);
    }

    #[test]
    fn test_flaky_step_counts() {
        let step = FlakyStep::new("f", 2, json!(null));
        assert_eq!(step.calls(), 0);
    }
}
