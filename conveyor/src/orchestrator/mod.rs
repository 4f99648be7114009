//! The run controller: drives the ordered step list end-to-end.
//!
//! Linear steps go through the step executor, the fan-out stage through the
//! coordinator, and the approval gate suspends the run until an external
//! decision arrives. Runs live in an explicit registry with compare-and-swap
//! status transitions; resuming allocates a new run that references its
//! ancestor instead of mutating history.

use crate::approval::{ApprovalDecision, ApprovalGate, Verdict};
use crate::artifact::{ArtifactError, ArtifactRef, ArtifactStore, InMemoryArtifactStore};
use crate::cancellation::CancellationToken;
use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use crate::config::{EngineConfig, ExecutionProfile};
use crate::core::{
    AttemptStatus, RunRecord, RunStatus, StageNode, StepAttempt, StepId, Topology,
};
use crate::errors::{EngineError, ErrorCategory, GroupFailure, StepFailure};
use crate::events::{event_types, EventSink, NoOpEventSink};
use crate::executor::{RunScope, StepExecutor, StepInputs, StepRegistry};
use crate::fanout::FanOutCoordinator;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;


/// Submission of a new run.
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Owning tenant.
    pub tenant_id: String,
    /// Execution profile; required, never defaulted.
    pub profile: Option<ExecutionProfile>,
    /// Opaque initial input payload.
    pub input: Value,
    /// The step list to execute.
    pub topology: Topology,
}

impl StartRequest {
    /// Creates a request with no profile and a null input.
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, topology: Topology) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            profile: None,
            input: Value::Null,
            topology,
        }
    }

    /// Sets the execution profile.
    #[must_use]
    pub fn with_profile(mut self, profile: ExecutionProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Sets the initial input payload.
    #[must_use]
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }
}

/// Explicit store of runs with compare-and-swap status transitions.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: DashMap<Uuid, RunRecord>,
}

impl RunRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a run record.
    pub fn insert(&self, record: RunRecord) {
        self.runs.insert(record.id, record);
    }

    /// Returns a snapshot of a run record.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RunNotFound`] for an unknown id.
    pub fn get(&self, run_id: Uuid) -> Result<RunRecord, EngineError> {
        self.runs
            .get(&run_id)
            .map(|entry| entry.clone())
            .ok_or(EngineError::RunNotFound { run_id })
    }

    /// Atomically transitions a run's status, verifying the expected
    /// current status first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidTransition`] when the run is not in
    /// `from`, or [`EngineError::RunNotFound`].
    pub fn transition(
        &self,
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<(), EngineError> {
        let mut entry = self
            .runs
            .get_mut(&run_id)
            .ok_or(EngineError::RunNotFound { run_id })?;

        if entry.status != from {
            return Err(EngineError::InvalidTransition { run_id, from, to });
        }

        entry.status = to;
        entry.touch();
        Ok(())
    }

    /// Applies a mutation to a run record.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RunNotFound`] for an unknown id.
    pub fn update<F>(&self, run_id: Uuid, apply: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut RunRecord),
    {
        let mut entry = self
            .runs
            .get_mut(&run_id)
            .ok_or(EngineError::RunNotFound { run_id })?;
        apply(&mut entry);
        entry.touch();
        Ok(())
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: EngineConfig,
    steps: Arc<StepRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    events: Arc<dyn EventSink>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            steps: Arc::new(StepRegistry::new()),
            artifacts: Arc::new(InMemoryArtifactStore::new()),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            events: Arc::new(NoOpEventSink),
        }
    }
}

impl OrchestratorBuilder {
    /// Sets the engine configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the step registry.
    #[must_use]
    pub fn with_steps(mut self, steps: Arc<StepRegistry>) -> Self {
        self.steps = steps;
        self
    }

    /// Sets the artifact store.
    #[must_use]
    pub fn with_artifact_store(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Sets the checkpoint store.
    #[must_use]
    pub fn with_checkpoint_store(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Builds the orchestrator.
    #[must_use]
    pub fn build(self) -> Orchestrator {
        let executor = Arc::new(StepExecutor::new(
            self.steps.clone(),
            self.artifacts,
            self.checkpoints,
            self.events.clone(),
            self.config.clone(),
        ));

        Orchestrator {
            coordinator: FanOutCoordinator::new(executor.clone(), self.events.clone()),
            executor,
            steps: self.steps,
            events: self.events,
            registry: RunRegistry::new(),
            gates: DashMap::new(),
            tokens: DashMap::new(),
        }
    }
}

/// Drives runs through the fixed step topology.
pub struct Orchestrator {
    registry: RunRegistry,
    executor: Arc<StepExecutor>,
    coordinator: FanOutCoordinator,
    steps: Arc<StepRegistry>,
    events: Arc<dyn EventSink>,
    gates: DashMap<Uuid, Arc<ApprovalGate>>,
    tokens: DashMap<Uuid, Arc<CancellationToken>>,
}

impl Orchestrator {
    /// Returns a builder with in-memory stores and a no-op event sink.
    #[must_use]
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Accepts a run submission and registers it in `Pending` status.
    ///
    /// # Errors
    ///
    /// Rejects a missing execution profile, a malformed topology, and any
    /// step id without a registered implementation.
    pub fn start_run(&self, request: StartRequest) -> Result<Uuid, EngineError> {
        let profile = request.profile.ok_or(EngineError::MissingProfile)?;
        request.topology.validate()?;
        self.steps.ensure_topology(&request.topology)?;

        let record = RunRecord::new(
            request.tenant_id,
            profile,
            request.topology,
            request.input,
        );
        let run_id = record.id;
        self.install(record);

        info!(run = %run_id, "run accepted");
        Ok(run_id)
    }

    fn install(&self, record: RunRecord) {
        let run_id = record.id;
        self.registry.insert(record);
        self.gates.insert(run_id, Arc::new(ApprovalGate::new()));
        self.tokens.insert(run_id, Arc::new(CancellationToken::new()));
    }

    fn gate(&self, run_id: Uuid) -> Result<Arc<ApprovalGate>, EngineError> {
        self.gates
            .get(&run_id)
            .map(|entry| entry.clone())
            .ok_or(EngineError::RunNotFound { run_id })
    }

    fn token(&self, run_id: Uuid) -> Result<Arc<CancellationToken>, EngineError> {
        self.tokens
            .get(&run_id)
            .map(|entry| entry.clone())
            .ok_or(EngineError::RunNotFound { run_id })
    }

    /// Executes a pending run to a terminal status.
    ///
    /// The future suspends at the approval gate and between long-running
    /// steps; it resolves once the run is `Completed`, `Failed`, or
    /// `Cancelled`.
    pub async fn drive(&self, run_id: Uuid) -> Result<RunStatus, EngineError> {
        self.registry
            .transition(run_id, RunStatus::Pending, RunStatus::Running)?;
        self.events.try_emit(
            event_types::RUN_STARTED,
            Some(serde_json::json!({ "run": run_id.to_string() })),
        );
        self.run_loop(run_id).await
    }

    async fn run_loop(&self, run_id: Uuid) -> Result<RunStatus, EngineError> {
        let token = self.token(run_id)?;

        loop {
            let record = self.registry.get(run_id)?;

            if token.is_cancelled() {
                return self.finish_cancelled(run_id, record.status, &token);
            }

            let Some(stage) = record.topology.stages.get(record.cursor).cloned() else {
                self.registry
                    .transition(run_id, RunStatus::Running, RunStatus::Completed)?;
                info!(run = %run_id, "run completed");
                self.events.try_emit(
                    event_types::RUN_COMPLETED,
                    Some(serde_json::json!({ "run": run_id.to_string() })),
                );
                return Ok(RunStatus::Completed);
            };

            let scope = RunScope {
                run: run_id,
                tenant: record.tenant_id.clone(),
            };

            match stage {
                StageNode::Step(descriptor) => {
                    let inputs = StepInputs {
                        artifacts: record.artifacts.clone(),
                        config: descriptor.config.clone(),
                        seed: record.input.clone(),
                    };

                    match self
                        .executor
                        .execute_with_retry(&scope, &descriptor, &inputs, &token)
                        .await
                    {
                        Ok(reference) => {
                            if token.is_cancelled() {
                                // In-flight work finished; its result is not
                                // reflected in the run and nothing further
                                // is scheduled.
                                return self.finish_cancelled(run_id, RunStatus::Running, &token);
                            }
                            self.registry.update(run_id, |r| {
                                r.artifacts.insert(descriptor.id.clone(), reference);
                                r.cursor += 1;
                            })?;
                        }
                        Err(failure) => {
                            return self.finish_failed(
                                run_id,
                                RunStatus::Running,
                                GroupFailure::single(failure),
                            );
                        }
                    }
                }
                StageNode::FanOut(members) => {
                    let base_inputs = StepInputs {
                        artifacts: record.artifacts.clone(),
                        config: Value::Null,
                        seed: record.input.clone(),
                    };

                    match self
                        .coordinator
                        .run_group(&scope, &members, &base_inputs, &token)
                        .await
                    {
                        Ok(results) => {
                            if token.is_cancelled() {
                                return self.finish_cancelled(run_id, RunStatus::Running, &token);
                            }
                            self.registry.update(run_id, |r| {
                                r.artifacts.extend(results);
                                r.cursor += 1;
                            })?;
                        }
                        Err(group) => {
                            return self.finish_failed(run_id, RunStatus::Running, group);
                        }
                    }
                }
                StageNode::ApprovalGate => {
                    self.registry.transition(
                        run_id,
                        RunStatus::Running,
                        RunStatus::PausedForApproval,
                    )?;
                    info!(run = %run_id, "run paused for approval");
                    self.events.try_emit(
                        event_types::RUN_PAUSED,
                        Some(serde_json::json!({ "run": run_id.to_string() })),
                    );

                    let gate = self.gate(run_id)?;
                    let decision = tokio::select! {
                        decision = gate.wait_for_decision() => decision,
                        () = token.cancelled() => {
                            return self.finish_cancelled(
                                run_id,
                                RunStatus::PausedForApproval,
                                &token,
                            );
                        }
                    };

                    match decision.verdict {
                        Verdict::Approved => {
                            self.registry.transition(
                                run_id,
                                RunStatus::PausedForApproval,
                                RunStatus::Running,
                            )?;
                            self.registry.update(run_id, |r| r.cursor += 1)?;
                        }
                        Verdict::Rejected => {
                            let mut message = format!("rejected by {}", decision.actor);
                            if let Some(reason) = decision.reason {
                                message.push_str(&format!(": {reason}"));
                            }
                            let failure = GroupFailure::single(StepFailure {
                                step_id: StepId::new("approval-gate"),
                                attempts: 1,
                                category: ErrorCategory::NonRetryable,
                                message,
                            });
                            return self.finish_failed(
                                run_id,
                                RunStatus::PausedForApproval,
                                failure,
                            );
                        }
                    }
                }
            }
        }
    }

    fn finish_failed(
        &self,
        run_id: Uuid,
        from: RunStatus,
        failure: GroupFailure,
    ) -> Result<RunStatus, EngineError> {
        self.registry.transition(run_id, from, RunStatus::Failed)?;
        warn!(run = %run_id, error = %failure, "run failed");
        self.events.try_emit(
            event_types::RUN_FAILED,
            Some(serde_json::json!({
                "run": run_id.to_string(),
                "failure": failure.to_string(),
            })),
        );
        self.registry.update(run_id, |r| r.failure = Some(failure))?;
        Ok(RunStatus::Failed)
    }

    fn finish_cancelled(
        &self,
        run_id: Uuid,
        from: RunStatus,
        token: &CancellationToken,
    ) -> Result<RunStatus, EngineError> {
        let reason = token.reason().unwrap_or_else(|| "cancelled".to_string());
        self.registry
            .transition(run_id, from, RunStatus::Cancelled)?;
        info!(run = %run_id, reason = %reason, "run cancelled");
        self.events.try_emit(
            event_types::RUN_CANCELLED,
            Some(serde_json::json!({
                "run": run_id.to_string(),
                "reason": reason,
            })),
        );
        Ok(RunStatus::Cancelled)
    }

    /// Delivers an approval to a waiting run.
    ///
    /// # Errors
    ///
    /// Conflict if the gate was already decided; rejected if the run is not
    /// waiting at the gate.
    pub fn approve(
        &self,
        run_id: Uuid,
        actor: impl Into<String>,
        reason: Option<String>,
    ) -> Result<ApprovalDecision, EngineError> {
        self.signal(run_id, Verdict::Approved, actor.into(), reason)
    }

    /// Delivers a rejection to a waiting run.
    ///
    /// # Errors
    ///
    /// Conflict if the gate was already decided; rejected if the run is not
    /// waiting at the gate.
    pub fn reject(
        &self,
        run_id: Uuid,
        actor: impl Into<String>,
        reason: Option<String>,
    ) -> Result<ApprovalDecision, EngineError> {
        self.signal(run_id, Verdict::Rejected, actor.into(), reason)
    }

    fn signal(
        &self,
        run_id: Uuid,
        verdict: Verdict,
        actor: String,
        reason: Option<String>,
    ) -> Result<ApprovalDecision, EngineError> {
        let record = self.registry.get(run_id)?;
        let gate = self.gate(run_id)?;

        if gate.is_decided() {
            return Err(EngineError::DecisionConflict { run_id });
        }
        if record.status != RunStatus::PausedForApproval {
            return Err(EngineError::NotAwaitingDecision {
                run_id,
                status: record.status,
            });
        }

        let decision = gate
            .record_decision(verdict, actor, reason)
            .map_err(|_| EngineError::DecisionConflict { run_id })?;

        info!(run = %run_id, verdict = %decision.verdict, actor = %decision.actor, "approval recorded");
        self.events.try_emit(
            event_types::APPROVAL_RECORDED,
            Some(serde_json::json!({
                "run": run_id.to_string(),
                "verdict": decision.verdict.to_string(),
                "actor": decision.actor,
            })),
        );
        Ok(decision)
    }

    /// Retries a terminally-failed step and drives the run onward.
    ///
    /// Earlier artifacts are reused after digest verification, never
    /// recomputed.
    pub async fn retry_step(
        &self,
        run_id: Uuid,
        step_id: &StepId,
    ) -> Result<RunStatus, EngineError> {
        let record = self.registry.get(run_id)?;
        let position = record
            .topology
            .position_of(step_id)
            .ok_or_else(|| EngineError::StepNotFound {
                step_id: step_id.clone(),
            })?;

        match self.executor.ledger().latest(run_id, step_id) {
            Some(attempt) if attempt.status == AttemptStatus::Failed => {}
            Some(attempt) => {
                return Err(EngineError::RetryNotAllowed {
                    step_id: step_id.clone(),
                    reason: format!("last attempt is {}", attempt.status),
                });
            }
            None => {
                return Err(EngineError::RetryNotAllowed {
                    step_id: step_id.clone(),
                    reason: "step has not been attempted".to_string(),
                });
            }
        }

        self.verify_prerequisites(&record, step_id).await?;

        self.registry
            .transition(run_id, RunStatus::Failed, RunStatus::Running)?;
        self.registry.update(run_id, |r| {
            r.failure = None;
            r.cursor = position;
        })?;

        info!(run = %run_id, step = %step_id, "retrying failed step");
        self.run_loop(run_id).await
    }

    /// Creates a continuation run starting at `step_id`, reusing the
    /// ancestor's digest-verified artifacts for every earlier step.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::CannotResume`] when any prerequisite artifact
    /// is missing or fails digest verification.
    pub async fn resume_from(
        &self,
        ancestor_id: Uuid,
        step_id: &StepId,
    ) -> Result<Uuid, EngineError> {
        let ancestor = self.registry.get(ancestor_id)?;
        let position = ancestor
            .topology
            .position_of(step_id)
            .ok_or_else(|| EngineError::StepNotFound {
                step_id: step_id.clone(),
            })?;

        self.verify_prerequisites(&ancestor, step_id).await?;

        let mut inherited = BTreeMap::new();
        if let Some(before) = ancestor.topology.descriptors_before(step_id) {
            for descriptor in before {
                if let Some(reference) = ancestor.artifacts.get(&descriptor.id) {
                    inherited.insert(descriptor.id.clone(), reference.clone());
                }
            }
        }

        let record = RunRecord::continuation(&ancestor, step_id.clone(), position, inherited);
        let run_id = record.id;
        self.install(record);

        info!(run = %run_id, ancestor = %ancestor_id, step = %step_id, "continuation run created");
        Ok(run_id)
    }

    async fn verify_prerequisites(
        &self,
        record: &RunRecord,
        step_id: &StepId,
    ) -> Result<(), EngineError> {
        let before = record
            .topology
            .descriptors_before(step_id)
            .ok_or_else(|| EngineError::StepNotFound {
                step_id: step_id.clone(),
            })?;

        for descriptor in before {
            let reference = record.artifacts.get(&descriptor.id).ok_or_else(|| {
                EngineError::CannotResume {
                    run_id: record.id,
                    reason: format!("missing prerequisite artifact for step '{}'", descriptor.id),
                }
            })?;

            self.executor
                .artifacts()
                .verify(reference)
                .await
                .map_err(|e| EngineError::CannotResume {
                    run_id: record.id,
                    reason: e.to_string(),
                })?;
        }

        Ok(())
    }

    /// Returns the digest-verified artifact reference for a step.
    pub async fn artifact_for(
        &self,
        run_id: Uuid,
        step_id: &StepId,
    ) -> Result<ArtifactRef, EngineError> {
        let record = self.registry.get(run_id)?;
        record
            .topology
            .position_of(step_id)
            .ok_or_else(|| EngineError::StepNotFound {
                step_id: step_id.clone(),
            })?;

        let reference =
            record
                .artifacts
                .get(step_id)
                .ok_or_else(|| {
                    EngineError::Artifact(ArtifactError::NotFound {
                        path: format!("{}/{}/{}", record.tenant_id, run_id, step_id),
                    })
                })?;

        self.executor.artifacts().verify(reference).await?;
        Ok(reference.clone())
    }

    /// Requests cancellation of a run.
    ///
    /// A pending run is cancelled immediately; an active run observes the
    /// token at its next suspension point.
    pub fn cancel(&self, run_id: Uuid, reason: impl Into<String>) -> Result<(), EngineError> {
        let record = self.registry.get(run_id)?;
        let reason = reason.into();
        self.token(run_id)?.cancel(reason.clone());

        if record.status == RunStatus::Pending
            && self
                .registry
                .transition(run_id, RunStatus::Pending, RunStatus::Cancelled)
                .is_ok()
        {
            info!(run = %run_id, reason = %reason, "pending run cancelled");
            self.events.try_emit(
                event_types::RUN_CANCELLED,
                Some(serde_json::json!({
                    "run": run_id.to_string(),
                    "reason": reason,
                })),
            );
        }

        Ok(())
    }

    /// Returns a run's current status.
    pub fn run_status(&self, run_id: Uuid) -> Result<RunStatus, EngineError> {
        Ok(self.registry.get(run_id)?.status)
    }

    /// Returns a snapshot of a run record.
    pub fn run(&self, run_id: Uuid) -> Result<RunRecord, EngineError> {
        self.registry.get(run_id)
    }

    /// Returns the attempt history for a (run, step).
    #[must_use]
    pub fn attempts_for(&self, run_id: Uuid, step_id: &StepId) -> Vec<StepAttempt> {
        self.executor.ledger().history(run_id, step_id)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("runs", &self.registry.runs.len())
            .finish()
    }
}
