//! Step execution with idempotency, checkpointing, and timeout enforcement.
//!
//! The executor treats step business logic as an opaque unit of work behind
//! the [`Step`] trait. Around each invocation it computes the input
//! fingerprint, short-circuits on a prior succeeded attempt, enforces the
//! descriptor timeout, classifies failures, and persists attempts, error
//! records, and output artifacts.

use crate::artifact::{ArtifactError, ArtifactPath, ArtifactRef, ArtifactStore};
use crate::cancellation::CancellationToken;
use crate::checkpoint::{CheckpointHandle, CheckpointStore};
use crate::config::EngineConfig;
use crate::core::{AttemptLedger, StepDescriptor, StepId, Topology};
use crate::errors::{EngineError, ErrorRecord, StepError, StepFailure};
use crate::events::{event_types, EventSink};
use crate::fingerprint::{fingerprint_value, Fingerprint};
use crate::observability::SpanTimer;
use crate::retry::{next_decision, RetryDecision, RetryState};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The inputs a step consumes: upstream artifact references, the step's
/// configuration, and the run's initial input payload.
#[derive(Debug, Clone, Default)]
pub struct StepInputs {
    /// Upstream artifacts by producing step.
    pub artifacts: BTreeMap<StepId, ArtifactRef>,
    /// Step configuration from the descriptor.
    pub config: Value,
    /// The run's opaque initial input.
    pub seed: Value,
}

impl StepInputs {
    /// Creates empty inputs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the run's initial input.
    #[must_use]
    pub fn with_seed(mut self, seed: Value) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the step configuration.
    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Adds an upstream artifact reference.
    #[must_use]
    pub fn with_artifact(mut self, step_id: impl Into<StepId>, reference: ArtifactRef) -> Self {
        self.artifacts.insert(step_id.into(), reference);
        self
    }

    /// Computes the idempotency fingerprint of these inputs.
    ///
    /// Only content digests of upstream artifacts participate, so a
    /// continuation run consuming the same bytes from an ancestor's paths
    /// fingerprints identically. Canonicalization makes the digest
    /// independent of map key ordering.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let mut artifact_map = serde_json::Map::new();
        for (step_id, reference) in &self.artifacts {
            artifact_map.insert(
                step_id.to_string(),
                Value::String(reference.digest.to_string()),
            );
        }

        fingerprint_value(&serde_json::json!({
            "artifacts": artifact_map,
            "config": self.config,
            "seed": self.seed,
        }))
    }
}

/// The serialized output of a successful step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Declared content type.
    pub content_type: String,
    /// Serialized payload.
    pub bytes: Vec<u8>,
}

impl StepOutput {
    /// Creates a JSON output.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::OutputValidation`] if the value cannot be
    /// serialized.
    pub fn json(value: &Value) -> Result<Self, StepError> {
        let bytes = serde_json::to_vec(value).map_err(|e| StepError::OutputValidation {
            message: format!("output is not serializable: {e}"),
        })?;
        Ok(Self {
            content_type: "application/json".to_string(),
            bytes,
        })
    }

    /// Creates a plain-text output.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: "text/plain".to_string(),
            bytes: text.into().into_bytes(),
        }
    }

    /// Creates a binary output with an explicit content type.
    #[must_use]
    pub fn bytes(content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes,
        }
    }
}

/// Execution context handed to step business logic.
///
/// Exposes the attempt's identity, a fingerprint-scoped checkpoint handle,
/// digest-verified access to upstream artifacts, and the run's cancellation
/// token for long-running work that wants to stop early.
pub struct StepContext {
    run: Uuid,
    tenant: String,
    step_id: StepId,
    attempt: u32,
    checkpoints: CheckpointHandle,
    cancel: Arc<CancellationToken>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl StepContext {
    /// Returns the run id.
    #[must_use]
    pub fn run(&self) -> Uuid {
        self.run
    }

    /// Returns the owning tenant.
    #[must_use]
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Returns the step id.
    #[must_use]
    pub fn step_id(&self) -> &StepId {
        &self.step_id
    }

    /// Returns the attempt number.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the checkpoint handle scoped to this attempt's inputs.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointHandle {
        &self.checkpoints
    }

    /// Returns the run's cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.cancel
    }

    /// Fetches the bytes behind an upstream artifact reference, verifying
    /// the content digest.
    pub async fn fetch(&self, reference: &ArtifactRef) -> Result<Vec<u8>, StepError> {
        self.artifacts.get(reference).await.map_err(|e| match e {
            ArtifactError::NotFound { path } => StepError::MissingArtifact { path },
            other => StepError::Storage {
                message: other.to_string(),
            },
        })
    }
}

impl Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("run", &self.run)
            .field("step_id", &self.step_id)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Capability trait every step implementation satisfies.
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Returns the step id this implementation serves.
    fn id(&self) -> &StepId;

    /// Executes the step's business logic.
    async fn execute(&self, ctx: &StepContext, inputs: &StepInputs) -> Result<StepOutput, StepError>;
}

/// Registry of step implementations, keyed by step id.
#[derive(Debug, Default)]
pub struct StepRegistry {
    steps: DashMap<StepId, Arc<dyn Step>>,
}

impl StepRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a step implementation under its id.
    pub fn register(&self, step: Arc<dyn Step>) {
        self.steps.insert(step.id().clone(), step);
    }

    /// Resolves the implementation for a step id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownStep`] when nothing is registered.
    pub fn resolve(&self, step_id: &StepId) -> Result<Arc<dyn Step>, EngineError> {
        self.steps
            .get(step_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| EngineError::UnknownStep {
                step_id: step_id.clone(),
            })
    }

    /// Verifies that every step in a topology resolves.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownStep`] for the first unresolved id.
    pub fn ensure_topology(&self, topology: &Topology) -> Result<(), EngineError> {
        for descriptor in topology.descriptors() {
            self.resolve(&descriptor.id)?;
        }
        Ok(())
    }
}

/// Identifies the run a step executes within.
#[derive(Debug, Clone)]
pub struct RunScope {
    /// The run id.
    pub run: Uuid,
    /// The owning tenant.
    pub tenant: String,
}

/// Executes single steps with idempotency, checkpointing, timeout
/// enforcement, and error classification.
pub struct StepExecutor {
    registry: Arc<StepRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    ledger: Arc<AttemptLedger>,
    events: Arc<dyn EventSink>,
    config: EngineConfig,
}

impl StepExecutor {
    /// Creates a new executor.
    #[must_use]
    pub fn new(
        registry: Arc<StepRegistry>,
        artifacts: Arc<dyn ArtifactStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        events: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            artifacts,
            checkpoints,
            ledger: Arc::new(AttemptLedger::new()),
            events,
            config,
        }
    }

    /// Returns the attempt ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<AttemptLedger> {
        &self.ledger
    }

    /// Returns the artifact store.
    #[must_use]
    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// Executes one attempt of one step.
    ///
    /// Consults the attempt ledger first: a prior succeeded attempt with the
    /// same (step, fingerprint) whose artifact still verifies is returned
    /// without invoking business logic. A deleted artifact falls through to
    /// recomputation; a corrupted one is a failure.
    pub async fn execute_once(
        &self,
        scope: &RunScope,
        descriptor: &StepDescriptor,
        inputs: &StepInputs,
        cancel: &Arc<CancellationToken>,
    ) -> Result<ArtifactRef, StepError> {
        let fingerprint = inputs.fingerprint();

        if let Some(prior) = self
            .ledger
            .find_succeeded(scope.run, &descriptor.id, &fingerprint)
        {
            if let Some(reference) = prior.artifact {
                match self.artifacts.verify(&reference).await {
                    Ok(()) => {
                        debug!(
                            step = %descriptor.id,
                            fingerprint = %fingerprint.short(),
                            "serving step result from prior succeeded attempt"
                        );
                        self.events.try_emit(
                            event_types::STEP_SHORT_CIRCUITED,
                            Some(serde_json::json!({
                                "run": scope.run.to_string(),
                                "step": descriptor.id.to_string(),
                                "digest": reference.digest.to_string(),
                            })),
                        );
                        return Ok(reference);
                    }
                    Err(ArtifactError::NotFound { .. }) => {
                        // The artifact was deleted out of band; recompute.
                    }
                    Err(e) => {
                        return Err(StepError::Storage {
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        let step = self.registry.resolve(&descriptor.id).map_err(|_| {
            StepError::invalid_config(format!(
                "no implementation registered for step '{}'",
                descriptor.id
            ))
        })?;

        let number = self
            .ledger
            .begin(scope.run, &descriptor.id, fingerprint.clone())
            .map_err(|e| StepError::fatal(e.to_string()))?;

        self.events.try_emit(
            event_types::STEP_STARTED,
            Some(serde_json::json!({
                "run": scope.run.to_string(),
                "step": descriptor.id.to_string(),
                "attempt": number,
            })),
        );

        let ctx = StepContext {
            run: scope.run,
            tenant: scope.tenant.clone(),
            step_id: descriptor.id.clone(),
            attempt: number,
            checkpoints: CheckpointHandle::new(
                self.checkpoints.clone(),
                scope.run,
                descriptor.id.clone(),
                fingerprint,
            ),
            cancel: cancel.clone(),
            artifacts: self.artifacts.clone(),
        };

        let timeout_ms = descriptor.timeout_ms.unwrap_or(self.config.step_timeout_ms);
        let timer = SpanTimer::start();
        let result = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            step.execute(&ctx, inputs),
        )
        .await
        {
            Ok(inner) => inner,
            Err(_) => Err(StepError::timeout(timeout_ms)),
        };

        match result {
            Ok(output) => {
                let path = ArtifactPath::new(&scope.tenant, scope.run, descriptor.id.clone());
                match self
                    .artifacts
                    .put(&path, &output.content_type, &output.bytes)
                    .await
                {
                    Ok(record) => {
                        self.ledger.succeed(
                            scope.run,
                            &descriptor.id,
                            number,
                            record.reference.clone(),
                        );
                        info!(
                            step = %descriptor.id,
                            attempt = number,
                            digest = %record.reference.digest.short(),
                            duration_ms = timer.elapsed_ms(),
                            "step succeeded"
                        );
                        self.events.try_emit(
                            event_types::STEP_SUCCEEDED,
                            Some(serde_json::json!({
                                "run": scope.run.to_string(),
                                "step": descriptor.id.to_string(),
                                "attempt": number,
                                "digest": record.reference.digest.to_string(),
                            })),
                        );
                        Ok(record.reference)
                    }
                    Err(e) => {
                        let err = StepError::Storage {
                            message: e.to_string(),
                        };
                        self.ledger.fail(
                            scope.run,
                            &descriptor.id,
                            number,
                            ErrorRecord::from_step_error(&err, number),
                        );
                        Err(err)
                    }
                }
            }
            Err(err) => {
                self.ledger.fail(
                    scope.run,
                    &descriptor.id,
                    number,
                    ErrorRecord::from_step_error(&err, number),
                );
                Err(err)
            }
        }
    }

    /// Executes a step to a terminal outcome, retrying per its budget.
    ///
    /// Retries reuse unchanged inputs and the same implementation. Only
    /// `RETRYABLE` failures consume budget; the other categories fail the
    /// step on first occurrence.
    pub async fn execute_with_retry(
        &self,
        scope: &RunScope,
        descriptor: &StepDescriptor,
        inputs: &StepInputs,
        cancel: &Arc<CancellationToken>,
    ) -> Result<ArtifactRef, StepFailure> {
        let retry_config = match descriptor.max_retries {
            Some(max) => self.config.retry.clone().with_max_retries(max),
            None => self.config.retry.clone(),
        };
        let mut state = RetryState::new();

        loop {
            match self.execute_once(scope, descriptor, inputs, cancel).await {
                Ok(reference) => return Ok(reference),
                Err(err) => {
                    let category = err.category();
                    match next_decision(&mut state, &retry_config, category) {
                        RetryDecision::Retry(delay) => {
                            warn!(
                                step = %descriptor.id,
                                next_attempt = state.attempts(),
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "retrying step after transient failure"
                            );
                            self.events.try_emit(
                                event_types::STEP_RETRYING,
                                Some(serde_json::json!({
                                    "run": scope.run.to_string(),
                                    "step": descriptor.id.to_string(),
                                    "next_attempt": state.attempts(),
                                    "delay_ms": delay.as_millis() as u64,
                                })),
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::Exhausted | RetryDecision::NotRetryable => {
                            let failure = StepFailure {
                                step_id: descriptor.id.clone(),
                                attempts: state.attempts(),
                                category,
                                message: err.to_string(),
                            };
                            warn!(
                                step = %descriptor.id,
                                attempts = failure.attempts,
                                category = %failure.category,
                                "step terminally failed"
                            );
                            self.events.try_emit(
                                event_types::STEP_FAILED,
                                Some(serde_json::json!({
                                    "run": scope.run.to_string(),
                                    "step": descriptor.id.to_string(),
                                    "attempts": failure.attempts,
                                    "category": failure.category.to_string(),
                                })),
                            );
                            return Err(failure);
                        }
                    }
                }
            }
        }
    }
}

impl Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::InMemoryArtifactStore;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::errors::ErrorCategory;
    use crate::events::NoOpEventSink;
    use crate::retry::{JitterStrategy, RetryConfig};
    use crate::testing::{FailingStep, FlakyStep, RecordingStep, SlowStep};
    use serde_json::json;

    fn executor_with(registry: StepRegistry) -> (StepExecutor, Arc<InMemoryArtifactStore>) {
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let executor = StepExecutor::new(
            Arc::new(registry),
            artifacts.clone(),
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(NoOpEventSink),
            EngineConfig::new().with_retry(
                RetryConfig::new()
                    .with_base_delay_ms(1)
                    .with_jitter(JitterStrategy::None),
            ),
        );
        (executor, artifacts)
    }

    fn scope() -> RunScope {
        RunScope {
            run: Uuid::new_v4(),
            tenant: "acme".to_string(),
        }
    }

    fn cancel() -> Arc<CancellationToken> {
        Arc::new(CancellationToken::new())
    }

    #[test]
    fn test_inputs_fingerprint_ignores_key_order() {
        let a = StepInputs::new().with_config(json!({"x": 1, "y": 2}));
        let b = StepInputs::new().with_config(json!({"y": 2, "x": 1}));
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_registry_resolution() {
        let registry = StepRegistry::new();
        registry.register(Arc::new(RecordingStep::new("a", json!(1))));

        assert!(registry.resolve(&StepId::new("a")).is_ok());
        assert!(matches!(
            registry.resolve(&StepId::new("missing")),
            Err(EngineError::UnknownStep { .. })
        ));
    }

    #[tokio::test]
    async fn test_execute_once_produces_artifact() {
        let registry = StepRegistry::new();
        registry.register(Arc::new(RecordingStep::new("a", json!({"out": 1}))));
        let (executor, _) = executor_with(registry);
        let scope = scope();

        let reference = executor
            .execute_once(&scope, &StepDescriptor::new("a"), &StepInputs::new(), &cancel())
            .await
            .unwrap();

        assert_eq!(reference.path.step, StepId::new("a"));
        assert_eq!(reference.content_type, "application/json");

        let latest = executor.ledger().latest(scope.run, &StepId::new("a")).unwrap();
        assert_eq!(latest.number, 1);
        assert!(latest.artifact.is_some());
    }

    #[tokio::test]
    async fn test_idempotent_short_circuit() {
        let step = Arc::new(RecordingStep::new("a", json!({"out": 1})));
        let registry = StepRegistry::new();
        registry.register(step.clone());
        let (executor, _) = executor_with(registry);
        let scope = scope();
        let inputs = StepInputs::new().with_seed(json!("same"));

        let first = executor
            .execute_once(&scope, &StepDescriptor::new("a"), &inputs, &cancel())
            .await
            .unwrap();
        let second = executor
            .execute_once(&scope, &StepDescriptor::new("a"), &inputs, &cancel())
            .await
            .unwrap();

        assert_eq!(first.digest, second.digest);
        assert_eq!(step.calls(), 1);
        assert_eq!(executor.ledger().attempt_count(scope.run, &StepId::new("a")), 1);
    }

    #[tokio::test]
    async fn test_changed_inputs_recompute() {
        let step = Arc::new(RecordingStep::new("a", json!({"out": 1})));
        let registry = StepRegistry::new();
        registry.register(step.clone());
        let (executor, _) = executor_with(registry);
        let scope = scope();

        executor
            .execute_once(
                &scope,
                &StepDescriptor::new("a"),
                &StepInputs::new().with_seed(json!("one")),
                &cancel(),
            )
            .await
            .unwrap();
        executor
            .execute_once(
                &scope,
                &StepDescriptor::new("a"),
                &StepInputs::new().with_seed(json!("two")),
                &cancel(),
            )
            .await
            .unwrap();

        assert_eq!(step.calls(), 2);
    }

    #[tokio::test]
    async fn test_deleted_artifact_recomputes() {
        let step = Arc::new(RecordingStep::new("a", json!({"out": 1})));
        let registry = StepRegistry::new();
        registry.register(step.clone());
        let (executor, artifacts) = executor_with(registry);
        let scope = scope();
        let inputs = StepInputs::new();

        let first = executor
            .execute_once(&scope, &StepDescriptor::new("a"), &inputs, &cancel())
            .await
            .unwrap();
        artifacts.remove(&first.path);

        let second = executor
            .execute_once(&scope, &StepDescriptor::new("a"), &inputs, &cancel())
            .await
            .unwrap();

        assert_eq!(first.digest, second.digest);
        assert_eq!(step.calls(), 2);
    }

    #[tokio::test]
    async fn test_timeout_is_classified_retryable() {
        let registry = StepRegistry::new();
        registry.register(Arc::new(SlowStep::new("slow", Duration::from_secs(5))));
        let (executor, _) = executor_with(registry);
        let scope = scope();

        let err = executor
            .execute_once(
                &scope,
                &StepDescriptor::new("slow").with_timeout_ms(20),
                &StepInputs::new(),
                &cancel(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StepError::Timeout { timeout_ms: 20 }));
        assert_eq!(err.category(), ErrorCategory::Retryable);

        let latest = executor.ledger().latest(scope.run, &StepId::new("slow")).unwrap();
        let record = latest.error.unwrap();
        assert_eq!(record.category, ErrorCategory::Retryable);
    }

    #[tokio::test]
    async fn test_unregistered_step_fails_structurally() {
        let (executor, _) = executor_with(StepRegistry::new());

        let err = executor
            .execute_once(
                &scope(),
                &StepDescriptor::new("ghost"),
                &StepInputs::new(),
                &cancel(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.category(), ErrorCategory::NonRetryable);
    }

    #[tokio::test]
    async fn test_retry_succeeds_within_budget() {
        let step = Arc::new(FlakyStep::new("flaky", 2, json!({"ok": true})));
        let registry = StepRegistry::new();
        registry.register(step.clone());
        let (executor, _) = executor_with(registry);
        let scope = scope();

        let reference = executor
            .execute_with_retry(
                &scope,
                &StepDescriptor::new("flaky"),
                &StepInputs::new(),
                &cancel(),
            )
            .await
            .unwrap();

        assert_eq!(reference.path.step, StepId::new("flaky"));
        assert_eq!(executor.ledger().attempt_count(scope.run, &StepId::new("flaky")), 3);
    }

    #[tokio::test]
    async fn test_retry_bound_is_max_retries_plus_one() {
        let registry = StepRegistry::new();
        registry.register(Arc::new(FailingStep::new(
            "doomed",
            StepError::transient_io("flapping"),
        )));
        let (executor, _) = executor_with(registry);
        let scope = scope();

        let failure = executor
            .execute_with_retry(
                &scope,
                &StepDescriptor::new("doomed").with_max_retries(1),
                &StepInputs::new(),
                &cancel(),
            )
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 2);
        assert_eq!(failure.category, ErrorCategory::Retryable);
        assert_eq!(executor.ledger().attempt_count(scope.run, &StepId::new("doomed")), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_on_first_attempt() {
        let step = Arc::new(FailingStep::new(
            "broken",
            StepError::invalid_config("bad prompt id"),
        ));
        let registry = StepRegistry::new();
        registry.register(step.clone());
        let (executor, _) = executor_with(registry);
        let scope = scope();

        let failure = executor
            .execute_with_retry(
                &scope,
                &StepDescriptor::new("broken"),
                &StepInputs::new(),
                &cancel(),
            )
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.category, ErrorCategory::NonRetryable);
        assert_eq!(step.calls(), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_not_retried() {
        let step = Arc::new(FailingStep::new(
            "malformed",
            StepError::output_validation("expected JSON object"),
        ));
        let registry = StepRegistry::new();
        registry.register(step.clone());
        let (executor, _) = executor_with(registry);

        let failure = executor
            .execute_with_retry(
                &scope(),
                &StepDescriptor::new("malformed"),
                &StepInputs::new(),
                &cancel(),
            )
            .await
            .unwrap_err();

        assert_eq!(failure.category, ErrorCategory::ValidationFailure);
        assert_eq!(step.calls(), 1);
    }
}
