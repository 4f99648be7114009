//! Concurrent execution of a fixed fan-out group with asymmetric retry.
//!
//! Every member runs as its own task through its own executor and retry
//! budget. The group converges only when all members succeed; on a later
//! attempt of a partially-failed group, members that already succeeded are
//! not reissued and keep their artifacts.

use crate::artifact::ArtifactRef;
use crate::cancellation::CancellationToken;
use crate::core::{StepDescriptor, StepId};
use crate::errors::{ErrorCategory, GroupFailure, StepFailure};
use crate::events::{event_types, EventSink};
use crate::executor::{RunScope, StepExecutor, StepInputs};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Runs a fixed set of independent steps concurrently and converges.
pub struct FanOutCoordinator {
    executor: Arc<StepExecutor>,
    events: Arc<dyn EventSink>,
}

impl FanOutCoordinator {
    /// Creates a coordinator over an executor.
    #[must_use]
    pub fn new(executor: Arc<StepExecutor>, events: Arc<dyn EventSink>) -> Self {
        Self { executor, events }
    }

    /// Executes the group to convergence or aggregated failure.
    ///
    /// `base_inputs` carries the upstream artifacts and seed shared by all
    /// members; each member's descriptor config is applied on top. Members
    /// with a prior succeeded attempt against the same inputs are skipped,
    /// keeping their existing artifacts.
    pub async fn run_group(
        &self,
        scope: &RunScope,
        members: &[StepDescriptor],
        base_inputs: &StepInputs,
        cancel: &Arc<CancellationToken>,
    ) -> Result<BTreeMap<StepId, ArtifactRef>, GroupFailure> {
        self.events.try_emit(
            event_types::GROUP_STARTED,
            Some(serde_json::json!({
                "run": scope.run.to_string(),
                "members": members.iter().map(|m| m.id.to_string()).collect::<Vec<_>>(),
            })),
        );

        let mut results = BTreeMap::new();
        let mut pending = Vec::new();

        for descriptor in members {
            let inputs = base_inputs.clone().with_config(descriptor.config.clone());
            let fingerprint = inputs.fingerprint();

            let prior = self
                .executor
                .ledger()
                .find_succeeded(scope.run, &descriptor.id, &fingerprint)
                .and_then(|attempt| attempt.artifact);

            if let Some(reference) = prior {
                if self.executor.artifacts().verify(&reference).await.is_ok() {
                    debug!(
                        step = %descriptor.id,
                        "fan-out member already succeeded; not reissuing"
                    );
                    results.insert(descriptor.id.clone(), reference);
                    continue;
                }
            }

            pending.push((descriptor.clone(), inputs));
        }

        let mut active: FuturesUnordered<_> = pending
            .into_iter()
            .map(|(descriptor, inputs)| {
                let executor = self.executor.clone();
                let scope = scope.clone();
                let cancel = cancel.clone();
                let step_id = descriptor.id.clone();

                let handle = tokio::spawn(async move {
                    executor
                        .execute_with_retry(&scope, &descriptor, &inputs, &cancel)
                        .await
                });
                async move { (step_id, handle.await) }
            })
            .collect();

        let mut failures = Vec::new();
        while let Some((step_id, joined)) = active.next().await {
            match joined {
                Ok(Ok(reference)) => {
                    results.insert(step_id, reference);
                }
                Ok(Err(failure)) => failures.push(failure),
                Err(join_error) => failures.push(StepFailure {
                    step_id,
                    attempts: 0,
                    category: ErrorCategory::NonRetryable,
                    message: format!("member task join error: {join_error}"),
                }),
            }
        }

        if failures.is_empty() {
            self.events.try_emit(
                event_types::GROUP_COMPLETED,
                Some(serde_json::json!({
                    "run": scope.run.to_string(),
                    "members": results.keys().map(ToString::to_string).collect::<Vec<_>>(),
                })),
            );
            Ok(results)
        } else {
            failures.sort_by(|a, b| a.step_id.cmp(&b.step_id));
            let group = GroupFailure { members: failures };
            warn!(run = %scope.run, error = %group, "fan-out group failed");
            self.events.try_emit(
                event_types::GROUP_FAILED,
                Some(serde_json::json!({
                    "run": scope.run.to_string(),
                    "failed": group.members.iter().map(|f| f.step_id.to_string()).collect::<Vec<_>>(),
                })),
            );
            Err(group)
        }
    }
}

impl std::fmt::Debug for FanOutCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutCoordinator").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::InMemoryArtifactStore;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::config::EngineConfig;
    use crate::events::NoOpEventSink;
    use crate::executor::StepRegistry;
    use crate::retry::{JitterStrategy, RetryConfig};
    use crate::testing::{FailingStep, FlakyStep, RecordingStep};
    use crate::errors::StepError;
    use serde_json::json;
    use uuid::Uuid;

    fn coordinator(registry: StepRegistry) -> (FanOutCoordinator, Arc<StepExecutor>) {
        let executor = Arc::new(StepExecutor::new(
            Arc::new(registry),
            Arc::new(InMemoryArtifactStore::new()),
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(NoOpEventSink),
            EngineConfig::new().with_retry(
                RetryConfig::new()
                    .with_max_retries(1)
                    .with_base_delay_ms(1)
                    .with_jitter(JitterStrategy::None),
            ),
        ));
        (
            FanOutCoordinator::new(executor.clone(), Arc::new(NoOpEventSink)),
            executor,
        )
    }

    fn scope() -> RunScope {
        RunScope {
            run: Uuid::new_v4(),
            tenant: "acme".to_string(),
        }
    }

    fn members(ids: &[&str]) -> Vec<StepDescriptor> {
        ids.iter().map(|id| StepDescriptor::new(*id)).collect()
    }

    fn cancel() -> Arc<CancellationToken> {
        Arc::new(CancellationToken::new())
    }

    #[tokio::test]
    async fn test_group_converges_when_all_succeed() {
        let registry = StepRegistry::new();
        registry.register(Arc::new(RecordingStep::new("c1", json!(1))));
        registry.register(Arc::new(RecordingStep::new("c2", json!(2))));
        registry.register(Arc::new(RecordingStep::new("c3", json!(3))));
        let (coordinator, _) = coordinator(registry);

        let results = coordinator
            .run_group(&scope(), &members(&["c1", "c2", "c3"]), &StepInputs::new(), &cancel())
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.contains_key(&StepId::new("c2")));
    }

    #[tokio::test]
    async fn test_group_failure_aggregates_failed_members() {
        let registry = StepRegistry::new();
        registry.register(Arc::new(RecordingStep::new("c1", json!(1))));
        registry.register(Arc::new(FailingStep::new(
            "c2",
            StepError::output_validation("bad"),
        )));
        registry.register(Arc::new(FailingStep::new(
            "c3",
            StepError::transient_io("flapping"),
        )));
        let (coordinator, _) = coordinator(registry);

        let group = coordinator
            .run_group(&scope(), &members(&["c1", "c2", "c3"]), &StepInputs::new(), &cancel())
            .await
            .unwrap_err();

        assert_eq!(group.members.len(), 2);
        assert_eq!(group.members[0].step_id, StepId::new("c2"));
        assert_eq!(group.members[0].category, ErrorCategory::ValidationFailure);
        assert_eq!(group.members[1].step_id, StepId::new("c3"));
        assert_eq!(group.members[1].category, ErrorCategory::Retryable);
        // c3 had a budget of 1 retry.
        assert_eq!(group.members[1].attempts, 2);
    }

    #[tokio::test]
    async fn test_group_retry_reissues_only_failed_members() {
        let a = Arc::new(RecordingStep::new("a", json!("a")));
        let c = Arc::new(RecordingStep::new("c", json!("c")));
        // Fails 3 times: exhausts the 2-attempt budget on the first group
        // run, succeeds on the second.
        let b = Arc::new(FlakyStep::new("b", 3, json!("b")));

        let registry = StepRegistry::new();
        registry.register(a.clone());
        registry.register(b.clone());
        registry.register(c.clone());
        let (coordinator, executor) = coordinator(registry);

        let scope = scope();
        let inputs = StepInputs::new();
        let group_members = members(&["a", "b", "c"]);

        let group = coordinator
            .run_group(&scope, &group_members, &inputs, &cancel())
            .await
            .unwrap_err();
        assert_eq!(group.members.len(), 1);
        assert_eq!(group.members[0].step_id, StepId::new("b"));

        let digest_a = executor
            .ledger()
            .latest(scope.run, &StepId::new("a"))
            .unwrap()
            .artifact
            .unwrap()
            .digest;

        let results = coordinator
            .run_group(&scope, &group_members, &inputs, &cancel())
            .await
            .unwrap();

        // Only the failed member ran again.
        assert_eq!(a.calls(), 1);
        assert_eq!(c.calls(), 1);
        assert_eq!(b.calls(), 4);

        // The sibling's artifact is unchanged.
        assert_eq!(results.get(&StepId::new("a")).unwrap().digest, digest_a);
    }
}
