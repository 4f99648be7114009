//! Run records: one execution of the pipeline for a tenant and input.

use crate::artifact::ArtifactRef;
use crate::config::ExecutionProfile;
use crate::core::{RunStatus, StepId, Topology};
use crate::errors::GroupFailure;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Link from a continuation run to the run it resumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeRef {
    /// The ancestor run whose artifacts are reused.
    pub ancestor: Uuid,
    /// The step boundary the continuation starts from.
    pub from_step: StepId,
}

/// One execution of the pipeline.
///
/// Mutated only by the orchestrator through the run registry; history is
/// append-only. A continuation run gets a fresh identity and references its
/// ancestor instead of rewriting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique run id.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// The execution profile the run was submitted with.
    pub profile: ExecutionProfile,
    /// Current status.
    pub status: RunStatus,
    /// The step list this run executes.
    pub topology: Topology,
    /// Index of the next stage to execute.
    pub cursor: usize,
    /// Opaque initial input payload.
    pub input: serde_json::Value,
    /// References to artifacts produced (or inherited) so far, by step.
    pub artifacts: BTreeMap<StepId, ArtifactRef>,
    /// Set when this run is a continuation of an ancestor run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<ResumeRef>,
    /// Terminal failure detail, when status is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<GroupFailure>,
    /// When the run was created.
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// When the run was last mutated.
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl RunRecord {
    /// Creates a fresh run in `Pending` status.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        profile: ExecutionProfile,
        topology: Topology,
        input: serde_json::Value,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            profile,
            status: RunStatus::Pending,
            topology,
            cursor: 0,
            input,
            artifacts: BTreeMap::new(),
            resume_from: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a continuation run that starts at `from_step`, inheriting the
    /// ancestor's verified artifacts for everything before the boundary.
    #[must_use]
    pub fn continuation(
        ancestor: &Self,
        from_step: StepId,
        cursor: usize,
        inherited: BTreeMap<StepId, ArtifactRef>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: ancestor.tenant_id.clone(),
            profile: ancestor.profile.clone(),
            status: RunStatus::Pending,
            topology: ancestor.topology.clone(),
            cursor,
            input: ancestor.input.clone(),
            artifacts: inherited,
            resume_from: Some(ResumeRef {
                ancestor: ancestor.id,
                from_step,
            }),
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the run has reached a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Bumps the updated-at timestamp.
    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{StageNode, StepDescriptor};

    fn topology() -> Topology {
        Topology::new(
            "p",
            vec![
                StageNode::Step(StepDescriptor::new("a")),
                StageNode::Step(StepDescriptor::new("b")),
            ],
        )
        .unwrap()
    }

    fn profile() -> ExecutionProfile {
        ExecutionProfile::new("default").unwrap()
    }

    #[test]
    fn test_new_run_is_pending() {
        let run = RunRecord::new("acme", profile(), topology(), serde_json::json!({"q": 1}));

        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.cursor, 0);
        assert!(run.artifacts.is_empty());
        assert!(run.resume_from.is_none());
        assert!(!run.is_terminal());
    }

    #[test]
    fn test_continuation_gets_new_identity() {
        let original = RunRecord::new("acme", profile(), topology(), serde_json::json!(null));
        let continuation = RunRecord::continuation(
            &original,
            StepId::new("b"),
            1,
            BTreeMap::new(),
        );

        assert_ne!(continuation.id, original.id);
        assert_eq!(continuation.tenant_id, original.tenant_id);
        assert_eq!(continuation.cursor, 1);

        let resume = continuation.resume_from.unwrap();
        assert_eq!(resume.ancestor, original.id);
        assert_eq!(resume.from_step, StepId::new("b"));
    }

    #[test]
    fn test_run_serialization() {
        let run = RunRecord::new("acme", profile(), topology(), serde_json::json!({"q": 1}));
        let json = serde_json::to_string(&run).unwrap();
        let back: RunRecord = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, run.id);
        assert_eq!(back.status, RunStatus::Pending);
    }
}
