//! # Conveyor
//!
//! A durable pipeline orchestration core.
//!
//! Conveyor executes a fixed, mostly-linear sequence of processing steps with
//! strong operational guarantees:
//!
//! - **Idempotent steps**: at most one logical execution per (step, inputs),
//!   enforced by fingerprint lookup against a content-addressed artifact store
//! - **Checkpointed retries**: bounded, category-aware retry with intra-step
//!   progress records so a retried attempt never restarts from zero
//! - **Fan-out/fan-in**: one parallel stage whose members retry independently;
//!   a later group attempt reissues only the members that failed
//! - **Approval gate**: a single-shot, externally-signaled barrier that
//!   suspends the run cooperatively
//! - **Resumable runs**: a continuation run reuses an ancestor's
//!   digest-verified artifacts instead of recomputing earlier steps
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use conveyor::prelude::*;
//!
//! let topology = Topology::new("content-pipeline", vec![
//!     StageNode::Step(StepDescriptor::new("extract")),
//!     StageNode::FanOut(vec![
//!         StepDescriptor::new("summarize"),
//!         StepDescriptor::new("classify"),
//!     ]),
//!     StageNode::ApprovalGate,
//!     StageNode::Step(StepDescriptor::new("publish")),
//! ])?;
//!
//! let run_id = orchestrator.start_run(
//!     StartRequest::new("acme", topology)
//!         .with_profile(ExecutionProfile::new("prod")?)
//!         .with_input(input),
//! )?;
//! let status = orchestrator.drive(run_id).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod approval;
pub mod artifact;
pub mod cancellation;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod executor;
pub mod fanout;
pub mod fingerprint;
pub mod observability;
pub mod orchestrator;
pub mod retry;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::approval::{ApprovalDecision, ApprovalGate, Verdict};
    pub use crate::artifact::{
        ArtifactPath, ArtifactRef, ArtifactStore, FsArtifactStore, InMemoryArtifactStore,
    };
    pub use crate::cancellation::CancellationToken;
    pub use crate::checkpoint::{CheckpointHandle, CheckpointStore, InMemoryCheckpointStore};
    pub use crate::config::{EngineConfig, ExecutionProfile};
    pub use crate::core::{
        AttemptStatus, RunStatus, StageNode, StepAttempt, StepDescriptor, StepId, Topology,
    };
    pub use crate::errors::{EngineError, ErrorCategory, ErrorRecord, StepError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::{
        Step, StepContext, StepExecutor, StepInputs, StepOutput, StepRegistry,
    };
    pub use crate::fingerprint::Fingerprint;
    pub use crate::orchestrator::{Orchestrator, OrchestratorBuilder, StartRequest};
    pub use crate::retry::{BackoffStrategy, JitterStrategy, RetryConfig};
}
