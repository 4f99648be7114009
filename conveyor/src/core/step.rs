//! Typed step descriptors and the fixed pipeline topology.
//!
//! The step sequence is a typed, ordered list resolved when a run is
//! constructed, not runtime string dispatch. A topology is mostly linear,
//! with at most one fan-out group and at most one approval gate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifier of a step within a topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    /// Creates a new step id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Declarative description of a single step: id, timeout, retry budget,
/// and the configuration its implementation receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescriptor {
    /// The step id, unique within a topology.
    pub id: StepId,
    /// Execution timeout in milliseconds; engine default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Maximum retries after the first attempt; engine default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Step configuration; part of the input fingerprint.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl StepDescriptor {
    /// Creates a descriptor with engine-default timeout and retry budget.
    #[must_use]
    pub fn new(id: impl Into<StepId>) -> Self {
        Self {
            id: id.into(),
            timeout_ms: None,
            max_retries: None,
            config: serde_json::Value::Null,
        }
    }

    /// Sets the execution timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Sets the step configuration.
    #[must_use]
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// One position in the ordered topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageNode {
    /// A single linear step.
    Step(StepDescriptor),
    /// A fixed set of independent steps executed concurrently.
    FanOut(Vec<StepDescriptor>),
    /// The single-shot human approval barrier.
    ApprovalGate,
}

impl StageNode {
    /// Returns the descriptors contained in this node.
    #[must_use]
    pub fn descriptors(&self) -> Vec<&StepDescriptor> {
        match self {
            Self::Step(desc) => vec![desc],
            Self::FanOut(members) => members.iter().collect(),
            Self::ApprovalGate => Vec::new(),
        }
    }
}

/// Error raised when a topology is malformed.
#[derive(Debug, Clone, Error)]
pub enum TopologyError {
    /// The topology name was empty or whitespace-only.
    #[error("topology name cannot be empty or whitespace-only")]
    EmptyName,

    /// The topology contains no stages.
    #[error("topology '{name}' contains no stages")]
    Empty {
        /// The topology name.
        name: String,
    },

    /// A step id appears more than once.
    #[error("duplicate step id '{step_id}' in topology")]
    DuplicateStep {
        /// The duplicated id.
        step_id: StepId,
    },

    /// A fan-out group has no members.
    #[error("fan-out group at position {position} has no members")]
    EmptyFanOut {
        /// Index of the offending stage.
        position: usize,
    },

    /// More than one fan-out group was declared.
    #[error("topology declares more than one fan-out group")]
    MultipleFanOuts,

    /// More than one approval gate was declared.
    #[error("topology declares more than one approval gate")]
    MultipleGates,
}

/// The fixed, ordered step list a run executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    /// The topology name.
    pub name: String,
    /// Ordered stages.
    pub stages: Vec<StageNode>,
}

impl Topology {
    /// Creates a topology and validates its shape.
    ///
    /// # Errors
    ///
    /// Returns a [`TopologyError`] for an empty name, an empty stage list,
    /// duplicate step ids, an empty fan-out group, or more than one
    /// fan-out/gate.
    pub fn new(name: impl Into<String>, stages: Vec<StageNode>) -> Result<Self, TopologyError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TopologyError::EmptyName);
        }

        let topology = Self { name, stages };
        topology.validate()?;
        Ok(topology)
    }

    /// Validates the topology shape.
    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.stages.is_empty() {
            return Err(TopologyError::Empty {
                name: self.name.clone(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        let mut fanouts = 0usize;
        let mut gates = 0usize;

        for (position, stage) in self.stages.iter().enumerate() {
            match stage {
                StageNode::Step(desc) => {
                    if !seen.insert(desc.id.clone()) {
                        return Err(TopologyError::DuplicateStep {
                            step_id: desc.id.clone(),
                        });
                    }
                }
                StageNode::FanOut(members) => {
                    if members.is_empty() {
                        return Err(TopologyError::EmptyFanOut { position });
                    }
                    fanouts += 1;
                    for desc in members {
                        if !seen.insert(desc.id.clone()) {
                            return Err(TopologyError::DuplicateStep {
                                step_id: desc.id.clone(),
                            });
                        }
                    }
                }
                StageNode::ApprovalGate => {
                    gates += 1;
                }
            }
        }

        if fanouts > 1 {
            return Err(TopologyError::MultipleFanOuts);
        }
        if gates > 1 {
            return Err(TopologyError::MultipleGates);
        }

        Ok(())
    }

    /// Returns every step descriptor in order.
    #[must_use]
    pub fn descriptors(&self) -> Vec<&StepDescriptor> {
        self.stages.iter().flat_map(StageNode::descriptors).collect()
    }

    /// Returns the descriptor for a step id.
    #[must_use]
    pub fn descriptor(&self, step_id: &StepId) -> Option<&StepDescriptor> {
        self.descriptors().into_iter().find(|d| &d.id == step_id)
    }

    /// Returns the stage index containing a step id.
    #[must_use]
    pub fn position_of(&self, step_id: &StepId) -> Option<usize> {
        self.stages.iter().position(|stage| {
            stage
                .descriptors()
                .iter()
                .any(|desc| &desc.id == step_id)
        })
    }

    /// Returns descriptors of all steps in stages strictly before the stage
    /// containing `step_id`.
    #[must_use]
    pub fn descriptors_before(&self, step_id: &StepId) -> Option<Vec<&StepDescriptor>> {
        let boundary = self.position_of(step_id)?;
        Some(
            self.stages[..boundary]
                .iter()
                .flat_map(StageNode::descriptors)
                .collect(),
        )
    }
}
