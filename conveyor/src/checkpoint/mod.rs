//! Fingerprint-guarded intra-step progress records.
//!
//! A checkpoint lets a retried attempt skip partial work it already
//! finished (e.g. "query N of M processed"). A record is only honored when
//! its stored input fingerprint matches the current attempt's; progress
//! computed against different inputs is stale and discarded.

use crate::core::StepId;
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Scope key of a checkpoint: (run, step, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    /// Owning run.
    pub run: Uuid,
    /// Owning step.
    pub step: StepId,
    /// Checkpoint name, chosen by the step.
    pub name: String,
}

impl CheckpointKey {
    /// Creates a new checkpoint key.
    #[must_use]
    pub fn new(run: Uuid, step: impl Into<StepId>, name: impl Into<String>) -> Self {
        Self {
            run,
            step: step.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.run, self.step, self.name)
    }
}

/// A stored checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Progress payload, interpreted only by the step that wrote it.
    pub payload: serde_json::Value,
    /// Input fingerprint the progress was computed against.
    pub fingerprint: Fingerprint,
    /// When the record was last written.
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Storage backend for checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Creates or overwrites the record at a key.
    async fn save(&self, key: &CheckpointKey, record: CheckpointRecord);

    /// Loads the record at a key, if any.
    async fn load(&self, key: &CheckpointKey) -> Option<CheckpointRecord>;

    /// Deletes the record at a key.
    async fn delete(&self, key: &CheckpointKey);
}

/// In-memory checkpoint store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    entries: DashMap<CheckpointKey, CheckpointRecord>,
}

impl InMemoryCheckpointStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored checkpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, key: &CheckpointKey, record: CheckpointRecord) {
        self.entries.insert(key.clone(), record);
    }

    async fn load(&self, key: &CheckpointKey) -> Option<CheckpointRecord> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    async fn delete(&self, key: &CheckpointKey) {
        self.entries.remove(key);
    }
}

/// Handle scoped to one (run, step, fingerprint), handed to step logic.
///
/// The executor creates the handle; the step reads and writes named
/// checkpoints through it without seeing the scoping. The handle stamps
/// every write with the attempt's input fingerprint and silently discards
/// stale records on read.
#[derive(Clone)]
pub struct CheckpointHandle {
    store: Arc<dyn CheckpointStore>,
    run: Uuid,
    step: StepId,
    fingerprint: Fingerprint,
}

impl CheckpointHandle {
    /// Creates a handle scoped to the given attempt.
    #[must_use]
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        run: Uuid,
        step: StepId,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            store,
            run,
            step,
            fingerprint,
        }
    }

    fn key(&self, name: &str) -> CheckpointKey {
        CheckpointKey::new(self.run, self.step.clone(), name)
    }

    /// Saves a named checkpoint for the current inputs.
    pub async fn save(&self, name: &str, payload: serde_json::Value) {
        let record = CheckpointRecord {
            payload,
            fingerprint: self.fingerprint.clone(),
            updated_at: chrono::Utc::now(),
        };
        self.store.save(&self.key(name), record).await;
    }

    /// Loads a named checkpoint.
    ///
    /// Returns `None` when no record exists or when the stored record was
    /// computed against different inputs; a stale record is deleted.
    pub async fn load(&self, name: &str) -> Option<serde_json::Value> {
        let key = self.key(name);
        let record = self.store.load(&key).await?;

        if record.fingerprint != self.fingerprint {
            debug!(
                checkpoint = %key,
                stored = %record.fingerprint.short(),
                current = %self.fingerprint.short(),
                "discarding stale checkpoint"
            );
            self.store.delete(&key).await;
            return None;
        }

        Some(record.payload)
    }

    /// Deletes a named checkpoint.
    pub async fn clear(&self, name: &str) {
        self.store.delete(&self.key(name)).await;
    }
}

impl fmt::Debug for CheckpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointHandle")
            .field("run", &self.run)
            .field("step", &self.step)
            .field("fingerprint", &self.fingerprint.short())
            .finish()
    }
}
