//! Content-addressed storage of step outputs.
//!
//! Artifacts are immutable: written once by the step that produced them,
//! referenced by path + digest everywhere else. Writes are scoped by unique
//! (tenant, run, step) keys, so the store only needs atomic
//! create-or-overwrite semantics per key; reads always verify the content
//! digest against the reference used to fetch.

use crate::core::StepId;
use crate::fingerprint::{digest_bytes, Fingerprint};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Logical path of an artifact, scoped by tenant, run, and step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactPath {
    /// Owning tenant.
    pub tenant: String,
    /// Owning run.
    pub run: Uuid,
    /// Producing step.
    pub step: StepId,
}

impl ArtifactPath {
    /// Creates a new artifact path.
    #[must_use]
    pub fn new(tenant: impl Into<String>, run: Uuid, step: impl Into<StepId>) -> Self {
        Self {
            tenant: tenant.into(),
            run,
            step: step.into(),
        }
    }
}

impl fmt::Display for ArtifactPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.run, self.step)
    }
}

/// Reference to an artifact: where it lives and what its bytes hash to.
///
/// References are the only currency passed between steps; payloads are
/// fetched (and digest-verified) on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Logical path.
    pub path: ArtifactPath,
    /// Hex SHA-256 digest of the stored bytes.
    pub digest: Fingerprint,
    /// Declared content type (e.g. "application/json").
    pub content_type: String,
}

/// Stored artifact metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// The artifact reference.
    pub reference: ArtifactRef,
    /// Size of the stored bytes.
    pub size_bytes: u64,
    /// When the artifact was written.
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Errors raised by artifact storage.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// No artifact exists at the path.
    #[error("artifact not found: {path}")]
    NotFound {
        /// The missing path.
        path: String,
    },

    /// Stored bytes do not match the digest in the reference.
    #[error("artifact digest mismatch at {path}: expected {expected}, found {actual}")]
    DigestMismatch {
        /// The path that failed verification.
        path: String,
        /// Digest recorded in the reference.
        expected: Fingerprint,
        /// Digest of the bytes actually stored.
        actual: Fingerprint,
    },

    /// Underlying I/O failure.
    #[error("artifact I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata (de)serialization failure.
    #[error("artifact metadata error: {0}")]
    Serialization(String),
}

/// Storage backend for artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Writes bytes at a path, atomically creating or overwriting the key.
    ///
    /// Returns the record describing what was stored. Writing identical
    /// bytes to the same path yields the same reference.
    async fn put(
        &self,
        path: &ArtifactPath,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<ArtifactRecord, ArtifactError>;

    /// Fetches the bytes behind a reference, verifying the content digest.
    ///
    /// A stale or mismatched digest is an error, never a silent return of
    /// whatever currently lives at the path.
    async fn get(&self, reference: &ArtifactRef) -> Result<Vec<u8>, ArtifactError>;

    /// Returns the stored metadata at a path, if any.
    async fn head(&self, path: &ArtifactPath) -> Result<Option<ArtifactRecord>, ArtifactError>;

    /// Verifies that the bytes behind a reference still match its digest.
    async fn verify(&self, reference: &ArtifactRef) -> Result<(), ArtifactError> {
        self.get(reference).await.map(|_| ())
    }
}

/// In-memory artifact store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    entries: DashMap<String, (ArtifactRecord, Vec<u8>)>,
}

impl InMemoryArtifactStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes the artifact at a path.
    pub fn remove(&self, path: &ArtifactPath) {
        self.entries.remove(&path.to_string());
    }

    /// Replaces stored bytes without updating the recorded digest.
    ///
    /// Exists so tests can simulate out-of-band corruption.
    #[cfg(test)]
    pub(crate) fn tamper(&self, path: &ArtifactPath, bytes: Vec<u8>) {
        if let Some(mut entry) = self.entries.get_mut(&path.to_string()) {
            entry.1 = bytes;
        }
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(
        &self,
        path: &ArtifactPath,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<ArtifactRecord, ArtifactError> {
        let record = ArtifactRecord {
            reference: ArtifactRef {
                path: path.clone(),
                digest: digest_bytes(bytes),
                content_type: content_type.to_string(),
            },
            size_bytes: bytes.len() as u64,
            created_at: chrono::Utc::now(),
        };

        self.entries
            .insert(path.to_string(), (record.clone(), bytes.to_vec()));
        Ok(record)
    }

    async fn get(&self, reference: &ArtifactRef) -> Result<Vec<u8>, ArtifactError> {
        let key = reference.path.to_string();
        let entry = self
            .entries
            .get(&key)
            .ok_or(ArtifactError::NotFound { path: key.clone() })?;

        let actual = digest_bytes(&entry.1);
        if actual != reference.digest {
            return Err(ArtifactError::DigestMismatch {
                path: key,
                expected: reference.digest.clone(),
                actual,
            });
        }

        Ok(entry.1.clone())
    }

    async fn head(&self, path: &ArtifactPath) -> Result<Option<ArtifactRecord>, ArtifactError> {
        Ok(self
            .entries
            .get(&path.to_string())
            .map(|entry| entry.0.clone()))
    }
}

/// Filesystem artifact store.
///
/// Layout: `<root>/<tenant>/<run>/<step>/data.bin` plus a `meta.json`
/// sidecar. Writes go to a temporary file first and are renamed into
/// place, which gives the atomic create-or-overwrite the store contract
/// requires.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Creates a store rooted at a directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir_for(&self, path: &ArtifactPath) -> PathBuf {
        self.root
            .join(&path.tenant)
            .join(path.run.to_string())
            .join(path.step.as_str())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        path: &ArtifactPath,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<ArtifactRecord, ArtifactError> {
        let dir = self.dir_for(path);
        tokio::fs::create_dir_all(&dir).await?;

        let record = ArtifactRecord {
            reference: ArtifactRef {
                path: path.clone(),
                digest: digest_bytes(bytes),
                content_type: content_type.to_string(),
            },
            size_bytes: bytes.len() as u64,
            created_at: chrono::Utc::now(),
        };

        let data_tmp = dir.join("data.bin.tmp");
        tokio::fs::write(&data_tmp, bytes).await?;
        tokio::fs::rename(&data_tmp, dir.join("data.bin")).await?;

        let meta = serde_json::to_vec_pretty(&record)
            .map_err(|e| ArtifactError::Serialization(e.to_string()))?;
        let meta_tmp = dir.join("meta.json.tmp");
        tokio::fs::write(&meta_tmp, meta).await?;
        tokio::fs::rename(&meta_tmp, dir.join("meta.json")).await?;

        Ok(record)
    }

    async fn get(&self, reference: &ArtifactRef) -> Result<Vec<u8>, ArtifactError> {
        let key = reference.path.to_string();
        let data_path = self.dir_for(&reference.path).join("data.bin");

        let bytes = match tokio::fs::read(&data_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArtifactError::NotFound { path: key });
            }
            Err(e) => return Err(e.into()),
        };

        let actual = digest_bytes(&bytes);
        if actual != reference.digest {
            return Err(ArtifactError::DigestMismatch {
                path: key,
                expected: reference.digest.clone(),
                actual,
            });
        }

        Ok(bytes)
    }

    async fn head(&self, path: &ArtifactPath) -> Result<Option<ArtifactRecord>, ArtifactError> {
        let meta_path = self.dir_for(path).join("meta.json");

        let bytes = match tokio::fs::read(&meta_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record = serde_json::from_slice(&bytes)
            .map_err(|e| ArtifactError::Serialization(e.to_string()))?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> ArtifactPath {
        ArtifactPath::new("acme", Uuid::new_v4(), "extract")
    }

    #[test]
    fn test_path_display() {
        let run = Uuid::new_v4();
        let p = ArtifactPath::new("acme", run, "extract");
        assert_eq!(p.to_string(), format!("acme/{run}/extract"));
    }

    #[tokio::test]
    async fn test_memory_put_get_roundtrip() {
        let store = InMemoryArtifactStore::new();
        let p = path();

        let record = store.put(&p, "application/json", b"{\"x\":1}").await.unwrap();
        assert_eq!(record.size_bytes, 7);
        assert_eq!(record.reference.content_type, "application/json");

        let bytes = store.get(&record.reference).await.unwrap();
        assert_eq!(bytes, b"{\"x\":1}");
    }

    #[tokio::test]
    async fn test_memory_same_bytes_same_digest() {
        let store = InMemoryArtifactStore::new();
        let p = path();

        let first = store.put(&p, "text/plain", b"payload").await.unwrap();
        let second = store.put(&p, "text/plain", b"payload").await.unwrap();

        assert_eq!(first.reference.digest, second.reference.digest);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_get_not_found() {
        let store = InMemoryArtifactStore::new();
        let reference = ArtifactRef {
            path: path(),
            digest: digest_bytes(b"anything"),
            content_type: "text/plain".to_string(),
        };

        let result = store.get(&reference).await;
        assert!(matches!(result, Err(ArtifactError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_memory_stale_digest_is_error() {
        let store = InMemoryArtifactStore::new();
        let p = path();

        let old = store.put(&p, "text/plain", b"v1").await.unwrap();
        store.put(&p, "text/plain", b"v2").await.unwrap();

        // Fetching through the stale reference must not return v2.
        let result = store.get(&old.reference).await;
        assert!(matches!(result, Err(ArtifactError::DigestMismatch { .. })));
    }

    #[tokio::test]
    async fn test_memory_tamper_detected() {
        let store = InMemoryArtifactStore::new();
        let p = path();

        let record = store.put(&p, "text/plain", b"original").await.unwrap();
        store.tamper(&p, b"altered".to_vec());

        let result = store.verify(&record.reference).await;
        assert!(matches!(result, Err(ArtifactError::DigestMismatch { .. })));
    }

    #[tokio::test]
    async fn test_fs_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let p = path();

        let record = store.put(&p, "application/json", b"{\"y\":2}").await.unwrap();
        let bytes = store.get(&record.reference).await.unwrap();
        assert_eq!(bytes, b"{\"y\":2}");

        let head = store.head(&p).await.unwrap().unwrap();
        assert_eq!(head.reference.digest, record.reference.digest);
    }

    #[tokio::test]
    async fn test_fs_head_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());

        assert!(store.head(&path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fs_tamper_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let p = path();

        let record = store.put(&p, "text/plain", b"original").await.unwrap();

        // Alter the stored bytes out of band.
        let data_path = dir
            .path()
            .join(&p.tenant)
            .join(p.run.to_string())
            .join(p.step.as_str())
            .join("data.bin");
        std::fs::write(&data_path, b"altered").unwrap();

        let result = store.get(&record.reference).await;
        assert!(matches!(result, Err(ArtifactError::DigestMismatch { .. })));
    }
}
