use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::projection::LandmarkProjector;

/// Stable identifier assigned to every atom.
pub type AtomId = u64;

/// Errors surfaced by the atom store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AtomStoreError {
    /// Embedding dimension differs from the store's fixed dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension the store was created with.
        expected: usize,
        /// Dimension of the offending embedding.
        got: usize,
    },
    /// The requested atom does not exist.
    #[error("atom not found: {0}")]
    NotFound(AtomId),
}

/// Content-addressable unit of data.
///
/// Immutable after creation except for the soft-delete flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Atom {
    /// Stable identifier.
    pub id: AtomId,
    /// Owning tenant.
    pub tenant_id: String,
    /// SHA-256 of the canonical content bytes, hex encoded.
    pub content_hash: String,
    /// High-dimensional embedding (fixed dimension per store).
    pub embedding: Vec<f32>,
    /// 3D projection derived from the embedding.
    pub spatial_point: [f64; 3],
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Soft-delete marker. Deleted atoms are invisible to search.
    pub deleted: bool,
}

#[derive(Debug, Default)]
struct StoreInner {
    atoms: IndexMap<AtomId, Atom>,
    by_hash: HashMap<(String, String), AtomId>,
    next_id: AtomId,
}

/// In-memory atom store with per-tenant content deduplication.
///
/// The store owns the landmark projector so every inserted atom's spatial
/// point is derived with the same function the search engine projects query
/// vectors with.
#[derive(Debug, Clone)]
pub struct AtomStore {
    inner: Arc<RwLock<StoreInner>>,
    projector: LandmarkProjector,
    dimension: usize,
}

impl AtomStore {
    /// Creates a store for embeddings of the given dimension.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                next_id: 1,
                ..StoreInner::default()
            })),
            projector: LandmarkProjector::new(dimension),
            dimension,
        }
    }

    /// Embedding dimension the store enforces.
    #[must_use]
    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    /// Projector used for every stored atom; query vectors must go through it.
    #[must_use]
    pub const fn projector(&self) -> &LandmarkProjector {
        &self.projector
    }

    /// Hex SHA-256 of the canonical content bytes.
    #[must_use]
    pub fn content_hash(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        format!("{:x}", hasher.finalize())
    }

    /// Inserts an atom, deduplicating on `(tenant_id, content_hash)`.
    ///
    /// Returns the new atom id, or the existing id when the content was
    /// already stored for this tenant (the duplicate is discarded). The
    /// spatial point is derived with the store's projector.
    pub fn insert(
        &self,
        tenant_id: impl Into<String>,
        content: &[u8],
        embedding: Vec<f32>,
    ) -> Result<AtomId, AtomStoreError> {
        if embedding.len() != self.dimension {
            return Err(AtomStoreError::DimensionMismatch {
                expected: self.dimension,
                got: embedding.len(),
            });
        }
        let spatial_point = self.projector.project(&embedding);
        self.insert_prepared(tenant_id, content, embedding, spatial_point)
    }

    /// Inserts an atom whose spatial point was precomputed by the ingestion
    /// collaborator. The point must come from the same projection function
    /// this store uses, or spatial pre-filtering becomes invalid.
    pub fn insert_prepared(
        &self,
        tenant_id: impl Into<String>,
        content: &[u8],
        embedding: Vec<f32>,
        spatial_point: [f64; 3],
    ) -> Result<AtomId, AtomStoreError> {
        if embedding.len() != self.dimension {
            return Err(AtomStoreError::DimensionMismatch {
                expected: self.dimension,
                got: embedding.len(),
            });
        }
        let tenant_id = tenant_id.into();
        let content_hash = Self::content_hash(content);

        let mut inner = self.inner.write();
        let key = (tenant_id.clone(), content_hash.clone());
        if let Some(existing) = inner.by_hash.get(&key) {
            return Ok(*existing);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.by_hash.insert(key, id);
        inner.atoms.insert(
            id,
            Atom {
                id,
                tenant_id,
                content_hash,
                embedding,
                spatial_point,
                created_at: Utc::now(),
                deleted: false,
            },
        );
        Ok(id)
    }

    /// Fetches an atom by id.
    pub fn get(&self, id: AtomId) -> Result<Atom, AtomStoreError> {
        self.inner
            .read()
            .atoms
            .get(&id)
            .cloned()
            .ok_or(AtomStoreError::NotFound(id))
    }

    /// Marks an atom soft-deleted. Idempotent.
    pub fn soft_delete(&self, id: AtomId) -> Result<(), AtomStoreError> {
        let mut inner = self.inner.write();
        let atom = inner
            .atoms
            .get_mut(&id)
            .ok_or(AtomStoreError::NotFound(id))?;
        atom.deleted = true;
        Ok(())
    }

    /// Snapshot of all live (non-deleted) atoms.
    #[must_use]
    pub fn live_atoms(&self) -> Vec<Atom> {
        self.inner
            .read()
            .atoms
            .values()
            .filter(|atom| !atom.deleted)
            .cloned()
            .collect()
    }

    /// Number of atoms including soft-deleted ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().atoms.len()
    }

    /// Whether the store holds no atoms at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().atoms.is_empty()
    }
}
