#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Content-addressable atom store and the hybrid vector-spatial search engine
//! built on top of it.
//!
//! Atoms arrive with a precomputed embedding; the store derives a 3D spatial
//! projection from it with a fixed landmark function so range queries at
//! search time filter against the same geometry used at ingest time.

/// Atom records and the deduplicating store.
pub mod atom;
/// Deterministic landmark projection from embeddings to 3D points.
pub mod projection;
/// Hybrid search: spatial pre-filter plus exact re-rank.
pub mod search;
/// Uniform-cell spatial grid index.
pub mod spatial;

pub use atom::{Atom, AtomId, AtomStore, AtomStoreError};
pub use projection::LandmarkProjector;
pub use search::{
    DistanceMetric, HybridSearchEngine, SearchConfig, SearchHit, SearchQuery, SearchStats,
};
pub use spatial::SpatialGrid;
