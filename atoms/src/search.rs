use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atom::{AtomId, AtomStore, AtomStoreError};
use crate::spatial::SpatialGrid;

/// Exact distance function applied during re-ranking.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Cosine distance (1 - cosine similarity).
    Cosine,
    /// Euclidean (L2) distance.
    Euclidean,
}

impl DistanceMetric {
    /// Computes the distance between two vectors of equal length.
    #[must_use]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f64 {
        match self {
            Self::Euclidean => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| f64::from(x - y).powi(2))
                .sum::<f64>()
                .sqrt(),
            Self::Cosine => {
                let mut dot = 0.0_f64;
                let mut norm_a = 0.0_f64;
                let mut norm_b = 0.0_f64;
                for (x, y) in a.iter().zip(b.iter()) {
                    dot += f64::from(*x) * f64::from(*y);
                    norm_a += f64::from(*x).powi(2);
                    norm_b += f64::from(*y).powi(2);
                }
                if norm_a == 0.0 || norm_b == 0.0 {
                    return 1.0;
                }
                1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
            }
        }
    }
}

/// Tuning knobs for the hybrid search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Maximum number of radius doublings before giving up escalation.
    pub max_doublings: u32,
    /// Hard ceiling on the escalated radius.
    pub max_radius: f64,
    /// Initial grid cell size.
    pub cell_size: f64,
    /// Soft target for the candidate set size; exceeding it is logged, not
    /// rejected.
    pub candidate_target: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_doublings: 6,
            max_radius: f64::INFINITY,
            cell_size: 1.0,
            candidate_target: 50_000,
        }
    }
}

/// A single search query.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    /// Vector compared exactly against candidate embeddings.
    pub query_vector: Vec<f32>,
    /// Center of the spatial pre-filter. Must come from the same projection
    /// function that produced the stored spatial points.
    pub spatial_center: [f64; 3],
    /// Starting radius for the pre-filter.
    pub initial_radius: f64,
    /// Number of results requested.
    pub k: usize,
    /// Exact distance function.
    pub metric: DistanceMetric,
}

/// One ranked result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Matched atom.
    pub atom_id: AtomId,
    /// Exact distance to the query vector.
    pub distance: f64,
}

/// Observability snapshot for a single search call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SearchStats {
    /// Radius doublings performed.
    pub doublings: u32,
    /// Candidate count that entered exact re-ranking.
    pub candidates: usize,
    /// Radius at which the candidate set was taken.
    pub final_radius: f64,
}

/// Hybrid vector-spatial search engine.
///
/// A coarse grid range query bounds the candidate set; exact distances are
/// computed only for candidates. When fewer than `k` candidates fall inside
/// the radius it doubles, degrading toward brute force, which guarantees the
/// true top-k once escalation reaches the whole domain.
#[derive(Debug, Clone)]
pub struct HybridSearchEngine {
    store: AtomStore,
    grid: Arc<RwLock<SpatialGrid>>,
    config: SearchConfig,
}

impl HybridSearchEngine {
    /// Creates an engine over the given store.
    #[must_use]
    pub fn new(store: AtomStore, config: SearchConfig) -> Self {
        let grid = Arc::new(RwLock::new(SpatialGrid::new(config.cell_size)));
        Self {
            store,
            grid,
            config,
        }
    }

    /// The underlying atom store.
    #[must_use]
    pub const fn store(&self) -> &AtomStore {
        &self.store
    }

    /// Ingests content into the store and indexes its spatial point.
    ///
    /// Deduplicated content returns the existing id without re-indexing.
    pub fn ingest(
        &self,
        tenant_id: impl Into<String>,
        content: &[u8],
        embedding: Vec<f32>,
    ) -> Result<AtomId, AtomStoreError> {
        let before = self.store.len();
        let id = self.store.insert(tenant_id, content, embedding)?;
        if self.store.len() > before {
            let atom = self.store.get(id)?;
            self.grid.write().insert(id, atom.spatial_point);
        }
        Ok(id)
    }

    /// Ingests an externally prepared atom (embedding and spatial point
    /// precomputed by the ingestion collaborator, using this engine's
    /// projection function).
    pub fn ingest_prepared(
        &self,
        tenant_id: impl Into<String>,
        content: &[u8],
        embedding: Vec<f32>,
        spatial_point: [f64; 3],
    ) -> Result<AtomId, AtomStoreError> {
        let before = self.store.len();
        let id = self
            .store
            .insert_prepared(tenant_id, content, embedding, spatial_point)?;
        if self.store.len() > before {
            self.grid.write().insert(id, spatial_point);
        }
        Ok(id)
    }

    /// Soft-deletes an atom and drops it from the spatial index.
    pub fn remove(&self, id: AtomId) -> Result<(), AtomStoreError> {
        let atom = self.store.get(id)?;
        self.store.soft_delete(id)?;
        self.grid.write().remove(id, atom.spatial_point);
        Ok(())
    }

    /// Rebuilds the spatial index with a new cell size.
    ///
    /// Takes a short exclusive write on the grid only; must never be called
    /// from inside a conversation transaction.
    pub fn rebuild(&self, cell_size: f64) {
        self.grid.write().retune(cell_size);
    }

    /// Current spatial index size (live points).
    #[must_use]
    pub fn indexed_points(&self) -> usize {
        self.grid.read().len()
    }

    /// Builds a query whose spatial center is the projection of the vector.
    #[must_use]
    pub fn query_for(
        &self,
        query_vector: Vec<f32>,
        initial_radius: f64,
        k: usize,
        metric: DistanceMetric,
    ) -> SearchQuery {
        let spatial_center = self.store.projector().project(&query_vector);
        SearchQuery {
            query_vector,
            spatial_center,
            initial_radius,
            k,
            metric,
        }
    }

    /// Executes a hybrid search: spatial pre-filter, radius escalation, exact
    /// re-rank. Deterministic for deterministic inputs: ties in distance are
    /// broken by ascending atom id.
    #[must_use]
    pub fn search(&self, query: &SearchQuery) -> (Vec<SearchHit>, SearchStats) {
        let grid = self.grid.read();
        let mut radius = query.initial_radius.max(0.0);
        let mut doublings = 0_u32;
        let mut candidates = grid.range(query.spatial_center, radius);

        while candidates.len() < query.k
            && doublings < self.config.max_doublings
            && radius < self.config.max_radius
        {
            radius = if radius > 0.0 {
                (radius * 2.0).min(self.config.max_radius)
            } else {
                self.config.cell_size
            };
            doublings += 1;
            candidates = grid.range(query.spatial_center, radius);
        }
        drop(grid);

        if candidates.len() > self.config.candidate_target {
            debug!(
                candidates = candidates.len(),
                target = self.config.candidate_target,
                "spatial pre-filter exceeded candidate target"
            );
        }

        let stats = SearchStats {
            doublings,
            candidates: candidates.len(),
            final_radius: radius,
        };

        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .filter_map(|id| {
                let atom = self.store.get(id).ok()?;
                if atom.deleted {
                    return None;
                }
                Some(SearchHit {
                    atom_id: id,
                    distance: query.metric.distance(&query.query_vector, &atom.embedding),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.atom_id.cmp(&b.atom_id))
        });
        hits.truncate(query.k);
        (hits, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Engine with prepared atoms whose embeddings are 1D-ish (distance is
    /// just the coordinate gap) and whose spatial points are laid out along
    /// the x axis.
    fn engine_with_line(points: &[(f32, f64)]) -> HybridSearchEngine {
        let store = AtomStore::new(4);
        let engine = HybridSearchEngine::new(store, SearchConfig::default());
        for (i, (value, x)) in points.iter().enumerate() {
            engine
                .ingest_prepared(
                    "tenant",
                    format!("content-{i}").as_bytes(),
                    vec![*value, 0.0, 0.0, 0.0],
                    [*x, 0.0, 0.0],
                )
                .unwrap();
        }
        engine
    }

    fn query(center_x: f64, radius: f64, k: usize) -> SearchQuery {
        SearchQuery {
            query_vector: vec![0.0, 0.0, 0.0, 0.0],
            spatial_center: [center_x, 0.0, 0.0],
            initial_radius: radius,
            k,
            metric: DistanceMetric::Euclidean,
        }
    }

    #[test]
    fn radius_doubles_until_k_candidates() {
        // 3 atoms inside radius 1.0, 9 more between 1.0 and 2.0.
        let mut layout = vec![(0.1, 0.2), (0.2, 0.5), (0.3, 0.9)];
        for i in 0..9 {
            let offset = 1.05 + f64::from(i) * 0.1;
            layout.push((1.0 + i as f32, offset));
        }
        let engine = engine_with_line(&layout);

        let (hits, stats) = engine.search(&query(0.0, 1.0, 10));
        assert_eq!(stats.doublings, 1);
        assert!((stats.final_radius - 2.0).abs() < f64::EPSILON);
        assert_eq!(stats.candidates, 12);
        assert_eq!(hits.len(), 10);
        for pair in hits.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
    }

    #[test]
    fn full_escalation_matches_brute_force() {
        // Fewer atoms than k, spread widely, with embedding order running
        // opposite to spatial order: escalation must reach the whole domain
        // and the result must still be the exact global ranking.
        let layout: Vec<(f32, f64)> = (0..8)
            .map(|i| ((8 - i) as f32 * 0.7, f64::from(i) * 3.1))
            .collect();
        let engine = engine_with_line(&layout);

        let (hits, stats) = engine.search(&query(0.0, 0.5, 10));
        assert_eq!(stats.doublings, 6);
        assert_eq!(hits.len(), 8);

        let q = vec![0.0_f32, 0.0, 0.0, 0.0];
        let mut expected: Vec<SearchHit> = engine
            .store()
            .live_atoms()
            .into_iter()
            .map(|atom| SearchHit {
                atom_id: atom.id,
                distance: DistanceMetric::Euclidean.distance(&q, &atom.embedding),
            })
            .collect();
        expected.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap()
                .then_with(|| a.atom_id.cmp(&b.atom_id))
        });
        assert_eq!(hits, expected);
    }

    #[test]
    fn ties_break_by_atom_id() {
        // Two atoms with identical embeddings at the same spot.
        let engine = engine_with_line(&[(1.0, 0.1), (1.0, 0.1)]);
        let (hits, _) = engine.search(&query(0.0, 1.0, 2));
        assert_eq!(hits.len(), 2);
        assert!(hits[0].atom_id < hits[1].atom_id);
    }

    #[test]
    fn soft_deleted_atoms_never_rank() {
        let engine = engine_with_line(&[(0.5, 0.1), (0.6, 0.2)]);
        engine.remove(1).unwrap();
        let (hits, _) = engine.search(&query(0.0, 5.0, 10));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].atom_id, 2);
    }

    #[test]
    fn rebuild_keeps_search_results_stable() {
        let engine = engine_with_line(&[(0.1, 0.3), (0.2, 0.6), (0.3, 4.0)]);
        let before = engine.search(&query(0.0, 1.0, 2)).0;
        engine.rebuild(0.2);
        let after = engine.search(&query(0.0, 1.0, 2)).0;
        assert_eq!(before, after);
        assert_eq!(engine.indexed_points(), 3);
    }

    #[test]
    fn cosine_metric_orders_by_angle() {
        let a = vec![1.0_f32, 0.0];
        let b = vec![0.0_f32, 1.0];
        let same = vec![2.0_f32, 0.0];
        assert!(DistanceMetric::Cosine.distance(&a, &same) < 1e-9);
        assert!((DistanceMetric::Cosine.distance(&a, &b) - 1.0).abs() < 1e-9);
    }
}
