use rand::{rngs::SmallRng, Rng, SeedableRng};

/// Fixed seeds for the three landmark vectors. Changing these invalidates
/// every stored spatial point, so they are part of the on-disk contract.
const LANDMARK_SEEDS: [u64; 3] = [0x6b61_697a, 0x7a65_6e2d, 0x6c6f_6f70];

/// Deterministic projection from a D-dimensional embedding to a 3D point.
///
/// The point is the vector of Euclidean distances from the embedding to three
/// fixed pseudo-random landmark vectors. The same projector instance (same
/// dimension) must be used at ingest and at query time; the spatial
/// pre-filter is meaningless otherwise.
#[derive(Debug, Clone)]
pub struct LandmarkProjector {
    landmarks: [Vec<f32>; 3],
}

impl LandmarkProjector {
    /// Creates a projector for embeddings of the given dimension.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        let landmarks = LANDMARK_SEEDS.map(|seed| {
            let mut rng = SmallRng::seed_from_u64(seed);
            (0..dimension).map(|_| rng.gen_range(-1.0..1.0)).collect()
        });
        Self { landmarks }
    }

    /// Projects an embedding to its 3D spatial point.
    ///
    /// # Panics
    /// Does not panic; a shorter embedding simply truncates the comparison.
    /// Callers are expected to validate dimensions before storing.
    #[must_use]
    pub fn project(&self, embedding: &[f32]) -> [f64; 3] {
        let mut point = [0.0_f64; 3];
        for (axis, landmark) in self.landmarks.iter().enumerate() {
            let sum: f64 = embedding
                .iter()
                .zip(landmark.iter())
                .map(|(a, b)| f64::from(a - b).powi(2))
                .sum();
            point[axis] = sum.sqrt();
        }
        point
    }
}
