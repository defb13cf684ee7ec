use std::collections::HashMap;

use crate::atom::AtomId;

/// Uniform-cell grid over 3D space supporting radius range queries.
///
/// Cells are cubes of `cell_size`; a range query visits only the cells that
/// intersect the query sphere's bounding box and then filters candidates by
/// exact point distance.
#[derive(Debug, Clone)]
pub struct SpatialGrid {
    cell_size: f64,
    cells: HashMap<[i64; 3], Vec<(AtomId, [f64; 3])>>,
    len: usize,
}

impl SpatialGrid {
    /// Creates an empty grid. Cell size must be positive; non-positive values
    /// fall back to 1.0.
    #[must_use]
    pub fn new(cell_size: f64) -> Self {
        Self {
            cell_size: if cell_size > 0.0 { cell_size } else { 1.0 },
            cells: HashMap::new(),
            len: 0,
        }
    }

    /// Current cell size.
    #[must_use]
    pub const fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// Number of indexed points.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the grid holds no points.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn cell_of(&self, point: [f64; 3]) -> [i64; 3] {
        let mut cell = [0_i64; 3];
        for axis in 0..3 {
            #[allow(clippy::cast_possible_truncation)]
            {
                cell[axis] = (point[axis] / self.cell_size).floor() as i64;
            }
        }
        cell
    }

    /// Indexes a point for the given atom.
    pub fn insert(&mut self, id: AtomId, point: [f64; 3]) {
        let cell = self.cell_of(point);
        self.cells.entry(cell).or_default().push((id, point));
        self.len += 1;
    }

    /// Removes an atom's point, if present.
    pub fn remove(&mut self, id: AtomId, point: [f64; 3]) {
        let cell = self.cell_of(point);
        if let Some(bucket) = self.cells.get_mut(&cell) {
            let before = bucket.len();
            bucket.retain(|(other, _)| *other != id);
            self.len -= before - bucket.len();
            if bucket.is_empty() {
                self.cells.remove(&cell);
            }
        }
    }

    /// Rebuilds the grid with a new cell size, keeping every indexed point.
    pub fn retune(&mut self, cell_size: f64) {
        let points: Vec<(AtomId, [f64; 3])> = self.cells.drain().flat_map(|(_, b)| b).collect();
        self.cell_size = if cell_size > 0.0 { cell_size } else { 1.0 };
        self.len = 0;
        for (id, point) in points {
            self.insert(id, point);
        }
    }

    /// Returns atom ids whose points lie within `radius` of `center`.
    #[must_use]
    pub fn range(&self, center: [f64; 3], radius: f64) -> Vec<AtomId> {
        if radius < 0.0 {
            return Vec::new();
        }
        let low = self.cell_of([center[0] - radius, center[1] - radius, center[2] - radius]);
        let high = self.cell_of([center[0] + radius, center[1] + radius, center[2] + radius]);
        let radius_sq = radius * radius;

        let mut hits = Vec::new();
        for x in low[0]..=high[0] {
            for y in low[1]..=high[1] {
                for z in low[2]..=high[2] {
                    let Some(bucket) = self.cells.get(&[x, y, z]) else {
                        continue;
                    };
                    for (id, point) in bucket {
                        let dist_sq: f64 = point
                            .iter()
                            .zip(center.iter())
                            .map(|(a, b)| (a - b).powi(2))
                            .sum();
                        if dist_sq <= radius_sq {
                            hits.push(*id);
                        }
                    }
                }
            }
        }
        hits
    }
}
