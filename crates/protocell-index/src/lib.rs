//! Spatial indexing abstractions for entity neighborhood queries.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Common behaviour exposed by neighborhood indices.
pub trait NeighborhoodIndex {
    /// Rebuild internal structures from entity positions.
    fn rebuild(&mut self, positions: &[(f64, f64)]) -> Result<(), IndexError>;

    /// Visit neighbors of `entity_idx` within the provided squared radius.
    ///
    /// The origin entity itself is never visited.
    fn neighbors_within(
        &self,
        entity_idx: usize,
        radius_sq: f64,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f64>),
    );

    /// Visit indexed entities within the squared radius of an arbitrary point.
    fn neighbors_of_point(
        &self,
        point: (f64, f64),
        radius_sq: f64,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f64>),
    );
}

/// Uniform grid index bucketing entities by cell for constant-time candidate lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    /// Edge length of each grid cell used for bucketing entities.
    pub cell_size: f64,
    width: f64,
    height: f64,
    cols: usize,
    rows: usize,
    #[serde(skip)]
    buckets: Vec<Vec<usize>>,
    #[serde(skip)]
    positions: Vec<(f64, f64)>,
}

impl UniformGridIndex {
    /// Create a new uniform grid covering `width x height` with the provided cell size.
    #[must_use]
    pub fn new(cell_size: f64, width: f64, height: f64) -> Self {
        let cols = Self::axis_cells(width, cell_size);
        let rows = Self::axis_cells(height, cell_size);
        Self {
            cell_size,
            width,
            height,
            cols,
            rows,
            buckets: vec![Vec::new(); cols * rows],
            positions: Vec::new(),
        }
    }

    fn axis_cells(extent: f64, cell_size: f64) -> usize {
        if extent <= 0.0 || cell_size <= 0.0 {
            return 1;
        }
        ((extent / cell_size).ceil() as usize).max(1)
    }

    #[inline]
    fn bucket_coords(&self, x: f64, y: f64) -> (usize, usize) {
        let cx = ((x / self.cell_size).floor() as isize).clamp(0, self.cols as isize - 1) as usize;
        let cy = ((y / self.cell_size).floor() as isize).clamp(0, self.rows as isize - 1) as usize;
        (cx, cy)
    }

    #[inline]
    fn bucket_index(&self, cx: usize, cy: usize) -> usize {
        cy * self.cols + cx
    }

    /// Number of entities currently indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true when no entities are indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn visit_candidates(
        &self,
        point: (f64, f64),
        radius_sq: f64,
        skip: Option<usize>,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f64>),
    ) {
        if self.positions.is_empty() || radius_sq < 0.0 {
            return;
        }
        let radius = radius_sq.sqrt();
        let (min_cx, min_cy) = self.bucket_coords(point.0 - radius, point.1 - radius);
        let (max_cx, max_cy) = self.bucket_coords(point.0 + radius, point.1 + radius);
        for cy in min_cy..=max_cy {
            for cx in min_cx..=max_cx {
                for &idx in &self.buckets[self.bucket_index(cx, cy)] {
                    if Some(idx) == skip {
                        continue;
                    }
                    let (px, py) = self.positions[idx];
                    let dx = px - point.0;
                    let dy = py - point.1;
                    let dist_sq = dx * dx + dy * dy;
                    if dist_sq <= radius_sq {
                        visitor(idx, OrderedFloat(dist_sq));
                    }
                }
            }
        }
    }
}

impl Default for UniformGridIndex {
    fn default() -> Self {
        Self::new(1.0, 1.0, 1.0)
    }
}

impl NeighborhoodIndex for UniformGridIndex {
    fn rebuild(&mut self, positions: &[(f64, f64)]) -> Result<(), IndexError> {
        if self.cell_size <= 0.0 {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        if self.width <= 0.0 || self.height <= 0.0 {
            return Err(IndexError::InvalidConfig("grid extent must be positive"));
        }
        let expected = self.cols * self.rows;
        if self.buckets.len() != expected {
            self.buckets = vec![Vec::new(); expected];
        } else {
            for bucket in &mut self.buckets {
                bucket.clear();
            }
        }
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        for (idx, &(x, y)) in positions.iter().enumerate() {
            let (cx, cy) = self.bucket_coords(x, y);
            let bucket = self.bucket_index(cx, cy);
            self.buckets[bucket].push(idx);
        }
        Ok(())
    }

    fn neighbors_within(
        &self,
        entity_idx: usize,
        radius_sq: f64,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f64>),
    ) {
        let Some(&origin) = self.positions.get(entity_idx) else {
            return;
        };
        self.visit_candidates(origin, radius_sq, Some(entity_idx), visitor);
    }

    fn neighbors_of_point(
        &self,
        point: (f64, f64),
        radius_sq: f64,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f64>),
    ) {
        self.visit_candidates(point, radius_sq, None, visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brute_force(positions: &[(f64, f64)], origin: usize, radius_sq: f64) -> Vec<usize> {
        let (ox, oy) = positions[origin];
        let mut hits: Vec<usize> = positions
            .iter()
            .enumerate()
            .filter(|(idx, (x, y))| {
                *idx != origin && {
                    let dx = x - ox;
                    let dy = y - oy;
                    dx * dx + dy * dy <= radius_sq
                }
            })
            .map(|(idx, _)| idx)
            .collect();
        hits.sort_unstable();
        hits
    }

    #[test]
    fn rebuild_rejects_invalid_cell_size() {
        let mut index = UniformGridIndex::new(0.0, 10.0, 10.0);
        assert!(index.rebuild(&[(1.0, 1.0)]).is_err());
    }

    #[test]
    fn queries_match_brute_force() {
        let positions = vec![
            (0.5, 0.5),
            (1.2, 0.6),
            (5.0, 5.0),
            (0.9, 0.9),
            (9.5, 9.5),
            (1.6, 1.4),
        ];
        let mut index = UniformGridIndex::new(1.0, 10.0, 10.0);
        index.rebuild(&positions).expect("rebuild");

        for origin in 0..positions.len() {
            for radius_sq in [0.25, 1.0, 4.0, 100.0] {
                let mut visited = Vec::new();
                index.neighbors_within(origin, radius_sq, &mut |idx, _| visited.push(idx));
                visited.sort_unstable();
                assert_eq!(
                    visited,
                    brute_force(&positions, origin, radius_sq),
                    "origin {origin} radius_sq {radius_sq}"
                );
            }
        }
    }

    #[test]
    fn point_queries_include_all_in_radius() {
        let positions = vec![(2.0, 2.0), (2.4, 2.1), (7.0, 7.0)];
        let mut index = UniformGridIndex::new(2.0, 10.0, 10.0);
        index.rebuild(&positions).expect("rebuild");

        let mut visited = Vec::new();
        index.neighbors_of_point((2.2, 2.0), 1.0, &mut |idx, dist| {
            visited.push((idx, dist.into_inner()));
        });
        visited.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(visited.len(), 2);
        assert_eq!(visited[0].0, 0);
        assert_eq!(visited[1].0, 1);
    }

    #[test]
    fn out_of_bounds_positions_clamp_into_edge_buckets() {
        let positions = vec![(-3.0, -3.0), (12.0, 12.0)];
        let mut index = UniformGridIndex::new(1.0, 10.0, 10.0);
        index.rebuild(&positions).expect("rebuild");

        let mut visited = Vec::new();
        index.neighbors_of_point((-3.0, -3.0), 0.01, &mut |idx, _| visited.push(idx));
        assert_eq!(visited, vec![0]);
    }
}
