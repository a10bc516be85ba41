//! Cell-list index for k-nearest-neighbour queries in 3D.
//!
//! Points are binned into a uniform cubic lattice; each cell maps to a compact
//! slice of point indices (`cell_offsets[c]..cell_offsets[c + 1]` into
//! `point_indices`). A query scans cells in shells of growing Chebyshev radius
//! around the query cell and stops once the k-th candidate is closer than
//! anything an unvisited shell could hold. Periodic boxes use minimum-image
//! distances and wrapped cells.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use crate::error::{Error, Result};
use crate::grid::GridSpec;
use crate::Vector3;

/// Upper bound on index cells per side.
const MAX_INDEX_CELLS: usize = 128;

#[derive(Debug, Clone)]
pub struct NeighbourIndex {
    spec: GridSpec,
    periodic: bool,
    points: Vec<Vector3>,
    cell_offsets: Vec<u32>,
    point_indices: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    dist2: f64,
    index: u32,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist2
            .total_cmp(&other.dist2)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl NeighbourIndex {
    /// Build an index over `points`.
    ///
    /// With `periodic_box` set, points are wrapped into that box and distances
    /// use the minimum image. `per_cell` is the target mean occupancy of an
    /// index cell.
    pub fn new(points: &[Vector3], periodic_box: Option<&GridSpec>, per_cell: usize) -> Result<Self> {
        if points.is_empty() {
            return Err(Error::InvalidInput(
                "cannot index an empty point set".into(),
            ));
        }
        let m = ((points.len() as f64 / per_cell.max(1) as f64).cbrt().floor() as usize)
            .clamp(2, MAX_INDEX_CELLS);

        let (spec, points): (GridSpec, Vec<Vector3>) = match periodic_box {
            Some(b) => (
                GridSpec::new(m, b.box_length(), b.origin())?,
                points.iter().map(|p| b.wrap(p)).collect(),
            ),
            None => {
                let extent = points
                    .iter()
                    .fold(0.0_f64, |acc, p| acc.max(p.abs().max()));
                (
                    GridSpec::enclosing(points, m, 1e-6 * (1.0 + extent))?,
                    points.to_vec(),
                )
            }
        };

        let n_cells = spec.num_cells();
        let mut bins: Vec<Vec<u32>> = vec![Vec::new(); n_cells];
        let mut index = Self {
            spec,
            periodic: periodic_box.is_some(),
            points,
            cell_offsets: Vec::with_capacity(n_cells + 1),
            point_indices: Vec::new(),
        };
        for (i, p) in index.points.iter().enumerate() {
            bins[index.cell_of(p)].push(i as u32);
        }
        index.point_indices.reserve(index.points.len());
        index.cell_offsets.push(0);
        for bin in bins {
            index.point_indices.extend(bin);
            index.cell_offsets.push(index.point_indices.len() as u32);
        }
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Separation `b - a` (minimum image when periodic).
    pub fn delta(&self, a: &Vector3, b: &Vector3) -> Vector3 {
        if self.periodic {
            self.spec.periodic_delta(a, b)
        } else {
            b - a
        }
    }

    /// The `k` nearest neighbours of indexed point `i` (excluding itself) as
    /// `(index, distance)`, nearest first.
    pub fn nearest(&self, i: usize, k: usize) -> Vec<(u32, f64)> {
        self.nearest_to(&self.points[i], k, Some(i as u32))
    }

    /// The `k` nearest indexed points to `p`, optionally skipping one index.
    pub fn nearest_to(&self, p: &Vector3, k: usize, exclude: Option<u32>) -> Vec<(u32, f64)> {
        if k == 0 {
            return Vec::new();
        }
        let p = if self.periodic { self.spec.wrap(p) } else { *p };
        let centre = self.spec.coords(self.cell_of(&p)).map(|c| c as i64);
        let m = self.spec.n() as i64;
        let h = self.spec.cell_size();
        let max_shell = if self.periodic { m / 2 } else { m - 1 };

        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        let mut seen: HashSet<usize> = HashSet::new();

        for s in 0..=max_shell {
            let dedupe = self.periodic && 2 * s + 1 > m;
            seen.clear();
            for dx in -s..=s {
                for dy in -s..=s {
                    for dz in -s..=s {
                        if dx.abs().max(dy.abs()).max(dz.abs()) != s {
                            continue;
                        }
                        let (x, y, z) = (centre[0] + dx, centre[1] + dy, centre[2] + dz);
                        let cell = if self.periodic {
                            self.spec.wrapped_index(x, y, z)
                        } else if (0..m).contains(&x) && (0..m).contains(&y) && (0..m).contains(&z) {
                            self.spec.index(x as usize, y as usize, z as usize)
                        } else {
                            continue;
                        };
                        if dedupe && !seen.insert(cell) {
                            continue;
                        }
                        self.scan_cell(cell, &p, k, exclude, &mut heap);
                    }
                }
            }
            // Unvisited shells lie at least s cells away
            if heap.len() == k {
                if let Some(worst) = heap.peek() {
                    let reach = s as f64 * h;
                    if worst.dist2 <= reach * reach {
                        break;
                    }
                }
            }
        }

        heap.into_sorted_vec()
            .into_iter()
            .map(|c| (c.index, c.dist2.sqrt()))
            .collect()
    }

    fn scan_cell(
        &self,
        cell: usize,
        p: &Vector3,
        k: usize,
        exclude: Option<u32>,
        heap: &mut BinaryHeap<Candidate>,
    ) {
        let start = self.cell_offsets[cell] as usize;
        let end = self.cell_offsets[cell + 1] as usize;
        for &idx in &self.point_indices[start..end] {
            if exclude == Some(idx) {
                continue;
            }
            let dist2 = self.delta(p, &self.points[idx as usize]).norm_squared();
            let candidate = Candidate { dist2, index: idx };
            if heap.len() < k {
                heap.push(candidate);
            } else if heap.peek().is_some_and(|worst| candidate < *worst) {
                heap.pop();
                heap.push(candidate);
            }
        }
    }

    fn cell_of(&self, p: &Vector3) -> usize {
        let u = self.spec.to_grid_units(p);
        let top = self.spec.n() - 1;
        let c = |v: f64| (v.floor().max(0.0) as usize).min(top);
        self.spec.index(c(u.x), c(u.y), c(u.z))
    }
}
