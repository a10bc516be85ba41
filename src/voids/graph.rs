//! Density graphs the watershed runs on.
//!
//! A node carries a density contrast, a volume and a position; edges say which
//! nodes are adjacent. Grid cells and tracers both implement [`DensityGraph`].

use std::f64::consts::PI;

use tracing::{debug, info};

use crate::density::DensityField;
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::grid::GridSpec;
use crate::mask::{PixelScheme, SurveyMask};
use crate::tracer::TracerSet;
use crate::Vector3;

use super::neighbours::NeighbourIndex;
use super::Connectivity;

/// Mean tracers per cell of the footprint built for unmasked surveys.
const FOOTPRINT_TRACERS_PER_CELL: usize = 10;

/// Adjacency and per-node samples for the watershed.
pub trait DensityGraph {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Density contrast δ of `node`.
    fn density(&self, node: usize) -> f64;

    /// Volume represented by `node` (Mpc/h)³.
    fn volume(&self, node: usize) -> f64;

    fn position(&self, node: usize) -> Vector3;

    /// Excluded nodes (outside the survey, vetoed) are never flooded.
    fn is_excluded(&self, node: usize) -> bool;

    /// `true` when the node sits on the survey or grid edge.
    fn touches_boundary(&self, node: usize) -> bool;

    /// Replace `out` with the neighbours of `node`.
    fn neighbours(&self, node: usize, out: &mut Vec<u32>);

    /// The periodic box, when positions wrap.
    fn periodic_box(&self) -> Option<&GridSpec>;
}

// ── Grid cells ──────────────────────────────────────────────────────────────

/// Cells of a density grid with face or full adjacency.
#[derive(Debug, Clone)]
pub struct CellGraph {
    density: DensityField,
    periodic: bool,
    offsets: Vec<[i64; 3]>,
}

impl CellGraph {
    pub fn new(density: DensityField, connectivity: Connectivity, geometry: Geometry) -> Self {
        let offsets = match connectivity {
            Connectivity::Face => vec![
                [-1, 0, 0],
                [1, 0, 0],
                [0, -1, 0],
                [0, 1, 0],
                [0, 0, -1],
                [0, 0, 1],
            ],
            Connectivity::Full => {
                let mut v = Vec::with_capacity(26);
                for dx in -1..=1 {
                    for dy in -1..=1 {
                        for dz in -1..=1 {
                            if (dx, dy, dz) != (0, 0, 0) {
                                v.push([dx, dy, dz]);
                            }
                        }
                    }
                }
                v
            }
        };
        Self {
            density,
            periodic: geometry.is_periodic(),
            offsets,
        }
    }

    pub fn density_field(&self) -> &DensityField {
        &self.density
    }

    fn spec(&self) -> &GridSpec {
        self.density.spec()
    }

    fn neighbour_cell(&self, node: usize, offset: &[i64; 3]) -> Option<usize> {
        let spec = self.spec();
        let c = spec.coords(node);
        let (x, y, z) = (
            c[0] as i64 + offset[0],
            c[1] as i64 + offset[1],
            c[2] as i64 + offset[2],
        );
        if self.periodic {
            return Some(spec.wrapped_index(x, y, z));
        }
        let n = spec.n() as i64;
        if (0..n).contains(&x) && (0..n).contains(&y) && (0..n).contains(&z) {
            Some(spec.index(x as usize, y as usize, z as usize))
        } else {
            None
        }
    }
}

impl DensityGraph for CellGraph {
    fn len(&self) -> usize {
        self.spec().num_cells()
    }

    fn density(&self, node: usize) -> f64 {
        self.density.contrast(node)
    }

    fn volume(&self, _node: usize) -> f64 {
        self.spec().cell_volume()
    }

    fn position(&self, node: usize) -> Vector3 {
        self.spec().cell_centre(node)
    }

    fn is_excluded(&self, node: usize) -> bool {
        !self.density.is_covered(node)
    }

    fn touches_boundary(&self, node: usize) -> bool {
        if self.periodic {
            return false;
        }
        self.offsets
            .iter()
            .any(|o| match self.neighbour_cell(node, o) {
                Some(nb) => !self.density.is_covered(nb),
                None => true,
            })
    }

    fn neighbours(&self, node: usize, out: &mut Vec<u32>) {
        out.clear();
        for o in &self.offsets {
            if let Some(nb) = self.neighbour_cell(node, o) {
                if nb != node && !out.contains(&(nb as u32)) {
                    out.push(nb as u32);
                }
            }
        }
    }

    fn periodic_box(&self) -> Option<&GridSpec> {
        self.periodic.then(|| self.spec())
    }
}

// ── Negated view ────────────────────────────────────────────────────────────

/// Another graph with the sign of every density flipped, so density peaks
/// become the minima the watershed grows from.
pub(crate) struct Inverted<'a, G>(pub &'a G);

impl<G: DensityGraph> DensityGraph for Inverted<'_, G> {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn density(&self, node: usize) -> f64 {
        -self.0.density(node)
    }

    fn volume(&self, node: usize) -> f64 {
        self.0.volume(node)
    }

    fn position(&self, node: usize) -> Vector3 {
        self.0.position(node)
    }

    fn is_excluded(&self, node: usize) -> bool {
        self.0.is_excluded(node)
    }

    fn touches_boundary(&self, node: usize) -> bool {
        self.0.touches_boundary(node)
    }

    fn neighbours(&self, node: usize, out: &mut Vec<u32>) {
        self.0.neighbours(node, out)
    }

    fn periodic_box(&self) -> Option<&GridSpec> {
        self.0.periodic_box()
    }
}

// ── Tracers ─────────────────────────────────────────────────────────────────

/// Tracers as nodes, with k-nearest-neighbour densities and adjacency.
///
/// Each tracer's raw volume is the sphere through its k-th neighbour divided
/// by k; volumes are then rescaled to sum to the box volume (or the mask
/// volume in survey mode). The contrast compares `w / V` with the mean density,
/// scaled in survey mode by completeness × selection at the tracer. Tracers
/// outside the mask or vetoed are excluded and take no part in the mean.
///
/// A tracer is on the edge when the sphere through its k-th neighbour leaves
/// the survey: the mask if one is given, otherwise the angular and radial
/// footprint of the tracers themselves.
#[derive(Debug, Clone)]
pub struct TracerGraph {
    positions: Vec<Vector3>,
    density: Vec<f64>,
    volume: Vec<f64>,
    excluded: Vec<bool>,
    boundary: Vec<bool>,
    adjacency_offsets: Vec<u32>,
    adjacency: Vec<u32>,
    periodic_box: Option<GridSpec>,
}

impl TracerGraph {
    pub fn new(
        tracers: &TracerSet,
        neighbours: usize,
        geometry: Geometry,
        spec: &GridSpec,
        mask: Option<&SurveyMask>,
    ) -> Result<Self> {
        tracers.validate()?;
        let n = tracers.len();
        if neighbours == 0 || neighbours >= n {
            return Err(Error::InvalidInput(format!(
                "{} tracers cannot support a {}-nearest-neighbour density",
                n, neighbours
            )));
        }
        let periodic_box = geometry.is_periodic().then_some(*spec);
        let positions: Vec<Vector3> = match &periodic_box {
            Some(b) => tracers.positions.iter().map(|p| b.wrap(p)).collect(),
            None => tracers.positions.clone(),
        };
        let index = NeighbourIndex::new(&positions, periodic_box.as_ref(), neighbours)?;

        let mut knn: Vec<Vec<u32>> = Vec::with_capacity(n);
        let mut raw_volume = Vec::with_capacity(n);
        let mut reach = Vec::with_capacity(n);
        for i in 0..n {
            let near = index.nearest(i, neighbours);
            let r_k = near.last().map_or(0.0, |&(_, d)| d);
            raw_volume.push((4.0 * PI / 3.0 * r_k.powi(3) / neighbours as f64).max(f64::MIN_POSITIVE));
            reach.push(r_k);
            knn.push(near.into_iter().map(|(j, _)| j).collect());
        }

        // Symmetrised adjacency, stored compactly
        let mut lists: Vec<Vec<u32>> = knn.clone();
        for (i, near) in knn.iter().enumerate() {
            for &j in near {
                lists[j as usize].push(i as u32);
            }
        }
        let mut adjacency_offsets = Vec::with_capacity(n + 1);
        let mut adjacency = Vec::new();
        adjacency_offsets.push(0);
        for mut list in lists {
            list.sort_unstable();
            list.dedup();
            adjacency.extend(list);
            adjacency_offsets.push(adjacency.len() as u32);
        }

        let observer = geometry.observer();
        let selection: Vec<f64> = positions
            .iter()
            .map(|p| match (mask, observer) {
                (Some(m), Some(o)) => m.weight_at(&(p - o)),
                _ => 1.0,
            })
            .collect();
        let excluded: Vec<bool> = (0..n)
            .map(|i| tracers.is_vetoed(i) || selection[i] <= 0.0)
            .collect();
        let kept = || (0..n).filter(|&i| !excluded[i]);

        // Excluded tracers carry no volume and no weight
        let kept_raw_volume: f64 = kept().map(|i| raw_volume[i]).sum();
        let total_volume = match (&periodic_box, mask) {
            (Some(b), _) => b.box_length().powi(3),
            (None, Some(m)) if m.volume() > 0.0 => m.volume(),
            _ => kept_raw_volume,
        };
        let scale = if kept_raw_volume > 0.0 {
            total_volume / kept_raw_volume
        } else {
            0.0
        };
        let volume: Vec<f64> = (0..n)
            .map(|i| if excluded[i] { 0.0 } else { raw_volume[i] * scale })
            .collect();

        let weights: Vec<f64> = (0..n).map(|i| tracers.weight(i)).collect();
        let total_weight: f64 = kept().map(|i| weights[i]).sum();
        let effective_volume: f64 = kept().map(|i| volume[i] * selection[i]).sum();
        if !(total_weight > 0.0 && effective_volume > 0.0) {
            return Err(Error::EmptyField(
                "tracer catalogue carries no usable weight".into(),
            ));
        }
        let mean_density = total_weight / effective_volume;
        let density: Vec<f64> = (0..n)
            .map(|i| {
                if excluded[i] {
                    0.0
                } else {
                    weights[i] / volume[i] / (mean_density * selection[i]) - 1.0
                }
            })
            .collect();

        // Without a survey mask the edges come from the footprint of the tracers
        let footprint = match (mask, observer) {
            (None, Some(o)) => Some(SurveyMask::from_tracers(
                footprint_nside(n),
                PixelScheme::Nested,
                &positions,
                o,
            )?),
            _ => None,
        };
        let edge_mask = mask.or(footprint.as_ref());
        let boundary: Vec<bool> = (0..n)
            .map(|i| match (edge_mask, observer) {
                (Some(m), Some(o)) => probe_outside(m, &(positions[i] - o), reach[i]),
                _ => false,
            })
            .collect();

        info!(
            "Tracer graph: {} nodes, {} edges, k = {}, {} excluded",
            n,
            adjacency.len() / 2,
            neighbours,
            excluded.iter().filter(|&&e| e).count()
        );
        debug!("Mean tracer density {:.4e} per (Mpc/h)^3", mean_density);

        Ok(Self {
            positions,
            density,
            volume,
            excluded,
            boundary,
            adjacency_offsets,
            adjacency,
            periodic_box,
        })
    }
}

/// Largest power-of-two HEALPix resolution leaving at least
/// `FOOTPRINT_TRACERS_PER_CELL` tracers per cell on average.
fn footprint_nside(n: usize) -> u32 {
    let mut nside = 1u32;
    while nside < 256 && 12 * (2 * nside as usize).pow(2) * FOOTPRINT_TRACERS_PER_CELL <= n {
        nside *= 2;
    }
    nside
}

/// Does the sphere of radius `r` around `offset` poke outside the mask?
fn probe_outside(mask: &SurveyMask, offset: &Vector3, r: f64) -> bool {
    let probes = [
        Vector3::x(),
        -Vector3::x(),
        Vector3::y(),
        -Vector3::y(),
        Vector3::z(),
        -Vector3::z(),
    ];
    probes.iter().any(|d| !mask.contains(&(offset + d * r)))
}

impl DensityGraph for TracerGraph {
    fn len(&self) -> usize {
        self.positions.len()
    }

    fn density(&self, node: usize) -> f64 {
        self.density[node]
    }

    fn volume(&self, node: usize) -> f64 {
        self.volume[node]
    }

    fn position(&self, node: usize) -> Vector3 {
        self.positions[node]
    }

    fn is_excluded(&self, node: usize) -> bool {
        self.excluded[node]
    }

    fn touches_boundary(&self, node: usize) -> bool {
        self.boundary[node]
    }

    fn neighbours(&self, node: usize, out: &mut Vec<u32>) {
        out.clear();
        let start = self.adjacency_offsets[node] as usize;
        let end = self.adjacency_offsets[node + 1] as usize;
        out.extend_from_slice(&self.adjacency[start..end]);
    }

    fn periodic_box(&self) -> Option<&GridSpec> {
        self.periodic_box.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cosmology::radec_to_uvec;
    use crate::density::AssignmentStats;
    use crate::grid::GridField;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn field(spec: GridSpec, coverage: Option<Vec<bool>>) -> DensityField {
        let values: Vec<f64> = (0..spec.num_cells()).map(|i| i as f64 * 0.01).collect();
        DensityField {
            field: GridField::from_real(spec, &values).unwrap(),
            coverage,
            stats: AssignmentStats::default(),
        }
    }

    #[test]
    fn face_and_full_neighbour_counts() {
        let spec = GridSpec::new(5, 5.0, Vector3::zeros()).unwrap();
        let mut out = Vec::new();
        let periodic = CellGraph::new(field(spec, None), Connectivity::Face, Geometry::default());
        periodic.neighbours(0, &mut out);
        assert_eq!(out.len(), 6);
        let full = CellGraph::new(field(spec, None), Connectivity::Full, Geometry::default());
        full.neighbours(0, &mut out);
        assert_eq!(out.len(), 26);

        let survey = Geometry::Survey {
            observer: Vector3::zeros(),
        };
        let open = CellGraph::new(field(spec, None), Connectivity::Face, survey);
        open.neighbours(0, &mut out);
        assert_eq!(out.len(), 3);
        assert!(open.touches_boundary(0));
        assert!(!open.touches_boundary(spec.index(2, 2, 2)));
    }

    #[test]
    fn small_periodic_grid_has_no_duplicate_neighbours() {
        let spec = GridSpec::new(2, 2.0, Vector3::zeros()).unwrap();
        let graph = CellGraph::new(field(spec, None), Connectivity::Full, Geometry::default());
        let mut out = Vec::new();
        graph.neighbours(0, &mut out);
        assert_eq!(out.len(), 7);
    }

    #[test]
    fn uncovered_cells_are_excluded() {
        let spec = GridSpec::new(4, 4.0, Vector3::zeros()).unwrap();
        let mut coverage = vec![true; spec.num_cells()];
        coverage[spec.index(1, 1, 2)] = false;
        let survey = Geometry::Survey {
            observer: Vector3::zeros(),
        };
        let graph = CellGraph::new(field(spec, Some(coverage)), Connectivity::Face, survey);
        assert!(graph.is_excluded(spec.index(1, 1, 2)));
        assert!(graph.touches_boundary(spec.index(1, 1, 1)));
    }

    #[test]
    fn lattice_tracers_have_uniform_density() {
        let spec = GridSpec::new(6, 12.0, Vector3::zeros()).unwrap();
        let positions = (0..spec.num_cells()).map(|i| spec.cell_centre(i)).collect();
        let set = TracerSet::new(positions);
        let graph = TracerGraph::new(&set, 6, Geometry::default(), &spec, None).unwrap();
        let total: f64 = (0..graph.len()).map(|i| graph.volume(i)).sum();
        assert!((total - 12.0_f64.powi(3)).abs() < 1e-6);
        for i in 0..graph.len() {
            assert!(graph.density(i).abs() < 1e-9, "node {} δ = {}", i, graph.density(i));
        }
        // Symmetrised 6-NN on a cubic lattice is the face adjacency
        let mut out = Vec::new();
        graph.neighbours(0, &mut out);
        assert_eq!(out.len(), 6);
    }

    #[test]
    fn rejects_too_many_neighbours() {
        let spec = GridSpec::new(4, 4.0, Vector3::zeros()).unwrap();
        let set = TracerSet::new(vec![Vector3::new(1.0, 1.0, 1.0); 3]);
        assert!(TracerGraph::new(&set, 3, Geometry::default(), &spec, None).is_err());
    }

    #[test]
    fn tracers_outside_the_mask_leave_contrasts_unchanged() {
        let spec = GridSpec::new(6, 12.0, Vector3::zeros()).unwrap();
        let observer = Vector3::new(6.0, 6.0, 6.0);
        let survey = Geometry::Survey { observer };
        let mask = SurveyMask::full_sky(2, PixelScheme::Ring)
            .unwrap()
            .with_radial_limits(0.0, 100.0);
        let lattice: Vec<Vector3> = (0..spec.num_cells()).map(|i| spec.cell_centre(i)).collect();
        let inside = TracerSet::new(lattice.clone());
        let before = TracerGraph::new(&inside, 6, survey, &spec, Some(&mask)).unwrap();

        // A ring of tracers 500 Mpc/h out, beyond the radial limit
        let mut positions = lattice;
        positions.extend((0..100).map(|i| observer + radec_to_uvec(3.6 * i as f64, 0.0) * 500.0));
        let with_far = TracerSet::new(positions);
        let after = TracerGraph::new(&with_far, 6, survey, &spec, Some(&mask)).unwrap();

        for i in 0..before.len() {
            assert!(
                (before.density(i) - after.density(i)).abs() < 1e-12,
                "node {}: δ {} became {}",
                i,
                before.density(i),
                after.density(i)
            );
            assert!((before.volume(i) - after.volume(i)).abs() < 1e-9);
        }
        for i in before.len()..after.len() {
            assert!(after.is_excluded(i));
            assert_eq!(after.volume(i), 0.0);
        }
    }

    #[test]
    fn unmasked_survey_flags_tracers_at_the_footprint_edge() {
        let mut rng = StdRng::seed_from_u64(8);
        let observer = Vector3::new(60.0, 60.0, 60.0);
        let positions: Vec<Vector3> = std::iter::repeat_with(|| {
            Vector3::new(
                rng.random_range(-50.0..50.0),
                rng.random_range(-50.0..50.0),
                rng.random_range(-50.0..50.0),
            )
        })
        .filter(|d: &Vector3| d.norm() < 50.0)
        .take(20000)
        .map(|d| observer + d)
        .collect();
        let set = TracerSet::new(positions);
        let spec = GridSpec::new(8, 120.0, Vector3::zeros()).unwrap();
        let graph =
            TracerGraph::new(&set, 6, Geometry::Survey { observer }, &spec, None).unwrap();

        let (mut outer, mut outer_flagged, mut inner, mut inner_flagged) = (0, 0, 0, 0);
        for i in 0..graph.len() {
            let r = (graph.position(i) - observer).norm();
            if r > 49.0 {
                outer += 1;
                outer_flagged += graph.touches_boundary(i) as usize;
            } else if (10.0..30.0).contains(&r) {
                inner += 1;
                inner_flagged += graph.touches_boundary(i) as usize;
            }
        }
        println!(
            "edge flags: {}/{} outer, {}/{} inner",
            outer_flagged, outer, inner_flagged, inner
        );
        assert!(outer_flagged as f64 > 0.9 * outer as f64);
        assert!((inner_flagged as f64) < 0.05 * inner as f64);
    }
}
