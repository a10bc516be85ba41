//! Watershed void finding.
//!
//! The finder works on a graph of density samples: either the cells of a
//! (smoothed) density grid or the tracers themselves with a k-nearest-neighbour
//! density estimate. Local minima below the threshold seed basins, which are
//! flooded in order of increasing density; where basins meet they are merged or,
//! under the hierarchical policy, nested as child voids.
//!
//! [`find_clusters`] runs the same flood on the negated contrast to extract
//! superclusters: regions above the threshold grown from density peaks, never
//! merged with one another.

pub mod catalogue;
pub mod graph;
pub mod neighbours;
mod watershed;

pub use catalogue::{
    EdgeStatus, MemberKind, SkyPosition, StructureKind, VoidCatalogue, VoidRecord,
    VoidSearchStatus,
};
pub use graph::{CellGraph, DensityGraph, TracerGraph};
use graph::Inverted;
pub use neighbours::NeighbourIndex;

use std::time::Instant;

use tracing::{info, warn};

use crate::cosmology::Cosmology;
use crate::density::{DensityAssigner, DensityConfig, MassAssignment};
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::grid::GridSpec;
use crate::mask::SurveyMask;
use crate::tracer::{RandomSet, TracerSet};
use crate::Vector3;

/// Variance below which a density graph is treated as featureless.
const UNIFORM_VARIANCE: f64 = 1e-24;

// ── Options ─────────────────────────────────────────────────────────────────

/// How the density is sampled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DensityProxy {
    /// Grid cells, optionally Gaussian-smoothed (radius in Mpc/h).
    Grid {
        assignment: MassAssignment,
        smoothing_radius: Option<f64>,
    },
    /// Tracers, with density from the volume enclosing `neighbours` nearest
    /// neighbours and adjacency from the symmetrised k-nearest-neighbour graph.
    Tracer { neighbours: usize },
}

impl Default for DensityProxy {
    fn default() -> Self {
        DensityProxy::Grid {
            assignment: MassAssignment::Cic,
            smoothing_radius: None,
        }
    }
}

/// Cell adjacency for the grid proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
    /// Six face neighbours.
    #[default]
    Face,
    /// All 26 surrounding cells.
    Full,
}

/// What happens when two basins meet at a saddle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum MergePolicy {
    /// The shallower basin is absorbed into the deeper one.
    #[default]
    Flat,
    /// The shallower basin survives as a child void when
    /// `(1 + δ_saddle) / (1 + δ_core)` is at least `min_density_ratio`;
    /// otherwise it is absorbed.
    Hierarchical { min_density_ratio: f64 },
    /// Basins never merge; the saddle node joins the deeper one and both are
    /// reported as separate top-level voids.
    Disjoint,
}

/// Which point is reported as the void centre.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoidCentre {
    /// Volume-weighted barycentre of the members.
    #[default]
    Barycentre,
    /// Position of the lowest-density member.
    DensityMinimum,
}

/// Parameters for [`find_voids`].
#[derive(Debug, Clone, PartialEq)]
pub struct VoidFinderConfig {
    pub proxy: DensityProxy,
    /// Cells per side for the grid proxy. Default 128.
    pub grid_size: usize,
    /// Box side in Mpc/h. Default 1000.
    pub box_length: f64,
    pub box_origin: Vector3,
    /// Survey mode only: size the grid to enclose the tracers and observer
    /// with this padding (Mpc/h).
    pub box_padding: Option<f64>,
    pub geometry: Geometry,
    pub connectivity: Connectivity,
    /// Only nodes with density contrast strictly below this value are
    /// flooded (strictly above it for [`find_clusters`]). Default 0.
    pub threshold: f64,
    pub merge_policy: MergePolicy,
    pub centre: VoidCentre,
    /// Smallest member count for a reported void. Default 1.
    pub min_members: usize,
    /// Smallest effective radius (Mpc/h) for a reported void. Default 0.
    pub min_radius: f64,
    /// Expected-count floor for survey coverage, as in [`DensityConfig`].
    pub random_threshold: f64,
    pub min_completeness: f64,
    pub outside_mask_tolerance: f64,
    /// Fiducial cosmology used to attach sky positions in survey mode.
    pub cosmology: Option<Cosmology>,
    /// Return [`Error::NoVoidsFound`] instead of an empty catalogue.
    ///
    /// The remaining fields apply to superclusters as well, except
    /// `merge_policy`: superclusters are always disjoint.
    pub fail_on_empty: bool,
}

impl Default for VoidFinderConfig {
    fn default() -> Self {
        Self {
            proxy: DensityProxy::default(),
            grid_size: 128,
            box_length: 1000.0,
            box_origin: Vector3::zeros(),
            box_padding: None,
            geometry: Geometry::default(),
            connectivity: Connectivity::Face,
            threshold: 0.0,
            merge_policy: MergePolicy::Flat,
            centre: VoidCentre::Barycentre,
            min_members: 1,
            min_radius: 0.0,
            random_threshold: 0.01,
            min_completeness: 0.0,
            outside_mask_tolerance: 0.01,
            cosmology: None,
            fail_on_empty: false,
        }
    }
}

impl VoidFinderConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "void threshold must be finite, got {}",
                self.threshold
            )));
        }
        if !(self.min_radius >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "minimum void radius must be non-negative, got {}",
                self.min_radius
            )));
        }
        if let MergePolicy::Hierarchical { min_density_ratio } = self.merge_policy {
            if !(min_density_ratio >= 1.0) {
                return Err(Error::InvalidConfig(format!(
                    "hierarchical merge needs a density ratio >= 1, got {}",
                    min_density_ratio
                )));
            }
        }
        match self.proxy {
            DensityProxy::Grid {
                smoothing_radius: Some(r),
                ..
            } if !(r.is_finite() && r >= 0.0) => Err(Error::InvalidConfig(format!(
                "void smoothing radius must be non-negative, got {}",
                r
            ))),
            DensityProxy::Tracer { neighbours: 0 } => Err(Error::InvalidConfig(
                "tracer density needs at least one neighbour".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Grid geometry (also the periodic box for the tracer proxy).
    pub fn grid_spec(&self, tracers: &TracerSet) -> Result<GridSpec> {
        match (self.geometry, self.box_padding) {
            (Geometry::Survey { observer }, Some(padding)) => {
                let mut points = tracers.positions.clone();
                points.push(observer);
                GridSpec::enclosing(&points, self.grid_size, padding)
            }
            _ => GridSpec::new(self.grid_size, self.box_length, self.box_origin),
        }
    }
}

// ── Entry points ────────────────────────────────────────────────────────────

/// Find voids in a tracer catalogue (typically the output of reconstruction).
///
/// Survey geometry with the grid proxy needs `randoms` or `mask` for the
/// expected counts. A featureless density field yields an empty catalogue with
/// [`VoidSearchStatus::NoVoidsFound`] rather than an error.
pub fn find_voids(
    tracers: &TracerSet,
    randoms: Option<&RandomSet>,
    mask: Option<&SurveyMask>,
    config: &VoidFinderConfig,
) -> Result<VoidCatalogue> {
    search(tracers, randoms, mask, config, StructureKind::Voids)
}

/// Find superclusters: basins of the negated contrast grown from density
/// peaks above `config.threshold`. Adjacent superclusters are never merged.
pub fn find_clusters(
    tracers: &TracerSet,
    randoms: Option<&RandomSet>,
    mask: Option<&SurveyMask>,
    config: &VoidFinderConfig,
) -> Result<VoidCatalogue> {
    search(tracers, randoms, mask, config, StructureKind::Superclusters)
}

fn search(
    tracers: &TracerSet,
    randoms: Option<&RandomSet>,
    mask: Option<&SurveyMask>,
    config: &VoidFinderConfig,
    structure: StructureKind,
) -> Result<VoidCatalogue> {
    let t0 = Instant::now();
    config.validate()?;
    let spec = config.grid_spec(tracers)?;

    let catalogue = match config.proxy {
        DensityProxy::Grid {
            assignment,
            smoothing_radius,
        } => {
            let density_config = DensityConfig {
                assignment,
                smoothing_radius: smoothing_radius.unwrap_or(0.0),
                geometry: config.geometry,
                random_threshold: config.random_threshold,
                min_completeness: config.min_completeness,
                outside_mask_tolerance: config.outside_mask_tolerance,
            };
            let assigner = DensityAssigner::new(spec, density_config)?;
            let density = assigner.assign_allow_uniform(tracers, randoms, mask)?;
            let graph = CellGraph::new(density, config.connectivity, config.geometry);
            search_graph(&graph, MemberKind::Cells, mask, config, structure)?
        }
        DensityProxy::Tracer { neighbours } => {
            let graph = TracerGraph::new(tracers, neighbours, config.geometry, &spec, mask)?;
            search_graph(&graph, MemberKind::Tracers, mask, config, structure)?
        }
    };
    info!(
        "{:?} search over {:?}: {} found in {:.1} ms",
        structure,
        catalogue.member_kind,
        catalogue.len(),
        t0.elapsed().as_secs_f32() * 1000.0
    );
    Ok(catalogue)
}

fn search_graph<G: DensityGraph>(
    graph: &G,
    member_kind: MemberKind,
    mask: Option<&SurveyMask>,
    config: &VoidFinderConfig,
    structure: StructureKind,
) -> Result<VoidCatalogue> {
    if is_featureless(graph) {
        info!("Density field is uniform; nothing to find");
        return empty_catalogue(member_kind, config, structure);
    }
    match structure {
        StructureKind::Voids => find_voids_in_graph(graph, member_kind, mask, config),
        StructureKind::Superclusters => find_clusters_in_graph(graph, member_kind, mask, config),
    }
}

/// Run the watershed on any density graph and build the void catalogue.
pub fn find_voids_in_graph<G: DensityGraph>(
    graph: &G,
    member_kind: MemberKind,
    mask: Option<&SurveyMask>,
    config: &VoidFinderConfig,
) -> Result<VoidCatalogue> {
    config.validate()?;
    let basins = watershed::flood(graph, config.threshold, config.merge_policy);
    let records = catalogue::build_records(graph, &basins, mask, config, StructureKind::Voids);
    finish(records, member_kind, config, StructureKind::Voids)
}

/// Supercluster counterpart of [`find_voids_in_graph`].
pub fn find_clusters_in_graph<G: DensityGraph>(
    graph: &G,
    member_kind: MemberKind,
    mask: Option<&SurveyMask>,
    config: &VoidFinderConfig,
) -> Result<VoidCatalogue> {
    config.validate()?;
    let inverted = Inverted(graph);
    let basins = watershed::flood(&inverted, -config.threshold, MergePolicy::Disjoint);
    let records = catalogue::build_records(
        &inverted,
        &basins,
        mask,
        config,
        StructureKind::Superclusters,
    );
    finish(records, member_kind, config, StructureKind::Superclusters)
}

fn finish(
    records: Vec<VoidRecord>,
    member_kind: MemberKind,
    config: &VoidFinderConfig,
    structure: StructureKind,
) -> Result<VoidCatalogue> {
    if records.is_empty() {
        return empty_catalogue(member_kind, config, structure);
    }
    info!(
        "Found {} {:?} ({} top-level) beyond δ = {}",
        records.len(),
        structure,
        records.iter().filter(|v| v.parent.is_none()).count(),
        config.threshold
    );
    Ok(VoidCatalogue {
        member_kind,
        structure,
        threshold: config.threshold,
        status: VoidSearchStatus::Found,
        voids: records,
    })
}

/// `true` when the densities of the usable nodes have (numerically) zero variance.
fn is_featureless<G: DensityGraph>(graph: &G) -> bool {
    let (mut n, mut sum, mut sum2) = (0.0, 0.0, 0.0);
    for i in (0..graph.len()).filter(|&i| !graph.is_excluded(i)) {
        let d = graph.density(i);
        n += 1.0;
        sum += d;
        sum2 += d * d;
    }
    if n == 0.0 {
        return true;
    }
    let mean = sum / n;
    sum2 / n - mean * mean < UNIFORM_VARIANCE
}

fn empty_catalogue(
    member_kind: MemberKind,
    config: &VoidFinderConfig,
    structure: StructureKind,
) -> Result<VoidCatalogue> {
    if config.fail_on_empty {
        return Err(Error::NoVoidsFound {
            threshold: config.threshold,
        });
    }
    warn!("No {:?} found beyond δ = {}", structure, config.threshold);
    Ok(VoidCatalogue {
        member_kind,
        structure,
        threshold: config.threshold,
        status: VoidSearchStatus::NoVoidsFound,
        voids: Vec::new(),
    })
}
