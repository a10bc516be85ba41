//! Void and supercluster records, the catalogue, and their derivation from
//! watershed basins.

use std::f64::consts::PI;
use std::path::Path;

use rkyv::{Archive, Deserialize, Serialize};
use tracing::{debug, info};

use crate::cosmology::uvec_to_radec;
use crate::mask::SurveyMask;
use crate::Vector3;

use super::graph::DensityGraph;
use super::watershed::{density_ratio, Basins};
use super::{VoidCentre, VoidFinderConfig};

/// Exponent of the effective radius in the void parameter `λ_v = δ_avg R^1.2`.
const LAMBDA_RADIUS_EXPONENT: f64 = 1.2;

/// Exponent for the supercluster parameter `λ_c = δ_avg R^1.6`.
const CLUSTER_LAMBDA_RADIUS_EXPONENT: f64 = 1.6;

// ── Records ─────────────────────────────────────────────────────────────────

/// What the member indices of a void refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum MemberKind {
    /// Flat grid cell indices.
    Cells,
    /// Indices into the input tracer set.
    Tracers,
}

/// Underdense voids or overdense superclusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum StructureKind {
    Voids,
    Superclusters,
}

impl StructureKind {
    /// Sign taking a flooded-graph density back to the contrast.
    fn sign(self) -> f64 {
        match self {
            StructureKind::Voids => 1.0,
            StructureKind::Superclusters => -1.0,
        }
    }

    fn lambda_exponent(self) -> f64 {
        match self {
            StructureKind::Voids => LAMBDA_RADIUS_EXPONENT,
            StructureKind::Superclusters => CLUSTER_LAMBDA_RADIUS_EXPONENT,
        }
    }

    /// Ridge-to-core contrast ratio from flooded-graph densities, oriented so
    /// that it is at least 1 for a basin bounded by its ridge.
    fn ratio(self, ridge: f64, core: f64) -> f64 {
        match self {
            StructureKind::Voids => density_ratio(ridge, core),
            StructureKind::Superclusters => density_ratio(-core, -ridge),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum EdgeStatus {
    /// No member touches the survey or grid edge.
    Interior,
    /// At least one member sits on the edge; size and shape may be truncated.
    Edge,
    /// The reported centre lies outside the survey.
    CentreOutsideSurvey,
}

/// Sky coordinates of a void centre (survey mode with a cosmology).
#[derive(Debug, Clone, Copy, PartialEq, Archive, Serialize, Deserialize)]
pub struct SkyPosition {
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub redshift: f64,
    /// Effective radius seen from the observer.
    pub angular_radius_deg: f64,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct VoidRecord {
    /// Unique within the catalogue; the most extreme cores get the lowest ids.
    pub id: u32,
    /// Centre in box coordinates (Mpc/h).
    pub centre: [f64; 3],
    /// Node with the lowest density contrast (highest for superclusters).
    pub core: u32,
    /// Sphere-equivalent radius `(3V / 4π)^(1/3)` (Mpc/h).
    pub radius: f64,
    /// Summed member volume (Mpc/h)³.
    pub volume: f64,
    /// Density contrast at the core; always below the search threshold for
    /// voids and above it for superclusters.
    pub central_contrast: f64,
    /// Volume-weighted mean contrast over the members.
    pub mean_contrast: f64,
    /// `mean_contrast * radius^1.2` for voids, `radius^1.6` for superclusters.
    pub lambda: f64,
    /// `(1 + δ_ridge) / (1 + δ_core)` with the ridge taken as the lowest
    /// density just outside the void; inverted for superclusters, whose ridge
    /// is the highest density outside. `None` when nothing borders it.
    pub density_ratio: Option<f64>,
    pub edge: EdgeStatus,
    /// Id of the enclosing void under the hierarchical policy.
    pub parent: Option<u32>,
    /// Member node indices, ascending.
    pub members: Vec<u32>,
    pub sky: Option<SkyPosition>,
}

impl VoidRecord {
    pub fn centre(&self) -> Vector3 {
        Vector3::new(self.centre[0], self.centre[1], self.centre[2])
    }

    pub fn is_top_level(&self) -> bool {
        self.parent.is_none()
    }
}

// ── Catalogue ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum VoidSearchStatus {
    Found,
    NoVoidsFound,
}

/// Voids from one search, ordered by id.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct VoidCatalogue {
    pub member_kind: MemberKind,
    pub structure: StructureKind,
    /// Density contrast threshold used for the search.
    pub threshold: f64,
    pub status: VoidSearchStatus,
    pub voids: Vec<VoidRecord>,
}

impl VoidCatalogue {
    pub fn len(&self) -> usize {
        self.voids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voids.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&VoidRecord> {
        self.voids.get(id as usize).filter(|v| v.id == id)
    }

    pub fn top_level(&self) -> impl Iterator<Item = &VoidRecord> {
        self.voids.iter().filter(|v| v.is_top_level())
    }

    pub fn children_of(&self, id: u32) -> impl Iterator<Item = &VoidRecord> {
        self.voids.iter().filter(move |v| v.parent == Some(id))
    }

    /// Serialize the catalogue to rkyv bytes.
    pub fn to_rkyv_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| anyhow::anyhow!("rkyv serialization failed: {}", e))?;
        Ok(bytes.to_vec())
    }

    pub fn from_rkyv_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| anyhow::anyhow!("rkyv deserialization failed: {}", e))
    }

    /// Save the catalogue to a file using rkyv.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let bytes = self.to_rkyv_bytes()?;
        std::fs::write(path, &bytes)?;
        info!(
            "Saved {} {:?} to {} ({} bytes)",
            self.len(),
            self.structure,
            path.display(),
            bytes.len()
        );
        Ok(())
    }

    /// Load a catalogue previously written by [`VoidCatalogue::save_to_file`].
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let catalogue = Self::from_rkyv_bytes(&bytes)?;
        info!(
            "Loaded {} {:?} from {}",
            catalogue.len(),
            catalogue.structure,
            path.display()
        );
        Ok(catalogue)
    }
}

// ── Derivation from basins ──────────────────────────────────────────────────

/// Turn surviving basins into filtered, id-ordered records. `graph` is the
/// graph that was flooded; `structure` says how its densities map back to
/// contrasts.
pub(crate) fn build_records<G: DensityGraph>(
    graph: &G,
    basins: &Basins,
    mask: Option<&SurveyMask>,
    config: &VoidFinderConfig,
    structure: StructureKind,
) -> Vec<VoidRecord> {
    let sign = structure.sign();
    let mut candidates: Vec<(u32, f64, VoidRecord)> = Vec::new();
    let mut in_void = vec![false; graph.len()];
    let mut nbrs = Vec::new();

    for (b, basin) in basins.basins.iter().enumerate() {
        if !basin.is_void() {
            continue;
        }
        let mut members = basins.all_members(b as u32);
        members.sort_unstable();
        if members.len() < config.min_members {
            continue;
        }
        let volume: f64 = members.iter().map(|&m| graph.volume(m as usize)).sum();
        let radius = (3.0 * volume / (4.0 * PI)).cbrt();
        if radius < config.min_radius {
            continue;
        }

        let mean_contrast = members
            .iter()
            .map(|&m| graph.volume(m as usize) * sign * graph.density(m as usize))
            .sum::<f64>()
            / volume;
        let centre = match config.centre {
            VoidCentre::DensityMinimum => graph.position(basin.core as usize),
            VoidCentre::Barycentre => barycentre(graph, &members, basin.core),
        };

        // Ridge: lowest density among nodes bordering the void
        for &m in &members {
            in_void[m as usize] = true;
        }
        let mut ridge = f64::INFINITY;
        let mut on_edge = false;
        for &m in &members {
            graph.neighbours(m as usize, &mut nbrs);
            for &nb in &nbrs {
                let nb = nb as usize;
                if !in_void[nb] && !graph.is_excluded(nb) {
                    ridge = ridge.min(graph.density(nb));
                }
            }
            on_edge |= graph.touches_boundary(m as usize);
        }
        for &m in &members {
            in_void[m as usize] = false;
        }

        let edge = edge_status(centre, on_edge, mask, config);
        let sky = match (config.geometry.observer(), &config.cosmology) {
            (Some(observer), Some(cosmology)) => {
                let (ra_deg, dec_deg, r) = uvec_to_radec(&(centre - observer));
                Some(SkyPosition {
                    ra_deg,
                    dec_deg,
                    redshift: cosmology.redshift_at(r),
                    angular_radius_deg: radius.atan2(r).to_degrees(),
                })
            }
            _ => None,
        };

        candidates.push((
            b as u32,
            basin.core_density,
            VoidRecord {
                id: 0,
                centre: [centre.x, centre.y, centre.z],
                core: basin.core,
                radius,
                volume,
                central_contrast: sign * basin.core_density,
                mean_contrast,
                lambda: mean_contrast * radius.powf(structure.lambda_exponent()),
                density_ratio: ridge
                    .is_finite()
                    .then(|| structure.ratio(ridge, basin.core_density)),
                edge,
                parent: None,
                members,
                sky,
            },
        ));
    }

    // Deepest first in the flooded graph; ids follow that order
    candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.2.core.cmp(&b.2.core)));
    let mut id_of = vec![None; basins.basins.len()];
    for (id, (b, _, _)) in candidates.iter().enumerate() {
        id_of[*b as usize] = Some(id as u32);
    }

    let records: Vec<VoidRecord> = candidates
        .into_iter()
        .enumerate()
        .map(|(id, (b, _, mut record))| {
            record.id = id as u32;
            record.parent = basins.basins[b as usize]
                .parent
                .and_then(|p| id_of[p as usize]);
            record
        })
        .collect();
    debug!(
        "{} of {} basins survive the size cuts",
        records.len(),
        basins.basins.iter().filter(|b| b.is_void()).count()
    );
    records
}

/// Volume-weighted centre; in a periodic box offsets are taken relative to
/// the core and the result wrapped back into the box.
fn barycentre<G: DensityGraph>(graph: &G, members: &[u32], core: u32) -> Vector3 {
    let anchor = graph.position(core as usize);
    let mut weighted = Vector3::zeros();
    let mut total = 0.0;
    for &m in members {
        let v = graph.volume(m as usize);
        let p = graph.position(m as usize);
        let offset = match graph.periodic_box() {
            Some(spec) => spec.periodic_delta(&anchor, &p),
            None => p - anchor,
        };
        weighted += offset * v;
        total += v;
    }
    let centre = anchor + weighted / total;
    match graph.periodic_box() {
        Some(spec) => spec.wrap(&centre),
        None => centre,
    }
}

fn edge_status(
    centre: Vector3,
    on_edge: bool,
    mask: Option<&SurveyMask>,
    config: &VoidFinderConfig,
) -> EdgeStatus {
    if let (Some(observer), Some(mask)) = (config.geometry.observer(), mask) {
        if !mask.contains(&(centre - observer)) {
            return EdgeStatus::CentreOutsideSurvey;
        }
    }
    if on_edge {
        EdgeStatus::Edge
    } else {
        EdgeStatus::Interior
    }
}
