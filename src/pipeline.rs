//! Reconstruction followed by void finding on the reconstructed tracers.

use tracing::info;

use crate::error::Result;
use crate::mask::SurveyMask;
use crate::recon::{reconstruct, ReconstructionConfig, ReconstructionResult};
use crate::tracer::{RandomSet, TracerSet};
use crate::voids::{find_clusters, find_voids, VoidCatalogue, VoidFinderConfig};

/// Settings for both stages. The void finder keeps its own grid and
/// smoothing scale, independent of reconstruction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineConfig {
    pub reconstruction: ReconstructionConfig,
    pub voids: VoidFinderConfig,
    /// Settings for an optional supercluster search; `threshold` is then the
    /// lower contrast bound.
    pub superclusters: Option<VoidFinderConfig>,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub reconstruction: ReconstructionResult,
    pub voids: VoidCatalogue,
    pub superclusters: Option<VoidCatalogue>,
}

/// Reconstruct `tracers`, then search the reconstructed positions for voids.
///
/// Randoms passed to the void finder are the reconstructed randoms, so in
/// full mode they follow the shifted tracers.
pub fn run_pipeline(
    tracers: &TracerSet,
    randoms: Option<&RandomSet>,
    mask: Option<&SurveyMask>,
    config: &PipelineConfig,
) -> Result<PipelineOutput> {
    let reconstruction = reconstruct(tracers, randoms, mask, &config.reconstruction)?;
    let voids = find_voids(
        &reconstruction.tracers,
        reconstruction.randoms.as_ref(),
        mask,
        &config.voids,
    )?;
    let superclusters = config
        .superclusters
        .as_ref()
        .map(|clusters| {
            find_clusters(
                &reconstruction.tracers,
                reconstruction.randoms.as_ref(),
                mask,
                clusters,
            )
        })
        .transpose()?;
    info!(
        "Pipeline: {} reconstruction iterations ({:?}), {} voids ({:?}), {} superclusters",
        reconstruction.iterations,
        reconstruction.status,
        voids.len(),
        voids.status,
        superclusters.as_ref().map_or(0, |c| c.len())
    );
    Ok(PipelineOutput {
        reconstruction,
        voids,
        superclusters,
    })
}
