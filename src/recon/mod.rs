//! Iterative redshift-space-distortion reconstruction.
//!
//! Estimates the linear (Zel'dovich) displacement field from the observed
//! tracer density and uses it to move tracers back towards their real-space
//! positions:
//!
//! 1. Assign tracers (and randoms in survey mode) to a grid smoothed at `R_s`.
//! 2. Solve `Ψ(k) = i k W(kR_s) δ(k) / (k² b_eff)` per Fourier mode.
//! 3. Interpolate Ψ at each tracer's observed position.
//! 4. Remove the RSD term `f (Ψ·r̂) r̂` (and, in full mode, the bulk Ψ).
//! 5. Recompute the density from the corrected positions and repeat.
//!
//! In a periodic box the first iteration uses the Kaiser-corrected bias
//! `b + f μ²` along the fixed line of sight; later iterations and survey
//! geometries divide by `b` alone, relying on the iteration to strip the
//! anisotropy.

pub mod displacement;
pub mod solve;

pub use displacement::DisplacementField;
pub use solve::reconstruct;

use crate::density::{DensityField, MassAssignment};
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::grid::GridSpec;
use crate::tracer::{RandomSet, TracerSet};
use crate::Vector3;

// ── Options ─────────────────────────────────────────────────────────────────

/// Which displacement is removed from the tracers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconstructionMode {
    /// Remove only the RSD component `f (Ψ·r̂) r̂`; randoms are left in place.
    #[default]
    RsdOnly,
    /// Remove the full displacement `Ψ + f (Ψ·r̂) r̂`; randoms move by `Ψ`.
    Full,
}

/// Outcome of the iteration loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconstructionStatus {
    /// Ran the configured number of iterations (no tolerance set).
    Completed,
    /// The RMS displacement change fell below the tolerance.
    Converged,
    /// Tolerance set but not reached within the iteration cap; the last
    /// iterate is returned.
    IterationLimit,
}

/// Parameters for [`reconstruct`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructionConfig {
    /// Cells per side. Default 128.
    pub grid_size: usize,
    /// Box side in Mpc/h. Default 1000.
    pub box_length: f64,
    /// Lower corner of the box. Default origin.
    pub box_origin: Vector3,
    /// Survey mode only: when set, the grid is sized to enclose the randoms
    /// (and the observer) with this padding in Mpc/h, overriding
    /// `box_length`/`box_origin`.
    pub box_padding: Option<f64>,
    /// Box (fixed line of sight) or survey (radial line of sight).
    pub geometry: Geometry,
    /// Mass-assignment kernel for deposit and interpolation. Default CIC.
    pub assignment: MassAssignment,
    /// Gaussian smoothing radius R_s in Mpc/h. Default 10.
    pub smoothing_radius: f64,
    /// Linear tracer bias b. Default 2.0.
    pub bias: f64,
    /// Linear growth rate f. Default 0.8.
    pub growth_rate: f64,
    pub mode: ReconstructionMode,
    /// Maximum number of iterations. Zero returns the input unchanged. Default 3.
    pub iterations: u32,
    /// Stop early once the RMS change in per-tracer displacement between
    /// successive iterations drops below this value (Mpc/h). Default None.
    pub tolerance: Option<f64>,
    /// Fail with [`Error::Convergence`] instead of returning an
    /// iteration-limited result. Default false.
    pub strict_convergence: bool,
    /// Cells with expected counts below this fraction of the mean are
    /// treated as outside the survey. Default 0.01.
    pub random_threshold: f64,
    /// Mask cells at or below this completeness are outside. Default 0.
    pub min_completeness: f64,
    /// Tolerated fraction of tracers outside the mask. Default 0.01.
    pub outside_mask_tolerance: f64,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            grid_size: 128,
            box_length: 1000.0,
            box_origin: Vector3::zeros(),
            box_padding: None,
            geometry: Geometry::default(),
            assignment: MassAssignment::Cic,
            smoothing_radius: 10.0,
            bias: 2.0,
            growth_rate: 0.8,
            mode: ReconstructionMode::RsdOnly,
            iterations: 3,
            tolerance: None,
            strict_convergence: false,
            random_threshold: 0.01,
            min_completeness: 0.0,
            outside_mask_tolerance: 0.01,
        }
    }
}

impl ReconstructionConfig {
    /// Check parameter ranges (grid shape is checked by [`GridSpec::new`]).
    pub fn validate(&self) -> Result<()> {
        if !(self.bias.is_finite() && self.bias > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "bias must be positive, got {}",
                self.bias
            )));
        }
        if !(self.growth_rate.is_finite() && self.growth_rate >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "growth rate must be non-negative, got {}",
                self.growth_rate
            )));
        }
        if let Some(tol) = self.tolerance {
            if !(tol.is_finite() && tol > 0.0) {
                return Err(Error::InvalidConfig(format!(
                    "convergence tolerance must be positive, got {}",
                    tol
                )));
            }
        }
        if let Some(pad) = self.box_padding {
            if !(pad.is_finite() && pad >= 0.0) {
                return Err(Error::InvalidConfig(format!(
                    "box padding must be non-negative, got {}",
                    pad
                )));
            }
        }
        Ok(())
    }

    /// Grid geometry for a run over `tracers` and `randoms`.
    pub fn grid_spec(&self, tracers: &TracerSet, randoms: Option<&RandomSet>) -> Result<GridSpec> {
        match (self.geometry, self.box_padding) {
            (Geometry::Survey { observer }, Some(padding)) => {
                let source = randoms.unwrap_or(tracers);
                let mut points = source.positions.clone();
                points.push(observer);
                GridSpec::enclosing(&points, self.grid_size, padding)
            }
            _ => GridSpec::new(self.grid_size, self.box_length, self.box_origin),
        }
    }
}

// ── Result ──────────────────────────────────────────────────────────────────

/// Output of [`reconstruct`].
#[derive(Debug, Clone)]
pub struct ReconstructionResult {
    /// Displaced tracers (input order, weights and vetoes preserved).
    pub tracers: TracerSet,
    /// Randoms after reconstruction: unchanged in RSD-only mode, shifted by
    /// `-Ψ` in full mode, `None` when no randoms were supplied.
    pub randoms: Option<RandomSet>,
    /// Density contrast from the last iteration's input positions.
    pub density: DensityField,
    /// Final Ψ interpolated at each tracer's observed position (Mpc/h).
    pub displacements: Vec<Vector3>,
    /// Iterations actually performed.
    pub iterations: u32,
    /// RMS change of the per-tracer displacement in the last iteration.
    pub rms_change: f64,
    pub status: ReconstructionStatus,
    /// Wall-clock time in milliseconds.
    pub elapsed_ms: f32,
}
