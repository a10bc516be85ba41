//! Density contrast estimation on a grid.
//!
//! Tracers are deposited with a [`MassAssignment`] kernel and compared against
//! an expected count per cell, taken from one of:
//!
//! - the uniform mean (periodic box without randoms),
//! - a random catalogue scaled by `alpha = sum(w_tracer) / sum(w_random)`,
//! - the survey mask completeness times the radial selection at the cell centre.
//!
//! Box mode wraps positions into the periodic cube; survey mode drops objects
//! that fall outside the grid and counts them. Survey grids should be padded by
//! at least the kernel support so that no stencil wraps across the box.

pub mod assignment;

pub use assignment::MassAssignment;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::grid::{GridField, GridSpec};
use crate::mask::SurveyMask;
use crate::tracer::{RandomSet, TracerSet};
use crate::Vector3;

/// Variance below which a contrast field is considered featureless.
const MIN_CONTRAST_VARIANCE: f64 = 1e-24;

/// Options for [`DensityAssigner`].
#[derive(Debug, Clone, PartialEq)]
pub struct DensityConfig {
    /// Mass-assignment kernel.
    pub assignment: MassAssignment,
    /// Gaussian smoothing radius in Mpc/h (0 disables smoothing).
    pub smoothing_radius: f64,
    /// Box or survey geometry; decides wrapping and where the observer sits.
    pub geometry: Geometry,
    /// Cells whose expected count falls below this fraction of the mean
    /// expected count (over cells with any coverage) are treated as outside the
    /// survey: their contrast is set to zero and they are marked uncovered.
    pub random_threshold: f64,
    /// Angular completeness at or below which a mask cell counts as outside.
    pub min_completeness: f64,
    /// Largest tolerated fraction of (non-vetoed) tracers lying outside the
    /// mask before assignment fails with [`Error::DomainMismatch`]. Tracers
    /// outside the mask are dropped either way.
    pub outside_mask_tolerance: f64,
}

impl Default for DensityConfig {
    fn default() -> Self {
        Self {
            assignment: MassAssignment::Cic,
            smoothing_radius: 0.0,
            geometry: Geometry::default(),
            random_threshold: 0.01,
            min_completeness: 0.0,
            outside_mask_tolerance: 0.01,
        }
    }
}

/// Bookkeeping from one assignment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssignmentStats {
    /// Objects deposited on the grid.
    pub deposited: usize,
    /// Total weight deposited (equals the field sum before normalisation).
    pub deposited_weight: f64,
    pub vetoed: usize,
    /// Survey mode only: objects outside `[origin, origin + L)`.
    pub outside_grid: usize,
    /// Survey mode only: objects in zero-completeness directions or beyond the
    /// radial limits.
    pub outside_mask: usize,
    /// Tracer-to-random weight ratio, when randoms set the expected counts.
    pub alpha: Option<f64>,
    /// Cells with usable expected counts (all cells in box mode).
    pub covered_cells: usize,
}

/// Density contrast on a grid, in configuration space.
#[derive(Debug, Clone)]
pub struct DensityField {
    /// `delta = n / n_expected - 1`, smoothed if requested.
    pub field: GridField,
    /// Per-cell survey coverage; `None` means every cell is covered.
    pub coverage: Option<Vec<bool>>,
    pub stats: AssignmentStats,
}

impl DensityField {
    pub fn spec(&self) -> &GridSpec {
        self.field.spec()
    }

    #[inline]
    pub fn contrast(&self, index: usize) -> f64 {
        self.field.get(index)
    }

    #[inline]
    pub fn is_covered(&self, index: usize) -> bool {
        self.coverage.as_ref().is_none_or(|c| c[index])
    }

    /// Mean and variance of the contrast over covered cells.
    pub fn covered_mean_variance(&self) -> (f64, f64) {
        let mut n = 0.0;
        let mut sum = 0.0;
        let mut sum2 = 0.0;
        for idx in 0..self.spec().num_cells() {
            if self.is_covered(idx) {
                let d = self.contrast(idx);
                n += 1.0;
                sum += d;
                sum2 += d * d;
            }
        }
        if n == 0.0 {
            return (0.0, 0.0);
        }
        let mean = sum / n;
        (mean, (sum2 / n - mean * mean).max(0.0))
    }
}

/// Expected-count model the contrast is measured against.
#[derive(Debug, Clone)]
pub(crate) enum Reference {
    Uniform,
    /// Deposited random field and its total weight.
    Randoms { field: GridField, weight: f64 },
    /// Relative expected density (completeness × selection) per cell.
    Mask { relative: Vec<f64> },
}

/// Turns tracer catalogues into density contrast fields on a fixed grid.
#[derive(Debug, Clone)]
pub struct DensityAssigner {
    spec: GridSpec,
    config: DensityConfig,
}

impl DensityAssigner {
    pub fn new(spec: GridSpec, config: DensityConfig) -> Result<Self> {
        if !(config.smoothing_radius.is_finite() && config.smoothing_radius >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "smoothing radius must be finite and non-negative, got {}",
                config.smoothing_radius
            )));
        }
        if !(config.random_threshold >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "random threshold must be non-negative, got {}",
                config.random_threshold
            )));
        }
        if !(0.0..=1.0).contains(&config.outside_mask_tolerance) {
            return Err(Error::InvalidConfig(format!(
                "outside-mask tolerance must lie in [0, 1], got {}",
                config.outside_mask_tolerance
            )));
        }
        if !(0.0..1.0).contains(&config.min_completeness) {
            return Err(Error::InvalidConfig(format!(
                "minimum completeness must lie in [0, 1), got {}",
                config.min_completeness
            )));
        }
        Ok(Self { spec, config })
    }

    pub fn spec(&self) -> &GridSpec {
        &self.spec
    }

    pub fn config(&self) -> &DensityConfig {
        &self.config
    }

    /// Density contrast of `tracers`.
    ///
    /// Survey geometry requires `randoms` or `mask` (randoms take precedence
    /// for the expected counts; the mask still filters tracers). Fails with
    /// [`Error::EmptyField`] when nothing is deposited or the resulting
    /// contrast has zero variance.
    pub fn assign(
        &self,
        tracers: &TracerSet,
        randoms: Option<&RandomSet>,
        mask: Option<&SurveyMask>,
    ) -> Result<DensityField> {
        let reference = self.reference(randoms, mask)?;
        let (data, stats) = self.deposit(tracers, mask)?;
        self.contrast(data, stats, &reference, true)
    }

    /// Like [`assign`](Self::assign) but accepts a featureless field.
    pub(crate) fn assign_allow_uniform(
        &self,
        tracers: &TracerSet,
        randoms: Option<&RandomSet>,
        mask: Option<&SurveyMask>,
    ) -> Result<DensityField> {
        let reference = self.reference(randoms, mask)?;
        let (data, stats) = self.deposit(tracers, mask)?;
        self.contrast(data, stats, &reference, false)
    }

    /// Deposit the weights of `set` onto a fresh grid.
    ///
    /// Vetoed objects are skipped. In survey mode objects outside the mask or
    /// the grid are dropped and counted; if the outside-mask fraction exceeds
    /// the configured tolerance the call fails with [`Error::DomainMismatch`].
    pub fn deposit(
        &self,
        set: &TracerSet,
        mask: Option<&SurveyMask>,
    ) -> Result<(GridField, AssignmentStats)> {
        set.validate()?;
        let mut field = GridField::zeros(self.spec);
        let mut stats = AssignmentStats::default();
        let periodic = self.config.geometry.is_periodic();
        let observer = self.config.geometry.observer();

        for (i, p) in set.positions.iter().enumerate() {
            if set.is_vetoed(i) {
                stats.vetoed += 1;
                continue;
            }
            if let (Some(mask), Some(observer)) = (mask, observer) {
                if !self.inside_mask(mask, &(p - observer)) {
                    stats.outside_mask += 1;
                    continue;
                }
            }
            let pos = if periodic {
                self.spec.wrap(p)
            } else if self.spec.contains(p) {
                *p
            } else {
                stats.outside_grid += 1;
                continue;
            };
            let w = set.weight(i);
            self.config.assignment.deposit(&mut field, &pos, w);
            stats.deposited += 1;
            stats.deposited_weight += w;
        }

        let considered = set.len() - stats.vetoed;
        if stats.outside_mask > 0 {
            let fraction = stats.outside_mask as f64 / considered.max(1) as f64;
            if fraction > self.config.outside_mask_tolerance {
                return Err(Error::DomainMismatch {
                    outside: stats.outside_mask,
                    total: considered,
                    tolerance: self.config.outside_mask_tolerance,
                });
            }
            warn!(
                "Dropped {} of {} objects outside the survey mask",
                stats.outside_mask, considered
            );
        }
        if stats.outside_grid > 0 {
            warn!(
                "Dropped {} of {} objects outside the grid",
                stats.outside_grid, considered
            );
        }
        debug!(
            "Deposited {} objects (weight {:.3}) with {:?}",
            stats.deposited, stats.deposited_weight, self.config.assignment
        );
        Ok((field, stats))
    }

    /// Build the expected-count model for this geometry.
    pub(crate) fn reference(
        &self,
        randoms: Option<&RandomSet>,
        mask: Option<&SurveyMask>,
    ) -> Result<Reference> {
        if let Some(randoms) = randoms {
            let (field, stats) = self.deposit(randoms, mask)?;
            if !(stats.deposited_weight > 0.0) {
                return Err(Error::EmptyField(
                    "random catalogue deposited no weight on the grid".into(),
                ));
            }
            info!(
                "Random reference: {} objects, weight {:.3}",
                stats.deposited, stats.deposited_weight
            );
            return Ok(Reference::Randoms {
                field,
                weight: stats.deposited_weight,
            });
        }
        match (self.config.geometry, mask) {
            (Geometry::Box { .. }, None) => Ok(Reference::Uniform),
            (Geometry::Box { .. }, Some(_)) => {
                warn!("Survey mask ignored in periodic box mode");
                Ok(Reference::Uniform)
            }
            (Geometry::Survey { observer }, Some(mask)) => {
                let relative = (0..self.spec.num_cells())
                    .map(|idx| self.mask_weight(mask, &(self.spec.cell_centre(idx) - observer)))
                    .collect();
                Ok(Reference::Mask { relative })
            }
            (Geometry::Survey { .. }, None) => Err(Error::InvalidInput(
                "survey geometry needs a random catalogue or a survey mask".into(),
            )),
        }
    }

    /// Convert deposited tracer weights into a density contrast.
    pub(crate) fn contrast(
        &self,
        mut data: GridField,
        mut stats: AssignmentStats,
        reference: &Reference,
        require_variance: bool,
    ) -> Result<DensityField> {
        if !(stats.deposited_weight > 0.0) {
            return Err(Error::EmptyField(
                "no tracer weight was deposited on the grid".into(),
            ));
        }
        let n_cells = self.spec.num_cells();
        let radius = self.config.smoothing_radius;

        let (values, coverage) = match reference {
            Reference::Uniform => {
                let mean = stats.deposited_weight / n_cells as f64;
                let values = data.data().iter().map(|c| c.re / mean - 1.0).collect();
                (values, None)
            }
            Reference::Randoms { field, weight } => {
                let alpha = stats.deposited_weight / weight;
                stats.alpha = Some(alpha);
                let mut expected = field.clone();
                for c in expected.data_mut() {
                    *c *= alpha;
                }
                data.smooth_gaussian(radius);
                expected.smooth_gaussian(radius);
                let (values, coverage) = self.relative_to(&data.real(), &expected.real());
                (values, Some(coverage))
            }
            Reference::Mask { relative } => {
                let total: f64 = relative.iter().sum();
                if !(total > 0.0) {
                    return Err(Error::EmptyField(
                        "survey mask covers no grid cell".into(),
                    ));
                }
                let nbar = stats.deposited_weight / total;
                let scaled: Vec<f64> = relative.iter().map(|w| w * nbar).collect();
                let mut expected = GridField::from_real(self.spec, &scaled)?;
                data.smooth_gaussian(radius);
                expected.smooth_gaussian(radius);
                let (values, coverage) = self.relative_to(&data.real(), &expected.real());
                (values, Some(coverage))
            }
        };

        stats.covered_cells = coverage
            .as_ref()
            .map_or(n_cells, |c| c.iter().filter(|&&v| v).count());
        if stats.covered_cells == 0 {
            return Err(Error::EmptyField(
                "no grid cell has an expected density above the random threshold".into(),
            ));
        }

        let mut field = GridField::from_real(self.spec, &values)?;
        if coverage.is_none() {
            field.smooth_gaussian(radius);
        }
        let density = DensityField {
            field,
            coverage,
            stats,
        };

        let (mean, variance) = density.covered_mean_variance();
        debug!(
            "Density contrast over {} covered cells: mean {:.3e}, rms {:.4}",
            density.stats.covered_cells,
            mean,
            variance.sqrt()
        );
        if require_variance && variance < MIN_CONTRAST_VARIANCE {
            return Err(Error::EmptyField(format!(
                "density contrast has zero variance over {} covered cells",
                density.stats.covered_cells
            )));
        }
        Ok(density)
    }

    /// `delta = data / expected - 1` where the expected count clears the floor.
    fn relative_to(&self, data: &[f64], expected: &[f64]) -> (Vec<f64>, Vec<bool>) {
        let (sum, count) = expected
            .iter()
            .filter(|&&e| e > 0.0)
            .fold((0.0, 0usize), |(s, n), &e| (s + e, n + 1));
        let mean = if count > 0 { sum / count as f64 } else { 0.0 };
        let floor = self.config.random_threshold * mean;

        let coverage: Vec<bool> = expected.iter().map(|&e| e > 0.0 && e > floor).collect();
        let values = data
            .iter()
            .zip(expected)
            .zip(&coverage)
            .map(|((&d, &e), &covered)| if covered { d / e - 1.0 } else { 0.0 })
            .collect();
        (values, coverage)
    }

    fn inside_mask(&self, mask: &SurveyMask, offset: &Vector3) -> bool {
        mask.contains(offset) && mask.completeness_at(offset) > self.config.min_completeness
    }

    fn mask_weight(&self, mask: &SurveyMask, offset: &Vector3) -> f64 {
        if mask.completeness_at(offset) > self.config.min_completeness {
            mask.weight_at(offset)
        } else {
            0.0
        }
    }
}
