//! Survey geometry: angular completeness plus radial limits and selection.
//!
//! The angular part is a completeness map of `12 * nside^2` cells. Maps from
//! survey tooling are HEALPix, in RING or NESTED order, and are looked up
//! with `cdshealpix`. [`PixelScheme::LatLon`] is a simpler equal-area binning
//! (`3 * nside` bins in `z = sin(dec)` by `4 * nside` bins in right ascension)
//! for masks built inside this crate.
//!
//! Directions are always measured from the observer, so callers pass offsets
//! `position - observer` rather than raw box coordinates.

use std::f64::consts::{FRAC_PI_2, PI, TAU};

use crate::error::{Error, Result};
use crate::Vector3;

/// Largest HEALPix resolution supported by the pixel hashing (depth 29).
pub const MAX_HEALPIX_NSIDE: u32 = 1 << 29;

/// Pixel ordering of a completeness map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelScheme {
    /// HEALPix RING ordering (the healpy default).
    #[default]
    Ring,
    /// HEALPix NESTED ordering; `nside` must be a power of two.
    Nested,
    /// Row-major (z bin, RA bin) over `3 * nside` by `4 * nside` cells.
    LatLon,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SurveyMask {
    pub nside: u32,
    pub scheme: PixelScheme,
    /// Completeness per cell, in `scheme` order.
    pub completeness: Vec<f64>,
    /// Inner comoving radius of the survey (Mpc/h).
    pub r_min: f64,
    /// Outer comoving radius of the survey (Mpc/h).
    pub r_max: f64,
    /// Optional radial selection n(r)/n̄ multiplying the completeness.
    pub selection: Option<SelectionFunction>,
}

/// Number of cells of a map, checking `nside` against the scheme.
fn cell_count(nside: u32, scheme: PixelScheme) -> Result<usize> {
    if nside == 0 {
        return Err(Error::Shape("mask nside must be > 0".into()));
    }
    match scheme {
        PixelScheme::Nested if !nside.is_power_of_two() => {
            return Err(Error::Shape(format!(
                "NESTED mask needs a power-of-two nside, got {}",
                nside
            )));
        }
        PixelScheme::Ring | PixelScheme::Nested if nside > MAX_HEALPIX_NSIDE => {
            return Err(Error::Shape(format!(
                "HEALPix nside {} exceeds the maximum of {}",
                nside, MAX_HEALPIX_NSIDE
            )));
        }
        _ => {}
    }
    let n = nside as usize;
    n.checked_mul(n)
        .and_then(|n2| n2.checked_mul(12))
        .ok_or_else(|| Error::Shape(format!("mask with nside {} has too many cells", nside)))
}

impl SurveyMask {
    /// Build a mask from per-cell completeness values in `scheme` order.
    ///
    /// `completeness.len()` must equal `12 * nside^2` and every value must lie
    /// in `[0, 1]`.
    pub fn new(nside: u32, scheme: PixelScheme, completeness: Vec<f64>) -> Result<Self> {
        let n_cells = cell_count(nside, scheme)?;
        if completeness.len() != n_cells {
            return Err(Error::Shape(format!(
                "mask with nside {} needs {} cells, got {}",
                nside,
                n_cells,
                completeness.len()
            )));
        }
        if let Some(bad) = completeness.iter().find(|c| !(0.0..=1.0).contains(*c)) {
            return Err(Error::InvalidInput(format!(
                "mask completeness {} outside [0, 1]",
                bad
            )));
        }
        Ok(Self {
            nside,
            scheme,
            completeness,
            r_min: 0.0,
            r_max: f64::INFINITY,
            selection: None,
        })
    }

    /// Full-sky mask with unit completeness.
    pub fn full_sky(nside: u32, scheme: PixelScheme) -> Result<Self> {
        let n = cell_count(nside, scheme)?;
        Self::new(nside, scheme, vec![1.0; n])
    }

    /// Approximate mask from the directions of a tracer sample: every cell that
    /// contains at least one tracer gets completeness 1.
    pub fn from_tracers(
        nside: u32,
        scheme: PixelScheme,
        positions: &[Vector3],
        observer: Vector3,
    ) -> Result<Self> {
        let n = cell_count(nside, scheme)?;
        let mut mask = Self::new(nside, scheme, vec![0.0; n])?;
        let mut r_min = f64::INFINITY;
        let mut r_max = 0.0_f64;
        for p in positions {
            let offset = p - observer;
            let r = offset.norm();
            r_min = r_min.min(r);
            r_max = r_max.max(r);
            if let Some(cell) = mask.cell_for_offset(&offset) {
                mask.completeness[cell] = 1.0;
            }
        }
        if positions.is_empty() {
            return Ok(mask);
        }
        Ok(mask.with_radial_limits(r_min, r_max))
    }

    pub fn with_radial_limits(mut self, r_min: f64, r_max: f64) -> Self {
        self.r_min = r_min;
        self.r_max = r_max;
        self
    }

    pub fn with_selection(mut self, selection: SelectionFunction) -> Self {
        self.selection = Some(selection);
        self
    }

    pub fn num_cells(&self) -> usize {
        self.completeness.len()
    }

    /// Completeness-weighted sky fraction.
    pub fn sky_fraction(&self) -> f64 {
        self.completeness.iter().sum::<f64>() / self.num_cells() as f64
    }

    /// Effective volume of the survey shell between the radial limits.
    pub fn volume(&self) -> f64 {
        let r_max = if self.r_max.is_finite() { self.r_max } else { 0.0 };
        self.sky_fraction() * 4.0 * PI / 3.0 * (r_max.powi(3) - self.r_min.powi(3)).max(0.0)
    }

    /// Angular completeness in the direction of `offset` (zero vector → 0).
    pub fn completeness_at(&self, offset: &Vector3) -> f64 {
        self.cell_for_offset(offset)
            .map_or(0.0, |cell| self.completeness[cell])
    }

    /// Expected relative density at `offset`: completeness × selection, zero
    /// outside the radial limits.
    pub fn weight_at(&self, offset: &Vector3) -> f64 {
        let r = offset.norm();
        if r < self.r_min || r > self.r_max {
            return 0.0;
        }
        let selection = self.selection.as_ref().map_or(1.0, |s| s.value(r));
        self.completeness_at(offset) * selection
    }

    /// `true` when `offset` lies in a cell with non-zero completeness and within
    /// the radial limits.
    pub fn contains(&self, offset: &Vector3) -> bool {
        let r = offset.norm();
        r >= self.r_min && r <= self.r_max && self.completeness_at(offset) > 0.0
    }

    /// Cell index for a direction, `None` for a zero-length offset.
    pub fn cell_for_offset(&self, offset: &Vector3) -> Option<usize> {
        let r = offset.norm();
        if r == 0.0 || !r.is_finite() {
            return None;
        }
        let z = (offset.z / r).clamp(-1.0, 1.0);
        let lon = offset.y.atan2(offset.x).rem_euclid(TAU);
        let cell = match self.scheme {
            PixelScheme::Ring => cdshealpix::ring::hash(self.nside, lon, z.asin()) as usize,
            PixelScheme::Nested => {
                cdshealpix::nested::hash(self.depth(), lon, z.asin()) as usize
            }
            PixelScheme::LatLon => {
                let (n_lat, n_lon) = self.lat_lon_bins();
                let lat_bin = ((((z + 1.0) * 0.5) * n_lat as f64).floor() as usize).min(n_lat - 1);
                let u = (lon / TAU).clamp(0.0, 1.0 - f64::EPSILON);
                let lon_bin = ((u * n_lon as f64).floor() as usize).min(n_lon - 1);
                lat_bin * n_lon + lon_bin
            }
        };
        Some(cell)
    }

    /// Unit vector through the centre of `cell`, `None` when out of range.
    pub fn cell_direction(&self, cell: usize) -> Option<Vector3> {
        if cell >= self.num_cells() {
            return None;
        }
        let (lon, lat) = match self.scheme {
            PixelScheme::Ring => cdshealpix::ring::center(self.nside, cell as u64),
            PixelScheme::Nested => cdshealpix::nested::center(self.depth(), cell as u64),
            PixelScheme::LatLon => {
                let (n_lat, n_lon) = self.lat_lon_bins();
                let (lat_bin, lon_bin) = (cell / n_lon, cell % n_lon);
                let z = -1.0 + (lat_bin as f64 + 0.5) * 2.0 / n_lat as f64;
                let lon = (lon_bin as f64 + 0.5) * TAU / n_lon as f64;
                (lon, z.clamp(-1.0, 1.0).asin())
            }
        };
        let lat = lat.clamp(-FRAC_PI_2, FRAC_PI_2);
        Some(Vector3::new(
            lat.cos() * lon.cos(),
            lat.cos() * lon.sin(),
            lat.sin(),
        ))
    }

    fn depth(&self) -> u8 {
        self.nside.trailing_zeros() as u8
    }

    fn lat_lon_bins(&self) -> (usize, usize) {
        (3 * self.nside as usize, 4 * self.nside as usize)
    }
}

// ── Radial selection ───────────────────────────────────────────────────────

/// Tabulated radial selection n(r)/n̄, linearly interpolated and held constant
/// beyond the end points.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionFunction {
    pub radii: Vec<f64>,
    pub values: Vec<f64>,
}

impl SelectionFunction {
    pub fn new(radii: Vec<f64>, values: Vec<f64>) -> Result<Self> {
        if radii.is_empty() || radii.len() != values.len() {
            return Err(Error::InvalidInput(format!(
                "selection function needs matching non-empty columns ({} radii, {} values)",
                radii.len(),
                values.len()
            )));
        }
        if radii.windows(2).any(|w| w[1] <= w[0]) {
            return Err(Error::InvalidInput(
                "selection function radii must be strictly increasing".into(),
            ));
        }
        Ok(Self { radii, values })
    }

    /// Estimate n(r)/n̄ by histogramming tracer distances in `bins` shells
    /// between `r_min` and `r_max`, normalising by the shell volume.
    pub fn estimate(distances: &[f64], r_min: f64, r_max: f64, bins: usize) -> Result<Self> {
        if bins == 0 || !(r_max > r_min) {
            return Err(Error::InvalidConfig(format!(
                "cannot bin selection function with {} bins over [{}, {}]",
                bins, r_min, r_max
            )));
        }
        let width = (r_max - r_min) / bins as f64;
        let mut counts = vec![0.0_f64; bins];
        for &r in distances {
            if r < r_min || r > r_max {
                continue;
            }
            let b = (((r - r_min) / width) as usize).min(bins - 1);
            counts[b] += 1.0;
        }
        let shell = |b: usize| {
            let lo = r_min + b as f64 * width;
            let hi = lo + width;
            hi.powi(3) - lo.powi(3)
        };
        let total_volume = r_max.powi(3) - r_min.powi(3);
        let total_count: f64 = counts.iter().sum();
        let radii = (0..bins).map(|b| r_min + (b as f64 + 0.5) * width).collect();
        let values = (0..bins)
            .map(|b| {
                if total_count > 0.0 {
                    (counts[b] / shell(b)) / (total_count / total_volume)
                } else {
                    0.0
                }
            })
            .collect();
        Self::new(radii, values)
    }

    pub fn value(&self, r: f64) -> f64 {
        let n = self.radii.len();
        if r <= self.radii[0] {
            return self.values[0];
        }
        if r >= self.radii[n - 1] {
            return self.values[n - 1];
        }
        let hi = self.radii.partition_point(|&x| x < r);
        let lo = hi - 1;
        let t = (r - self.radii[lo]) / (self.radii[hi] - self.radii[lo]);
        self.values[lo] + t * (self.values[hi] - self.values[lo])
    }
}
