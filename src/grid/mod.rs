//! Uniform cubic grids and their Fourier transforms.
//!
//! A [`GridSpec`] fixes the geometry: `n` cells per side over a box of length
//! `box_length` whose lower corner sits at `origin`. Cell `(i, j, k)` covers
//! `origin + [i, i+1) * h` along x (likewise y, z) with `h = box_length / n`, and
//! its sample represents the cell centre. Storage is flat, x slowest:
//! `index = (i * n + j) * n + k`.
//!
//! A [`GridField`] holds complex samples and remembers which space it is in.
//! Real fields are stored with zero imaginary part; transfer functions that are
//! Hermitian-symmetric in k therefore keep the inverse transform real.

pub mod fft;

use rustfft::num_complex::Complex;

use crate::error::{Error, Result};
use crate::Vector3;

use fft::Fft3;

/// Largest supported cells per side; keeps `n^3` addressable by `u32` node ids.
pub const MAX_CELLS_PER_SIDE: usize = 1625;

/// Geometry of a cubic grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    n: usize,
    box_length: f64,
    origin: Vector3,
}

impl GridSpec {
    /// Validate and build a grid geometry.
    ///
    /// Fails with [`Error::Shape`] when `n < 2`, when `n^3` exceeds the node id
    /// space, or when the box length is not a positive finite number.
    pub fn new(n: usize, box_length: f64, origin: Vector3) -> Result<Self> {
        if n < 2 {
            return Err(Error::Shape(format!(
                "grid needs at least 2 cells per side, got {}",
                n
            )));
        }
        if n > MAX_CELLS_PER_SIDE {
            return Err(Error::Shape(format!(
                "grid of {} cells per side exceeds the maximum of {}",
                n, MAX_CELLS_PER_SIDE
            )));
        }
        if !(box_length.is_finite() && box_length > 0.0) {
            return Err(Error::Shape(format!(
                "box length must be positive and finite, got {}",
                box_length
            )));
        }
        if !(origin.x.is_finite() && origin.y.is_finite() && origin.z.is_finite()) {
            return Err(Error::Shape(format!("box origin {:?} is not finite", origin)));
        }
        Ok(Self {
            n,
            box_length,
            origin,
        })
    }

    /// Smallest grid of `n` cells per side enclosing `points` with `padding`
    /// (Mpc/h) on every side. Used for survey geometries.
    pub fn enclosing(points: &[Vector3], n: usize, padding: f64) -> Result<Self> {
        if points.is_empty() {
            return Err(Error::InvalidInput(
                "cannot size a grid around an empty point set".into(),
            ));
        }
        let mut lo = Vector3::repeat(f64::INFINITY);
        let mut hi = Vector3::repeat(f64::NEG_INFINITY);
        for p in points {
            lo = lo.inf(p);
            hi = hi.sup(p);
        }
        let extent = (hi - lo).max() + 2.0 * padding;
        let centre = (lo + hi) * 0.5;
        Self::new(n, extent, centre - Vector3::repeat(0.5 * extent))
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn box_length(&self) -> f64 {
        self.box_length
    }

    pub fn origin(&self) -> Vector3 {
        self.origin
    }

    pub fn cell_size(&self) -> f64 {
        self.box_length / self.n as f64
    }

    pub fn cell_volume(&self) -> f64 {
        self.cell_size().powi(3)
    }

    pub fn num_cells(&self) -> usize {
        self.n * self.n * self.n
    }

    #[inline]
    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        (i * self.n + j) * self.n + k
    }

    #[inline]
    pub fn coords(&self, index: usize) -> [usize; 3] {
        let n = self.n;
        [index / (n * n), (index / n) % n, index % n]
    }

    /// Flat index of a (possibly out-of-range) cell, wrapped periodically.
    #[inline]
    pub fn wrapped_index(&self, i: i64, j: i64, k: i64) -> usize {
        let n = self.n as i64;
        self.index(
            i.rem_euclid(n) as usize,
            j.rem_euclid(n) as usize,
            k.rem_euclid(n) as usize,
        )
    }

    /// Centre of the cell at flat `index`.
    pub fn cell_centre(&self, index: usize) -> Vector3 {
        let [i, j, k] = self.coords(index);
        let h = self.cell_size();
        self.origin + Vector3::new(i as f64 + 0.5, j as f64 + 0.5, k as f64 + 0.5) * h
    }

    /// Position in units of cells relative to the origin.
    #[inline]
    pub fn to_grid_units(&self, p: &Vector3) -> Vector3 {
        (p - self.origin) / self.cell_size()
    }

    /// `true` when `p` lies inside `[origin, origin + L)` on every axis.
    pub fn contains(&self, p: &Vector3) -> bool {
        let u = p - self.origin;
        (0..3).all(|a| u[a] >= 0.0 && u[a] < self.box_length)
    }

    /// Map a position into the periodic box `[origin, origin + L)`.
    pub fn wrap(&self, p: &Vector3) -> Vector3 {
        let u = p - self.origin;
        let l = self.box_length;
        let mut w = Vector3::new(u.x.rem_euclid(l), u.y.rem_euclid(l), u.z.rem_euclid(l));
        // rem_euclid can round up to exactly L for tiny negative inputs
        for a in 0..3 {
            if w[a] >= l {
                w[a] = 0.0;
            }
        }
        self.origin + w
    }

    /// Minimum-image separation vector `b - a` in a periodic box.
    pub fn periodic_delta(&self, a: &Vector3, b: &Vector3) -> Vector3 {
        let l = self.box_length;
        (b - a).map(|d| d - l * (d / l).round())
    }

    /// Angular wavenumbers along one axis in FFT order (2π m / L).
    pub fn wavenumbers(&self) -> Vec<f64> {
        let scale = std::f64::consts::TAU / self.box_length;
        fft_frequencies(self.n)
            .into_iter()
            .map(|m| m as f64 * scale)
            .collect()
    }

    /// FFT-order index of the Nyquist frequency, if `n` is even.
    pub fn nyquist_index(&self) -> Option<usize> {
        (self.n % 2 == 0).then_some(self.n / 2)
    }
}

/// Integer frequencies in standard FFT order: `0, 1, ..., n/2 - 1, -n/2, ..., -1`
/// for even `n` (the Nyquist bin is reported as negative).
pub fn fft_frequencies(n: usize) -> Vec<i64> {
    let n_i = n as i64;
    (0..n_i)
        .map(|m| if m < (n_i + 1) / 2 { m } else { m - n_i })
        .collect()
}

// ── Fields ─────────────────────────────────────────────────────────────────

/// Which representation a [`GridField`] currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    Configuration,
    Fourier,
}

/// Complex samples on a [`GridSpec`].
#[derive(Debug, Clone)]
pub struct GridField {
    spec: GridSpec,
    space: Space,
    data: Vec<Complex<f64>>,
}

impl GridField {
    /// Zero field in configuration space.
    pub fn zeros(spec: GridSpec) -> Self {
        Self {
            spec,
            space: Space::Configuration,
            data: vec![Complex::new(0.0, 0.0); spec.num_cells()],
        }
    }

    /// Configuration-space field from real samples in flat order.
    pub fn from_real(spec: GridSpec, values: &[f64]) -> Result<Self> {
        if values.len() != spec.num_cells() {
            return Err(Error::Shape(format!(
                "{} samples for a grid of {} cells",
                values.len(),
                spec.num_cells()
            )));
        }
        Ok(Self {
            spec,
            space: Space::Configuration,
            data: values.iter().map(|&v| Complex::new(v, 0.0)).collect(),
        })
    }

    pub fn spec(&self) -> &GridSpec {
        &self.spec
    }

    pub fn space(&self) -> Space {
        self.space
    }

    pub fn data(&self) -> &[Complex<f64>] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [Complex<f64>] {
        &mut self.data
    }

    /// Real parts of the samples (the field itself in configuration space).
    pub fn real(&self) -> Vec<f64> {
        self.data.iter().map(|c| c.re).collect()
    }

    #[inline]
    pub fn get(&self, index: usize) -> f64 {
        self.data[index].re
    }

    #[inline]
    pub fn add(&mut self, index: usize, value: f64) {
        self.data[index].re += value;
    }

    /// Sum of the real samples.
    pub fn sum(&self) -> f64 {
        self.data.iter().map(|c| c.re).sum()
    }

    /// Mean and variance of the real samples.
    pub fn mean_variance(&self) -> (f64, f64) {
        let n = self.data.len() as f64;
        let mean = self.sum() / n;
        let var = self
            .data
            .iter()
            .map(|c| (c.re - mean) * (c.re - mean))
            .sum::<f64>()
            / n;
        (mean, var)
    }

    /// Configuration → Fourier (unnormalised, `e^{-i k·x}` convention).
    pub fn forward(&mut self) {
        if self.space == Space::Fourier {
            return;
        }
        Fft3::new(self.spec.n).forward(&mut self.data);
        self.space = Space::Fourier;
    }

    /// Fourier → configuration, normalised by `1 / n^3`.
    pub fn inverse(&mut self) {
        if self.space == Space::Configuration {
            return;
        }
        Fft3::new(self.spec.n).inverse(&mut self.data);
        let norm = 1.0 / self.spec.num_cells() as f64;
        for c in self.data.iter_mut() {
            *c *= norm;
        }
        self.space = Space::Configuration;
    }

    /// Multiply every Fourier mode by `transfer(k)`, where `k` is the angular
    /// wavevector and `nyquist` is `true` when any component sits on the
    /// Nyquist frequency. Transforms to Fourier space first if needed.
    pub fn apply_transfer<F>(&mut self, mut transfer: F)
    where
        F: FnMut(Vector3, bool) -> Complex<f64>,
    {
        self.forward();
        let n = self.spec.n;
        let kvals = self.spec.wavenumbers();
        let nyq = self.spec.nyquist_index();
        let is_nyq = |m: usize| nyq == Some(m);
        for i in 0..n {
            for j in 0..n {
                let row = self.spec.index(i, j, 0);
                for k in 0..n {
                    let kvec = Vector3::new(kvals[i], kvals[j], kvals[k]);
                    let on_nyquist = is_nyq(i) || is_nyq(j) || is_nyq(k);
                    self.data[row + k] *= transfer(kvec, on_nyquist);
                }
            }
        }
    }

    /// Gaussian smoothing `exp(-k^2 R^2 / 2)`; no-op for `R <= 0`.
    pub fn smooth_gaussian(&mut self, radius: f64) {
        if radius <= 0.0 {
            return;
        }
        let was_configuration = self.space == Space::Configuration;
        let r2 = radius * radius;
        self.apply_transfer(|k, _| Complex::new((-0.5 * k.norm_squared() * r2).exp(), 0.0));
        if was_configuration {
            self.inverse();
        }
    }
}
