//! Fiducial flat ΛCDM cosmology used to convert sky coordinates and redshifts
//! into comoving Cartesian positions (and void centres back onto the sky).
//!
//! Distances are in Mpc/h, so the Hubble distance is c/H0 = 2997.92458 Mpc/h
//! regardless of the Hubble constant.

use crate::Vector3;

/// Hubble distance c/H0 in Mpc/h.
pub const HUBBLE_DISTANCE: f64 = 2997.924_58;

/// Flat ΛCDM background (Ω_Λ = 1 − Ω_m, radiation neglected).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cosmology {
    pub omega_m: f64,
}

impl Default for Cosmology {
    fn default() -> Self {
        Self { omega_m: 0.308 }
    }
}

impl Cosmology {
    pub fn new(omega_m: f64) -> Self {
        Self { omega_m }
    }

    /// Dimensionless expansion rate E(z) = H(z)/H0.
    pub fn efunc(&self, z: f64) -> f64 {
        let a3 = (1.0 + z).powi(3);
        (self.omega_m * a3 + (1.0 - self.omega_m)).sqrt()
    }

    /// Line-of-sight comoving distance to redshift `z` in Mpc/h.
    ///
    /// Composite Simpson integration of 1/E(z); accurate to better than 1e-8
    /// relative for z < 5.
    pub fn comoving_distance(&self, z: f64) -> f64 {
        if z <= 0.0 {
            return 0.0;
        }
        const STEPS: usize = 512;
        let h = z / STEPS as f64;
        let mut sum = 1.0 / self.efunc(0.0) + 1.0 / self.efunc(z);
        for i in 1..STEPS {
            let w = if i % 2 == 1 { 4.0 } else { 2.0 };
            sum += w / self.efunc(i as f64 * h);
        }
        HUBBLE_DISTANCE * sum * h / 3.0
    }

    /// Redshift at which the comoving distance equals `distance` (Mpc/h).
    ///
    /// Bisection on `[0, 20]`; distances beyond z = 20 are clamped.
    pub fn redshift_at(&self, distance: f64) -> f64 {
        if distance <= 0.0 {
            return 0.0;
        }
        let (mut lo, mut hi) = (0.0_f64, 20.0_f64);
        for _ in 0..100 {
            let mid = 0.5 * (lo + hi);
            if self.comoving_distance(mid) < distance {
                lo = mid;
            } else {
                hi = mid;
            }
            if hi - lo < 1e-12 {
                break;
            }
        }
        0.5 * (lo + hi)
    }

    /// Tabulate distance(z) on `[0, z_max]` for fast bulk conversion.
    pub fn table(&self, z_max: f64) -> RedshiftTable {
        RedshiftTable::new(self, z_max, 4096)
    }
}

/// Monotone lookup table between redshift and comoving distance.
///
/// Both directions use linear interpolation; inputs outside the tabulated range
/// fall back to the exact (slow) cosmology calls.
#[derive(Debug, Clone)]
pub struct RedshiftTable {
    cosmology: Cosmology,
    z: Vec<f64>,
    r: Vec<f64>,
}

impl RedshiftTable {
    pub fn new(cosmology: &Cosmology, z_max: f64, samples: usize) -> Self {
        let samples = samples.max(2);
        let z_max = z_max.max(1e-6);
        let z: Vec<f64> = (0..samples)
            .map(|i| z_max * i as f64 / (samples - 1) as f64)
            .collect();
        // Integrate incrementally with the trapezoid-corrected Simpson rule per interval
        let mut r = Vec::with_capacity(samples);
        r.push(0.0);
        for i in 1..samples {
            let (a, b) = (z[i - 1], z[i]);
            let m = 0.5 * (a + b);
            let seg = (b - a) / 6.0
                * (1.0 / cosmology.efunc(a) + 4.0 / cosmology.efunc(m) + 1.0 / cosmology.efunc(b));
            r.push(r[i - 1] + HUBBLE_DISTANCE * seg);
        }
        Self {
            cosmology: *cosmology,
            z,
            r,
        }
    }

    pub fn distance(&self, z: f64) -> f64 {
        match interpolate(&self.z, &self.r, z) {
            Some(r) => r,
            None => self.cosmology.comoving_distance(z),
        }
    }

    pub fn redshift(&self, distance: f64) -> f64 {
        match interpolate(&self.r, &self.z, distance) {
            Some(z) => z,
            None => self.cosmology.redshift_at(distance),
        }
    }
}

/// Linear interpolation on a strictly increasing abscissa; `None` outside the range.
fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> Option<f64> {
    let (first, last) = (*xs.first()?, *xs.last()?);
    if x < first || x > last {
        return None;
    }
    let hi = xs.partition_point(|&v| v < x).clamp(1, xs.len() - 1);
    let lo = hi - 1;
    let t = (x - xs[lo]) / (xs[hi] - xs[lo]);
    Some(ys[lo] + t * (ys[hi] - ys[lo]))
}

// ── Sky ↔ Cartesian ────────────────────────────────────────────────────────

/// Unit vector for (RA, Dec) given in degrees: x = cos δ cos α, y = cos δ sin α, z = sin δ.
pub fn radec_to_uvec(ra_deg: f64, dec_deg: f64) -> Vector3 {
    let (sin_ra, cos_ra) = ra_deg.to_radians().sin_cos();
    let (sin_dec, cos_dec) = dec_deg.to_radians().sin_cos();
    Vector3::new(cos_dec * cos_ra, cos_dec * sin_ra, sin_dec)
}

/// Inverse of [`radec_to_uvec`] for an arbitrary (non-zero) offset vector.
///
/// Returns `(ra_deg, dec_deg, distance)` with RA in `[0, 360)`.
pub fn uvec_to_radec(offset: &Vector3) -> (f64, f64, f64) {
    let r = offset.norm();
    if r == 0.0 {
        return (0.0, 90.0, 0.0);
    }
    let dec = (offset.z / r).clamp(-1.0, 1.0).asin().to_degrees();
    let ra = offset.y.atan2(offset.x).to_degrees().rem_euclid(360.0);
    (ra, dec, r)
}
