//! Tracer catalogues: galaxies, haloes, simulation particles or randoms.
//!
//! A [`TracerSet`] is an ordered list of comoving Cartesian positions (Mpc/h)
//! with optional per-object weights and veto flags. Engines consume it read-only;
//! reconstruction produces a displaced copy.

use std::path::Path;

use rkyv::{Archive, Deserialize, Serialize};
use tracing::info;

use crate::cosmology::{radec_to_uvec, uvec_to_radec, Cosmology};
use crate::error::{Error, Result};
use crate::Vector3;

#[derive(Debug, Clone, PartialEq)]
pub struct TracerSet {
    pub positions: Vec<Vector3>,
    /// Non-negative weights aligned with `positions` (FKP or completeness weights).
    pub weights: Option<Vec<f64>>,
    /// `true` marks an object excluded from density estimates.
    pub veto: Option<Vec<bool>>,
}

/// Randoms share the tracer layout; the alias documents intent at call sites.
pub type RandomSet = TracerSet;

impl TracerSet {
    /// Unweighted, un-vetoed set.
    pub fn new(positions: Vec<Vector3>) -> Self {
        Self {
            positions,
            weights: None,
            veto: None,
        }
    }

    /// Weighted set; weights must be aligned and non-negative.
    pub fn with_weights(positions: Vec<Vector3>, weights: Vec<f64>) -> Result<Self> {
        let set = Self {
            positions,
            weights: Some(weights),
            veto: None,
        };
        set.validate()?;
        Ok(set)
    }

    /// Attach veto flags (aligned with positions).
    pub fn with_veto(mut self, veto: Vec<bool>) -> Result<Self> {
        self.veto = Some(veto);
        self.validate()?;
        Ok(self)
    }

    /// Build a set from sky coordinates and redshifts.
    ///
    /// Positions are observer-centred comoving Cartesian coordinates shifted by
    /// `observer`, so the observer sits at `observer` in box coordinates.
    pub fn from_sky(
        ra_deg: &[f64],
        dec_deg: &[f64],
        redshift: &[f64],
        cosmology: &Cosmology,
        observer: Vector3,
    ) -> Result<Self> {
        if ra_deg.len() != dec_deg.len() || ra_deg.len() != redshift.len() {
            return Err(Error::InvalidInput(format!(
                "sky columns have different lengths: ra {}, dec {}, z {}",
                ra_deg.len(),
                dec_deg.len(),
                redshift.len()
            )));
        }
        let z_max = redshift.iter().cloned().fold(0.0_f64, f64::max);
        let table = cosmology.table(z_max * 1.01 + 1e-3);
        let positions = ra_deg
            .iter()
            .zip(dec_deg)
            .zip(redshift)
            .map(|((&ra, &dec), &z)| observer + radec_to_uvec(ra, dec) * table.distance(z))
            .collect();
        Ok(Self::new(positions))
    }

    /// Convert positions back to `(ra_deg, dec_deg, redshift)` relative to `observer`.
    pub fn to_sky(&self, cosmology: &Cosmology, observer: Vector3) -> Vec<(f64, f64, f64)> {
        let r_max = self
            .positions
            .iter()
            .map(|p| (p - observer).norm())
            .fold(0.0_f64, f64::max);
        let table = cosmology.table(cosmology.redshift_at(r_max) * 1.01 + 1e-3);
        self.positions
            .iter()
            .map(|p| {
                let (ra, dec, r) = uvec_to_radec(&(p - observer));
                (ra, dec, table.redshift(r))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Weight of object `i` (1 when unweighted, 0 when vetoed).
    pub fn weight(&self, i: usize) -> f64 {
        if self.is_vetoed(i) {
            return 0.0;
        }
        self.weights.as_ref().map_or(1.0, |w| w[i])
    }

    pub fn is_vetoed(&self, i: usize) -> bool {
        self.veto.as_ref().is_some_and(|v| v[i])
    }

    /// Sum of the effective weights of all non-vetoed objects.
    pub fn total_weight(&self) -> f64 {
        (0..self.len()).map(|i| self.weight(i)).sum()
    }

    /// Check the alignment and sign invariants.
    pub fn validate(&self) -> Result<()> {
        let n = self.positions.len();
        if let Some(w) = &self.weights {
            if w.len() != n {
                return Err(Error::InvalidInput(format!(
                    "{} weights for {} positions",
                    w.len(),
                    n
                )));
            }
            if let Some((i, bad)) = w.iter().enumerate().find(|(_, w)| !(**w >= 0.0)) {
                return Err(Error::InvalidInput(format!(
                    "weight {} at index {} is negative or not a number",
                    bad, i
                )));
            }
        }
        if let Some(v) = &self.veto {
            if v.len() != n {
                return Err(Error::InvalidInput(format!(
                    "{} veto flags for {} positions",
                    v.len(),
                    n
                )));
            }
        }
        if let Some(i) = self
            .positions
            .iter()
            .position(|p| !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite()))
        {
            return Err(Error::InvalidInput(format!(
                "position at index {} is not finite",
                i
            )));
        }
        Ok(())
    }

    /// Copy with the positions replaced, keeping weights and veto flags.
    pub fn with_positions(&self, positions: Vec<Vector3>) -> Self {
        debug_assert_eq!(positions.len(), self.positions.len());
        Self {
            positions,
            weights: self.weights.clone(),
            veto: self.veto.clone(),
        }
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    pub fn to_record(&self) -> TracerRecord {
        TracerRecord {
            positions: self.positions.iter().map(|p| [p.x, p.y, p.z]).collect(),
            weights: self.weights.clone(),
            veto: self.veto.clone(),
        }
    }

    pub fn from_record(record: TracerRecord) -> Result<Self> {
        let set = Self {
            positions: record
                .positions
                .iter()
                .map(|p| Vector3::new(p[0], p[1], p[2]))
                .collect(),
            weights: record.weights,
            veto: record.veto,
        };
        set.validate()?;
        Ok(set)
    }

    /// Save the set to a file using rkyv.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&self.to_record())
            .map_err(|e| anyhow::anyhow!("rkyv serialization failed: {}", e))?;
        std::fs::write(path, &bytes)?;
        info!(
            "Saved {} tracers to {} ({} bytes)",
            self.len(),
            path.display(),
            bytes.len()
        );
        Ok(())
    }

    /// Load a set previously written by [`TracerSet::save_to_file`].
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let record = rkyv::from_bytes::<TracerRecord, rkyv::rancor::Error>(&bytes)
            .map_err(|e| anyhow::anyhow!("rkyv deserialization failed: {}", e))?;
        let set = Self::from_record(record)?;
        info!("Loaded {} tracers from {}", set.len(), path.display());
        Ok(set)
    }
}

/// Plain archived form of a [`TracerSet`].
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct TracerRecord {
    pub positions: Vec<[f64; 3]>,
    pub weights: Option<Vec<f64>>,
    pub veto: Option<Vec<bool>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_misaligned_weights() {
        let positions = vec![Vector3::zeros(); 3];
        let err = TracerSet::with_weights(positions, vec![1.0, 2.0]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn rejects_negative_weights() {
        let positions = vec![Vector3::zeros(); 2];
        assert!(TracerSet::with_weights(positions, vec![1.0, -0.5]).is_err());
    }

    #[test]
    fn veto_zeroes_weight() {
        let positions = vec![Vector3::zeros(); 3];
        let set = TracerSet::with_weights(positions, vec![1.0, 2.0, 3.0])
            .unwrap()
            .with_veto(vec![false, true, false])
            .unwrap();
        assert_eq!(set.weight(1), 0.0);
        assert!((set.total_weight() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn sky_roundtrip() {
        let cosmo = Cosmology::default();
        let observer = Vector3::new(1000.0, 1000.0, 1000.0);
        let ra = [10.0, 150.0, 300.0];
        let dec = [-5.0, 20.0, 60.0];
        let z = [0.45, 0.55, 0.65];
        let set = TracerSet::from_sky(&ra, &dec, &z, &cosmo, observer).unwrap();
        let back = set.to_sky(&cosmo, observer);
        for i in 0..3 {
            assert!((back[i].0 - ra[i]).abs() < 1e-8);
            assert!((back[i].1 - dec[i]).abs() < 1e-8);
            assert!((back[i].2 - z[i]).abs() < 1e-5);
        }
    }

    #[test]
    fn record_roundtrip_through_rkyv() {
        let set = TracerSet::with_weights(
            vec![Vector3::new(1.0, 2.0, 3.0), Vector3::new(4.0, 5.0, 6.0)],
            vec![0.5, 1.5],
        )
        .unwrap();
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&set.to_record()).unwrap();
        let record = rkyv::from_bytes::<TracerRecord, rkyv::rancor::Error>(&bytes).unwrap();
        assert_eq!(TracerSet::from_record(record).unwrap(), set);
    }
}
