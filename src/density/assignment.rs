//! Mass-assignment kernels: nearest grid point, cloud-in-cell and
//! triangular-shaped cloud.
//!
//! Grid nodes sit at cell centres, so a point at grid-unit coordinate `u` has
//! its nearest node at `round(u - 0.5)`. The same stencil is used to deposit
//! mass and to interpolate fields back to particle positions.

use crate::grid::{GridField, GridSpec};
use crate::Vector3;

/// Mass-assignment scheme used to move between particles and the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MassAssignment {
    /// Nearest grid point (1 cell per axis).
    Ngp,
    /// Cloud-in-cell, linear (2 cells per axis).
    #[default]
    Cic,
    /// Triangular-shaped cloud, quadratic (3 cells per axis).
    Tsc,
}

/// One-axis stencil: first (unwrapped) cell index and up to three weights.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Stencil {
    pub start: i64,
    pub weights: [f64; 3],
    pub len: usize,
}

impl MassAssignment {
    /// Number of cells per axis touched by the kernel.
    pub fn support(&self) -> usize {
        match self {
            MassAssignment::Ngp => 1,
            MassAssignment::Cic => 2,
            MassAssignment::Tsc => 3,
        }
    }

    /// Stencil along one axis for grid-unit coordinate `u` (cell edges at integers).
    pub(crate) fn stencil(&self, u: f64) -> Stencil {
        match self {
            MassAssignment::Ngp => Stencil {
                start: u.floor() as i64,
                weights: [1.0, 0.0, 0.0],
                len: 1,
            },
            MassAssignment::Cic => {
                let s = u - 0.5;
                let i0 = s.floor();
                let t = s - i0;
                Stencil {
                    start: i0 as i64,
                    weights: [1.0 - t, t, 0.0],
                    len: 2,
                }
            }
            MassAssignment::Tsc => {
                let s = u - 0.5;
                let i = s.round();
                let d = s - i;
                Stencil {
                    start: i as i64 - 1,
                    weights: [
                        0.5 * (0.5 - d) * (0.5 - d),
                        0.75 - d * d,
                        0.5 * (0.5 + d) * (0.5 + d),
                    ],
                    len: 3,
                }
            }
        }
    }

    /// Visit every `(flat index, weight)` pair of the 3D stencil at `p`.
    ///
    /// Stencil cells outside `[0, n)` are wrapped periodically; callers that
    /// need non-periodic behaviour drop out-of-box points beforehand.
    pub(crate) fn for_each_cell<F>(&self, spec: &GridSpec, p: &Vector3, mut f: F)
    where
        F: FnMut(usize, f64),
    {
        let u = spec.to_grid_units(p);
        let sx = self.stencil(u.x);
        let sy = self.stencil(u.y);
        let sz = self.stencil(u.z);
        for a in 0..sx.len {
            let wx = sx.weights[a];
            for b in 0..sy.len {
                let wxy = wx * sy.weights[b];
                for c in 0..sz.len {
                    let w = wxy * sz.weights[c];
                    if w == 0.0 {
                        continue;
                    }
                    let idx = spec.wrapped_index(
                        sx.start + a as i64,
                        sy.start + b as i64,
                        sz.start + c as i64,
                    );
                    f(idx, w);
                }
            }
        }
    }

    /// Add `weight` at `p` to `field` (configuration space).
    pub fn deposit(&self, field: &mut GridField, p: &Vector3, weight: f64) {
        let spec = *field.spec();
        self.for_each_cell(&spec, p, |idx, w| field.add(idx, w * weight));
    }

    /// Interpolate a configuration-space field at `p`.
    pub fn interpolate(&self, field: &GridField, p: &Vector3) -> f64 {
        let mut value = 0.0;
        self.for_each_cell(field.spec(), p, |idx, w| value += w * field.get(idx));
        value
    }
}
