//! Zel'dovich displacement from a density contrast.

use rustfft::num_complex::Complex;

use crate::density::MassAssignment;
use crate::grid::{GridField, GridSpec, Space};
use crate::Vector3;

/// Linear displacement Ψ on a grid, one configuration-space field per axis.
#[derive(Debug, Clone)]
pub struct DisplacementField {
    pub components: [GridField; 3],
}

impl DisplacementField {
    /// Solve `δ = -∇·Ψ` for the irrotational Ψ:
    /// `Ψ(k) = i k δ(k) / (k² b_eff)`.
    ///
    /// `delta` is expected to be smoothed already. With `kaiser = Some((f, los))`
    /// the bias becomes `b + f μ²`, `μ` being the cosine between `k` and the unit
    /// line of sight `los`. The DC mode and every mode on a Nyquist plane give
    /// zero displacement.
    pub fn solve(delta: &GridField, bias: f64, kaiser: Option<(f64, Vector3)>) -> Self {
        let mut delta_k = delta.clone();
        delta_k.forward();

        let solve_axis = |axis: usize| {
            let mut component = delta_k.clone();
            component.apply_transfer(|k, on_nyquist| {
                let k2 = k.norm_squared();
                if on_nyquist || k2 == 0.0 {
                    return Complex::new(0.0, 0.0);
                }
                let b_eff = match kaiser {
                    Some((f, los)) => {
                        let mu = k.dot(&los) / k2.sqrt();
                        bias + f * mu * mu
                    }
                    None => bias,
                };
                Complex::new(0.0, k[axis] / (k2 * b_eff))
            });
            component.inverse();
            // Drop round-off imaginary parts
            for c in component.data_mut() {
                c.im = 0.0;
            }
            component
        };

        Self {
            components: [solve_axis(0), solve_axis(1), solve_axis(2)],
        }
    }

    /// Zero displacement on `spec`.
    pub fn zeros(spec: GridSpec) -> Self {
        Self {
            components: [
                GridField::zeros(spec),
                GridField::zeros(spec),
                GridField::zeros(spec),
            ],
        }
    }

    pub fn spec(&self) -> &GridSpec {
        self.components[0].spec()
    }

    /// Ψ at grid cell `index`.
    pub fn at_cell(&self, index: usize) -> Vector3 {
        Vector3::new(
            self.components[0].get(index),
            self.components[1].get(index),
            self.components[2].get(index),
        )
    }

    /// Ψ at `p`, interpolated with the given kernel.
    pub fn interpolate(&self, assignment: MassAssignment, p: &Vector3) -> Vector3 {
        debug_assert!(self.components.iter().all(|c| c.space() == Space::Configuration));
        Vector3::new(
            assignment.interpolate(&self.components[0], p),
            assignment.interpolate(&self.components[1], p),
            assignment.interpolate(&self.components[2], p),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::TAU;

    #[test]
    fn inverts_a_plane_wave() {
        // Ψ_x = A sin(k x)  →  δ = -∂Ψ_x/∂x = -A k cos(k x)
        let spec = GridSpec::new(16, 160.0, Vector3::zeros()).unwrap();
        let k = TAU / 160.0 * 2.0;
        let amp = 3.0;
        let delta: Vec<f64> = (0..spec.num_cells())
            .map(|i| -amp * k * (k * spec.cell_centre(i).x).cos())
            .collect();
        let field = GridField::from_real(spec, &delta).unwrap();
        let psi = DisplacementField::solve(&field, 1.0, None);
        for idx in 0..spec.num_cells() {
            let x = spec.cell_centre(idx).x;
            let d = psi.at_cell(idx);
            assert!((d.x - amp * (k * x).sin()).abs() < 1e-10, "cell {}", idx);
            assert!(d.y.abs() < 1e-10 && d.z.abs() < 1e-10);
        }
    }

    #[test]
    fn bias_scales_displacement() {
        let spec = GridSpec::new(8, 80.0, Vector3::zeros()).unwrap();
        let delta: Vec<f64> = (0..spec.num_cells())
            .map(|i| (TAU * spec.cell_centre(i).y / 80.0).sin())
            .collect();
        let field = GridField::from_real(spec, &delta).unwrap();
        let unit = DisplacementField::solve(&field, 1.0, None);
        let biased = DisplacementField::solve(&field, 2.0, None);
        for idx in 0..spec.num_cells() {
            assert!((unit.at_cell(idx).y - 2.0 * biased.at_cell(idx).y).abs() < 1e-12);
        }
    }

    #[test]
    fn kaiser_term_only_affects_line_of_sight_modes() {
        // A wave along x has μ = 0 for a z line of sight
        let spec = GridSpec::new(8, 80.0, Vector3::zeros()).unwrap();
        let wave = |axis: usize| -> Vec<f64> {
            (0..spec.num_cells())
                .map(|i| (TAU * spec.cell_centre(i)[axis] / 80.0).cos())
                .collect()
        };
        let los = Vector3::z();
        let along_x = GridField::from_real(spec, &wave(0)).unwrap();
        let plain = DisplacementField::solve(&along_x, 1.5, None);
        let kaiser = DisplacementField::solve(&along_x, 1.5, Some((0.8, los)));
        for idx in 0..spec.num_cells() {
            assert!((plain.at_cell(idx).x - kaiser.at_cell(idx).x).abs() < 1e-12);
        }
        // Along z, μ = 1 and the effective bias is b + f
        let along_z = GridField::from_real(spec, &wave(2)).unwrap();
        let plain = DisplacementField::solve(&along_z, 2.3, None);
        let kaiser = DisplacementField::solve(&along_z, 1.5, Some((0.8, los)));
        for idx in 0..spec.num_cells() {
            assert!((plain.at_cell(idx).z - kaiser.at_cell(idx).z).abs() < 1e-12);
        }
    }

    #[test]
    fn nyquist_and_dc_modes_give_no_displacement() {
        // Constant plus a Nyquist checkerboard along x
        let spec = GridSpec::new(8, 8.0, Vector3::zeros()).unwrap();
        let delta: Vec<f64> = (0..spec.num_cells())
            .map(|i| {
                let [x, _, _] = spec.coords(i);
                0.5 + if x % 2 == 0 { 1.0 } else { -1.0 }
            })
            .collect();
        let field = GridField::from_real(spec, &delta).unwrap();
        let psi = DisplacementField::solve(&field, 1.0, None);
        for idx in 0..spec.num_cells() {
            assert!(psi.at_cell(idx).norm() < 1e-12);
        }
    }
}
