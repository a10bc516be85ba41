//! The reconstruction iteration loop.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::density::{DensityAssigner, DensityConfig};
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::grid::GridSpec;
use crate::mask::SurveyMask;
use crate::tracer::{RandomSet, TracerSet};
use crate::Vector3;

use super::{
    DisplacementField, ReconstructionConfig, ReconstructionMode, ReconstructionResult,
    ReconstructionStatus,
};

/// Remove redshift-space distortions from `tracers`.
///
/// Box geometry accepts optional randoms; survey geometry requires them (the
/// mask, if given, filters tracers and randoms). The input sets are never
/// modified. Fails with [`Error::Shape`] for an unusable grid before any
/// computation, [`Error::DomainMismatch`] when the mask misses the tracers,
/// [`Error::EmptyField`] for a featureless density, and [`Error::Convergence`]
/// only when `strict_convergence` is set.
pub fn reconstruct(
    tracers: &TracerSet,
    randoms: Option<&RandomSet>,
    mask: Option<&SurveyMask>,
    config: &ReconstructionConfig,
) -> Result<ReconstructionResult> {
    let t0 = Instant::now();
    config.validate()?;
    let spec = config.grid_spec(tracers, randoms)?;
    tracers.validate()?;
    if let Some(r) = randoms {
        r.validate()?;
    }
    if matches!(config.geometry, Geometry::Survey { .. }) && randoms.is_none() {
        return Err(Error::InvalidInput(
            "survey-mode reconstruction needs a random catalogue".into(),
        ));
    }

    let assigner = DensityAssigner::new(spec, density_config(config))?;
    let reference = assigner.reference(randoms, mask)?;

    info!(
        "Reconstruction: {} tracers, {} randoms, grid {}^3 over {:.1} Mpc/h, R_s = {:.1}, b = {:.2}, f = {:.3}, {:?}",
        tracers.len(),
        randoms.map_or(0, |r| r.len()),
        spec.n(),
        spec.box_length(),
        config.smoothing_radius,
        config.bias,
        config.growth_rate,
        config.mode
    );

    let observed = &tracers.positions;
    let (field, stats) = assigner.deposit(tracers, mask)?;
    let mut density = assigner.contrast(field, stats, &reference, true)?;

    if config.iterations == 0 {
        info!("Zero iterations requested, returning the input unchanged");
        return Ok(ReconstructionResult {
            tracers: tracers.clone(),
            randoms: randoms.cloned(),
            density,
            displacements: vec![Vector3::zeros(); tracers.len()],
            iterations: 0,
            rms_change: 0.0,
            status: ReconstructionStatus::Completed,
            elapsed_ms: elapsed_ms(t0),
        });
    }

    let f = config.growth_rate;
    let mut displacements = vec![Vector3::zeros(); tracers.len()];
    let mut psi = DisplacementField::zeros(spec);
    let mut rms_change = 0.0;
    let mut iterations = 0;
    let mut status = match config.tolerance {
        Some(_) => ReconstructionStatus::IterationLimit,
        None => ReconstructionStatus::Completed,
    };

    for it in 0..config.iterations {
        let kaiser = match config.geometry {
            Geometry::Box { line_of_sight } if it == 0 => Some((f, line_of_sight.unit())),
            _ => None,
        };
        psi = DisplacementField::solve(&density.field, config.bias, kaiser);

        let mut sum_sq = 0.0;
        for (i, s) in observed.iter().enumerate() {
            let new = displacement_at(&psi, &spec, config, s);
            sum_sq += (new - displacements[i]).norm_squared();
            displacements[i] = new;
        }
        rms_change = (sum_sq / observed.len().max(1) as f64).sqrt();
        iterations = it + 1;
        debug!(
            "Iteration {}: rms displacement change {:.4e} Mpc/h{}",
            iterations,
            rms_change,
            if kaiser.is_some() { " (Kaiser bias)" } else { "" }
        );

        if let Some(tol) = config.tolerance {
            if it > 0 && rms_change < tol {
                status = ReconstructionStatus::Converged;
                break;
            }
        }
        if iterations < config.iterations {
            let real_space = tracers.with_positions(remove_rsd(observed, &displacements, config, &spec));
            let (field, stats) = assigner.deposit(&real_space, mask)?;
            density = assigner.contrast(field, stats, &reference, true)?;
        }
    }

    if status == ReconstructionStatus::IterationLimit {
        let tolerance = config.tolerance.unwrap_or_default();
        if config.strict_convergence {
            return Err(Error::Convergence {
                iterations,
                rms_change,
                tolerance,
            });
        }
        warn!(
            "Reconstruction hit the iteration cap ({}) with rms change {:.4e} > tolerance {:.4e}",
            iterations, rms_change, tolerance
        );
    }

    let output = match config.mode {
        ReconstructionMode::RsdOnly => remove_rsd(observed, &displacements, config, &spec),
        ReconstructionMode::Full => observed
            .iter()
            .zip(&displacements)
            .map(|(s, d)| {
                let los = config.geometry.line_of_sight(s);
                place(&spec, config, s - d - los * (f * d.dot(&los)))
            })
            .collect(),
    };
    let shifted_randoms = randoms.map(|r| match config.mode {
        ReconstructionMode::RsdOnly => r.clone(),
        ReconstructionMode::Full => r.with_positions(
            r.positions
                .iter()
                .map(|p| place(&spec, config, p - displacement_at(&psi, &spec, config, p)))
                .collect(),
        ),
    });

    let rms_psi = (displacements.iter().map(|d| d.norm_squared()).sum::<f64>()
        / displacements.len().max(1) as f64)
        .sqrt();
    info!(
        "Reconstruction finished after {} iterations ({:?}): rms change {:.4e}, rms displacement {:.3} Mpc/h, {:.1} ms",
        iterations,
        status,
        rms_change,
        rms_psi,
        elapsed_ms(t0)
    );

    Ok(ReconstructionResult {
        tracers: tracers.with_positions(output),
        randoms: shifted_randoms,
        density,
        displacements,
        iterations,
        rms_change,
        status,
        elapsed_ms: elapsed_ms(t0),
    })
}

fn density_config(config: &ReconstructionConfig) -> DensityConfig {
    DensityConfig {
        assignment: config.assignment,
        smoothing_radius: config.smoothing_radius,
        geometry: config.geometry,
        random_threshold: config.random_threshold,
        min_completeness: config.min_completeness,
        outside_mask_tolerance: config.outside_mask_tolerance,
    }
}

/// Ψ at `p`; zero for survey positions outside the grid.
fn displacement_at(
    psi: &DisplacementField,
    spec: &GridSpec,
    config: &ReconstructionConfig,
    p: &Vector3,
) -> Vector3 {
    if config.geometry.is_periodic() {
        psi.interpolate(config.assignment, &spec.wrap(p))
    } else if spec.contains(p) {
        psi.interpolate(config.assignment, p)
    } else {
        Vector3::zeros()
    }
}

/// `x = s - f (Ψ·r̂) r̂` for every tracer.
fn remove_rsd(
    observed: &[Vector3],
    displacements: &[Vector3],
    config: &ReconstructionConfig,
    spec: &GridSpec,
) -> Vec<Vector3> {
    observed
        .iter()
        .zip(displacements)
        .map(|(s, d)| {
            let los = config.geometry.line_of_sight(s);
            place(spec, config, s - los * (config.growth_rate * d.dot(&los)))
        })
        .collect()
}

/// Wrap into the periodic box; survey positions are left as they are.
fn place(spec: &GridSpec, config: &ReconstructionConfig, p: Vector3) -> Vector3 {
    if config.geometry.is_periodic() {
        spec.wrap(&p)
    } else {
        p
    }
}

fn elapsed_ms(t0: Instant) -> f32 {
    t0.elapsed().as_secs_f32() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Axis;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn clustered_box(seed: u64, n: usize, l: f64) -> TracerSet {
        // Uniform background plus a few Gaussian clumps
        let mut rng = StdRng::seed_from_u64(seed);
        let centres: Vec<Vector3> = (0..4)
            .map(|_| {
                Vector3::new(
                    rng.random_range(0.0..l),
                    rng.random_range(0.0..l),
                    rng.random_range(0.0..l),
                )
            })
            .collect();
        let positions = (0..n)
            .map(|i| {
                if i % 3 == 0 {
                    let c = centres[i % centres.len()];
                    let off = Vector3::new(
                        rng.random_range(-0.05..0.05),
                        rng.random_range(-0.05..0.05),
                        rng.random_range(-0.05..0.05),
                    ) * l;
                    c + off
                } else {
                    Vector3::new(
                        rng.random_range(0.0..l),
                        rng.random_range(0.0..l),
                        rng.random_range(0.0..l),
                    )
                }
            })
            .collect();
        TracerSet::new(positions)
    }

    fn small_config() -> ReconstructionConfig {
        ReconstructionConfig {
            grid_size: 16,
            box_length: 200.0,
            smoothing_radius: 15.0,
            bias: 1.5,
            growth_rate: 0.7,
            ..Default::default()
        }
    }

    #[test]
    fn zero_iterations_is_identity() {
        let tracers = clustered_box(1, 3000, 200.0);
        let config = ReconstructionConfig {
            iterations: 0,
            ..small_config()
        };
        let result = reconstruct(&tracers, None, None, &config).unwrap();
        assert_eq!(result.tracers, tracers);
        assert_eq!(result.iterations, 0);
        assert!(result.displacements.iter().all(|d| *d == Vector3::zeros()));
        assert!(result.randoms.is_none());
    }

    #[test]
    fn rsd_only_moves_along_line_of_sight() {
        let tracers = clustered_box(2, 3000, 200.0);
        let config = ReconstructionConfig {
            geometry: Geometry::Box {
                line_of_sight: Axis::Y,
            },
            ..small_config()
        };
        let result = reconstruct(&tracers, None, None, &config).unwrap();
        assert_eq!(result.status, ReconstructionStatus::Completed);
        assert_eq!(result.iterations, 3);
        let spec = config.grid_spec(&tracers, None).unwrap();
        let mut moved = 0;
        for (s, x) in tracers.positions.iter().zip(&result.tracers.positions) {
            let d = spec.periodic_delta(s, x);
            assert!(d.x.abs() < 1e-9 && d.z.abs() < 1e-9);
            if d.y.abs() > 1e-6 {
                moved += 1;
            }
        }
        assert!(moved > tracers.len() / 2);
    }

    #[test]
    fn full_mode_shifts_randoms() {
        let tracers = clustered_box(3, 3000, 200.0);
        let randoms = TracerSet::new(clustered_box(4, 6000, 200.0).positions);
        let config = ReconstructionConfig {
            mode: ReconstructionMode::Full,
            ..small_config()
        };
        let result = reconstruct(&tracers, Some(&randoms), None, &config).unwrap();
        let shifted = result.randoms.unwrap();
        assert_eq!(shifted.len(), randoms.len());
        assert!(shifted
            .positions
            .iter()
            .zip(&randoms.positions)
            .any(|(a, b)| (a - b).norm() > 1e-6));
    }

    #[test]
    fn tolerance_reports_convergence_status() {
        let tracers = clustered_box(5, 3000, 200.0);
        let loose = ReconstructionConfig {
            iterations: 10,
            tolerance: Some(1e3),
            ..small_config()
        };
        let result = reconstruct(&tracers, None, None, &loose).unwrap();
        assert_eq!(result.status, ReconstructionStatus::Converged);
        assert_eq!(result.iterations, 2);

        let tight = ReconstructionConfig {
            iterations: 2,
            tolerance: Some(1e-14),
            ..small_config()
        };
        let result = reconstruct(&tracers, None, None, &tight).unwrap();
        assert_eq!(result.status, ReconstructionStatus::IterationLimit);

        let strict = ReconstructionConfig {
            strict_convergence: true,
            ..tight
        };
        assert!(matches!(
            reconstruct(&tracers, None, None, &strict),
            Err(Error::Convergence { iterations: 2, .. })
        ));
    }

    #[test]
    fn survey_mode_requires_randoms() {
        let tracers = clustered_box(6, 100, 200.0);
        let config = ReconstructionConfig {
            geometry: Geometry::Survey {
                observer: Vector3::new(100.0, 100.0, 100.0),
            },
            ..small_config()
        };
        assert!(matches!(
            reconstruct(&tracers, None, None, &config),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn survey_mode_displaces_radially() {
        let mut rng = StdRng::seed_from_u64(8);
        let observer = Vector3::new(100.0, 100.0, 100.0);
        let randoms = TracerSet::new(
            (0..20000)
                .map(|_| {
                    Vector3::new(
                        rng.random_range(20.0..180.0),
                        rng.random_range(20.0..180.0),
                        rng.random_range(20.0..180.0),
                    )
                })
                .collect(),
        );
        let tracers = TracerSet::new(
            clustered_box(9, 3000, 160.0)
                .positions
                .iter()
                .map(|p| p + Vector3::repeat(20.0))
                .collect(),
        );
        let config = ReconstructionConfig {
            geometry: Geometry::Survey { observer },
            box_padding: Some(20.0),
            ..small_config()
        };
        let result = reconstruct(&tracers, Some(&randoms), None, &config).unwrap();
        for (s, x) in tracers.positions.iter().zip(&result.tracers.positions) {
            let r = s - observer;
            let shift = x - s;
            // Shift is parallel to the line of sight
            assert!(shift.cross(&r).norm() <= 1e-9 * r.norm().max(1.0) * shift.norm().max(1.0));
        }
        assert_eq!(result.randoms.unwrap(), randoms);
    }
}
