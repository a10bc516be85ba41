//! Reconstruction on synthetic boxes: a Gaussian random field displaced with
//! the Zel'dovich approximation and observed with RSD along z.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use voidrecon::{
    reconstruct, Axis, DisplacementField, Error, Geometry, GridField, GridSpec, MassAssignment,
    ReconstructionConfig, ReconstructionMode, ReconstructionStatus, TracerSet, Vector3,
};

const N: usize = 64;
const L: f64 = 1000.0;
const GROWTH_RATE: f64 = 0.8;

/// Lattice tracers with real-space positions `q + Ψ(q)` and redshift-space
/// positions shifted by `f Ψ_z` along z. Returns (observed set, true Ψ, real positions).
fn synthetic_box(seed: u64) -> (TracerSet, Vec<Vector3>, Vec<Vector3>) {
    let spec = GridSpec::new(N, L, Vector3::zeros()).unwrap();
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let noise: Vec<f64> = (0..spec.num_cells()).map(|_| normal.sample(&mut rng)).collect();
    let mut delta = GridField::from_real(spec, &noise).unwrap();
    delta.smooth_gaussian(40.0);

    let psi = DisplacementField::solve(&delta, 1.0, None);
    let rms = ((0..spec.num_cells())
        .map(|i| psi.at_cell(i).norm_squared())
        .sum::<f64>()
        / spec.num_cells() as f64)
        .sqrt();
    let scale = 3.0 / rms;

    let mut observed = Vec::with_capacity(spec.num_cells());
    let mut truth = Vec::with_capacity(spec.num_cells());
    let mut real = Vec::with_capacity(spec.num_cells());
    for i in 0..spec.num_cells() {
        let q = spec.cell_centre(i);
        let d = psi.at_cell(i) * scale;
        let x = spec.wrap(&(q + d));
        let s = spec.wrap(&(x + Vector3::z() * (GROWTH_RATE * d.z)));
        observed.push(s);
        truth.push(d);
        real.push(x);
    }
    (TracerSet::new(observed), truth, real)
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let ma = a.iter().sum::<f64>() / n;
    let mb = b.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for (x, y) in a.iter().zip(b) {
        cov += (x - ma) * (y - mb);
        va += (x - ma) * (x - ma);
        vb += (y - mb) * (y - mb);
    }
    cov / (va.sqrt() * vb.sqrt())
}

fn box_config() -> ReconstructionConfig {
    ReconstructionConfig {
        grid_size: N,
        box_length: L,
        geometry: Geometry::Box {
            line_of_sight: Axis::Z,
        },
        assignment: MassAssignment::Cic,
        smoothing_radius: 15.0,
        bias: 1.0,
        growth_rate: GROWTH_RATE,
        mode: ReconstructionMode::RsdOnly,
        iterations: 3,
        ..Default::default()
    }
}

#[test]
fn recovers_line_of_sight_displacement() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let (tracers, truth, real) = synthetic_box(2024);
    let config = box_config();
    let result = reconstruct(&tracers, None, None, &config).expect("reconstruction failed");

    assert_eq!(result.iterations, 3);
    assert_eq!(result.status, ReconstructionStatus::Completed);

    let recovered: Vec<f64> = result.displacements.iter().map(|d| d.z).collect();
    let expected: Vec<f64> = truth.iter().map(|d| d.z).collect();
    let r = pearson(&recovered, &expected);
    println!(
        "Ψ_z correlation {:.4} after {} iterations ({:.1} ms)",
        r, result.iterations, result.elapsed_ms
    );
    assert!(r > 0.9, "Ψ_z correlation {} should exceed 0.9", r);

    // Reconstructed positions sit closer to the real-space ones than the observed ones
    let spec = GridSpec::new(N, L, Vector3::zeros()).unwrap();
    let rms = |a: &[Vector3]| {
        (a.iter()
            .zip(&real)
            .map(|(p, x)| spec.periodic_delta(x, p).norm_squared())
            .sum::<f64>()
            / a.len() as f64)
            .sqrt()
    };
    let before = rms(&tracers.positions);
    let after = rms(&result.tracers.positions);
    println!("rms offset from real space: before {:.3}, after {:.3}", before, after);
    assert!(after < 0.5 * before, "before {} after {}", before, after);
}

#[test]
fn zero_iterations_returns_input() {
    let (tracers, _, _) = synthetic_box(7);
    let config = ReconstructionConfig {
        iterations: 0,
        ..box_config()
    };
    let result = reconstruct(&tracers, None, None, &config).unwrap();
    assert_eq!(result.tracers, tracers);
    assert_eq!(result.iterations, 0);
    assert_eq!(result.rms_change, 0.0);
}

#[test]
fn full_mode_removes_bulk_displacement() {
    let (tracers, truth, _) = synthetic_box(99);
    let config = ReconstructionConfig {
        mode: ReconstructionMode::Full,
        ..box_config()
    };
    let result = reconstruct(&tracers, None, None, &config).unwrap();
    // Full reconstruction moves tracers back towards the lattice q
    let spec = GridSpec::new(N, L, Vector3::zeros()).unwrap();
    let mut before = 0.0;
    let mut after = 0.0;
    for (i, (s, x)) in tracers
        .positions
        .iter()
        .zip(&result.tracers.positions)
        .enumerate()
    {
        let q = spec.cell_centre(i);
        before += spec.periodic_delta(&q, s).norm_squared();
        after += spec.periodic_delta(&q, x).norm_squared();
    }
    println!(
        "rms offset from lattice: before {:.3}, after {:.3} (true rms Ψ {:.3})",
        (before / truth.len() as f64).sqrt(),
        (after / truth.len() as f64).sqrt(),
        (truth.iter().map(|d| d.norm_squared()).sum::<f64>() / truth.len() as f64).sqrt()
    );
    assert!(after < 0.5 * before);
}

#[test]
fn shape_errors_precede_computation() {
    let tracers = TracerSet::new(vec![Vector3::new(1.0, 2.0, 3.0)]);
    for (grid_size, box_length) in [(0, 1000.0), (64, -5.0), (64, 0.0)] {
        let config = ReconstructionConfig {
            grid_size,
            box_length,
            ..Default::default()
        };
        let err = reconstruct(&tracers, None, None, &config).unwrap_err();
        assert!(
            matches!(err, Error::Shape(_)),
            "N = {}, L = {}: {:?}",
            grid_size,
            box_length,
            err
        );
    }
}

#[test]
fn strict_convergence_fails_when_tolerance_is_missed() {
    let (tracers, _, _) = synthetic_box(5);
    let config = ReconstructionConfig {
        iterations: 2,
        tolerance: Some(1e-12),
        strict_convergence: true,
        ..box_config()
    };
    let err = reconstruct(&tracers, None, None, &config).unwrap_err();
    assert!(matches!(err, Error::Convergence { iterations: 2, .. }));
    assert!(err.is_recoverable());
}
