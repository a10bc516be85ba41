//! 3D complex FFT on a flat cubic array, built from 1D rustfft passes.
//!
//! The z axis is contiguous and transformed in place row by row; the y and x
//! axes are gathered into a line buffer, transformed and scattered back.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

pub(crate) struct Fft3 {
    n: usize,
    planner: FftPlanner<f64>,
}

impl Fft3 {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            n,
            planner: FftPlanner::new(),
        }
    }

    pub(crate) fn forward(&mut self, data: &mut [Complex<f64>]) {
        let plan = self.planner.plan_fft_forward(self.n);
        self.run(&plan, data);
    }

    /// Unnormalised inverse; the caller divides by `n^3`.
    pub(crate) fn inverse(&mut self, data: &mut [Complex<f64>]) {
        let plan = self.planner.plan_fft_inverse(self.n);
        self.run(&plan, data);
    }

    fn run(&self, plan: &Arc<dyn Fft<f64>>, data: &mut [Complex<f64>]) {
        let n = self.n;
        debug_assert_eq!(data.len(), n * n * n);
        let mut scratch = vec![Complex::new(0.0, 0.0); plan.get_inplace_scratch_len()];
        let mut line = vec![Complex::new(0.0, 0.0); n];

        // z: contiguous rows
        for row in data.chunks_exact_mut(n) {
            plan.process_with_scratch(row, &mut scratch);
        }

        // y: stride n within each x-slab
        for i in 0..n {
            for k in 0..n {
                let base = i * n * n + k;
                for j in 0..n {
                    line[j] = data[base + j * n];
                }
                plan.process_with_scratch(&mut line, &mut scratch);
                for j in 0..n {
                    data[base + j * n] = line[j];
                }
            }
        }

        // x: stride n^2
        for j in 0..n {
            for k in 0..n {
                let base = j * n + k;
                for i in 0..n {
                    line[i] = data[base + i * n * n];
                }
                plan.process_with_scratch(&mut line, &mut scratch);
                for i in 0..n {
                    data[base + i * n * n] = line[i];
                }
            }
        }
    }
}
