//! Error taxonomy shared by the reconstruction and void-finding engines.
//!
//! Geometry problems ([`Error::Shape`], [`Error::DomainMismatch`]) abort a run
//! immediately. Numerical non-convergence and empty void catalogues are only
//! surfaced as errors when the caller asks for strict behaviour; by default the
//! engines report them through the status fields of their results.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The requested grid resolution or box geometry cannot be transformed.
    #[error("invalid grid shape: {0}")]
    Shape(String),

    /// The survey mask does not cover the angular/radial domain of the input.
    #[error(
        "survey mask does not cover the tracer domain: {outside} of {total} objects fall \
         outside the mask (tolerated fraction {tolerance})"
    )]
    DomainMismatch {
        outside: usize,
        total: usize,
        tolerance: f64,
    },

    /// The assigned density field carries no information (no mass or zero variance).
    #[error("degenerate density field: {0}")]
    EmptyField(String),

    /// Reconstruction hit its iteration cap before the RMS change fell below tolerance.
    #[error(
        "reconstruction did not converge after {iterations} iterations \
         (rms displacement change {rms_change:.4e}, tolerance {tolerance:.4e})"
    )]
    Convergence {
        iterations: u32,
        rms_change: f64,
        tolerance: f64,
    },

    /// No density minimum survived the significance filter.
    #[error("no voids passed the significance filter (threshold {threshold})")]
    NoVoidsFound { threshold: f64 },

    /// A configuration parameter is out of its valid range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Input catalogues are malformed (misaligned weights, missing randoms, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Returns `true` for conditions the pipeline may continue past.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Convergence { .. } | Error::NoVoidsFound { .. })
    }
}
