//! # voidrecon
//!
//! Redshift-space-distortion reconstruction and watershed void finding for
//! galaxy and simulation catalogues.
//!
//! Given tracer positions in a periodic box or an observed survey (with
//! randoms and/or an angular mask), `voidrecon` estimates the linear
//! Zel'dovich displacement from the observed density, moves tracers back to
//! their approximate real-space positions, and then locates underdense
//! regions with a priority-flood watershed.
//!
//! ## Example
//!
//! ```no_run
//! use voidrecon::{
//!     run_pipeline, PipelineConfig, ReconstructionConfig, TracerSet, Vector3,
//!     VoidFinderConfig,
//! };
//!
//! let tracers = TracerSet::load_from_file("data/box_galaxies.rkyv").unwrap();
//!
//! let config = PipelineConfig {
//!     reconstruction: ReconstructionConfig {
//!         grid_size: 256,
//!         box_length: 1500.0,
//!         bias: 2.0,
//!         growth_rate: 0.76,
//!         smoothing_radius: 10.0,
//!         ..Default::default()
//!     },
//!     voids: VoidFinderConfig {
//!         grid_size: 128,
//!         box_length: 1500.0,
//!         threshold: -0.2,
//!         ..Default::default()
//!     },
//!     superclusters: None,
//! };
//!
//! let output = run_pipeline(&tracers, None, None, &config).unwrap();
//! println!(
//!     "{} iterations, {} voids",
//!     output.reconstruction.iterations,
//!     output.voids.len()
//! );
//! for void in output.voids.top_level().take(5) {
//!     println!("void {} at {:?}, R = {:.1} Mpc/h", void.id, void.centre, void.radius);
//! }
//! output.voids.save_to_file("data/voids.rkyv").unwrap();
//! ```
//!
//! ## Stages
//!
//! 1. **Density assignment**: NGP, CIC or TSC deposit; contrast against the
//!    uniform mean, an α-scaled random catalogue, or mask completeness ×
//!    radial selection; optional Gaussian smoothing
//! 2. **Reconstruction**: `Ψ(k) = i k W(kR) δ(k) / (k² b_eff)`, interpolated
//!    at the tracers and iterated to strip the RSD term `f (Ψ·r̂) r̂`
//! 3. **Void finding**: grid-cell or tracer (k-nearest-neighbour) density
//!    graph, watershed flooding from minima below a threshold, flat or
//!    hierarchical merging at saddles
//! 4. **Catalogue**: centres, effective radii, contrasts, λ_v, edge flags,
//!    optional sky positions; rkyv persistence
//!
//! Superclusters come from the same watershed run on the negated contrast
//! ([`find_clusters`]).

pub mod cosmology;
pub mod density;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod mask;
pub mod pipeline;
pub mod recon;
pub mod tracer;
pub mod voids;

pub use cosmology::{Cosmology, RedshiftTable};
pub use density::{AssignmentStats, DensityAssigner, DensityConfig, DensityField, MassAssignment};
pub use error::{Error, Result};
pub use geometry::{Axis, Geometry};
pub use grid::{fft_frequencies, GridField, GridSpec, Space};
pub use mask::{PixelScheme, SelectionFunction, SurveyMask};
pub use pipeline::{run_pipeline, PipelineConfig, PipelineOutput};
pub use recon::{
    reconstruct, DisplacementField, ReconstructionConfig, ReconstructionMode,
    ReconstructionResult, ReconstructionStatus,
};
pub use tracer::{RandomSet, TracerRecord, TracerSet};
pub use voids::{
    find_clusters, find_clusters_in_graph, find_voids, find_voids_in_graph, CellGraph,
    Connectivity, DensityGraph, DensityProxy, EdgeStatus, MemberKind, MergePolicy, SkyPosition,
    StructureKind, TracerGraph, VoidCatalogue, VoidCentre, VoidFinderConfig, VoidRecord,
    VoidSearchStatus,
};

// Positions and displacements are comoving Mpc/h in double precision
pub type Vector3 = nalgebra::Vector3<f64>;
