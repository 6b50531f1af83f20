//! # nmf_deblender
//!
//! Multi-band **deblending** of overlapping astronomical sources by constrained
//! non-negative matrix factorization.
//!
//! A blended detection ("footprint") observed in several bands is flattened into a
//! band × pixel data matrix `A`. The deblender factors it as `A ≈ W·H`, where each
//! column of `W` is a source's colour (its relative flux per band) and each row of
//! `H` is that source's spatial intensity. An optional penalty pulls every source
//! toward 180° rotational symmetry about its own peak, which is a good prior for
//! stars and most galaxies.
//!
//! ## Features
//!
//! - **Seeded** — the initial `(W, H)` comes from externally built per-band templates,
//!   with `W` solved by pseudoinverse so close or degenerate peaks never fail
//! - **Symmetry prior** — sparse point-reflection operators clipped to the footprint,
//!   one per peak
//! - **Three update rules** — multiplicative (non-negative), exact alternating least
//!   squares (baseline), and decaying gradient descent, behind one contract
//! - **Value semantics** — every iteration consumes a [`Factorization`] and yields a
//!   new one, so invariants can be checked after any step
//!
//! ## Example
//!
//! ```no_run
//! use nmf_deblender::{
//!     BandImage, BoundingBox, Constraint, DeblendConfig, Footprint, FootprintData, Peak,
//!     SourceTemplate, TemplateImage,
//! };
//!
//! # fn load() -> (Vec<BandImage>, Vec<Vec<TemplateImage>>) { unimplemented!() }
//! let (bands, seed_images) = load();
//! let footprint = Footprint::new(
//!     BoundingBox::new(1024, 2048, 31, 25),
//!     vec![Peak::new(1036, 2058), Peak::new(1045, 2063)],
//! )
//! .unwrap();
//!
//! let data = FootprintData::assemble(&bands, &footprint).unwrap();
//! let templates: Vec<SourceTemplate> = seed_images
//!     .iter()
//!     .map(|imgs| SourceTemplate::from_images(&footprint, imgs).unwrap())
//!     .collect();
//!
//! let config = DeblendConfig {
//!     constraint: Constraint::Symmetry { beta: 0.05 },
//!     ..Default::default()
//! };
//! let result = nmf_deblender::deblend(&footprint, &data, &templates, &config).unwrap();
//! for d in &result.diagnostics {
//!     println!("band {}: residual {:.2}%", d.band, 100.0 * d.residual_fraction);
//! }
//! let image = result.reconstruction.template_image(0, 1).unwrap();
//! println!("source 1, band 0: {}x{}", image.nrows(), image.ncols());
//! ```
//!
//! ## Algorithm overview
//!
//! 1. **Assembly** — crop each band to the footprint box and flatten row-major;
//!    shift by a constant if any pixel is negative
//! 2. **Initial estimate** — average each source's per-band templates into one row of
//!    `H`, add a flat background row, solve `W = A·pinv(H)`, normalise columns of `W`
//! 3. **Symmetry operators** — per peak, a sparse reflection `S` over the largest
//!    symmetric rectangle and the penalty operator `D = I + SᵗS − 2S`
//! 4. **Iteration** — apply the chosen [`UpdateRule`] a caller-chosen number of times
//! 5. **Reconstruction** — per-source templates `W[b,s]·H[s,:]`, residual diagnostics
//!    and thresholded child footprints

pub mod assemble;
pub mod deblend;
mod error;
pub mod footprint;
pub mod init;
pub mod reconstruct;
pub mod solver;
pub mod symmetry;

pub use assemble::{BandImage, FootprintData};
pub use deblend::{deblend, Constraint, DeblendConfig, DeblendResult};
pub use error::{DeblendError, Result};
pub use footprint::{BoundingBox, Footprint, GridShape, Peak};
pub use init::{initial_factorization, Background, SourceTemplate, TemplateImage};
pub use reconstruct::{
    BandDiagnostics, Reconstruction, TemplateFootprint, DEFAULT_FOOTPRINT_THRESHOLD,
};
pub use solver::{
    Factorization, FactorizationSolver, SolveOutcome, SourceKind, SourceLayout, SymmetryPenalty,
    UpdateRule,
};
pub use symmetry::{DiffOperator, SymmetryOperator};
