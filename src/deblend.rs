//! One-call deblending of a single footprint.
//!
//! Strings the pipeline together:
//!
//! 1. Optionally shift the data so it is non-negative.
//! 2. Seed `(W, H)` from the external templates ([`initial_factorization`]).
//! 3. Build the symmetry penalty if requested.
//! 4. Run the chosen update rule for a fixed number of iterations.
//! 5. Wrap the result in a [`Reconstruction`] and log per-band diagnostics.
//!
//! # Example
//!
//! ```no_run
//! use nmf_deblender::{
//!     deblend, BoundingBox, Constraint, DeblendConfig, Footprint, FootprintData, Peak,
//!     SourceTemplate,
//! };
//! # fn run(data: FootprintData, templates: Vec<SourceTemplate>) -> nmf_deblender::Result<()> {
//! let footprint = Footprint::new(
//!     BoundingBox::new(120, 340, 21, 17),
//!     vec![Peak::new(127, 346), Peak::new(133, 350)],
//! )?;
//! let config = DeblendConfig {
//!     iterations: 300,
//!     constraint: Constraint::Symmetry { beta: 0.1 },
//!     ..Default::default()
//! };
//! let result = deblend(&footprint, &data, &templates, &config)?;
//! let flux = result.reconstruction.template_flux(0, 1)?;
//! println!("source 1 flux in band 0: {flux:.1}");
//! # Ok(())
//! # }
//! ```

use tracing::{debug, info};

use crate::assemble::FootprintData;
use crate::error::{DeblendError, Result};
use crate::footprint::Footprint;
use crate::init::{initial_factorization, Background, SourceTemplate};
use crate::reconstruct::{BandDiagnostics, Reconstruction};
use crate::solver::{Factorization, FactorizationSolver, SymmetryPenalty, UpdateRule};

/// Shape prior applied to every peak source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constraint {
    /// Plain NMF.
    None,
    /// Quadratic penalty on deviations from point symmetry about each peak, weighted by `beta`.
    Symmetry { beta: f64 },
    /// Radial monotonicity about each peak. Not implemented.
    Monotonicity,
}

/// Configuration for [`deblend`].
#[derive(Debug, Clone)]
pub struct DeblendConfig {
    /// Number of solver iterations. Default 200.
    pub iterations: usize,
    /// Update rule. Default multiplicative.
    pub update_rule: UpdateRule,
    /// Shape prior on the peak sources. Default none.
    pub constraint: Constraint,
    /// Per-peak shape priors, in peak order. Empty (the default) applies
    /// `constraint` to every peak; otherwise there must be one entry per peak and
    /// `constraint` is ignored.
    pub peak_constraints: Vec<Constraint>,
    /// Append a flat background source. Default true.
    pub include_background: bool,
    /// Shift the data to be non-negative before solving. Default true.
    /// Required for the multiplicative rule when the data has negative pixels.
    pub offset_data: bool,
    /// Convolve the model with the band PSFs. Not implemented; must stay false.
    pub use_psf: bool,
}

impl Default for DeblendConfig {
    fn default() -> Self {
        Self {
            iterations: 200,
            update_rule: UpdateRule::Multiplicative,
            constraint: Constraint::None,
            peak_constraints: Vec::new(),
            include_background: true,
            offset_data: true,
            use_psf: false,
        }
    }
}

/// Output of [`deblend`].
#[derive(Debug, Clone)]
pub struct DeblendResult {
    /// Seed factorization before any iteration.
    pub initial: Factorization,
    /// Solved factorization, offset-shifted data and grid shape.
    pub reconstruction: Reconstruction,
    /// Per-band fit diagnostics.
    pub diagnostics: Vec<BandDiagnostics>,
    /// `‖A − W·H‖` before and after solving.
    pub residual_before: f64,
    pub residual_after: f64,
}

impl DeblendResult {
    pub fn factors(&self) -> &Factorization {
        self.reconstruction.factors()
    }

    /// Data offset that was applied (0 if none).
    pub fn offset(&self) -> f64 {
        self.reconstruction.offset()
    }
}

/// Deblend one footprint.
///
/// `templates[k]` seeds the source of `footprint.peaks()[k]`.
pub fn deblend(
    footprint: &Footprint,
    data: &FootprintData,
    templates: &[SourceTemplate],
    config: &DeblendConfig,
) -> Result<DeblendResult> {
    if config.use_psf {
        return Err(DeblendError::Unsupported("PSF operator"));
    }
    let constraints = resolve_constraints(footprint, config)?;
    if constraints.contains(&Constraint::Monotonicity) {
        return Err(DeblendError::Unsupported("monotonicity constraint"));
    }
    if templates.len() != footprint.num_peaks() {
        return Err(DeblendError::shape(
            "seed templates vs peaks",
            footprint.num_peaks(),
            templates.len(),
        ));
    }
    let shape = footprint.shape();
    if data.num_pixels() != shape.pixels() {
        return Err(DeblendError::shape(
            "data pixels vs footprint grid",
            format!("{} ({})", shape.pixels(), shape),
            data.num_pixels(),
        ));
    }

    let data = if config.offset_data {
        data.with_positivity_offset()
    } else {
        data.clone()
    };
    let offset = data.offset();
    if offset > 0.0 {
        debug!("Shifted footprint data by {:.4} to remove negative pixels", offset);
    }

    let background = if config.include_background {
        Background::Included { offset }
    } else {
        Background::Excluded
    };
    let initial = initial_factorization(data.data(), templates, background)?;

    let mut solver = FactorizationSolver::new(config.update_rule);
    if constraints.iter().any(|c| matches!(c, Constraint::Symmetry { .. })) {
        let betas = constraints
            .iter()
            .map(|c| match c {
                Constraint::Symmetry { beta } => *beta,
                _ => 0.0,
            })
            .collect();
        solver = solver.with_penalty(SymmetryPenalty::from_footprint_weights(betas, footprint)?);
    }

    info!(
        "Deblending {} peaks over {} pixels in {} bands ({}, {} iterations)",
        footprint.num_peaks(),
        shape.pixels(),
        data.num_bands(),
        config.update_rule.name(),
        config.iterations
    );
    let outcome = solver.run(data.data(), initial.clone(), config.iterations)?;

    let reconstruction = Reconstruction::new(
        data.data().clone(),
        outcome.factors,
        offset,
        Some(shape),
    )?;
    let diagnostics = reconstruction.band_diagnostics();
    for d in &diagnostics {
        info!(
            "Band {}: pixel range {:.4} to {:.4}, max difference {:.4e}, residual {:.1}%",
            d.band,
            d.data_min,
            d.data_max,
            d.max_difference,
            100.0 * d.residual_fraction
        );
    }

    Ok(DeblendResult {
        initial,
        reconstruction,
        diagnostics,
        residual_before: outcome.residual_before,
        residual_after: outcome.residual_after,
    })
}

/// One constraint per peak: the explicit list, or `config.constraint` broadcast.
fn resolve_constraints(footprint: &Footprint, config: &DeblendConfig) -> Result<Vec<Constraint>> {
    if config.peak_constraints.is_empty() {
        return Ok(vec![config.constraint; footprint.num_peaks()]);
    }
    if config.peak_constraints.len() != footprint.num_peaks() {
        return Err(DeblendError::shape(
            "peak constraints vs peaks",
            footprint.num_peaks(),
            config.peak_constraints.len(),
        ));
    }
    Ok(config.peak_constraints.clone())
}
