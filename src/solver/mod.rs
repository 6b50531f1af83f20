//! Iterative factorization `A ≈ W·H` of a footprint's band × pixel data.
//!
//! - `W` (bands × sources): the colour (SED) of each source, columns normalised to 1.
//! - `H` (sources × pixels): the spatial intensity of each source.
//!
//! Three interchangeable update rules share one contract, see [`UpdateRule::apply`]:
//!
//! 1. **Multiplicative** (default) — Lee & Seung (2001). Preserves non-negativity and,
//!    without a penalty, never increases `‖A − W·H‖`. Supports the symmetry penalty.
//! 2. **Exact inverse** — closed-form alternating least squares. Unconstrained
//!    baseline for comparison; may go negative.
//! 3. **Gradient descent** — explicit steps whose sizes halve after every call.
//!
//! The caller chooses the number of iterations; there is no convergence test.
//!
//! # Background policy
//!
//! When a background source is present it is always the last source. It takes
//! part in column normalisation and in every update rule exactly like a peak,
//! is never given a symmetry operator, and is the only source whose template is
//! shifted back by the data offset at reconstruction.

pub mod linalg;
mod update;

use nalgebra::DMatrix;
use tracing::debug;

use crate::error::{DeblendError, Result};
use crate::footprint::Footprint;
use crate::symmetry::{diff_operators, intensity_diff, symmetry_penalty, DiffOperator};

pub use linalg::{normalize_columns, pseudo_inverse, regularized_inverse, ColumnSum};

/// Regulariser added to every denominator and Gram-matrix diagonal.
pub const EPSILON: f64 = 1e-9;

/// Default step size for [`UpdateRule::GradientDescent`].
pub const DEFAULT_GRADIENT_STEP: f64 = 1e-3;

// ── Sources ────────────────────────────────────────────────────────────────

/// What a row of `H` (column of `W`) represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// The source seeded from peak `i` of the footprint.
    Peak(usize),
    /// The synthetic flat background source.
    Background,
}

/// Peak sources followed by an optional background source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLayout {
    peaks: usize,
    background: bool,
}

impl SourceLayout {
    pub fn new(peaks: usize, background: bool) -> Self {
        Self { peaks, background }
    }

    /// Total number of sources, including the background.
    pub fn len(&self) -> usize {
        self.peaks + usize::from(self.background)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_peaks(&self) -> usize {
        self.peaks
    }

    pub fn has_background(&self) -> bool {
        self.background
    }

    /// Index of the background source, if any.
    pub fn background_index(&self) -> Option<usize> {
        self.background.then_some(self.peaks)
    }

    /// Kind of source `index`, or `None` if out of range.
    pub fn kind(&self, index: usize) -> Option<SourceKind> {
        if index < self.peaks {
            Some(SourceKind::Peak(index))
        } else if self.background && index == self.peaks {
            Some(SourceKind::Background)
        } else {
            None
        }
    }
}

// ── Factorization value ────────────────────────────────────────────────────

/// An immutable `(W, H)` pair with its source layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Factorization {
    w: DMatrix<f64>,
    h: DMatrix<f64>,
    layout: SourceLayout,
}

impl Factorization {
    /// Create a factorization, checking `W.ncols == H.nrows == layout.len()`.
    pub fn new(w: DMatrix<f64>, h: DMatrix<f64>, layout: SourceLayout) -> Result<Self> {
        if w.ncols() != h.nrows() {
            return Err(DeblendError::shape(
                "factorization sources",
                format!("W columns = {}", w.ncols()),
                format!("H rows = {}", h.nrows()),
            ));
        }
        if w.ncols() != layout.len() {
            return Err(DeblendError::shape(
                "factorization layout",
                layout.len(),
                w.ncols(),
            ));
        }
        Ok(Self { w, h, layout })
    }

    /// Same layout, new matrices. Update rules preserve shapes.
    pub(crate) fn with_matrices(&self, w: DMatrix<f64>, h: DMatrix<f64>) -> Self {
        debug_assert_eq!(w.shape(), self.w.shape());
        debug_assert_eq!(h.shape(), self.h.shape());
        Self {
            w,
            h,
            layout: self.layout,
        }
    }

    /// Colour matrix (bands × sources).
    pub fn w(&self) -> &DMatrix<f64> {
        &self.w
    }

    /// Intensity matrix (sources × pixels).
    pub fn h(&self) -> &DMatrix<f64> {
        &self.h
    }

    pub fn layout(&self) -> SourceLayout {
        self.layout
    }

    pub fn into_parts(self) -> (DMatrix<f64>, DMatrix<f64>) {
        (self.w, self.h)
    }

    pub fn num_bands(&self) -> usize {
        self.w.nrows()
    }

    pub fn num_sources(&self) -> usize {
        self.w.ncols()
    }

    pub fn num_pixels(&self) -> usize {
        self.h.ncols()
    }

    /// The model `W·H`.
    pub fn model(&self) -> DMatrix<f64> {
        &self.w * &self.h
    }

    /// Frobenius norm `‖A − W·H‖`.
    pub fn residual_norm(&self, data: &DMatrix<f64>) -> f64 {
        (data - self.model()).norm()
    }

    /// Returns `true` if every entry of `W` and `H` is `≥ 0`.
    pub fn is_non_negative(&self) -> bool {
        self.w.iter().chain(self.h.iter()).all(|&v| v >= 0.0)
    }

    fn check_data(&self, data: &DMatrix<f64>) -> Result<()> {
        let expected = (self.num_bands(), self.num_pixels());
        if data.shape() != expected {
            return Err(DeblendError::shape(
                "data matrix vs factorization",
                format!("{:?}", expected),
                format!("{:?}", data.shape()),
            ));
        }
        Ok(())
    }
}

// ── Symmetry penalty ───────────────────────────────────────────────────────

/// Weighted symmetry penalty: one weight `β_k` and one difference operator per
/// peak source. A weight of zero leaves that peak unconstrained.
#[derive(Debug, Clone)]
pub struct SymmetryPenalty {
    betas: Vec<f64>,
    operators: Vec<DiffOperator>,
}

impl SymmetryPenalty {
    /// Same weight `beta` for every operator. `beta` must be finite and non-negative.
    pub fn new(beta: f64, operators: Vec<DiffOperator>) -> Result<Self> {
        check_weight(beta)?;
        Self::with_peak_weights(vec![beta; operators.len()], operators)
    }

    /// One weight per operator, each finite and non-negative.
    pub fn with_peak_weights(betas: Vec<f64>, operators: Vec<DiffOperator>) -> Result<Self> {
        if betas.len() != operators.len() {
            return Err(DeblendError::shape(
                "symmetry weights vs operators",
                operators.len(),
                betas.len(),
            ));
        }
        for &beta in &betas {
            check_weight(beta)?;
        }
        Ok(Self { betas, operators })
    }

    /// Build the operators for every peak of `footprint`, all weighted by `beta`.
    pub fn from_footprint(beta: f64, footprint: &Footprint) -> Result<Self> {
        Self::new(beta, diff_operators(footprint)?)
    }

    /// Build the operators for every peak of `footprint`, weighting peak `k` by `betas[k]`.
    pub fn from_footprint_weights(betas: Vec<f64>, footprint: &Footprint) -> Result<Self> {
        Self::with_peak_weights(betas, diff_operators(footprint)?)
    }

    /// Per-peak weights, in peak order.
    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    /// Largest per-peak weight.
    pub fn max_beta(&self) -> f64 {
        self.betas.iter().copied().fold(0.0, f64::max)
    }

    pub fn operators(&self) -> &[DiffOperator] {
        &self.operators
    }

    /// `β_k·D_k·H[k]` for every peak row; zero for the background row.
    pub fn weighted_diff(&self, h: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        let mut diff = intensity_diff(h, &self.operators)?;
        for (k, beta) in self.betas.iter().enumerate() {
            diff.row_mut(k).scale_mut(*beta);
        }
        Ok(diff)
    }

    /// Total penalty `Σ β_k·H[k]ᵗ·D_k·H[k]`.
    pub fn value(&self, h: &DMatrix<f64>) -> Result<f64> {
        Ok(symmetry_penalty(h, &self.operators)?
            .iter()
            .zip(&self.betas)
            .map(|(p, b)| p * b)
            .sum())
    }

    fn check(&self, factors: &Factorization) -> Result<()> {
        let layout = factors.layout();
        if self.operators.len() != layout.num_peaks() {
            return Err(DeblendError::shape(
                "symmetry operators vs peak sources",
                layout.num_peaks(),
                self.operators.len(),
            ));
        }
        let pixels = factors.num_pixels();
        if let Some(op) = self.operators.iter().find(|op| op.matrix().nrows() != pixels) {
            return Err(DeblendError::shape(
                "symmetry operator size",
                pixels,
                op.matrix().nrows(),
            ));
        }
        Ok(())
    }
}

fn check_weight(beta: f64) -> Result<()> {
    if !beta.is_finite() || beta < 0.0 {
        return Err(DeblendError::InvalidArgument(format!(
            "symmetry weight must be finite and non-negative, got {}",
            beta
        )));
    }
    Ok(())
}

// ── Update rules ───────────────────────────────────────────────────────────

/// Strategy used for each iteration.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum UpdateRule {
    /// Lee & Seung multiplicative update; non-negativity preserving.
    #[default]
    Multiplicative,
    /// Closed-form ε-regularised alternating least squares; unconstrained.
    ExactInverse,
    /// Explicit gradient step; both step sizes halve after every call.
    GradientDescent { step_w: f64, step_h: f64 },
}

impl UpdateRule {
    /// Gradient descent with the default step sizes.
    pub fn gradient_descent() -> Self {
        UpdateRule::GradientDescent {
            step_w: DEFAULT_GRADIENT_STEP,
            step_h: DEFAULT_GRADIENT_STEP,
        }
    }

    /// Apply one iteration: `(A, W, H, penalty) → (W', H')`.
    ///
    /// Fails with [`DeblendError::ShapeMismatch`] if `data` or the penalty operators do
    /// not match the factorization, and with [`DeblendError::InvalidArgument`] if a
    /// penalty is given to a rule that cannot use it.
    pub fn apply(
        &self,
        data: &DMatrix<f64>,
        factors: &Factorization,
        penalty: Option<&SymmetryPenalty>,
    ) -> Result<Factorization> {
        self.check_inputs(data, factors, penalty)?;
        match *self {
            UpdateRule::Multiplicative => update::multiplicative(data, factors, penalty),
            UpdateRule::ExactInverse => Ok(update::exact_inverse(data, factors)),
            UpdateRule::GradientDescent { step_w, step_h } => {
                update::gradient_descent(data, factors, penalty, step_w, step_h)
            }
        }
    }

    fn check_inputs(
        &self,
        data: &DMatrix<f64>,
        factors: &Factorization,
        penalty: Option<&SymmetryPenalty>,
    ) -> Result<()> {
        factors.check_data(data)?;
        if let Some(p) = penalty {
            if !self.supports_penalty() {
                return Err(DeblendError::InvalidArgument(format!(
                    "the {} update does not support a symmetry penalty",
                    self.name()
                )));
            }
            p.check(factors)?;
        }
        Ok(())
    }

    /// The rule to use for the next iteration.
    ///
    /// Gradient-descent steps are halved; the other rules are stateless.
    pub fn decayed(&self) -> Self {
        match *self {
            UpdateRule::GradientDescent { step_w, step_h } => UpdateRule::GradientDescent {
                step_w: step_w / 2.0,
                step_h: step_h / 2.0,
            },
            other => other,
        }
    }

    /// Whether the rule accepts a symmetry penalty.
    pub fn supports_penalty(&self) -> bool {
        !matches!(self, UpdateRule::ExactInverse)
    }

    pub fn name(&self) -> &'static str {
        match self {
            UpdateRule::Multiplicative => "multiplicative",
            UpdateRule::ExactInverse => "exact-inverse",
            UpdateRule::GradientDescent { .. } => "gradient-descent",
        }
    }
}

// ── Solver ─────────────────────────────────────────────────────────────────

/// Result of a solver run.
#[derive(Debug, Clone)]
pub struct SolveOutcome {
    /// Final factorization.
    pub factors: Factorization,
    /// Rule to continue with (decayed steps for gradient descent).
    pub rule: UpdateRule,
    /// Number of iterations performed.
    pub iterations: usize,
    /// `‖A − W·H‖` before the first iteration.
    pub residual_before: f64,
    /// `‖A − W·H‖` after the last iteration.
    pub residual_after: f64,
    /// Residual after every iteration, if tracking was enabled.
    pub residual_history: Vec<f64>,
}

/// Runs an update rule for a fixed number of iterations.
#[derive(Debug, Clone, Default)]
pub struct FactorizationSolver {
    rule: UpdateRule,
    penalty: Option<SymmetryPenalty>,
    track_residuals: bool,
}

impl FactorizationSolver {
    pub fn new(rule: UpdateRule) -> Self {
        Self {
            rule,
            penalty: None,
            track_residuals: false,
        }
    }

    /// Add a symmetry penalty to the H update.
    pub fn with_penalty(mut self, penalty: SymmetryPenalty) -> Self {
        self.penalty = Some(penalty);
        self
    }

    /// Record `‖A − W·H‖` after every iteration.
    pub fn track_residuals(mut self, track: bool) -> Self {
        self.track_residuals = track;
        self
    }

    pub fn rule(&self) -> UpdateRule {
        self.rule
    }

    pub fn penalty(&self) -> Option<&SymmetryPenalty> {
        self.penalty.as_ref()
    }

    /// Run exactly `iterations` updates starting from `init`.
    pub fn run(
        &self,
        data: &DMatrix<f64>,
        init: Factorization,
        iterations: usize,
    ) -> Result<SolveOutcome> {
        self.rule.check_inputs(data, &init, self.penalty.as_ref())?;

        let residual_before = init.residual_norm(data);
        let mut history = Vec::with_capacity(if self.track_residuals { iterations } else { 0 });
        let mut factors = init;
        let mut rule = self.rule;

        for _ in 0..iterations {
            factors = rule.apply(data, &factors, self.penalty.as_ref())?;
            rule = rule.decayed();
            if self.track_residuals {
                history.push(factors.residual_norm(data));
            }
        }

        let residual_after = factors.residual_norm(data);
        debug!(
            "NMF {}: {} iterations, residual {:.6e} → {:.6e}, max symmetry weight={}",
            self.rule.name(),
            iterations,
            residual_before,
            residual_after,
            self.penalty.as_ref().map_or(0.0, |p| p.max_beta())
        );

        Ok(SolveOutcome {
            factors,
            rule,
            iterations,
            residual_before,
            residual_after,
            residual_history: history,
        })
    }
}
