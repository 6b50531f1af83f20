//! The three update rules.
//!
//! Each takes the data matrix and the current factorization by reference and
//! returns a new factorization; nothing is updated in place across iterations.

use nalgebra::DMatrix;

use super::linalg::{normalize_columns, regularized_inverse, ColumnSum};
use super::{Factorization, SymmetryPenalty, EPSILON};
use crate::error::Result;

/// Lee & Seung multiplicative update with an optional symmetry penalty.
///
/// ```text
/// W ← W ⊙ (A·Hᵗ) ⊘ (W·H·Hᵗ + ε),  then normalise columns of W (scale into H)
/// H ← H ⊙ (Wᵗ·A + Hdiff⁻) ⊘ (WᵗW·H + Hdiff⁺ + ε)
/// ```
///
/// `Hdiff⁺`/`Hdiff⁻` are the positive part and the magnitude of the negative part
/// of the weighted `Hdiff = β·D·H`. For `Hdiff ≥ 0` this is exactly
/// `H ⊙ WᵗA ⊘ (WᵗWH + Hdiff + ε)`; otherwise every factor stays non-negative.
pub(super) fn multiplicative(
    a: &DMatrix<f64>,
    f: &Factorization,
    penalty: Option<&SymmetryPenalty>,
) -> Result<Factorization> {
    let (w, h) = (f.w(), f.h());
    let ht = h.transpose();

    let numer = a * &ht;
    let denom = w * (h * &ht);
    let w = w.zip_zip_map(&numer, &denom, |x, n, d| x * n / (d + EPSILON));
    let (w, h) = normalize_columns(w, h.clone(), ColumnSum::Absolute);

    let wt = w.transpose();
    let mut numer = &wt * a;
    let mut denom = (&wt * &w) * &h;
    if let Some(p) = penalty {
        let diff = p.weighted_diff(&h)?;
        numer += diff.map(|d| (-d).max(0.0));
        denom += diff.map(|d| d.max(0.0));
    }
    let h = h.zip_zip_map(&numer, &denom, |x, n, d| x * n / (d + EPSILON));

    Ok(f.with_matrices(w, h))
}

/// Unconstrained alternating least squares.
///
/// ```text
/// W = A·Hᵗ·(H·Hᵗ + εI)⁻¹,  normalised
/// H = (WᵗW + εI)⁻¹·Wᵗ·A
/// ```
///
/// Ignores any symmetry penalty and may produce negative entries.
pub(super) fn exact_inverse(a: &DMatrix<f64>, f: &Factorization) -> Factorization {
    let h = f.h();
    let ht = h.transpose();
    let w = (a * &ht) * regularized_inverse(&(h * &ht), EPSILON);
    let (w, _) = normalize_columns(w, h.clone(), ColumnSum::Absolute);

    let wt = w.transpose();
    let h = regularized_inverse(&(&wt * &w), EPSILON) * (&wt * a);

    f.with_matrices(w, h)
}

/// One explicit gradient step on `½‖A − W·H‖² + ½·Σ β_k·h_kᵀD_kh_k`.
///
/// `H` is stepped first; the `W` gradient uses the stepped `H` with the residual
/// from the start of the call.
pub(super) fn gradient_descent(
    a: &DMatrix<f64>,
    f: &Factorization,
    penalty: Option<&SymmetryPenalty>,
    step_w: f64,
    step_h: f64,
) -> Result<Factorization> {
    let (w, h) = (f.w(), f.h());
    let resid = w * h - a;

    let mut grad_h = w.transpose() * &resid;
    if let Some(p) = penalty {
        grad_h += p.weighted_diff(h)?;
    }
    let h = h - grad_h * step_h;

    let grad_w = &resid * h.transpose();
    let w = w - grad_w * step_w;

    Ok(f.with_matrices(w, h))
}
