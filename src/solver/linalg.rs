//! Dense linear-algebra helpers shared by the estimator and the update rules.

use nalgebra::DMatrix;

/// Relative singular-value cutoff for the pseudoinverse.
const PINV_RCOND: f64 = 1e-12;

/// How the column sums of `W` are measured during normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnSum {
    /// Plain sum; used for the initial estimate, whose `W` may contain negative entries.
    Signed,
    /// Sum of absolute values; used inside the update rules.
    Absolute,
}

/// Normalise every column of `W` to unit sum, moving the scale into `H`.
///
/// Column `k` of `W` is divided by its sum and row `k` of `H` multiplied by the same
/// factor, so `W·H` is unchanged. A column whose sum is exactly zero uses factor 1,
/// i.e. it is left untouched.
pub fn normalize_columns(
    mut w: DMatrix<f64>,
    mut h: DMatrix<f64>,
    sum: ColumnSum,
) -> (DMatrix<f64>, DMatrix<f64>) {
    for k in 0..w.ncols() {
        let norm = match sum {
            ColumnSum::Signed => w.column(k).sum(),
            ColumnSum::Absolute => w.column(k).iter().map(|v| v.abs()).sum(),
        };
        let norm = if norm == 0.0 { 1.0 } else { norm };
        w.column_mut(k).unscale_mut(norm);
        if k < h.nrows() {
            h.row_mut(k).scale_mut(norm);
        }
    }
    (w, h)
}

/// Moore–Penrose pseudoinverse via SVD.
///
/// Singular values below `1e-12 × σ_max` are treated as zero, so rank-deficient
/// inputs yield the minimum-norm least-squares inverse instead of an error.
pub fn pseudo_inverse(m: &DMatrix<f64>) -> DMatrix<f64> {
    let (nrows, ncols) = m.shape();
    if nrows == 0 || ncols == 0 {
        return DMatrix::zeros(ncols, nrows);
    }
    let svd = m.clone().svd(true, true);
    let sigma_max = svd.singular_values.max();
    if sigma_max <= 0.0 {
        return DMatrix::zeros(ncols, nrows);
    }
    svd.pseudo_inverse(sigma_max * PINV_RCOND)
        .unwrap_or_else(|_| DMatrix::zeros(ncols, nrows))
}

/// Inverse of the square matrix `m + eps·I`.
///
/// For the Gram matrices used by the update rules this is symmetric positive
/// definite whenever `eps > 0`; if the inversion still fails numerically the
/// pseudoinverse is returned instead.
pub fn regularized_inverse(m: &DMatrix<f64>, eps: f64) -> DMatrix<f64> {
    let n = m.nrows();
    let reg = m + DMatrix::<f64>::identity(n, n) * eps;
    match reg.clone().try_inverse() {
        Some(inv) if inv.iter().all(|v| v.is_finite()) => inv,
        _ => pseudo_inverse(&reg),
    }
}
