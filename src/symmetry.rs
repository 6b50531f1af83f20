//! Sparse operators enforcing 180° rotational symmetry about each peak.
//!
//! For a source whose peak sits at grid position `(px, py)`, the symmetry operator
//! `S` maps a flattened intensity row to its point reflection about the peak:
//!
//! ```text
//! (S·v)[(px + dx, py + dy)] = v[(px − dx, py − dy)]
//! ```
//!
//! Reflection is only defined inside the largest axis-aligned rectangle centred on
//! the peak that fits in the footprint. Rows and columns of `S` for pixels outside
//! that rectangle are empty.
//!
//! The derived difference operator `D = I + SᵗS − 2S` turns this into a quadratic
//! penalty `hᵗ·D·h`. Inside the rectangle `SᵗS` is the identity and the penalty is
//! `‖h − S·h‖²`. Outside it only the identity term survives, so
//! `(D·h)[p] = h[p]` and the penalty contributes `h[p]²`.
//!
//! # Outside-rectangle policy
//!
//! Flux outside the symmetric rectangle is penalised toward zero with the same
//! weight as asymmetric flux inside it. The penalty vanishes only for rows that are
//! symmetric inside the rectangle and zero outside it. A peak near the footprint
//! edge has a small rectangle, so most of its profile is pulled toward zero.

use std::ops::Range;

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use rayon::prelude::*;
use tracing::debug;

use crate::error::{DeblendError, Result};
use crate::footprint::{Footprint, GridShape};

/// Minimal index range along one axis that is symmetric about `peak`
/// and clipped to `0..size`.
pub fn symmetric_range(peak: usize, size: usize) -> Range<usize> {
    // Compare 2·peak against size−1 to stay in integers
    let twice = 2 * peak;
    let last = size - 1;
    if twice < last {
        0..twice + 1
    } else if twice > last {
        twice + 1 - size..size
    } else {
        0..size
    }
}

/// Point-reflection operator about one peak.
#[derive(Debug, Clone)]
pub struct SymmetryOperator {
    matrix: CsrMatrix<f64>,
    columns: Range<usize>,
    rows: Range<usize>,
}

impl SymmetryOperator {
    /// Build the operator for a peak at grid position `(px, py)`.
    pub fn new(shape: GridShape, px: usize, py: usize) -> Result<Self> {
        if shape.pixels() == 0 {
            return Err(DeblendError::InvalidArgument(
                "cannot build a symmetry operator on an empty grid".into(),
            ));
        }
        if px >= shape.width || py >= shape.height {
            return Err(DeblendError::InvalidArgument(format!(
                "peak ({}, {}) outside {} grid",
                px, py, shape
            )));
        }

        let n = shape.pixels();

        // Peak at the geometric centre: reverse the whole pixel vector
        if 2 * px + 1 == shape.width && 2 * py + 1 == shape.height {
            let mut coo = CooMatrix::new(n, n);
            for i in 0..n {
                coo.push(i, n - 1 - i, 1.0);
            }
            return Ok(Self {
                matrix: CsrMatrix::from(&coo),
                columns: 0..shape.width,
                rows: 0..shape.height,
            });
        }

        let columns = symmetric_range(px, shape.width);
        let rows = symmetric_range(py, shape.height);
        let sub_width = columns.len();
        let sub_height = rows.len();

        // Contiguous flat span from the rectangle's first pixel to its last
        let start = shape.index(columns.start, rows.start);
        let block = (sub_height - 1) * shape.width + sub_width;

        // Diagonal of the sub-block before reversal. Inside the flat span every
        // interior row is followed by `extra` pixels that lie outside the rectangle;
        // their entries are zeroed so nothing reflects into them.
        let mut keep = vec![true; block];
        for offset in aliased_offsets(sub_width, sub_height, shape.width) {
            keep[offset] = false;
        }

        let mut coo = CooMatrix::new(n, n);
        for k in (0..block).filter(|&k| keep[k]) {
            coo.push(start + k, start + block - 1 - k, 1.0);
        }

        Ok(Self {
            matrix: CsrMatrix::from(&coo),
            columns,
            rows,
        })
    }

    /// The sparse pixels × pixels matrix.
    pub fn matrix(&self) -> &CsrMatrix<f64> {
        &self.matrix
    }

    /// Grid columns covered by the symmetric rectangle.
    pub fn columns(&self) -> Range<usize> {
        self.columns.clone()
    }

    /// Grid rows covered by the symmetric rectangle.
    pub fn rows(&self) -> Range<usize> {
        self.rows.clone()
    }

    /// Reflect an intensity row about the peak.
    pub fn apply(&self, v: &DVector<f64>) -> DVector<f64> {
        &self.matrix * v
    }

    /// The quadratic penalty operator `I + SᵗS − 2S`.
    pub fn diff_operator(&self) -> DiffOperator {
        let n = self.matrix.nrows();
        let identity = CsrMatrix::<f64>::identity(n);
        let sts = &self.matrix.transpose() * &self.matrix;
        let two_s = &self.matrix * 2.0;
        DiffOperator {
            matrix: &(&identity + &sts) - &two_s,
        }
    }
}

/// Offsets within the flat sub-block that fall outside the symmetric rectangle.
///
/// For interior row `i` (`0 ≤ i < sub_height − 1`) these are
/// `(i + 1)·sub_width + i·extra + j` for `j < extra`, with
/// `extra = grid_width − sub_width`.
fn aliased_offsets(
    sub_width: usize,
    sub_height: usize,
    grid_width: usize,
) -> impl Iterator<Item = usize> {
    let extra = grid_width - sub_width;
    (0..sub_height.saturating_sub(1))
        .flat_map(move |i| (0..extra).map(move |j| (i + 1) * sub_width + i * extra + j))
}

/// Quadratic symmetry-violation operator `D = I + SᵗS − 2S` for one peak.
#[derive(Debug, Clone)]
pub struct DiffOperator {
    matrix: CsrMatrix<f64>,
}

impl DiffOperator {
    pub fn matrix(&self) -> &CsrMatrix<f64> {
        &self.matrix
    }

    pub fn apply(&self, v: &DVector<f64>) -> DVector<f64> {
        &self.matrix * v
    }

    /// Penalty value `vᵗ·D·v`.
    pub fn penalty(&self, v: &DVector<f64>) -> f64 {
        v.dot(&self.apply(v))
    }
}

/// Build one symmetry operator per peak of `footprint`, in peak order.
pub fn symmetry_operators(footprint: &Footprint) -> Result<Vec<SymmetryOperator>> {
    let shape = footprint.shape();
    let ops = footprint
        .relative_peaks()
        .into_par_iter()
        .map(|(px, py)| SymmetryOperator::new(shape, px, py))
        .collect::<Result<Vec<_>>>()?;
    debug!(
        "Built {} symmetry operators on {} grid ({} total non-zeros)",
        ops.len(),
        shape,
        ops.iter().map(|s| s.matrix.nnz()).sum::<usize>()
    );
    Ok(ops)
}

/// Build one difference operator per peak of `footprint`, in peak order.
pub fn diff_operators(footprint: &Footprint) -> Result<Vec<DiffOperator>> {
    Ok(symmetry_operators(footprint)?
        .par_iter()
        .map(SymmetryOperator::diff_operator)
        .collect())
}

/// Operators must not outnumber the rows of `h` and must match its pixel count.
fn check_operators(h: &DMatrix<f64>, operators: &[DiffOperator]) -> Result<()> {
    if operators.len() > h.nrows() {
        return Err(DeblendError::shape(
            "symmetry operators vs intensity rows",
            format!("at most {}", h.nrows()),
            operators.len(),
        ));
    }
    if let Some(op) = operators.iter().find(|op| op.matrix().ncols() != h.ncols()) {
        return Err(DeblendError::shape(
            "symmetry operator size",
            h.ncols(),
            op.matrix().ncols(),
        ));
    }
    Ok(())
}

/// Per-row penalty gradient: `Hdiff[k] = D_k·H[k]` for peak rows.
///
/// Rows without an operator (the background row, when present) are zero.
pub fn intensity_diff(h: &DMatrix<f64>, operators: &[DiffOperator]) -> Result<DMatrix<f64>> {
    check_operators(h, operators)?;
    let mut diff = DMatrix::<f64>::zeros(h.nrows(), h.ncols());
    for (k, op) in operators.iter().enumerate() {
        let row = op.apply(&h.row(k).transpose());
        diff.row_mut(k).tr_copy_from(&row);
    }
    Ok(diff)
}

/// Symmetry penalty `H[k]ᵗ·D_k·H[k]` for each peak row.
pub fn symmetry_penalty(h: &DMatrix<f64>, operators: &[DiffOperator]) -> Result<Vec<f64>> {
    check_operators(h, operators)?;
    Ok(operators
        .iter()
        .enumerate()
        .map(|(k, op)| op.penalty(&h.row(k).transpose()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::footprint::{BoundingBox, Peak};

    /// Dense copy of a sparse operator for entry-wise checks.
    fn dense(m: &CsrMatrix<f64>) -> DMatrix<f64> {
        let mut d = DMatrix::zeros(m.nrows(), m.ncols());
        for (i, j, v) in m.triplet_iter() {
            d[(i, j)] += *v;
        }
        d
    }

    /// Row symmetric about (px, py) inside the operator's rectangle, zero elsewhere.
    fn symmetric_row(
        shape: GridShape,
        op: &SymmetryOperator,
        px: usize,
        py: usize,
    ) -> DVector<f64> {
        let mut v = DVector::zeros(shape.pixels());
        for y in op.rows() {
            for x in op.columns() {
                let dx = x as f64 - px as f64;
                let dy = y as f64 - py as f64;
                // Even in (dx, dy) → (−dx, −dy), but not axis-symmetric
                v[shape.index(x, y)] = 10.0 * (-(dx * dx + 0.5 * dy * dy)).exp() + 0.3 * dx * dy;
            }
        }
        v.map(|x: f64| x.abs())
    }

    #[test]
    fn test_symmetric_range() {
        assert_eq!(symmetric_range(1, 7), 0..3);
        assert_eq!(symmetric_range(3, 7), 0..7);
        assert_eq!(symmetric_range(5, 7), 4..7);
        assert_eq!(symmetric_range(0, 4), 0..1);
        assert_eq!(symmetric_range(2, 4), 1..4);
        assert_eq!(symmetric_range(3, 4), 3..4);
        assert_eq!(symmetric_range(0, 1), 0..1);
    }

    #[test]
    fn test_centered_peak_is_full_reversal() {
        let shape = GridShape::new(5, 7);
        let op = SymmetryOperator::new(shape, 3, 2).unwrap();
        let n = shape.pixels();
        assert_eq!(op.matrix().nnz(), n);
        let d = dense(op.matrix());
        for i in 0..n {
            for j in 0..n {
                let expected = if j == n - 1 - i { 1.0 } else { 0.0 };
                assert_eq!(d[(i, j)], expected, "entry ({}, {})", i, j);
            }
        }
    }

    #[test]
    fn test_symmetric_row_is_fixed_point() {
        let shape = GridShape::new(6, 8);
        for &(px, py) in &[(2usize, 1usize), (6, 4), (1, 3), (5, 0)] {
            let op = SymmetryOperator::new(shape, px, py).unwrap();
            let v = symmetric_row(shape, &op, px, py);
            let sv = op.apply(&v);
            let err = (&sv - &v).abs().max();
            assert!(err < 1e-12, "S·v != v for peak ({}, {}): {}", px, py, err);

            let dv = op.diff_operator().apply(&v);
            assert!(dv.abs().max() < 1e-12, "D·v != 0 for peak ({}, {})", px, py);
            assert!(op.diff_operator().penalty(&v).abs() < 1e-12);
        }
    }

    #[test]
    fn test_asymmetric_row_is_penalized() {
        let shape = GridShape::new(5, 5);
        let op = SymmetryOperator::new(shape, 2, 2).unwrap();
        let mut v = DVector::zeros(25);
        v[shape.index(3, 2)] = 1.0;
        assert!(op.diff_operator().penalty(&v) > 0.5);
    }

    #[test]
    fn test_trailing_columns_not_aliased() {
        // 6 wide, 5 tall; peak at (1, 1) gives a 3x3 rectangle at the top-left,
        // leaving 3 extra columns per interior row inside the flat span.
        let shape = GridShape::new(5, 6);
        let op = SymmetryOperator::new(shape, 1, 1).unwrap();
        assert_eq!(op.columns(), 0..3);
        assert_eq!(op.rows(), 0..3);

        let d = dense(op.matrix());
        let offsets: Vec<usize> = aliased_offsets(3, 3, 6).collect();
        assert_eq!(offsets, vec![3, 4, 5, 9, 10, 11]);
        for &idx in &offsets {
            assert_eq!(d[(idx, idx)], 0.0, "diagonal at aliased index {}", idx);
            assert_eq!(d.row(idx).sum(), 0.0, "row {} should be empty", idx);
            assert_eq!(d.column(idx).sum(), 0.0, "column {} should be empty", idx);
        }

        // Only the 9 rectangle pixels map, each onto its reflection
        assert_eq!(op.matrix().nnz(), 9);
        for y in 0..3 {
            for x in 0..3 {
                let src = shape.index(2 - x, 2 - y);
                assert_eq!(d[(shape.index(x, y), src)], 1.0);
            }
        }
        // Rows outside the rectangle are empty, not identity
        assert_eq!(d.row(shape.index(5, 4)).sum(), 0.0);
    }

    #[test]
    fn test_right_edge_peak() {
        // Peak near the bottom-right corner
        let shape = GridShape::new(4, 5);
        let op = SymmetryOperator::new(shape, 4, 3).unwrap();
        assert_eq!(op.columns(), 4..5);
        assert_eq!(op.rows(), 3..4);
        assert_eq!(op.matrix().nnz(), 1);
        let d = dense(op.matrix());
        assert_eq!(d[(19, 19)], 1.0);
    }

    #[test]
    fn test_operators_skip_background_row() {
        let fp = Footprint::new(
            BoundingBox::new(0, 0, 5, 5),
            vec![Peak::new(2, 2), Peak::new(1, 1)],
        )
        .unwrap();
        let ops = diff_operators(&fp).unwrap();
        assert_eq!(ops.len(), 2);

        // Three rows: two peaks plus a background that is wildly asymmetric
        let mut h = DMatrix::<f64>::zeros(3, 25);
        h[(2, 0)] = 100.0;
        h[(0, 12)] = 1.0;
        let diff = intensity_diff(&h, &ops).unwrap();
        assert_eq!(diff.row(2).sum(), 0.0);
        assert!(diff.row(0).abs().max() < 1e-12);

        let penalty = symmetry_penalty(&h, &ops).unwrap();
        assert_eq!(penalty.len(), 2);
        assert!(penalty[0].abs() < 1e-12);
    }

    #[test]
    fn test_flux_outside_rectangle_penalized() {
        // Corner peak: the symmetric rectangle is the single pixel (0, 0)
        let shape = GridShape::new(5, 5);
        let op = SymmetryOperator::new(shape, 0, 0).unwrap();
        assert_eq!(op.columns(), 0..1);
        assert_eq!(op.rows(), 0..1);

        let mut v = DVector::zeros(25);
        v[shape.index(4, 4)] = 3.0;
        assert_eq!(op.apply(&v)[24], 0.0);

        let d = op.diff_operator();
        let dv = d.apply(&v);
        assert!((dv[24] - 3.0).abs() < 1e-12, "Hdiff at (4, 4): {}", dv[24]);
        assert!((d.penalty(&v) - 9.0).abs() < 1e-12, "penalty {}", d.penalty(&v));

        // Flux at the peak itself is symmetric and costs nothing
        let mut at_peak = DVector::zeros(25);
        at_peak[0] = 3.0;
        assert!(d.penalty(&at_peak).abs() < 1e-12);
    }

    #[test]
    fn test_operator_size_checked() {
        let fp = Footprint::new(BoundingBox::new(0, 0, 3, 3), vec![Peak::new(1, 1)]).unwrap();
        let ops = diff_operators(&fp).unwrap();
        let h = DMatrix::<f64>::zeros(1, 10);
        assert!(matches!(
            intensity_diff(&h, &ops),
            Err(DeblendError::ShapeMismatch { .. })
        ));
        let empty = DMatrix::<f64>::zeros(0, 9);
        assert!(symmetry_penalty(&empty, &ops).is_err());
    }

    #[test]
    fn test_out_of_grid_peak_rejected() {
        let shape = GridShape::new(3, 3);
        assert!(SymmetryOperator::new(shape, 3, 0).is_err());
    }
}
