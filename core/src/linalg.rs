//! Covariance hygiene helpers.
//!
//! Public API:
//!     pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn clamp_variances(p, range, floor, ceiling)
//!     pub fn zero_rows_and_columns(p, range)
//!     pub fn reset_block(p, range, variance)
//!     pub fn is_finite(m) -> bool
//!     pub fn min_eigenvalue(p) -> f64
//!
//! Strategy after every covariance mutation:
//! 1) Check every entry is finite; a non-finite entry is fatal to the filter instance
//! 2) Symmetrize P ← 0.5 (P + Pᵀ)
//! 3) Clamp each state group's variances to its configured [floor, ceiling]

use std::ops::Range;

use nalgebra::DMatrix;
use nalgebra::linalg::SymmetricEigen;

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
///
/// Simple matrix symmetrization function that reduces round-off errors associated
/// with floating point arithmetic.
///
/// # Arguments
/// * `m` - the matrix to symmetrize
///
/// # Returns
/// A symmetrized version of the input matrix.
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}
/// Clamp the diagonal entries in `range` to `[floor, ceiling]`.
///
/// When a variance is pulled down to the ceiling the matching rows and columns are scaled by the
/// same factor so the correlation structure (and therefore positive semi-definiteness) is kept.
pub fn clamp_variances(p: &mut DMatrix<f64>, range: Range<usize>, floor: f64, ceiling: f64) {
    for i in range {
        let variance = p[(i, i)];
        if variance < floor {
            p[(i, i)] = floor;
        } else if variance > ceiling {
            let scale = (ceiling / variance).sqrt();
            for j in 0..p.ncols() {
                if j != i {
                    p[(i, j)] *= scale;
                    p[(j, i)] *= scale;
                }
            }
            p[(i, i)] = ceiling;
        }
    }
}
/// Zero the rows and columns in `range`, including their diagonal entries.
pub fn zero_rows_and_columns(p: &mut DMatrix<f64>, range: Range<usize>) {
    let n = p.ncols();
    for i in range {
        for j in 0..n {
            p[(i, j)] = 0.0;
            p[(j, i)] = 0.0;
        }
    }
}
/// Decorrelate the states in `range` from everything else and set their variance.
pub fn reset_block(p: &mut DMatrix<f64>, range: Range<usize>, variance: f64) {
    zero_rows_and_columns(p, range.clone());
    for i in range {
        p[(i, i)] = variance;
    }
}
/// True if every entry is finite.
#[inline]
pub fn is_finite(m: &DMatrix<f64>) -> bool {
    m.iter().all(|v| v.is_finite())
}
/// Smallest eigenvalue of the symmetric part of `p`.
pub fn min_eigenvalue(p: &DMatrix<f64>) -> f64 {
    SymmetricEigen::new(symmetrize(p))
        .eigenvalues
        .iter()
        .cloned()
        .fold(f64::INFINITY, f64::min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn t_symmetrize() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 0.0, 3.0]);
        let s = symmetrize(&m);
        assert_eq!(s, DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 3.0]));
    }
    #[test]
    fn t_clamp_floor() {
        let mut p = DMatrix::from_diagonal_element(3, 3, 1e-12);
        clamp_variances(&mut p, 0..2, 1e-6, 1.0);
        assert_eq!(p[(0, 0)], 1e-6);
        assert_eq!(p[(1, 1)], 1e-6);
        assert_eq!(p[(2, 2)], 1e-12);
    }
    #[test]
    fn t_clamp_ceiling_keeps_psd() {
        let a = DMatrix::from_row_slice(3, 3, &[3.0, 0.0, 0.0, 2.0, 1.0, 0.0, 0.5, 0.2, 0.1]);
        let mut p = &a * a.transpose();
        clamp_variances(&mut p, 0..1, 0.0, 1.0);
        assert_approx_eq!(p[(0, 0)], 1.0);
        assert!(min_eigenvalue(&p) > -1e-12);
        assert_eq!(p, p.transpose());
    }
    #[test]
    fn t_zero_rows_and_columns() {
        let mut p = DMatrix::from_element(4, 4, 1.0);
        zero_rows_and_columns(&mut p, 1..3);
        assert_eq!(p[(1, 0)], 0.0);
        assert_eq!(p[(0, 2)], 0.0);
        assert_eq!(p[(2, 2)], 0.0);
        assert_eq!(p[(3, 0)], 1.0);
    }
    #[test]
    fn t_reset_block() {
        let mut p = DMatrix::from_element(3, 3, 0.5);
        reset_block(&mut p, 2..3, 4.0);
        assert_eq!(p[(2, 2)], 4.0);
        assert_eq!(p[(2, 0)], 0.0);
        assert_eq!(p[(0, 0)], 0.5);
    }
    #[test]
    fn t_is_finite() {
        let mut p = DMatrix::identity(2, 2);
        assert!(is_finite(&p));
        p[(1, 0)] = f64::NAN;
        assert!(!is_finite(&p));
    }
}
