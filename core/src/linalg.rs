//! Linear algebra helpers for sigma-point generation.
//!
//! Public API:
//!     pub fn modified_cholesky(matrix: &DMatrix<f64>) -> ModifiedCholesky
//!
//! The decomposition is the numerically defensive variant used for
//! sigma-point spreads: a non-positive diagonal pivot does not fail the
//! factorization; the corresponding column's scale factor is zeroed instead,
//! so that dimension contributes no spread. Degraded columns are reported on
//! the result so callers can surface the accuracy loss instead of inheriting
//! it silently.

use nalgebra::DMatrix;

/// Pivots at or below this value are treated as non-positive.
const PIVOT_TOLERANCE: f64 = 1.0e-20;

/// Result of [`modified_cholesky`]: a lower-triangular factor `L` with
/// `matrix ≈ L·Lᵀ` on the non-degenerate subspace, plus the column indices
/// whose pivots were zeroed.
#[derive(Clone, Debug, PartialEq)]
pub struct ModifiedCholesky {
    pub factor: DMatrix<f64>,
    pub degenerate: Vec<usize>,
}

impl ModifiedCholesky {
    pub fn is_degenerate(&self) -> bool {
        !self.degenerate.is_empty()
    }
}

/// Decompose a symmetric matrix into a lower-triangular square-root factor,
/// zeroing the scale of any non-positive pivot rather than failing.
pub fn modified_cholesky(matrix: &DMatrix<f64>) -> ModifiedCholesky {
    assert!(
        matrix.is_square(),
        "modified_cholesky: matrix must be square"
    );
    let n = matrix.nrows();
    let mut l = DMatrix::<f64>::zeros(n, n);
    let mut d = vec![0.0; n];
    if n > 0 {
        if matrix[(0, 0)] > PIVOT_TOLERANCE {
            l[(0, 0)] = matrix[(0, 0)];
            d[0] = 1.0 / l[(0, 0)];
        } else {
            l[(0, 0)] = 1.0;
            d[0] = 0.0;
        }
        for i in 1..n {
            for j in 0..=i {
                let mut lld = matrix[(i, j)];
                for k in 0..j {
                    lld -= l[(i, k)] * l[(j, k)] * d[k];
                }
                l[(i, j)] = lld;
            }
            if l[(i, i)] > PIVOT_TOLERANCE {
                d[i] = 1.0 / l[(i, i)];
            } else {
                d[i] = 0.0;
            }
        }
    }
    let mut degenerate = Vec::new();
    for col in 0..n {
        let scale = if d[col] > 0.0 {
            d[col].sqrt()
        } else {
            degenerate.push(col);
            0.0
        };
        for row in 0..n {
            l[(row, col)] *= scale;
        }
    }
    ModifiedCholesky {
        factor: l,
        degenerate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: &DMatrix<f64>, b: &DMatrix<f64>, tol: f64) -> bool {
        if a.shape() != b.shape() {
            return false;
        }
        let mut max_abs = 0.0f64;
        for i in 0..a.nrows() {
            for j in 0..a.ncols() {
                max_abs = max_abs.max((a[(i, j)] - b[(i, j)]).abs());
            }
        }
        max_abs <= tol
    }

    #[test]
    fn t_identity() {
        let i = DMatrix::<f64>::identity(3, 3);
        let result = modified_cholesky(&i);
        assert!(!result.is_degenerate());
        assert!(approx_eq(&result.factor, &i, 1e-14));
    }

    #[test]
    fn t_spd_round_trip() {
        let a = DMatrix::from_row_slice(3, 3, &[2.0, 0.0, 0.0, 1.0, 1.5, 0.0, 0.5, -0.5, 1.0]);
        let p = &a * a.transpose();
        let result = modified_cholesky(&p);
        assert!(!result.is_degenerate());
        let back = &result.factor * result.factor.transpose();
        assert!(approx_eq(&back, &p, 1e-12));
    }

    #[test]
    fn t_lower_triangular() {
        let p = DMatrix::from_row_slice(2, 2, &[4.0, 2.0, 2.0, 5.0]);
        let result = modified_cholesky(&p);
        assert_eq!(result.factor[(0, 1)], 0.0);
        assert!(approx_eq(
            &result.factor,
            &DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 1.0, 2.0]),
            1e-12
        ));
    }

    #[test]
    fn t_zero_leading_pivot_is_zeroed_not_fatal() {
        let p = DMatrix::from_row_slice(2, 2, &[0.0, 0.0, 0.0, 1.0]);
        let result = modified_cholesky(&p);
        assert_eq!(result.degenerate, vec![0]);
        // The degenerate column contributes no spread.
        assert_eq!(result.factor.column(0).amax(), 0.0);
        let back = &result.factor * result.factor.transpose();
        assert!(approx_eq(&back, &p, 1e-12));
    }

    #[test]
    fn t_negative_pivot_is_degenerate() {
        let p = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -2.0]);
        let result = modified_cholesky(&p);
        assert_eq!(result.degenerate, vec![1]);
        assert_eq!(result.factor.column(1).amax(), 0.0);
    }
}
