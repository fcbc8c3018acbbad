//! Dense linear algebra for matrix blocks and small direct solves
//!
//! Matrix entries store their coefficient blocks row-major in flat slices.
//! The helpers here multiply, invert and solve with such blocks, and provide
//! the unpivoted LU factorization used by the direct smoother, where the row
//! of a failing pivot has to be known.

use crate::algebra::SkipMask;
use ndarray::{Array1, Array2};
use thiserror::Error;

/// Relative size below which a pivot is treated as zero.
pub const PIVOT_TOLERANCE: f64 = 1e-12;

/// Errors that can occur during dense factorization
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LuError {
    /// Pivot of the given row vanished
    #[error("zero pivot in row {row}")]
    ZeroPivot {
        /// Row of the failing pivot
        row: usize,
    },
    /// Operand sizes disagree
    #[error("Matrix dimensions mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Expected size
        expected: usize,
        /// Actual size
        got: usize,
    },
}

/// Unpivoted LU factorization
///
/// L is unit lower triangular and stored below the diagonal of `lu`.
#[derive(Debug, Clone)]
pub struct LuFactorization {
    /// Combined L and U factors
    pub lu: Array2<f64>,
    /// Matrix dimension
    pub n: usize,
}

impl LuFactorization {
    /// Solve `A x = b`
    pub fn solve(&self, b: &Array1<f64>) -> Result<Array1<f64>, LuError> {
        if b.len() != self.n {
            return Err(LuError::DimensionMismatch {
                expected: self.n,
                got: b.len(),
            });
        }
        // logical order, so the result is contiguous even for strided input
        let mut x = Array1::from(b.to_vec());
        let slice = x.as_slice_mut().ok_or(LuError::DimensionMismatch {
            expected: self.n,
            got: 0,
        })?;
        self.solve_in_place(slice)?;
        Ok(x)
    }

    /// Solve `A x = b`, overwriting `x` (holding `b`) with the solution
    pub fn solve_in_place(&self, x: &mut [f64]) -> Result<(), LuError> {
        if x.len() != self.n {
            return Err(LuError::DimensionMismatch {
                expected: self.n,
                got: x.len(),
            });
        }
        for i in 0..self.n {
            let mut s = x[i];
            for j in 0..i {
                s -= self.lu[[i, j]] * x[j];
            }
            x[i] = s;
        }
        for i in (0..self.n).rev() {
            let mut s = x[i];
            for j in (i + 1)..self.n {
                s -= self.lu[[i, j]] * x[j];
            }
            x[i] = s / self.lu[[i, i]];
        }
        Ok(())
    }
}

/// Factorize `a` without pivoting.
///
/// A pivot is zero when it is below [`PIVOT_TOLERANCE`] times the largest
/// absolute coefficient of `a`; the error names its row.
pub fn lu_factorize(a: &Array2<f64>) -> Result<LuFactorization, LuError> {
    let n = a.nrows();
    if n != a.ncols() {
        return Err(LuError::DimensionMismatch {
            expected: n,
            got: a.ncols(),
        });
    }
    let scale = a.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let tol = PIVOT_TOLERANCE * scale.max(f64::MIN_POSITIVE);

    let mut lu = a.clone();
    for k in 0..n {
        let pivot = lu[[k, k]];
        if pivot.abs() <= tol {
            return Err(LuError::ZeroPivot { row: k });
        }
        for i in (k + 1)..n {
            let mult = lu[[i, k]] / pivot;
            if mult == 0.0 {
                continue;
            }
            lu[[i, k]] = mult;
            for j in (k + 1)..n {
                let update = mult * lu[[k, j]];
                lu[[i, j]] -= update;
            }
        }
    }
    Ok(LuFactorization { lu, n })
}

/// `y -= A x` for a row-major `rows x cols` block
#[inline]
pub fn block_mul_sub(a: &[f64], rows: usize, cols: usize, x: &[f64], y: &mut [f64]) {
    for r in 0..rows {
        let row = &a[r * cols..(r + 1) * cols];
        y[r] -= row.iter().zip(x).map(|(aij, xj)| aij * xj).sum::<f64>();
    }
}

/// `A x` for a row-major `rows x cols` block
#[inline]
pub fn block_mul(a: &[f64], rows: usize, cols: usize, x: &[f64]) -> Vec<f64> {
    let mut y = vec![0.0; rows];
    for r in 0..rows {
        y[r] = a[r * cols..(r + 1) * cols]
            .iter()
            .zip(x)
            .map(|(aij, xj)| aij * xj)
            .sum();
    }
    y
}

/// `A B` for row-major blocks `A` (`n x k`) and `B` (`k x m`)
pub fn block_product(a: &[f64], n: usize, k: usize, b: &[f64], m: usize) -> Vec<f64> {
    let mut c = vec![0.0; n * m];
    for i in 0..n {
        for l in 0..k {
            let ail = a[i * k + l];
            if ail == 0.0 {
                continue;
            }
            for j in 0..m {
                c[i * m + j] += ail * b[l * m + j];
            }
        }
    }
    c
}

/// Inverse of a row-major `n x n` block (Gauss-Jordan with partial pivoting)
pub fn block_invert(a: &[f64], n: usize) -> Result<Vec<f64>, LuError> {
    if a.len() != n * n {
        return Err(LuError::DimensionMismatch {
            expected: n * n,
            got: a.len(),
        });
    }
    let mut m = Array2::from_shape_fn((n, n), |(i, j)| a[i * n + j]);
    let mut inv = Array2::<f64>::eye(n);
    let scale = a.iter().fold(0.0_f64, |s, v| s.max(v.abs()));
    let tol = PIVOT_TOLERANCE * scale.max(f64::MIN_POSITIVE);

    for k in 0..n {
        let mut max_row = k;
        let mut max_val = m[[k, k]].abs();
        for i in (k + 1)..n {
            if m[[i, k]].abs() > max_val {
                max_val = m[[i, k]].abs();
                max_row = i;
            }
        }
        if max_val <= tol {
            return Err(LuError::ZeroPivot { row: k });
        }
        if max_row != k {
            for j in 0..n {
                m.swap([k, j], [max_row, j]);
                inv.swap([k, j], [max_row, j]);
            }
        }
        let pivot = m[[k, k]];
        for j in 0..n {
            m[[k, j]] /= pivot;
            inv[[k, j]] /= pivot;
        }
        for i in 0..n {
            if i == k {
                continue;
            }
            let f = m[[i, k]];
            if f == 0.0 {
                continue;
            }
            for j in 0..n {
                m[[i, j]] -= f * m[[k, j]];
                inv[[i, j]] -= f * inv[[k, j]];
            }
        }
    }
    Ok(inv.iter().copied().collect())
}

/// Solve a row-major `n x n` block system in place
pub fn block_solve(a: &[f64], n: usize, rhs: &mut [f64]) -> Result<(), LuError> {
    if n == 1 {
        if a[0].abs() <= f64::MIN_POSITIVE {
            return Err(LuError::ZeroPivot { row: 0 });
        }
        rhs[0] /= a[0];
        return Ok(());
    }
    let inv = block_invert(a, n)?;
    let x = block_mul(&inv, n, n, rhs);
    rhs.copy_from_slice(&x);
    Ok(())
}

/// Replace the rows and columns of locked components by the identity.
///
/// A locked component then solves to its right-hand side, which callers
/// set to zero.
pub fn mask_diagonal_block(a: &mut [f64], n: usize, skip: SkipMask) {
    if skip.is_empty() {
        return;
    }
    for k in 0..n {
        if !skip.is_locked(k) {
            continue;
        }
        for j in 0..n {
            a[k * n + j] = 0.0;
            a[j * n + k] = 0.0;
        }
        a[k * n + k] = 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_lu_solve() {
        let a = array![[4.0_f64, 1.0], [1.0, 3.0]];
        let b = array![1.0_f64, 2.0];
        let lu = lu_factorize(&a).expect("factorization should succeed");
        let x = lu.solve(&b).expect("solve should succeed");
        let ax = a.dot(&x);
        for i in 0..2 {
            assert_relative_eq!(ax[i], b[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_lu_solve_strided_rhs() {
        let a = array![[4.0_f64, 1.0], [1.0, 3.0]];
        let lu = lu_factorize(&a).unwrap();
        // reversed axis: not contiguous in memory order
        let mut b = array![2.0_f64, 1.0];
        b.invert_axis(ndarray::Axis(0));
        let x = lu.solve(&b).unwrap();
        let ax = a.dot(&x);
        assert_relative_eq!(ax[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(ax[1], 2.0, epsilon = 1e-12);
        assert!(matches!(
            lu.solve(&array![1.0_f64]),
            Err(LuError::DimensionMismatch { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_zero_pivot_reports_row() {
        // singular Neumann chain: last pivot vanishes
        let a = array![[1.0_f64, -1.0, 0.0], [-1.0, 2.0, -1.0], [0.0, -1.0, 1.0]];
        assert_eq!(lu_factorize(&a).unwrap_err(), LuError::ZeroPivot { row: 2 });

        let a = array![[0.0_f64, 1.0], [1.0, 0.0]];
        assert_eq!(lu_factorize(&a).unwrap_err(), LuError::ZeroPivot { row: 0 });
    }

    #[test]
    fn test_block_invert_needs_pivoting() {
        let a = [0.0, 1.0, 2.0, 0.0];
        let inv = block_invert(&a, 2).unwrap();
        let id = block_product(&a, 2, 2, &inv, 2);
        assert_relative_eq!(id[0], 1.0, epsilon = 1e-14);
        assert_relative_eq!(id[1], 0.0, epsilon = 1e-14);
        assert_relative_eq!(id[2], 0.0, epsilon = 1e-14);
        assert_relative_eq!(id[3], 1.0, epsilon = 1e-14);

        let mut rhs = [2.0, 4.0];
        block_solve(&a, 2, &mut rhs).unwrap();
        assert_relative_eq!(rhs[0], 2.0);
        assert_relative_eq!(rhs[1], 2.0);
    }

    #[test]
    fn test_mask_diagonal_block() {
        let mut a = [2.0, -1.0, -1.0, 2.0];
        mask_diagonal_block(&mut a, 2, SkipMask::from_components(&[1]));
        assert_eq!(a, [2.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_block_mul_sub() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut y = [10.0, 20.0];
        block_mul_sub(&a, 2, 3, &[1.0, 1.0, 1.0], &mut y);
        assert_eq!(y, [4.0, 5.0]);
        assert_eq!(block_mul(&a, 2, 3, &[1.0, 0.0, 0.0]), vec![1.0, 4.0]);
    }
}
