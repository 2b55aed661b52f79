//! Shared numerics for covariance algebra.
//!
//! Every inversion goes through a Cholesky factorization and a triangular
//! solve. Nothing here holds state.

use crate::error::{KalmanError, Result};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use std::f64::consts::PI;

/// Smallest admissible squared pivot relative to the largest diagonal entry.
const RELATIVE_PIVOT_FLOOR: f64 = 1e-14;

/// Returns `(m + mᵀ) / 2`.
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    (m + m.transpose()) * 0.5
}

/// Checks symmetry with a tolerance relative to the largest absolute entry.
pub fn is_symmetric(m: &DMatrix<f64>, tol: f64) -> bool {
    if !m.is_square() {
        return false;
    }
    let scale = m.amax().max(1.0);
    let n = m.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            if (m[(i, j)] - m[(j, i)]).abs() > tol * scale {
                return false;
            }
        }
    }
    true
}

/// Smallest eigenvalue of the symmetric part must be ≥ −tol·scale.
pub fn is_positive_semidefinite(m: &DMatrix<f64>, tol: f64) -> bool {
    if m.nrows() == 0 {
        return true;
    }
    let scale = m.amax().max(1.0);
    let eigen = symmetrize(m).symmetric_eigen();
    eigen.eigenvalues.min() >= -tol * scale
}

/// Fails with `NumericalInstability` if any entry is NaN or infinite.
pub fn ensure_finite_matrix(m: &DMatrix<f64>, context: &str) -> Result<()> {
    if m.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(KalmanError::numerical(format!("non-finite entry in {}", context)))
    }
}

/// Vector counterpart of [`ensure_finite_matrix`].
pub fn ensure_finite_vector(v: &DVector<f64>, context: &str) -> Result<()> {
    if v.iter().all(|x| x.is_finite()) {
        Ok(())
    } else {
        Err(KalmanError::numerical(format!("non-finite entry in {}", context)))
    }
}

/// Cholesky factorization of a symmetric positive-definite matrix.
///
/// Fails with `SingularInnovation` when the matrix is not positive-definite
/// or when a pivot is negligible compared to the matrix scale.
pub fn factorize(m: &DMatrix<f64>) -> Result<Cholesky<f64, Dyn>> {
    if !m.is_square() || m.nrows() == 0 {
        return Err(KalmanError::SingularInnovation);
    }
    ensure_finite_matrix(m, "matrix to factorize")?;

    let max_diag = m.diagonal().amax();
    let chol = symmetrize(m)
        .cholesky()
        .ok_or(KalmanError::SingularInnovation)?;

    let l = chol.l_dirty();
    for i in 0..m.nrows() {
        let pivot = l[(i, i)];
        if pivot * pivot <= RELATIVE_PIVOT_FLOOR * max_diag {
            return Err(KalmanError::SingularInnovation);
        }
    }
    Ok(chol)
}

/// Solves `Σ x = b` against an existing factorization.
pub fn solve(chol: &Cholesky<f64, Dyn>, b: &DMatrix<f64>) -> DMatrix<f64> {
    chol.solve(b)
}

/// `log |Σ|` from the Cholesky factor: `2 Σ log Lᵢᵢ`.
pub fn log_det(chol: &Cholesky<f64, Dyn>) -> f64 {
    2.0 * chol.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>()
}

/// Squared Mahalanobis norm `kᵀ Σ⁻¹ k`.
pub fn mahalanobis_sq(k: &DVector<f64>, chol: &Cholesky<f64, Dyn>) -> f64 {
    let solved = chol.solve(k);
    k.dot(&solved)
}

/// Log-density of a zero-mean Gaussian with factorized covariance, at `k`.
///
/// `−½ [kᵀΣ⁻¹k + log|Σ| + dim·log(2π)]`
pub fn log_gaussian_density_factored(k: &DVector<f64>, chol: &Cholesky<f64, Dyn>) -> f64 {
    let dim = k.len() as f64;
    -0.5 * (mahalanobis_sq(k, chol) + log_det(chol) + dim * (2.0 * PI).ln())
}

/// Log-density of `N(0, Σ)` at `k`.
pub fn log_gaussian_density(k: &DVector<f64>, sigma: &DMatrix<f64>) -> Result<f64> {
    if k.len() != sigma.nrows() {
        return Err(KalmanError::dimension("log-density point", sigma.nrows(), k.len()));
    }
    let chol = factorize(sigma)?;
    Ok(log_gaussian_density_factored(k, &chol))
}

/// A square root `S` with `S Sᵀ = m` for a symmetric PSD matrix.
///
/// Uses Cholesky when the matrix is positive-definite and falls back to the
/// eigen-decomposition (negative eigenvalues clipped to zero) otherwise.
pub fn psd_sqrt(m: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    ensure_finite_matrix(m, "matrix square root")?;
    if let Some(chol) = symmetrize(m).cholesky() {
        return Ok(chol.l());
    }
    let eigen = symmetrize(m).symmetric_eigen();
    let roots = eigen.eigenvalues.map(|l| l.max(0.0).sqrt());
    Ok(&eigen.eigenvectors * DMatrix::from_diagonal(&roots))
}

/// Stacks square blocks along the diagonal.
pub fn block_diagonal(blocks: &[&DMatrix<f64>]) -> DMatrix<f64> {
    let n: usize = blocks.iter().map(|b| b.nrows()).sum();
    let mut out = DMatrix::zeros(n, n);
    let mut offset = 0;
    for block in blocks {
        let d = block.nrows();
        out.view_mut((offset, offset), (d, d)).copy_from(*block);
        offset += d;
    }
    out
}

/// Kronecker sum `a ⊗ I + I ⊗ b` for square `a`, `b`.
pub fn kronecker_sum(a: &DMatrix<f64>, b: &DMatrix<f64>) -> DMatrix<f64> {
    let ia = DMatrix::<f64>::identity(a.nrows(), a.nrows());
    let ib = DMatrix::<f64>::identity(b.nrows(), b.nrows());
    a.kronecker(&ib) + ia.kronecker(b)
}

/// Column-major vectorization.
pub fn vec(m: &DMatrix<f64>) -> DVector<f64> {
    DVector::from_column_slice(m.as_slice())
}

/// Inverse of [`vec`] for a `rows × (len / rows)` matrix.
pub fn unvec(v: &DVector<f64>, rows: usize) -> DMatrix<f64> {
    DMatrix::from_column_slice(rows, v.len() / rows, v.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_log_density_univariate() {
        let k = DVector::from_vec(vec![1.0]);
        let sigma = DMatrix::from_element(1, 1, 4.0);
        let expected = -0.5 * (0.25 + 4.0_f64.ln() + (2.0 * PI).ln());
        assert_relative_eq!(log_gaussian_density(&k, &sigma).unwrap(), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_factorize_rejects_singular() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(factorize(&m).unwrap_err(), KalmanError::SingularInnovation);

        let zero = DMatrix::<f64>::zeros(1, 1);
        assert_eq!(factorize(&zero).unwrap_err(), KalmanError::SingularInnovation);
    }

    #[test]
    fn test_factorize_rejects_non_finite() {
        let m = DMatrix::from_element(1, 1, f64::NAN);
        assert!(matches!(factorize(&m), Err(KalmanError::NumericalInstability(_))));
    }

    #[test]
    fn test_psd_sqrt_of_singular_matrix() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let s = psd_sqrt(&m).unwrap();
        let back = &s * s.transpose();
        assert_relative_eq!(back, m, epsilon = 1e-10);
    }

    #[test]
    fn test_block_diagonal_layout() {
        let a = DMatrix::from_element(1, 1, 2.0);
        let b = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 3.0]);
        let m = block_diagonal(&[&a, &b]);
        assert_eq!(m.nrows(), 3);
        assert_eq!(m[(0, 0)], 2.0);
        assert_eq!(m[(1, 2)], 0.5);
        assert_eq!(m[(0, 1)], 0.0);
        assert_eq!(m[(2, 0)], 0.0);
    }

    #[test]
    fn test_vec_unvec_column_major() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let v = vec(&m);
        assert_eq!(v.as_slice(), &[1.0, 3.0, 2.0, 4.0]);
        assert_eq!(unvec(&v, 2), m);
    }

    #[test]
    fn test_symmetry_and_psd_checks() {
        let good = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 2.0]);
        let skew = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 0.0, 2.0]);
        let indefinite = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(is_symmetric(&good, 1e-12));
        assert!(!is_symmetric(&skew, 1e-12));
        assert!(is_positive_semidefinite(&good, 1e-12));
        assert!(!is_positive_semidefinite(&indefinite, 1e-12));
    }
}
