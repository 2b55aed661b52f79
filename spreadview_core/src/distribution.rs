//! Multivariate normal distribution, the value type every stage passes around.

use crate::error::{KalmanError, Result};
use crate::linalg;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Relative tolerance for the symmetry check at construction.
pub const SYMMETRY_TOLERANCE: f64 = 1e-9;

/// Relative eigenvalue floor for the positive-semidefinite check at construction.
pub const PSD_TOLERANCE: f64 = 1e-9;

/// Immutable Gaussian `N(mean, cov)`.
///
/// New distributions are produced by prediction and update; an existing
/// one is never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNormalDistr")]
pub struct NormalDistr {
    mean: DVector<f64>,
    cov: DMatrix<f64>,
}

/// Unchecked wire form; deserialization goes through [`NormalDistr::new`].
#[derive(Deserialize)]
struct RawNormalDistr {
    mean: DVector<f64>,
    cov: DMatrix<f64>,
}

impl TryFrom<RawNormalDistr> for NormalDistr {
    type Error = KalmanError;

    fn try_from(raw: RawNormalDistr) -> Result<Self> {
        Self::new(raw.mean, raw.cov)
    }
}

impl NormalDistr {
    /// Create a distribution, validating shape, finiteness, symmetry and
    /// positive-semidefiniteness.
    ///
    /// # Errors
    /// * `DimensionMismatch` if `cov` is not square or does not match `mean`
    /// * `NumericalInstability` if any entry is NaN or infinite
    /// * `InvalidCovariance` if `cov` is not symmetric or has a negative eigenvalue
    pub fn new(mean: DVector<f64>, cov: DMatrix<f64>) -> Result<Self> {
        if !cov.is_square() {
            return Err(KalmanError::dimension("covariance columns", cov.nrows(), cov.ncols()));
        }
        if cov.nrows() != mean.len() {
            return Err(KalmanError::dimension("covariance rows", mean.len(), cov.nrows()));
        }
        linalg::ensure_finite_vector(&mean, "distribution mean")?;
        linalg::ensure_finite_matrix(&cov, "distribution covariance")?;
        if !linalg::is_symmetric(&cov, SYMMETRY_TOLERANCE) {
            return Err(KalmanError::InvalidCovariance("covariance is not symmetric".into()));
        }
        if !linalg::is_positive_semidefinite(&cov, PSD_TOLERANCE) {
            return Err(KalmanError::InvalidCovariance(
                "covariance is not positive-semidefinite".into(),
            ));
        }
        Ok(Self { mean, cov })
    }

    /// Crate-internal constructor for values already known to be consistent.
    pub(crate) fn from_parts(mean: DVector<f64>, cov: DMatrix<f64>) -> Self {
        debug_assert_eq!(mean.len(), cov.nrows());
        Self { mean, cov }
    }

    /// One-dimensional `N(mean, variance)`.
    pub fn univariate(mean: f64, variance: f64) -> Result<Self> {
        if variance < 0.0 {
            return Err(KalmanError::InvalidCovariance(format!(
                "negative variance {}",
                variance
            )));
        }
        Self::new(
            DVector::from_element(1, mean),
            DMatrix::from_element(1, 1, variance),
        )
    }

    /// Point mass at `mean` (zero covariance).
    pub fn dirac(mean: DVector<f64>) -> Result<Self> {
        let n = mean.len();
        Self::new(mean, DMatrix::zeros(n, n))
    }

    /// Standard normal `N(0, I)` of dimension `dim`.
    pub fn standard(dim: usize) -> Self {
        Self {
            mean: DVector::zeros(dim),
            cov: DMatrix::identity(dim, dim),
        }
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn cov(&self) -> &DMatrix<f64> {
        &self.cov
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Variance of component `i`.
    pub fn variance(&self, i: usize) -> f64 {
        self.cov[(i, i)]
    }

    /// Standard deviation of component `i`.
    pub fn sd(&self, i: usize) -> f64 {
        self.cov[(i, i)].max(0.0).sqrt()
    }

    /// Square-root factor `V` with `V Vᵀ = cov`.
    pub fn vol(&self) -> Result<DMatrix<f64>> {
        linalg::psd_sqrt(&self.cov)
    }

    /// Squared Mahalanobis distance of `x` from the mean.
    pub fn mahalanobis_sq(&self, x: &DVector<f64>) -> Result<f64> {
        if x.len() != self.dim() {
            return Err(KalmanError::dimension("mahalanobis point", self.dim(), x.len()));
        }
        let chol = linalg::factorize(&self.cov)?;
        Ok(linalg::mahalanobis_sq(&(x - &self.mean), &chol))
    }

    /// Log-density at `x`.
    pub fn log_density(&self, x: &DVector<f64>) -> Result<f64> {
        if x.len() != self.dim() {
            return Err(KalmanError::dimension("density point", self.dim(), x.len()));
        }
        linalg::log_gaussian_density(&(x - &self.mean), &self.cov)
    }

    /// 2×2 volatility factor for two correlated components.
    pub fn vol_2d(sd1: f64, sd2: f64, cor: f64) -> Result<DMatrix<f64>> {
        if !(-1.0..=1.0).contains(&cor) {
            return Err(KalmanError::InvalidCovariance(format!(
                "correlation {} outside [-1, 1]",
                cor
            )));
        }
        Ok(DMatrix::from_row_slice(
            2,
            2,
            &[sd1, 0.0, cor * sd2, (1.0 - cor * cor).sqrt() * sd2],
        ))
    }

    /// Volatility factor of a covariance matrix.
    pub fn vol_from_cov(cov: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        if !cov.is_square() {
            return Err(KalmanError::dimension("covariance columns", cov.nrows(), cov.ncols()));
        }
        linalg::psd_sqrt(cov)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rejects_shape_mismatch() {
        let err = NormalDistr::new(DVector::zeros(2), DMatrix::identity(3, 3)).unwrap_err();
        assert!(matches!(err, KalmanError::DimensionMismatch { .. }));

        let err = NormalDistr::new(DVector::zeros(2), DMatrix::zeros(2, 3)).unwrap_err();
        assert!(matches!(err, KalmanError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_rejects_asymmetric_and_nan() {
        let skew = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.0, 1.0]);
        assert!(matches!(
            NormalDistr::new(DVector::zeros(2), skew),
            Err(KalmanError::InvalidCovariance(_))
        ));

        let nan = DVector::from_vec(vec![f64::NAN]);
        assert!(matches!(
            NormalDistr::new(nan, DMatrix::identity(1, 1)),
            Err(KalmanError::NumericalInstability(_))
        ));
    }

    #[test]
    fn test_rejects_negative_and_indefinite_covariance() {
        let negative = NormalDistr::new(
            DVector::from_element(1, 100.35),
            DMatrix::from_element(1, 1, -100.0),
        );
        assert!(matches!(negative, Err(KalmanError::InvalidCovariance(_))));

        // Symmetric, eigenvalues 4 and -2
        let indefinite = DMatrix::from_row_slice(2, 2, &[1.0, 3.0, 3.0, 1.0]);
        assert!(matches!(
            NormalDistr::new(DVector::zeros(2), indefinite),
            Err(KalmanError::InvalidCovariance(_))
        ));

        // Singular but PSD is fine
        let singular = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        assert!(NormalDistr::new(DVector::zeros(2), singular).is_ok());
    }

    #[test]
    fn test_deserialize_validates() {
        let d = NormalDistr::univariate(1.5, 4.0).unwrap();
        let json = serde_json::to_value(&d).unwrap();
        let back: NormalDistr = serde_json::from_value(json).unwrap();
        assert_eq!(back, d);

        // Mean of one distribution spliced onto the covariance of a larger one
        let small = serde_json::to_value(NormalDistr::standard(1)).unwrap();
        let large = serde_json::to_value(NormalDistr::standard(2)).unwrap();
        let forged = serde_json::json!({ "mean": small["mean"], "cov": large["cov"] });
        assert!(serde_json::from_value::<NormalDistr>(forged).is_err());

        let negative = serde_json::to_value(NormalDistr::univariate(0.0, 1.0).unwrap())
            .unwrap()
            .to_string()
            .replace("1.0", "-1.0");
        assert!(serde_json::from_str::<NormalDistr>(&negative).is_err());
    }

    #[test]
    fn test_vol_from_cov_reproduces_covariance() {
        let cov = DMatrix::from_row_slice(2, 2, &[4.0, 1.2, 1.2, 9.0]);
        let vol = NormalDistr::vol_from_cov(&cov).unwrap();
        let back = &vol * vol.transpose();
        for (a, b) in back.iter().zip(cov.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
        assert!(NormalDistr::vol_from_cov(&DMatrix::zeros(2, 3)).is_err());
    }

    #[test]
    fn test_vol_2d_reproduces_covariance() {
        let vol = NormalDistr::vol_2d(2.0, 3.0, 0.5).unwrap();
        let cov = &vol * vol.transpose();
        assert_relative_eq!(cov[(0, 0)], 4.0, epsilon = 1e-12);
        assert_relative_eq!(cov[(1, 1)], 9.0, epsilon = 1e-12);
        assert_relative_eq!(cov[(0, 1)], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_dirac_has_zero_spread() {
        let d = NormalDistr::dirac(DVector::from_vec(vec![1.0, 2.0])).unwrap();
        assert_eq!(d.sd(0), 0.0);
        assert!(d.log_density(d.mean()).is_err());
    }

    #[test]
    fn test_mahalanobis_of_standard_normal() {
        let d = NormalDistr::standard(2);
        let x = DVector::from_vec(vec![3.0, 4.0]);
        assert_relative_eq!(d.mahalanobis_sq(&x).unwrap(), 25.0, epsilon = 1e-12);
    }
}
