//! Linear observation models.
//!
//! Every shorthand (scalar, row, identity) normalizes to one `k × m` matrix
//! that maps the bound state slice into measurement space.

use crate::distribution::{PSD_TOLERANCE, SYMMETRY_TOLERANCE};
use crate::error::{KalmanError, Result};
use crate::linalg;
use nalgebra::DMatrix;

/// `y = H x (+ v)`, with optional model-level measurement noise `v ~ N(0, R)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationModel {
    matrix: DMatrix<f64>,
    noise: Option<DMatrix<f64>>,
}

impl ObservationModel {
    /// Canonical constructor.
    pub fn new(matrix: DMatrix<f64>) -> Result<Self> {
        if matrix.nrows() == 0 || matrix.ncols() == 0 {
            return Err(KalmanError::dimension(
                "observation matrix",
                1,
                matrix.nrows().min(matrix.ncols()),
            ));
        }
        linalg::ensure_finite_matrix(&matrix, "observation matrix")?;
        Ok(Self { matrix, noise: None })
    }

    /// Observe the bound state directly.
    pub fn identity(dim: usize) -> Result<Self> {
        Self::new(DMatrix::identity(dim, dim))
    }

    /// `value · I`.
    pub fn scalar(value: f64, dim: usize) -> Result<Self> {
        Self::new(DMatrix::identity(dim, dim) * value)
    }

    /// A single linear combination of the bound state.
    pub fn row(coefficients: &[f64]) -> Result<Self> {
        Self::new(DMatrix::from_row_slice(1, coefficients.len(), coefficients))
    }

    /// Attach measurement noise carried by the model itself.
    pub fn with_noise(mut self, noise: DMatrix<f64>) -> Result<Self> {
        if !noise.is_square() || noise.nrows() != self.matrix.nrows() {
            return Err(KalmanError::dimension(
                "observation noise",
                self.matrix.nrows(),
                noise.nrows(),
            ));
        }
        linalg::ensure_finite_matrix(&noise, "observation noise")?;
        if !linalg::is_symmetric(&noise, SYMMETRY_TOLERANCE) {
            return Err(KalmanError::InvalidCovariance(
                "observation noise is not symmetric".into(),
            ));
        }
        if !linalg::is_positive_semidefinite(&noise, PSD_TOLERANCE) {
            return Err(KalmanError::InvalidCovariance(
                "observation noise is not positive-semidefinite".into(),
            ));
        }
        self.noise = Some(noise);
        Ok(self)
    }

    /// Horizontal composition: `[H₁ H₂ …]`, one part per bound sub-process.
    ///
    /// Row counts must agree. Noise is kept only when exactly one part
    /// carries it; two noisy parts are ambiguous and rejected.
    pub fn hstack(parts: &[ObservationModel]) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| KalmanError::composition("cannot stack zero observation models"))?;
        let rows = first.rows();
        let cols: usize = parts.iter().map(|p| p.cols()).sum();

        let mut matrix = DMatrix::zeros(rows, cols);
        let mut offset = 0;
        for part in parts {
            if part.rows() != rows {
                return Err(KalmanError::dimension("stacked observation rows", rows, part.rows()));
            }
            matrix.view_mut((0, offset), (rows, part.cols())).copy_from(&part.matrix);
            offset += part.cols();
        }

        let mut noisy = parts.iter().filter_map(|p| p.noise.as_ref());
        let noise = match (noisy.next(), noisy.next()) {
            (None, _) => None,
            (Some(n), None) => Some(n.clone()),
            (Some(_), Some(_)) => {
                return Err(KalmanError::composition(
                    "more than one stacked observation model carries noise",
                ))
            }
        };

        Ok(Self { matrix, noise })
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn noise(&self) -> Option<&DMatrix<f64>> {
        self.noise.as_ref()
    }

    /// Measurement dimension `k`.
    pub fn rows(&self) -> usize {
        self.matrix.nrows()
    }

    /// Bound state dimension `m`.
    pub fn cols(&self) -> usize {
        self.matrix.ncols()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shorthands_normalize_to_matrix() {
        assert_eq!(ObservationModel::scalar(2.0, 2).unwrap().matrix()[(1, 1)], 2.0);
        let row = ObservationModel::row(&[1.0, -1.0]).unwrap();
        assert_eq!((row.rows(), row.cols()), (1, 2));
        assert!(ObservationModel::row(&[]).is_err());
    }

    #[test]
    fn test_hstack() {
        let a = ObservationModel::row(&[1.0]).unwrap();
        let b = ObservationModel::row(&[-1.0, 0.5]).unwrap();
        let stacked = ObservationModel::hstack(&[a, b]).unwrap();
        assert_eq!(stacked.matrix().row(0).iter().copied().collect::<Vec<_>>(), vec![1.0, -1.0, 0.5]);
    }

    #[test]
    fn test_hstack_rejects_row_mismatch_and_double_noise() {
        let a = ObservationModel::row(&[1.0]).unwrap();
        let b = ObservationModel::identity(2).unwrap();
        assert!(ObservationModel::hstack(&[a.clone(), b]).is_err());

        let noisy = a.clone().with_noise(DMatrix::from_element(1, 1, 1.0)).unwrap();
        assert!(ObservationModel::hstack(&[noisy.clone(), noisy.clone()]).is_err());
        let one = ObservationModel::hstack(&[noisy, a]).unwrap();
        assert!(one.noise().is_some());
    }

    #[test]
    fn test_noise_shape_checked() {
        let a = ObservationModel::identity(2).unwrap();
        assert!(a.with_noise(DMatrix::identity(1, 1)).is_err());
    }

    #[test]
    fn test_noise_must_be_positive_semidefinite() {
        let negative = ObservationModel::identity(1)
            .unwrap()
            .with_noise(DMatrix::from_element(1, 1, -0.5));
        assert!(matches!(negative, Err(KalmanError::InvalidCovariance(_))));

        let indefinite = DMatrix::from_row_slice(2, 2, &[1.0, 3.0, 3.0, 1.0]);
        let err = ObservationModel::identity(2).unwrap().with_noise(indefinite);
        assert!(matches!(err, Err(KalmanError::InvalidCovariance(_))));

        let ok = ObservationModel::identity(2)
            .unwrap()
            .with_noise(DMatrix::identity(2, 2) * 0.25)
            .unwrap();
        assert_eq!(ok.noise(), Some(&(DMatrix::identity(2, 2) * 0.25)));
    }
}
