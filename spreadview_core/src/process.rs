//! Process models: how a state block's distribution evolves over elapsed time.
//!
//! A process never owns state. Given an elapsed interval it reports the
//! linear-Gaussian transition `x' = A x + drift + noise`, `noise ~ N(0, Q)`.

use crate::distribution::NormalDistr;
use crate::error::{KalmanError, Result};
use crate::linalg;
use nalgebra::{DMatrix, DVector, Dyn, LU};
use std::fmt::Debug;

/// Linear-Gaussian transition over one elapsed interval.
#[derive(Debug, Clone, PartialEq)]
pub struct Evolution {
    /// State transition `A`; `None` means identity.
    pub transition: Option<DMatrix<f64>>,

    /// Deterministic drift added after the transition.
    pub drift: DVector<f64>,

    /// Process noise covariance `Q` accumulated over the interval.
    pub noise_cov: DMatrix<f64>,
}

impl Evolution {
    /// Identity evolution: no drift, no noise.
    pub fn identity(dim: usize) -> Self {
        Self {
            transition: None,
            drift: DVector::zeros(dim),
            noise_cov: DMatrix::zeros(dim, dim),
        }
    }

    pub fn dim(&self) -> usize {
        self.drift.len()
    }

    /// Pushes a distribution through the transition:
    /// `A·m + drift`, `A·P·Aᵀ + Q`.
    pub fn apply(&self, distr: &NormalDistr) -> Result<NormalDistr> {
        if distr.dim() != self.dim() {
            return Err(KalmanError::dimension("evolved distribution", self.dim(), distr.dim()));
        }
        let (mean, cov) = match &self.transition {
            Some(a) => (
                a * distr.mean() + &self.drift,
                a * distr.cov() * a.transpose() + &self.noise_cov,
            ),
            None => (distr.mean() + &self.drift, distr.cov() + &self.noise_cov),
        };
        let cov = linalg::symmetrize(&cov);
        linalg::ensure_finite_vector(&mean, "evolved mean")?;
        linalg::ensure_finite_matrix(&cov, "evolved covariance")?;
        Ok(NormalDistr::from_parts(mean, cov))
    }
}

/// A stochastic process model over a `dim()`-dimensional state block.
///
/// Implementations must return [`Evolution::identity`] for zero elapsed time
/// and a positive-semidefinite `noise_cov` for any non-negative one.
pub trait Process: Debug + Send + Sync {
    /// Dimension of the state block.
    fn dim(&self) -> usize;

    /// Dimension of the driving noise.
    fn noise_dim(&self) -> usize {
        self.dim()
    }

    /// Transition over `elapsed` process time units.
    fn evolve(&self, elapsed: f64) -> Result<Evolution>;

    /// Samples the value after `elapsed`, starting from `value0`, using a
    /// standard-normal `variate` of length `noise_dim()`.
    fn propagate(
        &self,
        elapsed: f64,
        value0: &DVector<f64>,
        variate: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        check_elapsed(elapsed)?;
        check_len("initial value", self.dim(), value0.len())?;
        if self.noise_dim() != self.dim() {
            return Err(KalmanError::composition(
                "default propagate requires noise_dim == dim",
            ));
        }
        check_len("variate", self.noise_dim(), variate.len())?;
        if elapsed == 0.0 {
            return Ok(value0.clone());
        }
        let evolution = self.evolve(elapsed)?;
        let mean = match &evolution.transition {
            Some(a) => a * value0 + &evolution.drift,
            None => value0 + &evolution.drift,
        };
        Ok(mean + linalg::psd_sqrt(&evolution.noise_cov)? * variate)
    }

    /// Distribution after `elapsed`, starting from `distr0`.
    fn propagate_distr(&self, elapsed: f64, distr0: &NormalDistr) -> Result<NormalDistr> {
        if elapsed == 0.0 {
            return Ok(distr0.clone());
        }
        self.evolve(elapsed)?.apply(distr0)
    }
}

pub(crate) fn check_elapsed(elapsed: f64) -> Result<()> {
    if elapsed.is_nan() {
        return Err(KalmanError::numerical("elapsed time is NaN"));
    }
    if elapsed < 0.0 {
        return Err(KalmanError::non_monotonic(0.0, elapsed));
    }
    if elapsed.is_infinite() {
        return Err(KalmanError::numerical("elapsed time is infinite"));
    }
    Ok(())
}

fn check_len(context: &str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(KalmanError::dimension(context, expected, actual));
    }
    Ok(())
}

// ============================================================================
// WIENER PROCESS
// ============================================================================

/// Brownian motion with drift: `dX = mean·dt + vol·dW`.
///
/// Drift and noise covariance both scale linearly with elapsed time and the
/// transition is always the identity.
#[derive(Debug, Clone, PartialEq)]
pub struct WienerProcess {
    mean: DVector<f64>,
    vol: DMatrix<f64>,
    cov: DMatrix<f64>,
}

impl WienerProcess {
    /// Create from a drift rate and a `dim × noise_dim` volatility matrix.
    pub fn new(mean: DVector<f64>, vol: DMatrix<f64>) -> Result<Self> {
        check_len("wiener volatility rows", mean.len(), vol.nrows())?;
        if mean.is_empty() {
            return Err(KalmanError::dimension("wiener dimension", 1, 0));
        }
        linalg::ensure_finite_vector(&mean, "wiener mean")?;
        linalg::ensure_finite_matrix(&vol, "wiener volatility")?;
        let cov = &vol * vol.transpose();
        Ok(Self { mean, vol, cov })
    }

    /// Create from a drift rate and an instantaneous covariance rate.
    pub fn from_cov(mean: DVector<f64>, cov: DMatrix<f64>) -> Result<Self> {
        check_len("wiener covariance rows", mean.len(), cov.nrows())?;
        let distr = NormalDistr::new(mean, cov)?;
        let vol = NormalDistr::vol_from_cov(distr.cov())?;
        Ok(Self {
            mean: distr.mean().clone(),
            vol,
            cov: distr.cov().clone(),
        })
    }

    /// Scalar process with drift `mean_rate` and variance `cov_rate` per unit time.
    pub fn univariate(mean_rate: f64, cov_rate: f64) -> Result<Self> {
        Self::from_cov(
            DVector::from_element(1, mean_rate),
            DMatrix::from_element(1, 1, cov_rate),
        )
    }

    /// Two correlated components.
    pub fn create_2d(mean1: f64, mean2: f64, sd1: f64, sd2: f64, cor: f64) -> Result<Self> {
        Self::new(
            DVector::from_vec(vec![mean1, mean2]),
            NormalDistr::vol_2d(sd1, sd2, cor)?,
        )
    }

    /// Driftless process with identity volatility.
    pub fn standard(dim: usize) -> Result<Self> {
        Self::new(DVector::zeros(dim), DMatrix::identity(dim, dim))
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn vol(&self) -> &DMatrix<f64> {
        &self.vol
    }

    pub fn cov(&self) -> &DMatrix<f64> {
        &self.cov
    }
}

impl Process for WienerProcess {
    fn dim(&self) -> usize {
        self.mean.len()
    }

    fn noise_dim(&self) -> usize {
        self.vol.ncols()
    }

    fn evolve(&self, elapsed: f64) -> Result<Evolution> {
        check_elapsed(elapsed)?;
        if elapsed == 0.0 {
            return Ok(Evolution::identity(self.dim()));
        }
        Ok(Evolution {
            transition: None,
            drift: &self.mean * elapsed,
            noise_cov: &self.cov * elapsed,
        })
    }

    fn propagate(
        &self,
        elapsed: f64,
        value0: &DVector<f64>,
        variate: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        check_elapsed(elapsed)?;
        check_len("initial value", self.dim(), value0.len())?;
        check_len("variate", self.noise_dim(), variate.len())?;
        if elapsed == 0.0 {
            return Ok(value0.clone());
        }
        Ok(value0 + &self.mean * elapsed + &self.vol * (variate * elapsed.sqrt()))
    }
}

// ============================================================================
// ORNSTEIN-UHLENBECK PROCESS
// ============================================================================

/// Mean-reverting process: `dX = −θ(X − μ)dt + vol·dW`.
///
/// Over an interval Δ the mean-reversion factor is `F = exp(−θΔ)`, giving
/// transition `F`, drift `(I − F)μ` and noise covariance
/// `unvec((θ⊕θ)⁻¹ (I − exp(−(θ⊕θ)Δ)) vec(vol·volᵀ))`.
#[derive(Debug, Clone)]
pub struct OrnsteinUhlenbeckProcess {
    transition: DMatrix<f64>,
    mean: DVector<f64>,
    vol: DMatrix<f64>,
    cov_vec: DVector<f64>,
    transition_x2: DMatrix<f64>,
    transition_x2_lu: LU<f64, Dyn, Dyn>,
}

impl OrnsteinUhlenbeckProcess {
    /// # Errors
    /// * `DimensionMismatch` if `transition` is not square or shapes disagree
    /// * `NumericalInstability` if `θ⊕θ` is singular (no stationary noise law)
    pub fn new(transition: DMatrix<f64>, mean: DVector<f64>, vol: DMatrix<f64>) -> Result<Self> {
        if !transition.is_square() {
            return Err(KalmanError::dimension(
                "ou transition columns",
                transition.nrows(),
                transition.ncols(),
            ));
        }
        let dim = transition.nrows();
        if dim == 0 {
            return Err(KalmanError::dimension("ou dimension", 1, 0));
        }
        check_len("ou mean", dim, mean.len())?;
        check_len("ou volatility rows", dim, vol.nrows())?;
        linalg::ensure_finite_matrix(&transition, "ou transition")?;
        linalg::ensure_finite_vector(&mean, "ou mean")?;
        linalg::ensure_finite_matrix(&vol, "ou volatility")?;

        let transition_x2 = linalg::kronecker_sum(&transition, &transition);
        let transition_x2_lu = transition_x2.clone().lu();
        if !transition_x2_lu.is_invertible() {
            return Err(KalmanError::numerical(
                "ou transition Kronecker sum is singular",
            ));
        }
        let cov = &vol * vol.transpose();

        Ok(Self {
            transition,
            mean,
            vol,
            cov_vec: linalg::vec(&cov),
            transition_x2,
            transition_x2_lu,
        })
    }

    /// Scalar process with reversion speed `theta`, level `mean` and volatility `sd`.
    pub fn univariate(theta: f64, mean: f64, sd: f64) -> Result<Self> {
        Self::new(
            DMatrix::from_element(1, 1, theta),
            DVector::from_element(1, mean),
            DMatrix::from_element(1, 1, sd),
        )
    }

    pub fn transition(&self) -> &DMatrix<f64> {
        &self.transition
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn vol(&self) -> &DMatrix<f64> {
        &self.vol
    }

    /// `exp(−θΔ)`
    pub fn mean_reversion_factor(&self, elapsed: f64) -> DMatrix<f64> {
        (&self.transition * -elapsed).exp()
    }

    /// Noise covariance accumulated over `elapsed`.
    pub fn noise_covariance(&self, elapsed: f64) -> Result<DMatrix<f64>> {
        let d2 = self.transition_x2.nrows();
        let decay = (&self.transition_x2 * -elapsed).exp();
        let rhs = (DMatrix::identity(d2, d2) - decay) * &self.cov_vec;
        let solved = self
            .transition_x2_lu
            .solve(&rhs)
            .ok_or_else(|| KalmanError::numerical("ou noise covariance solve failed"))?;
        let noise = linalg::symmetrize(&linalg::unvec(&solved, self.dim()));
        linalg::ensure_finite_matrix(&noise, "ou noise covariance")?;
        Ok(noise)
    }
}

impl Process for OrnsteinUhlenbeckProcess {
    fn dim(&self) -> usize {
        self.mean.len()
    }

    fn evolve(&self, elapsed: f64) -> Result<Evolution> {
        check_elapsed(elapsed)?;
        if elapsed == 0.0 {
            return Ok(Evolution::identity(self.dim()));
        }
        let factor = self.mean_reversion_factor(elapsed);
        linalg::ensure_finite_matrix(&factor, "ou mean-reversion factor")?;
        let n = self.dim();
        let drift = (DMatrix::identity(n, n) - &factor) * &self.mean;
        Ok(Evolution {
            transition: Some(factor),
            drift,
            noise_cov: self.noise_covariance(elapsed)?,
        })
    }
}
