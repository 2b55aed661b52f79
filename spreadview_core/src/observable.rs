//! Observables: linear views of a filter's belief that can be predicted and
//! updated against measurements.
//!
//! An [`Observable`] is a small `Copy` handle. It does not own or borrow the
//! filter; every operation takes the filter explicitly, so several handles
//! can share one belief without reference cycles.

use crate::distribution::NormalDistr;
use crate::error::{KalmanError, Result};
use crate::filter::{CachedPrediction, KalmanFilter};
use crate::linalg;
use crate::time::TimePoint;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Predicted observation at a given filter time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictedObs<T> {
    /// Filter time the prediction refers to
    pub time: T,

    /// `N(H·m, H·P·Hᵀ + R_model)` in measurement space
    pub distr: NormalDistr,

    /// `H·P`: `k × n` covariance between measurement and full state
    pub crosscov: DMatrix<f64>,
}

/// Outcome of a measurement update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsResult<T> {
    pub time: T,

    /// The incoming measurement
    pub obsdistr: NormalDistr,

    /// Whether the measurement was folded into the belief
    pub accepted: bool,

    /// Prediction computed just before the update
    pub predictedobs: PredictedObs<T>,

    /// Innovation `y − ŷ` with covariance `S = cov(ŷ) + cov(y)`
    pub innovdistr: NormalDistr,

    /// Log-density of the innovation mean under `N(0, S)`
    pub loglikelihood: f64,
}

impl<T> ObsResult<T> {
    /// `kᵀ S⁻¹ k` of the innovation.
    pub fn mahalanobis_sq(&self) -> Result<f64> {
        let chol = linalg::factorize(self.innovdistr.cov())?;
        Ok(linalg::mahalanobis_sq(self.innovdistr.mean(), &chol))
    }
}

/// Handle to an observation model bound to some processes of one filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Observable {
    filter_id: u64,
    index: usize,
}

impl Observable {
    pub(crate) fn new(filter_id: u64, index: usize) -> Self {
        Self { filter_id, index }
    }

    pub(crate) fn filter_id(&self) -> u64 {
        self.filter_id
    }

    /// Position of this observable among the filter's observables.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Measurement dimension.
    pub fn dim<T: TimePoint>(&self, filter: &KalmanFilter<T>) -> Result<usize> {
        Ok(filter.slot(self)?.model.rows())
    }

    /// Cached prediction at `time`, if still valid. Never mutates the filter.
    pub fn cached<T: TimePoint>(
        &self,
        filter: &KalmanFilter<T>,
        time: T,
    ) -> Result<Option<PredictedObs<T>>> {
        let slot = filter.slot(self)?;
        if filter.state.time != time {
            return Ok(None);
        }
        Ok(slot
            .cache
            .as_ref()
            .filter(|c| c.revision == filter.revision && c.prediction.time == time)
            .map(|c| c.prediction.clone()))
    }

    /// Advance the filter to `time` and project the belief into measurement
    /// space.
    ///
    /// A repeated call at the same time with no intervening `observe` on any
    /// observable of the filter returns the cached prediction.
    pub fn predict<T: TimePoint>(
        &self,
        filter: &mut KalmanFilter<T>,
        time: T,
    ) -> Result<PredictedObs<T>> {
        if let Some(hit) = self.cached(filter, time)? {
            return Ok(hit);
        }
        filter.advance(time)?;

        let slot = filter.slot(self)?;
        let mean = filter.state.distr.mean();
        let cov = filter.state.distr.cov();
        let h = slot.model.matrix();

        let crosscov = h * cov.select_rows(&slot.columns);
        let predicted_mean = h * mean.select_rows(&slot.columns);
        let mut predicted_cov = crosscov.select_columns(&slot.columns) * h.transpose();
        if let Some(noise) = slot.model.noise() {
            predicted_cov += noise;
        }
        let predicted_cov = linalg::symmetrize(&predicted_cov);
        linalg::ensure_finite_vector(&predicted_mean, "predicted observation mean")?;
        linalg::ensure_finite_matrix(&predicted_cov, "predicted observation covariance")?;

        let prediction = PredictedObs {
            time,
            distr: NormalDistr::from_parts(predicted_mean, predicted_cov),
            crosscov,
        };

        let revision = filter.revision;
        filter.observables[self.index].cache = Some(CachedPrediction {
            revision,
            prediction: prediction.clone(),
        });
        Ok(prediction)
    }

    /// Advance, predict and fold `obsdistr` into the filter's belief.
    ///
    /// On rejection the belief stays at `time` unmodified and
    /// `accepted = false` is returned with the would-have-been innovation.
    /// Every call invalidates the cached predictions of all observables of
    /// the filter.
    ///
    /// # Errors
    /// * `DimensionMismatch` if `obsdistr` is not in this measurement space
    /// * `NonMonotonicTime` if `time` is earlier than the filter time
    /// * `SingularInnovation` if the innovation covariance is not invertible
    /// * `NumericalInstability` if the update produces non-finite values
    pub fn observe<T: TimePoint>(
        &self,
        filter: &mut KalmanFilter<T>,
        time: T,
        obsdistr: NormalDistr,
    ) -> Result<ObsResult<T>> {
        let k = self.dim(filter)?;
        if obsdistr.dim() != k {
            return Err(KalmanError::dimension("observation", k, obsdistr.dim()));
        }

        let predictedobs = self.predict(filter, time)?;

        let innov_mean = obsdistr.mean() - predictedobs.distr.mean();
        let innov_cov = linalg::symmetrize(&(predictedobs.distr.cov() + obsdistr.cov()));
        let chol = linalg::factorize(&innov_cov)?;
        let loglikelihood = linalg::log_gaussian_density_factored(&innov_mean, &chol);
        let mahalanobis_sq = linalg::mahalanobis_sq(&innov_mean, &chol);

        // The belief is about to be judged against; every cache is stale from here.
        filter.revision += 1;

        let config = *filter.config();
        let mut accepted = config.acceptance.accepts(mahalanobis_sq);

        if accepted {
            let slot = filter.slot(self)?;
            let prior = &filter.state.distr;

            // K = crosscovᵀ S⁻¹, via a solve against the factorization.
            let gain = linalg::solve(&chol, &predictedobs.crosscov).transpose();
            let posterior_mean: DVector<f64> = prior.mean() + &gain * &innov_mean;

            let posterior_cov = if config.joseph_form {
                let n = prior.dim();
                let mut measurement_noise = obsdistr.cov().clone();
                if let Some(noise) = slot.model.noise() {
                    measurement_noise += noise;
                }
                let ikh = DMatrix::identity(n, n) - &gain * &slot.full_matrix;
                &ikh * prior.cov() * ikh.transpose()
                    + &gain * measurement_noise * gain.transpose()
            } else {
                prior.cov() - &gain * &predictedobs.crosscov
            };
            let posterior_cov = linalg::symmetrize(&posterior_cov);

            linalg::ensure_finite_vector(&posterior_mean, "posterior mean")?;
            linalg::ensure_finite_matrix(&posterior_cov, "posterior covariance")?;

            if config.require_positive_definite
                && !linalg::is_positive_semidefinite(&posterior_cov, config.psd_tolerance)
            {
                warn!(observable = self.index, "posterior covariance not PSD, update rejected");
                accepted = false;
            } else {
                filter.state.distr = NormalDistr::from_parts(posterior_mean, posterior_cov);
            }
        } else {
            warn!(
                observable = self.index,
                mahalanobis_sq,
                "observation rejected by acceptance policy"
            );
        }

        if accepted {
            debug!(observable = self.index, loglikelihood, "observation accepted");
        }

        Ok(ObsResult {
            time,
            obsdistr,
            accepted,
            predictedobs,
            innovdistr: NormalDistr::from_parts(innov_mean, innov_cov),
            loglikelihood,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composite::ProcessId;
    use crate::filter::{AcceptancePolicy, FilterConfig};
    use crate::observation::ObservationModel;
    use crate::process::{Process, WienerProcess};
    use approx::assert_relative_eq;
    use chrono::{NaiveDate, NaiveDateTime};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2017, 5, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    fn univariate(config: FilterConfig) -> (KalmanFilter<NaiveDateTime>, Observable) {
        let process: Arc<dyn Process> = Arc::new(WienerProcess::univariate(3.0, 25.0).unwrap());
        let mut filter = KalmanFilter::with_config(
            t0(),
            NormalDistr::univariate(100.0, 250.0).unwrap(),
            vec![process],
            config,
        )
        .unwrap();
        let obs = filter
            .create_observable(ObservationModel::identity(1).unwrap(), &[ProcessId(0)])
            .unwrap();
        (filter, obs)
    }

    fn two_process_filter() -> (KalmanFilter<f64>, Observable, Observable) {
        let a: Arc<dyn Process> = Arc::new(WienerProcess::univariate(0.5, 2.0).unwrap());
        let b: Arc<dyn Process> = Arc::new(WienerProcess::univariate(-0.5, 3.0).unwrap());
        let initial = NormalDistr::new(
            DVector::from_vec(vec![10.0, 20.0]),
            DMatrix::from_diagonal(&DVector::from_vec(vec![4.0, 9.0])),
        )
        .unwrap();
        let mut filter = KalmanFilter::with_config(
            0.0,
            initial,
            vec![a, b],
            FilterConfig::default().with_time_unit(crate::time::TimeUnit::SECOND),
        )
        .unwrap();
        let obs_a = filter
            .create_observable(ObservationModel::identity(1).unwrap(), &[ProcessId(0)])
            .unwrap();
        let obs_b = filter
            .create_observable(ObservationModel::identity(1).unwrap(), &[ProcessId(1)])
            .unwrap();
        (filter, obs_a, obs_b)
    }

    #[test]
    fn test_worked_example_predict() {
        let (mut filter, obs) = univariate(FilterConfig::default());
        let t1 = t0() + chrono::Duration::hours(1);
        let predicted = obs.predict(&mut filter, t1).unwrap();
        assert_relative_eq!(predicted.distr.mean()[0], 100.125, epsilon = 1e-10);
        assert_relative_eq!(predicted.distr.cov()[(0, 0)], 251.041_666_666_666_67, epsilon = 1e-9);
        assert_eq!(predicted.time, t1);
    }

    #[test]
    fn test_worked_example_observe() {
        for joseph_form in [true, false] {
            let (mut filter, obs) =
                univariate(FilterConfig::default().with_joseph_form(joseph_form));
            let t1 = t0() + chrono::Duration::hours(1);
            let result = obs
                .observe(&mut filter, t1, NormalDistr::univariate(100.35, 100.0).unwrap())
                .unwrap();
            assert!(result.accepted);
            assert_relative_eq!(filter.distr().mean()[0], 100.2859, epsilon = 1e-4);
            assert_relative_eq!(filter.distr().cov()[(0, 0)], 71.5134, epsilon = 1e-4);

            assert_relative_eq!(result.innovdistr.mean()[0], 0.225, epsilon = 1e-10);
            let s: f64 = 251.0 + 1.0 / 24.0 + 100.0;
            let expected_ll = -0.5 * (0.225 * 0.225 / s + s.ln() + (2.0 * std::f64::consts::PI).ln());
            assert_relative_eq!(result.loglikelihood, expected_ll, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_predict_twice_uses_cache() {
        let (mut filter, obs) = univariate(FilterConfig::default());
        let t1 = t0() + chrono::Duration::hours(1);
        let first = obs.predict(&mut filter, t1).unwrap();
        let state = filter.state().clone();
        let revision = filter.revision();

        assert_eq!(obs.cached(&filter, t1).unwrap(), Some(first.clone()));
        let second = obs.predict(&mut filter, t1).unwrap();
        assert_eq!(first, second);
        assert_eq!(filter.state(), &state);
        assert_eq!(filter.revision(), revision);
    }

    #[test]
    fn test_observe_invalidates_every_cache() {
        let (mut filter, obs_a, obs_b) = two_process_filter();
        obs_a.predict(&mut filter, 1.0).unwrap();
        obs_b.predict(&mut filter, 1.0).unwrap();
        assert!(obs_b.cached(&filter, 1.0).unwrap().is_some());

        obs_a
            .observe(&mut filter, 1.0, NormalDistr::univariate(11.0, 1.0).unwrap())
            .unwrap();
        assert!(obs_a.cached(&filter, 1.0).unwrap().is_none());
        assert!(obs_b.cached(&filter, 1.0).unwrap().is_none());

        let after = obs_a.predict(&mut filter, 1.0).unwrap();
        assert_eq!(after.distr.mean()[0], filter.distr().mean()[0]);
    }

    #[test]
    fn test_independence_preserved_after_single_process_update() {
        let (mut filter, obs_a, obs_b) = two_process_filter();
        let result = obs_a
            .observe(&mut filter, 2.0, NormalDistr::univariate(12.0, 1.0).unwrap())
            .unwrap();
        assert!(result.accepted);
        assert_eq!(result.predictedobs.crosscov[(0, 1)], 0.0);

        let cov = filter.distr().cov();
        assert_eq!(cov[(0, 1)], 0.0);
        assert_eq!(cov[(1, 0)], 0.0);
        // Unobserved process untouched: 9 + 3*2
        assert_relative_eq!(cov[(1, 1)], 15.0, epsilon = 1e-12);
        assert_relative_eq!(filter.distr().mean()[1], 19.0, epsilon = 1e-12);

        let next = obs_b.predict(&mut filter, 3.0).unwrap();
        assert_eq!(next.crosscov[(0, 0)], 0.0);
        assert_eq!(filter.distr().cov()[(0, 1)], 0.0);
    }

    #[test]
    fn test_joint_observable_correlates_processes() {
        let (mut filter, obs_a, _) = two_process_filter();
        let spread = filter
            .create_observable(
                ObservationModel::row(&[1.0, -1.0]).unwrap(),
                &[ProcessId(0), ProcessId(1)],
            )
            .unwrap();
        spread
            .observe(&mut filter, 1.0, NormalDistr::univariate(-9.0, 0.5).unwrap())
            .unwrap();
        assert!(filter.distr().cov()[(0, 1)] > 0.0);

        let predicted = obs_a.predict(&mut filter, 1.0).unwrap();
        assert!(predicted.crosscov[(0, 1)] != 0.0);
    }

    #[test]
    fn test_gate_rejection_leaves_belief_at_advanced_time() {
        let config = FilterConfig::default().with_acceptance(AcceptancePolicy::chi2_gate_95(1));
        let (mut filter, obs) = univariate(config);
        let t1 = t0() + chrono::Duration::hours(1);
        let result = obs
            .observe(&mut filter, t1, NormalDistr::univariate(500.0, 1.0).unwrap())
            .unwrap();
        assert!(!result.accepted);
        assert_eq!(filter.time(), t1);
        assert_relative_eq!(filter.distr().mean()[0], 100.125, epsilon = 1e-10);
        assert!(result.loglikelihood.is_finite());
        assert!(result.mahalanobis_sq().unwrap() > 3.841);
    }

    #[test]
    fn test_non_psd_posterior_is_rejected() {
        let (mut filter, obs) = univariate(FilterConfig::default());
        // Demand a minimum eigenvalue no posterior here can reach
        filter.config.psd_tolerance = -2.0;
        let revision = filter.revision();
        let t1 = t0() + chrono::Duration::hours(1);

        let result = obs
            .observe(&mut filter, t1, NormalDistr::univariate(100.35, 100.0).unwrap())
            .unwrap();
        assert!(!result.accepted);
        assert_eq!(filter.time(), t1);
        assert_relative_eq!(filter.distr().mean()[0], 100.125, epsilon = 1e-10);
        assert_relative_eq!(filter.distr().cov()[(0, 0)], 251.041_666_666_666_67, epsilon = 1e-9);
        assert_eq!(filter.revision(), revision + 1);
    }

    #[test]
    fn test_observe_at_infinite_time_is_numerical_error() {
        let (mut filter, obs_a, _) = two_process_filter();
        let before = filter.state().clone();
        let err = obs_a
            .observe(&mut filter, f64::INFINITY, NormalDistr::univariate(10.0, 1.0).unwrap())
            .unwrap_err();
        assert!(matches!(err, KalmanError::NumericalInstability(_)));
        assert_eq!(filter.state(), &before);
        assert_eq!(filter.revision(), 0);
    }

    #[test]
    fn test_singular_innovation() {
        let process: Arc<dyn Process> = Arc::new(WienerProcess::univariate(0.0, 0.0).unwrap());
        let mut filter =
            KalmanFilter::new(0.0, NormalDistr::univariate(1.0, 0.0).unwrap(), vec![process])
                .unwrap();
        let obs = filter
            .create_observable(ObservationModel::identity(1).unwrap(), &[ProcessId(0)])
            .unwrap();
        let err = obs
            .observe(&mut filter, 1.0, NormalDistr::dirac(DVector::from_element(1, 2.0)).unwrap())
            .unwrap_err();
        assert_eq!(err, KalmanError::SingularInnovation);
    }

    #[test]
    fn test_rank_deficient_observation_is_singular() {
        let process: Arc<dyn Process> = Arc::new(WienerProcess::univariate(0.0, 1.0).unwrap());
        let mut filter =
            KalmanFilter::new(0.0, NormalDistr::univariate(0.0, 1.0).unwrap(), vec![process])
                .unwrap();
        let doubled = ObservationModel::new(DMatrix::from_element(2, 1, 1.0)).unwrap();
        let obs = filter.create_observable(doubled, &[ProcessId(0)]).unwrap();
        let err = obs
            .observe(&mut filter, 0.0, NormalDistr::dirac(DVector::zeros(2)).unwrap())
            .unwrap_err();
        assert_eq!(err, KalmanError::SingularInnovation);
    }

    #[test]
    fn test_observation_dimension_checked() {
        let (mut filter, obs) = univariate(FilterConfig::default());
        let err = obs.observe(&mut filter, t0(), NormalDistr::standard(2)).unwrap_err();
        assert!(matches!(err, KalmanError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_foreign_observable_rejected() {
        let (mut filter_a, _) = univariate(FilterConfig::default());
        let (_, obs_b) = univariate(FilterConfig::default());
        assert_eq!(
            obs_b.predict(&mut filter_a, t0()).unwrap_err(),
            KalmanError::UnknownObservable
        );
    }

    #[test]
    fn test_model_noise_adds_to_prediction() {
        let process: Arc<dyn Process> = Arc::new(WienerProcess::univariate(0.0, 1.0).unwrap());
        let mut filter =
            KalmanFilter::new(0.0, NormalDistr::univariate(0.0, 2.0).unwrap(), vec![process])
                .unwrap();
        let model = ObservationModel::identity(1)
            .unwrap()
            .with_noise(DMatrix::from_element(1, 1, 0.5))
            .unwrap();
        let obs = filter.create_observable(model, &[ProcessId(0)]).unwrap();
        let predicted = obs.predict(&mut filter, 0.0).unwrap();
        assert_relative_eq!(predicted.distr.cov()[(0, 0)], 2.5);
        assert_relative_eq!(predicted.crosscov[(0, 0)], 2.0);
    }

    proptest! {
        #[test]
        fn prop_observe_keeps_covariance_symmetric_psd(
            observations in proptest::collection::vec((0.0f64..2.0, -5.0f64..5.0, 0.01f64..4.0, any::<bool>()), 1..25),
        ) {
            let (mut filter, obs_a, _) = two_process_filter();
            let spread = filter
                .create_observable(ObservationModel::row(&[1.0, -1.0]).unwrap(), &[ProcessId(0), ProcessId(1)])
                .unwrap();

            let mut t = 0.0;
            for (dt, value, var, joint) in observations {
                t += dt;
                let target = if joint { spread } else { obs_a };
                let result = target
                    .observe(&mut filter, t, NormalDistr::univariate(value, var).unwrap())
                    .unwrap();
                prop_assert!(result.accepted);
                let cov = filter.distr().cov();
                prop_assert!(linalg::is_symmetric(cov, 1e-12));
                prop_assert!(linalg::is_positive_semidefinite(cov, 1e-9));
            }
        }
    }
}
