//! The "BELIEF" Engine - Kalman filter state ownership and time update
//!
//! A [`KalmanFilter`] is the single owner of the Gaussian belief over the
//! full, block-composed state. Observables are handles into it; every
//! mutation of the belief goes through `advance` (time update) or an
//! observable's `observe` (measurement update).

use crate::composite::{CompositeProcess, ProcessId};
use crate::distribution::NormalDistr;
use crate::error::{KalmanError, Result};
use crate::linalg;
use crate::observable::{Observable, ObsResult, PredictedObs};
use crate::observation::ObservationModel;
use crate::process::Process;
use crate::time::{TimePoint, TimeUnit};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

static NEXT_FILTER_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Decides whether an innovation is folded into the belief.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AcceptancePolicy {
    /// Every observation is accepted (subject to the posterior PSD check).
    AcceptAll,

    /// Reject when the squared Mahalanobis norm of the innovation,
    /// `kᵀ S⁻¹ k`, exceeds `threshold` (a χ² gate).
    MahalanobisGate { threshold: f64 },
}

impl AcceptancePolicy {
    /// χ² gate at the 95% level for `dof` measurement dimensions.
    pub fn chi2_gate_95(dof: usize) -> Self {
        Self::MahalanobisGate {
            threshold: chi2_95(dof),
        }
    }

    pub fn accepts(&self, mahalanobis_sq: f64) -> bool {
        match self {
            Self::AcceptAll => true,
            Self::MahalanobisGate { threshold } => mahalanobis_sq <= *threshold,
        }
    }
}

impl Default for AcceptancePolicy {
    fn default() -> Self {
        Self::AcceptAll
    }
}

/// 95% quantile of χ²(dof). Tabulated up to 6 dof, Wilson-Hilferty beyond.
pub fn chi2_95(dof: usize) -> f64 {
    const TABLE: [f64; 6] = [3.841, 5.991, 7.815, 9.488, 11.070, 12.592];
    match dof {
        0 => 0.0,
        1..=6 => TABLE[dof - 1],
        _ => {
            let k = dof as f64;
            let z = 1.644_853_626_951_472_2;
            let c = 2.0 / (9.0 * k);
            k * (1.0 - c + z * c.sqrt()).powi(3)
        }
    }
}

/// Configuration for a [`KalmanFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Unit in which process rates are quoted (default: one day)
    pub time_unit: TimeUnit,

    /// Outlier / consistency policy (default: accept all)
    pub acceptance: AcceptancePolicy,

    /// Reject updates whose posterior covariance is not PSD (default: true)
    pub require_positive_definite: bool,

    /// Joseph-form covariance update (default: true)
    pub joseph_form: bool,

    /// Relative tolerance for PSD checks (default: 1e-9)
    pub psd_tolerance: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            time_unit: TimeUnit::DAY,
            acceptance: AcceptancePolicy::AcceptAll,
            require_positive_definite: true,
            joseph_form: true,
            psd_tolerance: 1e-9,
        }
    }
}

impl FilterConfig {
    pub fn with_time_unit(mut self, time_unit: TimeUnit) -> Self {
        self.time_unit = time_unit;
        self
    }

    pub fn with_acceptance(mut self, acceptance: AcceptancePolicy) -> Self {
        self.acceptance = acceptance;
        self
    }

    pub fn with_joseph_form(mut self, joseph_form: bool) -> Self {
        self.joseph_form = joseph_form;
        self
    }
}

// ============================================================================
// STATE
// ============================================================================

/// The belief: current time and the distribution of the full state.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterState<T> {
    pub time: T,
    pub distr: NormalDistr,
}

/// Last prediction of one observable, valid for one `(time, revision)`.
#[derive(Debug, Clone)]
pub(crate) struct CachedPrediction<T> {
    pub revision: u64,
    pub prediction: PredictedObs<T>,
}

/// Filter-side record of an observable.
#[derive(Debug, Clone)]
pub(crate) struct ObservableSlot<T> {
    pub model: ObservationModel,
    pub processes: Vec<ProcessId>,
    /// Full-state indices of the bound processes, in binding order.
    pub columns: Vec<usize>,
    /// `H` re-expressed against the full state (zero outside `columns`).
    pub full_matrix: DMatrix<f64>,
    pub cache: Option<CachedPrediction<T>>,
}

// ============================================================================
// KALMAN FILTER
// ============================================================================

/// Linear-Gaussian filter over a composite of independent processes.
#[derive(Debug)]
pub struct KalmanFilter<T: TimePoint> {
    id: u64,
    pub(crate) state: FilterState<T>,
    processes: CompositeProcess,
    pub(crate) config: FilterConfig,
    pub(crate) revision: u64,
    pub(crate) observables: Vec<ObservableSlot<T>>,
}

impl<T: TimePoint> KalmanFilter<T> {
    /// Create a filter with the default configuration.
    ///
    /// # Errors
    /// * `InvalidComposition` if `processes` is empty
    /// * `DimensionMismatch` if the state dimension differs from the sum of
    ///   process dimensions
    pub fn new(time: T, distr: NormalDistr, processes: Vec<Arc<dyn Process>>) -> Result<Self> {
        Self::with_config(time, distr, processes, FilterConfig::default())
    }

    pub fn with_config(
        time: T,
        distr: NormalDistr,
        processes: Vec<Arc<dyn Process>>,
        config: FilterConfig,
    ) -> Result<Self> {
        Self::from_composite(time, distr, CompositeProcess::new(processes)?, config)
    }

    pub fn from_composite(
        time: T,
        distr: NormalDistr,
        processes: CompositeProcess,
        config: FilterConfig,
    ) -> Result<Self> {
        if distr.dim() != processes.dim() {
            return Err(KalmanError::dimension(
                "initial state vs. process dimensions",
                processes.dim(),
                distr.dim(),
            ));
        }
        if !linalg::is_positive_semidefinite(distr.cov(), config.psd_tolerance) {
            return Err(KalmanError::InvalidCovariance(
                "initial covariance is not positive-semidefinite".into(),
            ));
        }
        if !(config.time_unit.seconds > 0.0) {
            return Err(KalmanError::numerical("time unit must be positive"));
        }

        Ok(Self {
            id: NEXT_FILTER_ID.fetch_add(1, Ordering::Relaxed),
            state: FilterState { time, distr },
            processes,
            config,
            revision: 0,
            observables: Vec::new(),
        })
    }

    pub fn state(&self) -> &FilterState<T> {
        &self.state
    }

    pub fn time(&self) -> T {
        self.state.time
    }

    pub fn distr(&self) -> &NormalDistr {
        &self.state.distr
    }

    pub fn processes(&self) -> &CompositeProcess {
        &self.processes
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Number of measurement updates attempted so far.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn observable_count(&self) -> usize {
        self.observables.len()
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Time update: propagate the belief to `time`.
    ///
    /// `mean' = A·mean + drift`, `cov' = A·cov·Aᵀ + Q`. A no-op when `time`
    /// equals the current time.
    ///
    /// # Errors
    /// `NonMonotonicTime` if `time` is earlier than the filter time.
    pub fn advance(&mut self, time: T) -> Result<()> {
        if time < self.state.time {
            return Err(KalmanError::non_monotonic(self.state.time, time));
        }
        if time == self.state.time {
            return Ok(());
        }
        let elapsed = self.config.time_unit.elapsed(&self.state.time, &time);
        if elapsed == 0.0 {
            self.state.time = time;
            return Ok(());
        }

        let evolution = self.processes.evolve(elapsed)?;
        let distr = evolution.apply(&self.state.distr)?;

        trace!(elapsed, from = ?self.state.time, to = ?time, "time update");
        self.state = FilterState { time, distr };
        Ok(())
    }

    /// Bind `model` to the listed processes.
    ///
    /// Model columns follow the order of `processes`.
    ///
    /// # Errors
    /// `InvalidComposition` if the list is empty, repeats or names an unknown
    /// process, or if the model's column count differs from the bound
    /// processes' combined dimension.
    pub fn create_observable(
        &mut self,
        model: ObservationModel,
        processes: &[ProcessId],
    ) -> Result<Observable> {
        if processes.is_empty() {
            return Err(KalmanError::composition("observable must bind at least one process"));
        }
        let mut seen = HashSet::new();
        let mut columns = Vec::new();
        for id in processes {
            if !seen.insert(*id) {
                return Err(KalmanError::composition(format!("{} bound twice", id)));
            }
            columns.extend(self.processes.range(*id)?);
        }
        if model.cols() != columns.len() {
            return Err(KalmanError::composition(format!(
                "observation model has {} columns but bound processes span {} dimensions",
                model.cols(),
                columns.len()
            )));
        }

        let mut full_matrix = DMatrix::zeros(model.rows(), self.processes.dim());
        for (j, &col) in columns.iter().enumerate() {
            full_matrix.set_column(col, &model.matrix().column(j));
        }

        self.observables.push(ObservableSlot {
            model,
            processes: processes.to_vec(),
            columns,
            full_matrix,
            cache: None,
        });
        Ok(Observable::new(self.id, self.observables.len() - 1))
    }

    pub(crate) fn slot(&self, observable: &Observable) -> Result<&ObservableSlot<T>> {
        if observable.filter_id() != self.id {
            return Err(KalmanError::UnknownObservable);
        }
        self.observables
            .get(observable.index())
            .ok_or(KalmanError::UnknownObservable)
    }

    /// Processes bound to `observable`, in binding order.
    pub fn bound_processes(&self, observable: &Observable) -> Result<&[ProcessId]> {
        Ok(&self.slot(observable)?.processes)
    }

    /// Observation model of `observable`.
    pub fn observation_model(&self, observable: &Observable) -> Result<&ObservationModel> {
        Ok(&self.slot(observable)?.model)
    }

    /// Shorthand for [`Observable::predict`].
    pub fn predict(&mut self, observable: &Observable, time: T) -> Result<PredictedObs<T>> {
        observable.predict(self, time)
    }

    /// Shorthand for [`Observable::observe`].
    pub fn observe(
        &mut self,
        observable: &Observable,
        time: T,
        obsdistr: NormalDistr,
    ) -> Result<ObsResult<T>> {
        observable.observe(self, time, obsdistr)
    }
}
