//! Scenario runner - drives the filter against a seeded ground truth.

use crate::error::SimError;
use crate::exporter::{SimExport, SimFrame};
use crate::oracle::Oracle;
use crate::scenarios::ScenarioId;

use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::Exp;
use spreadview_core::{
    AcceptancePolicy, FilterConfig, KalmanFilter, NormalDistr, ObservationModel,
    OrnsteinUhlenbeckProcess, Process, ProcessId, WienerProcess,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Measurement steps executed
    pub steps: usize,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Measurements folded into the belief
    pub accepted: u64,

    /// Measurements refused by the acceptance gate
    pub rejected: u64,

    /// RMS of `truth − posterior mean` over all steps and components
    pub rms_error: f64,

    /// Mean innovation log-likelihood
    pub mean_loglikelihood: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

impl ScenarioResult {
    fn failed(scenario: ScenarioId, seed: u64, reason: String) -> Self {
        Self {
            scenario,
            seed,
            passed: false,
            steps: 0,
            final_time_secs: 0.0,
            accepted: 0,
            rejected: 0,
            rms_error: f64::NAN,
            mean_loglikelihood: f64::NAN,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
        }
    }
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default)]
pub struct ScenarioMetrics {
    /// Corrupted measurements fed to the filter
    pub outliers_injected: u64,

    /// Corrupted measurements the gate refused
    pub outliers_rejected: u64,

    /// Clean measurements the gate refused
    pub clean_rejected: u64,

    /// Largest squared Mahalanobis distance of an accepted innovation
    pub max_accepted_mahalanobis_sq: f64,

    /// Predictions whose noiseless truth fell inside two standard deviations
    pub predictions_within_2sd: u64,
}

/// Simulation configuration.
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    /// Number of measurement steps (default: 200)
    pub steps: usize,

    /// Mean spacing between measurements in seconds (default: 3600.0)
    pub step_secs: f64,

    /// Size of an injected outlier in measurement standard deviations (default: 50.0)
    pub outlier_sigmas: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            steps: 200,
            step_secs: 3600.0,
            outlier_sigmas: 50.0,
        }
    }
}

/// One observable of a scenario: model, bound processes and quote noise.
struct QuoteSource {
    model: ObservationModel,
    bound: Vec<ProcessId>,
    noise_sd: f64,
}

/// Everything a scenario fixes before the loop starts.
struct Setup {
    processes: Vec<Arc<dyn Process>>,
    truth0: DVector<f64>,
    prior: NormalDistr,
    quotes: Vec<QuoteSource>,
    acceptance: AcceptancePolicy,
    outlier_every: Option<usize>,
    irregular: bool,
    rms_bound: f64,
}

/// Runs estimation scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    config: SimConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            config: SimConfig::default(),
        }
    }

    /// Replaces the whole configuration.
    pub fn with_config(mut self, config: SimConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the number of measurement steps.
    pub fn with_steps(mut self, steps: usize) -> Self {
        self.config.steps = steps;
        self
    }

    /// Sets the mean spacing between measurements.
    pub fn with_step_secs(mut self, secs: f64) -> Self {
        self.config.step_secs = secs;
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        match self.run_with_export(scenario) {
            Ok((result, _)) => result,
            Err(e) => {
                warn!("Scenario {} aborted: {}", scenario.name(), e);
                ScenarioResult::failed(scenario, self.seed, e.to_string())
            }
        }
    }

    /// Runs a scenario and records every step for export.
    pub fn run_with_export(&self, scenario: ScenarioId) -> Result<(ScenarioResult, SimExport), SimError> {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        if self.config.step_secs <= 0.0 || !self.config.step_secs.is_finite() {
            return Err(SimError::scenario(format!(
                "step spacing must be positive, got {}",
                self.config.step_secs
            )));
        }

        let setup = Self::setup(scenario)?;
        let filter_config = FilterConfig::default().with_acceptance(setup.acceptance);
        let time_unit = filter_config.time_unit;

        let mut filter = KalmanFilter::with_config(
            0.0_f64,
            setup.prior.clone(),
            setup.processes.clone(),
            filter_config,
        )?;
        let composite = filter.processes().clone();
        let mut oracle = Oracle::new(composite, setup.truth0.clone(), time_unit, self.seed)?;

        let handles = setup
            .quotes
            .iter()
            .map(|q| filter.create_observable(q.model.clone(), &q.bound))
            .collect::<Result<Vec<_>, _>>()?;

        let mut schedule = ChaCha8Rng::seed_from_u64(self.seed.wrapping_mul(0x9e3779b97f4a7c15));
        let arrivals = Exp::new(1.0 / self.config.step_secs)
            .map_err(|e| SimError::scenario(format!("bad arrival rate: {}", e)))?;

        let mut export = SimExport::new(scenario.name(), self.seed);
        let mut metrics = ScenarioMetrics::default();
        let (mut accepted, mut rejected) = (0u64, 0u64);
        let mut sq_error = 0.0;
        let mut loglik_sum = 0.0;

        for step in 0..self.config.steps {
            let dt = if setup.irregular {
                schedule.sample(arrivals)
            } else {
                self.config.step_secs
            };
            oracle.step(dt)?;
            let now = oracle.time();

            let which = if setup.irregular {
                schedule.gen_range(0..handles.len())
            } else {
                step % handles.len()
            };
            let quote = &setup.quotes[which];
            let handle = handles[which];

            let predicted = handle.predict(&mut filter, now)?;
            let clean = quote.model.matrix() * Self::bound_truth(&filter, &handle, oracle.truth())?;
            let within = (0..clean.len())
                .all(|i| (clean[i] - predicted.distr.mean()[i]).abs() <= 2.0 * predicted.distr.sd(i));
            if within {
                metrics.predictions_within_2sd += 1;
            }

            let mut y = oracle.measure(&quote.model, &quote.bound, quote.noise_sd)?;
            let outlier = setup.outlier_every.map_or(false, |k| step % k == k - 1);
            if outlier {
                y[0] += self.config.outlier_sigmas * quote.noise_sd;
                metrics.outliers_injected += 1;
            }

            let obsdistr = NormalDistr::new(y.clone(), Oracle::noise_cov(y.len(), quote.noise_sd))?;
            let result = handle.observe(&mut filter, now, obsdistr)?;

            if result.accepted {
                accepted += 1;
                let d2 = result.mahalanobis_sq()?;
                metrics.max_accepted_mahalanobis_sq = metrics.max_accepted_mahalanobis_sq.max(d2);
            } else {
                rejected += 1;
                if outlier {
                    metrics.outliers_rejected += 1;
                } else {
                    metrics.clean_rejected += 1;
                }
            }
            loglik_sum += result.loglikelihood;

            let estimate = filter.distr().mean();
            let err = oracle.truth() - estimate;
            sq_error += err.norm_squared();

            export.add_frame(SimFrame {
                time_sec: now,
                observable: which,
                truth: oracle.truth().iter().copied().collect(),
                estimate: estimate.iter().copied().collect(),
                sd: (0..estimate.len()).map(|i| filter.distr().sd(i)).collect(),
                accepted: result.accepted,
                loglikelihood: result.loglikelihood,
                outlier,
            });

            if step % 50 == 0 {
                debug!(
                    "  t={:.1}h | obs#{} | accepted={} | loglik={:.3} | |err|={:.4}",
                    now / 3600.0,
                    which,
                    result.accepted,
                    result.loglikelihood,
                    err.norm()
                );
            }
        }

        let steps = self.config.steps;
        let dim = setup.truth0.len();
        let (rms_error, mean_loglikelihood) = if steps == 0 {
            (0.0, 0.0)
        } else {
            (
                (sq_error / (steps * dim) as f64).sqrt(),
                loglik_sum / steps as f64,
            )
        };

        let mut failures = Vec::new();
        if !rms_error.is_finite() || rms_error > setup.rms_bound {
            failures.push(format!(
                "RMS error {:.4} exceeds bound {:.4}",
                rms_error, setup.rms_bound
            ));
        }
        if metrics.outliers_rejected < metrics.outliers_injected {
            failures.push(format!(
                "{} of {} outliers accepted",
                metrics.outliers_injected - metrics.outliers_rejected,
                metrics.outliers_injected
            ));
        }
        if !mean_loglikelihood.is_finite() {
            failures.push("non-finite log-likelihood".to_string());
        }

        let passed = failures.is_empty();
        export.finalize(passed, Some(rms_error));

        info!(
            "{}: steps={} accepted={} rejected={} rms={:.4} mean_loglik={:.3}",
            scenario.name(),
            steps,
            accepted,
            rejected,
            rms_error,
            mean_loglikelihood
        );

        let result = ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            steps,
            final_time_secs: oracle.time(),
            accepted,
            rejected,
            rms_error,
            mean_loglikelihood,
            failure_reason: if passed { None } else { Some(failures.join("; ")) },
            metrics,
        };
        Ok((result, export))
    }

    /// True values of the components an observable is bound to, in model column order.
    fn bound_truth(
        filter: &KalmanFilter<f64>,
        handle: &spreadview_core::Observable,
        truth: &DVector<f64>,
    ) -> Result<DVector<f64>, SimError> {
        let mut columns = Vec::new();
        for id in filter.bound_processes(handle)? {
            columns.extend(filter.processes().range(*id)?);
        }
        Ok(truth.select_rows(&columns))
    }

    fn setup(scenario: ScenarioId) -> Result<Setup, SimError> {
        let setup = match scenario {
            // Rates per day, quotes hourly
            ScenarioId::SingleWiener | ScenarioId::Outliers => {
                let process: Arc<dyn Process> = Arc::new(WienerProcess::univariate(3.0, 25.0)?);
                let gated = scenario.is_gated();
                Setup {
                    processes: vec![process],
                    truth0: DVector::from_element(1, 100.0),
                    prior: NormalDistr::univariate(100.0, 250.0)?,
                    quotes: vec![QuoteSource {
                        model: ObservationModel::identity(1)?,
                        bound: vec![ProcessId(0)],
                        noise_sd: 1.0,
                    }],
                    acceptance: if gated {
                        AcceptancePolicy::chi2_gate_95(1)
                    } else {
                        AcceptancePolicy::AcceptAll
                    },
                    outlier_every: gated.then_some(10),
                    irregular: false,
                    rms_bound: 3.0,
                }
            }

            ScenarioId::SpreadPair | ScenarioId::Async => {
                let leg_a: Arc<dyn Process> = Arc::new(WienerProcess::univariate(0.5, 4.0)?);
                let leg_b: Arc<dyn Process> = Arc::new(WienerProcess::univariate(-0.5, 4.0)?);
                let mut quotes = vec![
                    QuoteSource {
                        model: ObservationModel::identity(1)?,
                        bound: vec![ProcessId(0)],
                        noise_sd: 0.5,
                    },
                    QuoteSource {
                        model: ObservationModel::row(&[1.0, -1.0])?,
                        bound: vec![ProcessId(0), ProcessId(1)],
                        noise_sd: 0.5,
                    },
                ];
                let irregular = scenario == ScenarioId::Async;
                if irregular {
                    quotes.push(QuoteSource {
                        model: ObservationModel::identity(1)?,
                        bound: vec![ProcessId(1)],
                        noise_sd: 0.5,
                    });
                }
                Setup {
                    processes: vec![leg_a, leg_b],
                    truth0: DVector::from_vec(vec![50.0, 48.0]),
                    prior: NormalDistr::new(
                        DVector::from_vec(vec![50.0, 48.0]),
                        DMatrix::identity(2, 2) * 100.0,
                    )?,
                    quotes,
                    acceptance: AcceptancePolicy::AcceptAll,
                    outlier_every: None,
                    irregular,
                    rms_bound: 2.0,
                }
            }

            ScenarioId::MeanReverting => {
                let process: Arc<dyn Process> =
                    Arc::new(OrnsteinUhlenbeckProcess::univariate(2.0, 1.0, 0.3)?);
                Setup {
                    processes: vec![process],
                    truth0: DVector::from_element(1, 1.2),
                    prior: NormalDistr::univariate(1.0, 0.1)?,
                    quotes: vec![QuoteSource {
                        model: ObservationModel::identity(1)?,
                        bound: vec![ProcessId(0)],
                        noise_sd: 0.1,
                    }],
                    acceptance: AcceptancePolicy::AcceptAll,
                    outlier_every: None,
                    irregular: false,
                    rms_bound: 0.3,
                }
            }
        };
        Ok(setup)
    }
}
