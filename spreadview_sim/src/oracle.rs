//! Ground truth oracle for simulation.
//!
//! The Oracle maintains the "true" hidden state the filter is estimating:
//! - True values of every process block
//! - Path sampling through `Process::propagate`
//! - Measurement generation (with noise)

use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Normal, StandardNormal};
use spreadview_core::{CompositeProcess, ObservationModel, Process, ProcessId, TimeUnit};

use crate::error::SimError;

/// Seeded generator of the hidden state and its noisy measurements.
pub struct Oracle {
    /// Processes driving the truth (same composition the filter uses)
    processes: CompositeProcess,

    /// Current true state
    state: DVector<f64>,

    /// Elapsed simulation time in seconds
    time_secs: f64,

    /// Unit in which process rates are quoted
    time_unit: TimeUnit,

    /// Deterministic RNG
    rng: ChaCha8Rng,
}

impl Oracle {
    /// Creates a new oracle starting at `initial` at time zero.
    pub fn new(
        processes: CompositeProcess,
        initial: DVector<f64>,
        time_unit: TimeUnit,
        seed: u64,
    ) -> Result<Self, SimError> {
        if initial.len() != processes.dim() {
            return Err(SimError::scenario(format!(
                "initial truth has {} components, processes span {}",
                initial.len(),
                processes.dim()
            )));
        }
        Ok(Self {
            processes,
            state: initial,
            time_secs: 0.0,
            time_unit,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    /// Advances the truth by `dt_secs` seconds.
    pub fn step(&mut self, dt_secs: f64) -> Result<&DVector<f64>, SimError> {
        let elapsed = dt_secs / self.time_unit.seconds;
        let variates: Vec<DVector<f64>> = self
            .processes
            .blocks()
            .iter()
            .map(|b| {
                let n = b.process.noise_dim();
                DVector::from_iterator(n, (0..n).map(|_| self.rng.sample::<f64, _>(StandardNormal)))
            })
            .collect();
        self.state = self.processes.propagate(elapsed, &self.state, &variates)?;
        self.time_secs += dt_secs;
        Ok(&self.state)
    }

    /// Noisy measurement `H x + ε`, `ε ~ N(0, noise_sd² I)`, of the bound blocks.
    pub fn measure(
        &mut self,
        model: &ObservationModel,
        bound: &[ProcessId],
        noise_sd: f64,
    ) -> Result<DVector<f64>, SimError> {
        let mut columns = Vec::with_capacity(model.cols());
        for id in bound {
            columns.extend(self.processes.range(*id)?);
        }
        if columns.len() != model.cols() {
            return Err(SimError::scenario("observation model does not match bound processes"));
        }

        let noise = Normal::new(0.0, noise_sd)
            .map_err(|e| SimError::scenario(format!("bad noise sd {}: {}", noise_sd, e)))?;
        let clean = model.matrix() * self.state.select_rows(&columns);
        let eps = DVector::from_iterator(clean.len(), (0..clean.len()).map(|_| self.rng.sample(noise)));
        Ok(clean + eps)
    }

    /// Measurement noise covariance matching [`Oracle::measure`].
    pub fn noise_cov(dim: usize, noise_sd: f64) -> DMatrix<f64> {
        DMatrix::identity(dim, dim) * (noise_sd * noise_sd)
    }

    /// Returns the current true state.
    pub fn truth(&self) -> &DVector<f64> {
        &self.state
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.time_secs
    }
}
