//! Reader/writer guarded filter for multi-threaded callers.
//!
//! Measurement and time updates take the write lock. Predictions are first
//! served from the observable's cache under the read lock, so concurrent
//! predicts at an already-reached time do not serialize behind each other.

use crate::composite::ProcessId;
use crate::distribution::NormalDistr;
use crate::error::{KalmanError, Result};
use crate::filter::{FilterState, KalmanFilter};
use crate::observable::{Observable, ObsResult, PredictedObs};
use crate::observation::ObservationModel;
use crate::time::TimePoint;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Cheaply clonable handle to one filter shared across threads.
#[derive(Debug)]
pub struct SharedFilter<T: TimePoint> {
    inner: Arc<RwLock<KalmanFilter<T>>>,
}

impl<T: TimePoint> Clone for SharedFilter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: TimePoint> SharedFilter<T> {
    pub fn new(filter: KalmanFilter<T>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(filter)),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, KalmanFilter<T>>> {
        self.inner.read().map_err(|_| KalmanError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, KalmanFilter<T>>> {
        self.inner.write().map_err(|_| KalmanError::LockPoisoned)
    }

    /// Consistent copy of `(time, distr)`.
    pub fn snapshot(&self) -> Result<FilterState<T>> {
        Ok(self.read()?.state().clone())
    }

    /// Run `f` against the filter under the read lock.
    pub fn with_read<R>(&self, f: impl FnOnce(&KalmanFilter<T>) -> R) -> Result<R> {
        Ok(f(&*self.read()?))
    }

    pub fn advance(&self, time: T) -> Result<()> {
        self.write()?.advance(time)
    }

    pub fn create_observable(
        &self,
        model: ObservationModel,
        processes: &[ProcessId],
    ) -> Result<Observable> {
        self.write()?.create_observable(model, processes)
    }

    /// Cache hit under the read lock, otherwise recompute under the write lock.
    pub fn predict(&self, observable: &Observable, time: T) -> Result<PredictedObs<T>> {
        let cached = {
            let guard = self.read()?;
            observable.cached(&guard, time)?
        };
        if let Some(hit) = cached {
            return Ok(hit);
        }
        observable.predict(&mut *self.write()?, time)
    }

    pub fn observe(
        &self,
        observable: &Observable,
        time: T,
        obsdistr: NormalDistr,
    ) -> Result<ObsResult<T>> {
        observable.observe(&mut *self.write()?, time, obsdistr)
    }
}
