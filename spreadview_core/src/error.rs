//! Error types for the SpreadView estimation engine.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, KalmanError>;

/// Errors reported by distributions, processes, filters and observables.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KalmanError {
    /// Shape inconsistency between vectors/matrices at construction or update
    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// Process partition or observation-model binding is inconsistent
    #[error("Invalid composition: {0}")]
    InvalidComposition(String),

    /// Time update requested to move backward
    #[error("Non-monotonic time: filter is at {current}, requested {requested}")]
    NonMonotonicTime { current: String, requested: String },

    /// Innovation covariance could not be factorized
    #[error("Innovation covariance is singular")]
    SingularInnovation,

    /// Non-finite value or failed factorization in linear algebra
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),

    /// Covariance matrix is not symmetric or not positive-semidefinite
    #[error("Invalid covariance: {0}")]
    InvalidCovariance(String),

    /// Observable handle was created by a different filter
    #[error("Observable does not belong to this filter")]
    UnknownObservable,

    /// A writer panicked while holding the shared filter lock
    #[error("Shared filter lock poisoned")]
    LockPoisoned,
}

impl KalmanError {
    /// Creates a dimension mismatch error.
    pub fn dimension(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }

    /// Creates a composition error.
    pub fn composition(msg: impl Into<String>) -> Self {
        Self::InvalidComposition(msg.into())
    }

    /// Creates a numerical instability error.
    pub fn numerical(msg: impl Into<String>) -> Self {
        Self::NumericalInstability(msg.into())
    }

    /// Creates a non-monotonic time error from two time points.
    pub fn non_monotonic(current: impl std::fmt::Debug, requested: impl std::fmt::Debug) -> Self {
        Self::NonMonotonicTime {
            current: format!("{:?}", current),
            requested: format!("{:?}", requested),
        }
    }
}
