//! Error types for the simulation harness.

use spreadview_core::KalmanError;
use thiserror::Error;

/// Errors that can occur while running or exporting a simulation.
#[derive(Debug, Error)]
pub enum SimError {
    /// The estimation engine rejected an operation
    #[error("Filter error: {0}")]
    Filter(#[from] KalmanError),

    /// Export file could not be written
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Export could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Scenario set-up is inconsistent
    #[error("Scenario error: {0}")]
    Scenario(String),
}

impl SimError {
    /// Creates a scenario error.
    pub fn scenario(msg: impl Into<String>) -> Self {
        Self::Scenario(msg.into())
    }
}
