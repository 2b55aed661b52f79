//! SpreadView Core - Linear-Gaussian State Estimation Engine
//!
//! Maintains a Gaussian belief over the state of several independent
//! stochastic processes and lets any number of observables, each a linear
//! projection of that state, be predicted and updated against noisy
//! measurements arriving at arbitrary times:
//! 1. **Processes**: Wiener and Ornstein-Uhlenbeck models composed block-diagonally
//! 2. **Filter**: one owner of the belief, time update on demand
//! 3. **Observables**: cached predictions and measurement updates over a shared belief
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use spreadview_core::{KalmanFilter, NormalDistr, ObservationModel, Process, ProcessId, WienerProcess};
//!
//! let process: Arc<dyn Process> = Arc::new(WienerProcess::univariate(3.0, 25.0)?);
//! let mut filter = KalmanFilter::new(0.0_f64, NormalDistr::univariate(100.0, 250.0)?, vec![process])?;
//! let obs = filter.create_observable(ObservationModel::identity(1)?, &[ProcessId(0)])?;
//!
//! // One hour later, with rates quoted per day
//! let result = obs.observe(&mut filter, 3600.0, NormalDistr::univariate(100.35, 100.0)?)?;
//! assert!(result.accepted);
//! assert!((filter.distr().mean()[0] - 100.2859).abs() < 1e-4);
//! # Ok::<(), spreadview_core::KalmanError>(())
//! ```

pub mod composite;
pub mod distribution;
pub mod error;
pub mod filter;
pub mod linalg;
pub mod observable;
pub mod observation;
pub mod process;
pub mod shared;
pub mod time;

// Re-export key types for convenience
pub use composite::{CompositeProcess, ProcessBlock, ProcessId};
pub use distribution::NormalDistr;
pub use error::{KalmanError, Result};
pub use filter::{AcceptancePolicy, FilterConfig, FilterState, KalmanFilter};
pub use observable::{ObsResult, Observable, PredictedObs};
pub use observation::ObservationModel;
pub use process::{Evolution, OrnsteinUhlenbeckProcess, Process, WienerProcess};
pub use shared::SharedFilter;
pub use time::{TimePoint, TimeUnit};
