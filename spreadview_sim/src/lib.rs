//! SpreadView Deterministic Simulation Harness
//!
//! Runs the estimation engine against a seeded ground truth so its
//! behaviour can be checked end to end.
//!
//! # Core Principle: One Seed
//!
//! All sources of randomness derive from a single 64-bit seed:
//! - **Truth**: process paths sampled through `Process::propagate`
//! - **Quotes**: measurement noise and injected outliers
//! - **Schedule**: irregular arrival times and which observable quotes
//!
//! ```text
//! ┌──────────────┐   y = Hx + ε    ┌──────────────────┐
//! │    Oracle    │────────────────►│   KalmanFilter   │
//! │ (true state) │                 │ (belief, gating) │
//! └──────┬───────┘                 └────────┬─────────┘
//!        │           truth vs. mean         │
//!        └──────────► ScenarioRunner ◄──────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use spreadview_sim::{ScenarioId, ScenarioRunner};
//!
//! let result = ScenarioRunner::new(42).with_steps(48).run(ScenarioId::SpreadPair);
//! assert!(result.passed);
//! ```

mod error;
mod exporter;
mod oracle;
mod runner;
pub mod scenarios;

pub use error::SimError;
pub use exporter::{SimExport, SimFrame};
pub use oracle::Oracle;
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner, SimConfig};
pub use scenarios::ScenarioId;
