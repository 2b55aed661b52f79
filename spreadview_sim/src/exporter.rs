//! JSON exporter for offline inspection of a run.
//!
//! Exports per-step frames (truth against the filter belief) as JSON.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;

use crate::error::SimError;

/// A single measurement step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    /// Index of the observable that produced the measurement
    pub observable: usize,

    /// True state after the step
    pub truth: Vec<f64>,

    /// Posterior mean
    pub estimate: Vec<f64>,

    /// Posterior standard deviations
    pub sd: Vec<f64>,

    pub accepted: bool,

    pub loglikelihood: f64,

    /// Set when the measurement was deliberately corrupted
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub outlier: bool,
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_rms_error: Option<f64>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            final_rms_error: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, rms_error: Option<f64>) {
        self.passed = passed;
        self.final_rms_error = rms_error;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> Result<(), SimError> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
