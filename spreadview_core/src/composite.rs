//! Block-diagonal composition of mutually independent processes.

use crate::error::{KalmanError, Result};
use crate::linalg;
use crate::process::{check_elapsed, Evolution, Process};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;

/// Position of a sub-process inside a [`CompositeProcess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(pub usize);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "process#{}", self.0)
    }
}

/// One sub-process and the slice of the full state it drives.
#[derive(Debug, Clone)]
pub struct ProcessBlock {
    pub process: Arc<dyn Process>,
    pub range: Range<usize>,
}

/// Ordered, independent sub-processes sharing no state.
///
/// Total dimension is the sum of the sub-dimensions. Evolution never
/// introduces cross-covariance between blocks.
#[derive(Debug, Clone)]
pub struct CompositeProcess {
    blocks: Vec<ProcessBlock>,
    dim: usize,
}

impl CompositeProcess {
    /// Lays the processes out contiguously in the given order.
    pub fn new(processes: Vec<Arc<dyn Process>>) -> Result<Self> {
        let mut offset = 0;
        let blocks = processes
            .into_iter()
            .map(|process| {
                let range = offset..offset + process.dim();
                offset = range.end;
                ProcessBlock { process, range }
            })
            .collect();
        Self::from_blocks(blocks)
    }

    /// Validates that the ranges exactly partition `[0, n)`.
    ///
    /// Blocks may be given in any order; they are stored sorted by range start.
    pub fn from_blocks(mut blocks: Vec<ProcessBlock>) -> Result<Self> {
        if blocks.is_empty() {
            return Err(KalmanError::composition("composite process needs at least one process"));
        }
        blocks.sort_by_key(|b| b.range.start);

        let mut expected_start = 0;
        for (i, block) in blocks.iter().enumerate() {
            let len = block.range.end.saturating_sub(block.range.start);
            if block.range.start != expected_start {
                return Err(KalmanError::composition(format!(
                    "block {} starts at {} but previous blocks end at {} (gap or overlap)",
                    i, block.range.start, expected_start
                )));
            }
            if len == 0 || len != block.process.dim() {
                return Err(KalmanError::composition(format!(
                    "block {} spans {} dimensions but its process has {}",
                    i,
                    len,
                    block.process.dim()
                )));
            }
            expected_start = block.range.end;
        }

        Ok(Self {
            blocks,
            dim: expected_start,
        })
    }

    /// Total state dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of sub-processes.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[ProcessBlock] {
        &self.blocks
    }

    pub fn ids(&self) -> impl Iterator<Item = ProcessId> {
        (0..self.blocks.len()).map(ProcessId)
    }

    fn block(&self, id: ProcessId) -> Result<&ProcessBlock> {
        self.blocks
            .get(id.0)
            .ok_or_else(|| KalmanError::composition(format!("unknown {}", id)))
    }

    /// State range driven by `id`.
    pub fn range(&self, id: ProcessId) -> Result<Range<usize>> {
        Ok(self.block(id)?.range.clone())
    }

    pub fn process(&self, id: ProcessId) -> Result<&Arc<dyn Process>> {
        Ok(&self.block(id)?.process)
    }

    /// Concatenated drift, block-diagonal noise and transition over `elapsed`.
    pub fn evolve(&self, elapsed: f64) -> Result<Evolution> {
        check_elapsed(elapsed)?;
        if elapsed == 0.0 {
            return Ok(Evolution::identity(self.dim));
        }

        let parts = self
            .blocks
            .iter()
            .map(|b| b.process.evolve(elapsed))
            .collect::<Result<Vec<_>>>()?;

        let mut drift = DVector::zeros(self.dim);
        for (block, part) in self.blocks.iter().zip(&parts) {
            if part.dim() != block.range.len() {
                return Err(KalmanError::dimension(
                    "sub-process evolution",
                    block.range.len(),
                    part.dim(),
                ));
            }
            drift.rows_mut(block.range.start, part.dim()).copy_from(&part.drift);
        }

        let noise_blocks: Vec<&DMatrix<f64>> = parts.iter().map(|p| &p.noise_cov).collect();
        let noise_cov = linalg::block_diagonal(&noise_blocks);

        let transition = if parts.iter().all(|p| p.transition.is_none()) {
            None
        } else {
            let mut a = DMatrix::identity(self.dim, self.dim);
            for (block, part) in self.blocks.iter().zip(&parts) {
                if let Some(t) = &part.transition {
                    let d = block.range.len();
                    a.view_mut((block.range.start, block.range.start), (d, d))
                        .copy_from(t);
                }
            }
            Some(a)
        };

        Ok(Evolution {
            transition,
            drift,
            noise_cov,
        })
    }

    /// Samples every block forward; `variates` holds one standard-normal
    /// vector per block, each of that block's `noise_dim()`.
    pub fn propagate(
        &self,
        elapsed: f64,
        value0: &DVector<f64>,
        variates: &[DVector<f64>],
    ) -> Result<DVector<f64>> {
        if value0.len() != self.dim {
            return Err(KalmanError::dimension("composite value", self.dim, value0.len()));
        }
        if variates.len() != self.blocks.len() {
            return Err(KalmanError::dimension(
                "composite variates",
                self.blocks.len(),
                variates.len(),
            ));
        }
        let mut out = DVector::zeros(self.dim);
        for (block, z) in self.blocks.iter().zip(variates) {
            let x0 = value0.rows(block.range.start, block.range.len()).clone_owned();
            let x = block.process.propagate(elapsed, &x0, z)?;
            out.rows_mut(block.range.start, block.range.len()).copy_from(&x);
        }
        Ok(out)
    }
}
