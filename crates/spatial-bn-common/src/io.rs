//! Borrowed input/output bundles for the spatial BN operators.
//!
//! The caller owns every tensor. Outputs are `&mut` and are resized and
//! written in place, mirroring how a framework hands workspace blobs to an
//! operator.

use crate::{Result, SpatialBnError, Tensor};

/// Per-channel `Σx` and `Σx²` gathered over `num_batches` batches.
#[derive(Debug, Clone, Copy)]
pub struct BatchAggregates<'a> {
    pub sums: &'a Tensor,
    pub sums_sq: &'a Tensor,
}

/// Per-channel scale and bias gradients summed over `num_batches` batches.
#[derive(Debug, Clone, Copy)]
pub struct GradientAggregates<'a> {
    pub dscale: &'a Tensor,
    pub dbias: &'a Tensor,
}

/// Statistics consumed or produced by a forward call, by mode.
#[derive(Debug)]
pub enum StatsIo<'a> {
    /// Evaluation: normalise with caller-provided estimates, nothing is written.
    Inference { est_mean: &'a Tensor, est_var: &'a Tensor },
    /// Training: running statistics are updated in place, saved statistics
    /// are overwritten for the backward pass.
    Training {
        running_mean: &'a mut Tensor,
        running_var: &'a mut Tensor,
        saved_mean: &'a mut Tensor,
        saved_inv_std: &'a mut Tensor,
        aggregates: Option<BatchAggregates<'a>>,
    },
}

impl StatsIo<'_> {
    pub fn is_training(&self) -> bool {
        matches!(self, Self::Training { .. })
    }

    /// Reject a bundle whose mode disagrees with the operator's `is_test` flag.
    pub fn check_mode(&self, is_test: bool) -> Result<()> {
        match (is_test, self.is_training()) {
            (true, true) => Err(SpatialBnError::validation(
                "training statistics supplied to an operator with is_test = true",
            )),
            (false, false) => Err(SpatialBnError::validation(
                "inference statistics supplied to an operator with is_test = false",
            )),
            _ => Ok(()),
        }
    }
}

/// Everything a forward call reads and writes.
#[derive(Debug)]
pub struct ForwardIo<'a> {
    pub x: &'a Tensor,
    pub scale: &'a Tensor,
    pub bias: &'a Tensor,
    pub y: &'a mut Tensor,
    pub stats: StatsIo<'a>,
}

/// Everything a backward call reads and writes.
#[derive(Debug)]
pub struct BackwardIo<'a> {
    pub x: &'a Tensor,
    pub scale: &'a Tensor,
    pub dy: &'a Tensor,
    pub saved_mean: &'a Tensor,
    pub saved_inv_std: &'a Tensor,
    pub aggregates: Option<GradientAggregates<'a>>,
    pub dx: &'a mut Tensor,
    pub dscale: &'a mut Tensor,
    pub dbias: &'a mut Tensor,
}
