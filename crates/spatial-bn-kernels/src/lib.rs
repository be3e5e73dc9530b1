//! Generic compute kernels for spatial batch normalization

use spatial_bn_common::{BackwardIo, ForwardIo, Result, SpatialBnArgs};

pub mod cpu;

pub use cpu::CpuFallback;

/// Implementation of spatial BN that does not depend on the vendor library.
///
/// Implementations accept every storage order and `num_batches` value the
/// operators do, and follow the same empty-batch behaviour.
pub trait SpatialBnFallback: Send + Sync {
    fn name(&self) -> &'static str;

    /// Forward pass; the mode is taken from `io.stats` and must agree with
    /// `args.is_test`.
    fn forward(&self, args: &SpatialBnArgs, io: ForwardIo<'_>) -> Result<()>;

    fn backward(&self, args: &SpatialBnArgs, io: BackwardIo<'_>) -> Result<()>;
}
