//! Spatial batch normalization operators on MIOpen
//!
//! [`MiopenSpatialBnOp`] (`SpatialBN`) and [`MiopenSpatialBnGradientOp`]
//! (`SpatialBNGradient`) translate framework tensors into MIOpen descriptors
//! and calls. Requests the vendor path cannot serve (NHWC order, statistics
//! aggregated over several batches, or `SPATIAL_BN_FORCE_FALLBACK`) go to a
//! [`SpatialBnFallback`] instead.

pub mod backward;
pub mod forward;
pub mod registry;
mod shape;

pub use backward::MiopenSpatialBnGradientOp;
pub use forward::MiopenSpatialBnOp;
pub use registry::{ENGINE_MIOPEN, OperatorFactory, OperatorRegistry, SpatialBnOperator};

pub use spatial_bn_common::{
    BackwardIo, BatchAggregates, ForwardIo, GradientAggregates, Result, SpatialBnArgs,
    SpatialBnError, StatsIo, StorageOrder, Tensor,
};
pub use spatial_bn_kernels::{CpuFallback, SpatialBnFallback};
pub use spatial_bn_miopen::{HostMiopen, MiopenApi, select_backend};
