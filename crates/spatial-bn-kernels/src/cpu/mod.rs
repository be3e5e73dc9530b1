//! CPU kernel implementations

pub mod batch_norm;
pub mod fallback;

pub use batch_norm::{
    Affine, GradientOutputs, MomentSums, SpatialLayout, TrainingConfig, TrainingOutputs,
    channel_sums, compute_batch_stats, spatial_bn_backward, spatial_bn_inference,
    spatial_bn_training,
};
pub use fallback::CpuFallback;
