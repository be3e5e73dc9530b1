//! Generic spatial batch normalization on host tensors.
//!
//! This is the path taken when the vendor library cannot serve a request:
//! channel-last layouts, statistics aggregated over several batches, or an
//! explicit override. It accepts any rank ≥ 2 in either storage order.

use super::batch_norm::{
    Affine, GradientOutputs, MomentSums, SpatialLayout, TrainingConfig, TrainingOutputs,
    spatial_bn_backward, spatial_bn_inference, spatial_bn_training,
};
use crate::SpatialBnFallback;
use spatial_bn_common::{
    BackwardIo, ForwardIo, Result, SpatialBnArgs, SpatialBnError, StatsIo, Tensor,
};
use tracing::debug;

const FORWARD_OP: &str = "SpatialBN";
const BACKWARD_OP: &str = "SpatialBNGradient";

/// Reference CPU implementation. Always available.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuFallback;

impl CpuFallback {
    pub fn new() -> Self {
        Self
    }
}

/// Running statistics are either uninitialised (empty) or one value per channel.
fn check_running(mean: &Tensor, var: &Tensor, c: usize) -> Result<()> {
    if mean.is_empty() {
        return Ok(());
    }
    mean.check_vector("running mean", c)?;
    var.check_vector("running variance", c)
}

impl SpatialBnFallback for CpuFallback {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn forward(&self, args: &SpatialBnArgs, io: ForwardIo<'_>) -> Result<()> {
        let ForwardIo { x, scale, bias, y, stats } = io;
        stats.check_mode(args.is_test)?;
        x.require_f32(FORWARD_OP)?;
        let layout = SpatialLayout::from_dims(x.dims(), args.order)?;
        let c = layout.c;
        scale.check_vector("scale", c)?;
        bias.check_vector("bias", c)?;
        let affine = Affine { scale: scale.as_f32()?, bias: bias.as_f32()? };
        debug!(
            dims = ?x.dims(),
            order = %args.order,
            num_batches = args.num_batches,
            training = stats.is_training(),
            "fallback spatial BN forward"
        );

        match stats {
            StatsIo::Inference { est_mean, est_var } => {
                est_mean.check_vector("estimated mean", c)?;
                est_var.check_vector("estimated variance", c)?;
                y.resize(x.dims());
                if layout.n == 0 {
                    return Ok(());
                }
                spatial_bn_inference(
                    x.as_f32()?,
                    &layout,
                    affine,
                    est_mean.as_f32()?,
                    est_var.as_f32()?,
                    args.epsilon,
                    y.as_f32_mut()?,
                )
            }
            StatsIo::Training { running_mean, running_var, saved_mean, saved_inv_std, aggregates } => {
                check_running(running_mean, running_var, c)?;
                y.resize(x.dims());
                saved_mean.resize(&[c]);
                saved_inv_std.resize(&[c]);
                if layout.n == 0 {
                    saved_mean.fill_zero();
                    saved_inv_std.fill_zero();
                    return Ok(());
                }
                if running_mean.is_empty() {
                    running_mean.resize(&[c]);
                    running_var.resize(&[c]);
                    running_mean.fill_zero();
                    running_var.fill_zero();
                }

                let sums = match aggregates {
                    Some(agg) => {
                        agg.sums.check_vector("sums", c)?;
                        agg.sums_sq.check_vector("sums_sq", c)?;
                        Some(MomentSums { sum: agg.sums.as_f32()?, sum_sq: agg.sums_sq.as_f32()? })
                    }
                    None => None,
                };
                let config = TrainingConfig {
                    eps: args.epsilon,
                    momentum: args.momentum,
                    num_batches: args.num_batches,
                };
                spatial_bn_training(
                    x.as_f32()?,
                    &layout,
                    affine,
                    &config,
                    sums,
                    TrainingOutputs {
                        y: y.as_f32_mut()?,
                        running_mean: running_mean.as_f32_mut()?,
                        running_var: running_var.as_f32_mut()?,
                        saved_mean: saved_mean.as_f32_mut()?,
                        saved_inv_std: saved_inv_std.as_f32_mut()?,
                    },
                )
            }
        }
    }

    fn backward(&self, args: &SpatialBnArgs, io: BackwardIo<'_>) -> Result<()> {
        let BackwardIo { x, scale, dy, saved_mean, saved_inv_std, aggregates, dx, dscale, dbias } =
            io;
        x.require_f32(BACKWARD_OP)?;
        let layout = SpatialLayout::from_dims(x.dims(), args.order)?;
        let c = layout.c;
        scale.check_vector("scale", c)?;
        if dy.dims() != x.dims() {
            return Err(SpatialBnError::validation(format!(
                "dY dims {:?} differ from X dims {:?}",
                dy.dims(),
                x.dims()
            )));
        }
        saved_mean.check_vector("saved mean", c)?;
        saved_inv_std.check_vector("saved inverse std", c)?;
        debug!(
            dims = ?x.dims(),
            order = %args.order,
            num_batches = args.num_batches,
            "fallback spatial BN backward"
        );

        dx.resize(x.dims());
        dscale.resize(scale.dims());
        dbias.resize(scale.dims());
        if layout.n == 0 {
            dscale.fill_zero();
            dbias.fill_zero();
            return Ok(());
        }

        let aggregated = match aggregates {
            Some(agg) => {
                agg.dscale.check_vector("aggregated scale gradient", c)?;
                agg.dbias.check_vector("aggregated bias gradient", c)?;
                Some((agg.dscale.as_f32()?, agg.dbias.as_f32()?))
            }
            None => None,
        };
        spatial_bn_backward(
            x.as_f32()?,
            dy.as_f32()?,
            &layout,
            scale.as_f32()?,
            saved_mean.as_f32()?,
            saved_inv_std.as_f32()?,
            args.num_batches,
            aggregated,
            GradientOutputs {
                dx: dx.as_f32_mut()?,
                dscale: dscale.as_f32_mut()?,
                dbias: dbias.as_f32_mut()?,
            },
        )
    }
}
