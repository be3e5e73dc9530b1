//! `SpatialBN` forward operator.

use crate::shape::{fallback_args, fallback_reason, vendor_epsilon};
use spatial_bn_common::{
    FallbackPolicy, ForwardIo, Result, SpatialBnArgs, SpatialBnError, StatsIo, Tensor,
};
use spatial_bn_kernels::{CpuFallback, SpatialBnFallback};
use spatial_bn_miopen::{
    BatchNormMode, DescriptorPair, ForwardInferenceArgs, ForwardTrainingArgs, MiopenApi,
};
use std::sync::Arc;
use tracing::debug;

/// Spatial batch normalization forward pass on MIOpen.
///
/// Takes X in NCHW order (rank 4), per-channel scale and bias, and either the
/// estimated statistics (evaluation) or the running and saved statistics
/// (training). Owns one descriptor pair, refreshed when X's dims change.
pub struct MiopenSpatialBnOp {
    args: SpatialBnArgs,
    policy: FallbackPolicy,
    api: Arc<dyn MiopenApi>,
    descriptors: DescriptorPair,
    fallback: Box<dyn SpatialBnFallback>,
}

impl MiopenSpatialBnOp {
    pub const NAME: &'static str = "SpatialBN";

    /// Build the operator with the CPU fallback and the environment policy.
    pub fn new(args: SpatialBnArgs, api: Arc<dyn MiopenApi>) -> Result<Self> {
        Self::with_fallback(args, api, Box::new(CpuFallback))
    }

    pub fn with_fallback(
        args: SpatialBnArgs,
        api: Arc<dyn MiopenApi>,
        fallback: Box<dyn SpatialBnFallback>,
    ) -> Result<Self> {
        args.validate()?;
        let descriptors = DescriptorPair::new(&api)?;
        Ok(Self { args, policy: FallbackPolicy::from_env(), api, descriptors, fallback })
    }

    /// Replace the policy read from the environment at construction.
    pub fn with_policy(mut self, policy: FallbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn args(&self) -> &SpatialBnArgs {
        &self.args
    }

    /// Whether calls bypass the vendor library.
    pub fn uses_fallback(&self) -> bool {
        fallback_reason(&self.args, self.policy).is_some()
    }

    /// Epsilon passed to MIOpen after clamping.
    pub fn vendor_epsilon(&self) -> f64 {
        vendor_epsilon(Self::NAME, self.args.epsilon)
    }

    pub fn run(&mut self, io: ForwardIo<'_>) -> Result<()> {
        io.stats.check_mode(self.args.is_test)?;
        if let Some(reason) = fallback_reason(&self.args, self.policy) {
            debug!(reason, fallback = self.fallback.name(), "SpatialBN using generic path");
            return self.fallback.forward(&fallback_args(Self::NAME, &self.args), io);
        }

        let ForwardIo { x, scale, bias, y, stats } = io;
        x.require_f32(Self::NAME)?;
        if x.ndim() != 4 {
            return Err(SpatialBnError::validation(format!(
                "X must be 4-dimensional, got dims {:?}",
                x.dims()
            )));
        }
        let c = x.dim(1);
        scale.check_vector("scale", c)?;
        bias.check_vector("bias", c)?;
        match &stats {
            StatsIo::Inference { est_mean, est_var } => {
                est_mean.check_vector("estimated mean", c)?;
                est_var.check_vector("estimated variance", c)?;
            }
            StatsIo::Training { running_mean, running_var, .. } => {
                if !running_mean.is_empty() {
                    running_mean.check_vector("running mean", c)?;
                    running_var.check_vector("running variance", c)?;
                }
            }
        }

        let epsilon = self.vendor_epsilon();
        y.resize(x.dims());
        let n = x.dim(0);

        match stats {
            StatsIo::Inference { est_mean, est_var } => {
                if n == 0 {
                    return Ok(());
                }
                let nchw = [n, c, x.dim(2), x.dim(3)];
                self.descriptors.refresh(x.dims(), nchw)?;
                debug!(nchw = ?nchw, epsilon, "MIOpen batch-norm inference");
                self.api.batch_norm_forward_inference(ForwardInferenceArgs {
                    mode: BatchNormMode::Spatial,
                    alpha: self.args.alpha,
                    beta: self.args.beta,
                    x_desc: self.descriptors.data(),
                    x: x.as_f32()?,
                    y_desc: self.descriptors.data(),
                    y: y.as_f32_mut()?,
                    param_desc: self.descriptors.param(),
                    scale: scale.as_f32()?,
                    bias: bias.as_f32()?,
                    estimated_mean: est_mean.as_f32()?,
                    estimated_variance: est_var.as_f32()?,
                    epsilon,
                })?;
            }
            StatsIo::Training { running_mean, running_var, saved_mean, saved_inv_std, .. } => {
                saved_mean.resize(&[c]);
                saved_inv_std.resize(&[c]);
                if n == 0 {
                    saved_mean.fill_zero();
                    saved_inv_std.fill_zero();
                    return Ok(());
                }
                init_running_stats(running_mean, running_var, c);

                let nchw = [n, c, x.dim(2), x.dim(3)];
                self.descriptors.refresh(x.dims(), nchw)?;
                let exp_avg_factor = self.args.exp_avg_factor();
                debug!(nchw = ?nchw, epsilon, exp_avg_factor, "MIOpen batch-norm training");
                self.api.batch_norm_forward_training(ForwardTrainingArgs {
                    mode: BatchNormMode::Spatial,
                    alpha: self.args.alpha,
                    beta: self.args.beta,
                    x_desc: self.descriptors.data(),
                    x: x.as_f32()?,
                    y_desc: self.descriptors.data(),
                    y: y.as_f32_mut()?,
                    param_desc: self.descriptors.param(),
                    scale: scale.as_f32()?,
                    bias: bias.as_f32()?,
                    exp_avg_factor,
                    running_mean: running_mean.as_f32_mut()?,
                    running_variance: running_var.as_f32_mut()?,
                    epsilon,
                    saved_mean: saved_mean.as_f32_mut()?,
                    saved_inv_variance: saved_inv_std.as_f32_mut()?,
                })?;
            }
        }
        Ok(())
    }
}

/// Empty running statistics start at zero before the first update.
fn init_running_stats(mean: &mut Tensor, var: &mut Tensor, c: usize) {
    if mean.is_empty() {
        mean.resize(&[c]);
        var.resize(&[c]);
        mean.fill_zero();
        var.fill_zero();
    }
}

impl std::fmt::Debug for MiopenSpatialBnOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiopenSpatialBnOp")
            .field("args", &self.args)
            .field("policy", &self.policy)
            .field("backend", &self.api.name())
            .field("descriptors", &self.descriptors)
            .field("fallback", &self.fallback.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spatial_bn_miopen::{HostMiopen, MiopenCall};

    fn build(args: SpatialBnArgs) -> (Arc<HostMiopen>, MiopenSpatialBnOp) {
        let host = Arc::new(HostMiopen::recording());
        let op = MiopenSpatialBnOp::new(args, host.clone())
            .unwrap()
            .with_policy(FallbackPolicy::default());
        (host, op)
    }

    fn vec_t(data: Vec<f32>) -> Tensor {
        Tensor::from_f32(&[data.len()], data).unwrap()
    }

    #[test]
    fn rejects_non_4d_input() {
        let (_, mut op) = build(SpatialBnArgs::default().with_is_test(true));
        let x = Tensor::zeros(&[2, 3, 4]);
        let p = Tensor::zeros(&[3]);
        let mut y = Tensor::empty();
        let err = op
            .run(ForwardIo {
                x: &x,
                scale: &p,
                bias: &p,
                y: &mut y,
                stats: StatsIo::Inference { est_mean: &p, est_var: &p },
            })
            .unwrap_err();
        assert!(err.to_string().contains("4-dimensional"));
    }

    #[test]
    fn rejects_mode_mismatch() {
        let (host, mut op) = build(SpatialBnArgs::default());
        let x = Tensor::zeros(&[1, 1, 1, 1]);
        let p = Tensor::zeros(&[1]);
        let mut y = Tensor::empty();
        let res = op.run(ForwardIo {
            x: &x,
            scale: &p,
            bias: &p,
            y: &mut y,
            stats: StatsIo::Inference { est_mean: &p, est_var: &p },
        });
        assert!(matches!(res, Err(SpatialBnError::Validation(_))));
        assert_eq!(host.compute_calls(), 0);
    }

    #[test]
    fn descriptors_refresh_only_on_shape_change() {
        let (host, mut op) = build(SpatialBnArgs::default().with_is_test(true));
        let scale = vec_t(vec![1.0, 1.0]);
        let bias = vec_t(vec![0.0, 0.0]);
        let mean = vec_t(vec![0.0, 0.0]);
        let var = vec_t(vec![1.0, 1.0]);
        let mut y = Tensor::empty();

        for dims in [[1usize, 2, 2, 2], [1, 2, 2, 2], [3, 2, 1, 1]] {
            let x = Tensor::zeros(&dims);
            op.run(ForwardIo {
                x: &x,
                scale: &scale,
                bias: &bias,
                y: &mut y,
                stats: StatsIo::Inference { est_mean: &mean, est_var: &var },
            })
            .unwrap();
            assert_eq!(y.dims(), &dims);
        }

        let sets = host
            .calls()
            .iter()
            .filter(|c| matches!(c, MiopenCall::SetTensorDescriptor { .. }))
            .count();
        assert_eq!(sets, 2);
        assert_eq!(host.compute_calls(), 3);
    }

    #[test]
    fn training_passes_one_minus_momentum() {
        let (host, mut op) = build(SpatialBnArgs::default().with_momentum(0.75));
        let x = Tensor::from_f32(&[2, 1, 1, 1], vec![1.0, 3.0]).unwrap();
        let scale = vec_t(vec![1.0]);
        let bias = vec_t(vec![0.0]);
        let (mut y, mut rm, mut rv, mut sm, mut si) =
            (Tensor::empty(), Tensor::empty(), Tensor::empty(), Tensor::empty(), Tensor::empty());
        op.run(ForwardIo {
            x: &x,
            scale: &scale,
            bias: &bias,
            y: &mut y,
            stats: StatsIo::Training {
                running_mean: &mut rm,
                running_var: &mut rv,
                saved_mean: &mut sm,
                saved_inv_std: &mut si,
                aggregates: None,
            },
        })
        .unwrap();

        let factor = host
            .calls()
            .iter()
            .find_map(|c| match c {
                MiopenCall::ForwardTraining { exp_avg_factor, .. } => Some(*exp_avg_factor),
                _ => None,
            })
            .unwrap();
        assert!((factor - 0.25).abs() < 1e-12);
        // zero start: 0.25 * batch mean 2
        assert_eq!(rm.as_f32().unwrap(), &[0.5]);
        assert_eq!(sm.as_f32().unwrap(), &[2.0]);
    }
}
