//! `SpatialBNGradient` operator.

use crate::shape::{fallback_args, fallback_reason, nchw_extents, vendor_epsilon};
use spatial_bn_common::{BackwardIo, FallbackPolicy, Result, SpatialBnArgs, SpatialBnError};
use spatial_bn_kernels::{CpuFallback, SpatialBnFallback};
use spatial_bn_miopen::{BackwardArgs, BatchNormMode, DescriptorPair, MiopenApi};
use std::sync::Arc;
use tracing::debug;

/// Spatial batch normalization backward pass on MIOpen.
///
/// Accepts X of rank 3 or more in NCHW order; the descriptor folds every
/// axis after the third into the width. Consumes the saved statistics
/// written by the matching training forward call.
pub struct MiopenSpatialBnGradientOp {
    args: SpatialBnArgs,
    policy: FallbackPolicy,
    api: Arc<dyn MiopenApi>,
    descriptors: DescriptorPair,
    fallback: Box<dyn SpatialBnFallback>,
}

impl MiopenSpatialBnGradientOp {
    pub const NAME: &'static str = "SpatialBNGradient";

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

    pub fn with_policy(mut self, policy: FallbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn args(&self) -> &SpatialBnArgs {
        &self.args
    }

    pub fn uses_fallback(&self) -> bool {
        fallback_reason(&self.args, self.policy).is_some()
    }

    pub fn vendor_epsilon(&self) -> f64 {
        vendor_epsilon(Self::NAME, self.args.epsilon)
    }

    pub fn run(&mut self, io: BackwardIo<'_>) -> Result<()> {
        if let Some(reason) = fallback_reason(&self.args, self.policy) {
            debug!(reason, fallback = self.fallback.name(), "SpatialBNGradient using generic path");
            return self.fallback.backward(&fallback_args(Self::NAME, &self.args), io);
        }

        let BackwardIo { x, scale, dy, saved_mean, saved_inv_std, dx, dscale, dbias, .. } = io;
        x.require_f32(Self::NAME)?;
        if x.ndim() < 3 {
            return Err(SpatialBnError::validation(format!(
                "X must have at least 3 dimensions, got dims {:?}",
                x.dims()
            )));
        }
        let c = x.dim(1);
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

        let epsilon = self.vendor_epsilon();
        dx.resize(x.dims());
        dscale.resize(scale.dims());
        dbias.resize(scale.dims());
        let n = x.dim(0);
        if n == 0 {
            dscale.fill_zero();
            dbias.fill_zero();
            return Ok(());
        }

        let nchw = nchw_extents(x.dims());
        self.descriptors.refresh(x.dims(), nchw)?;
        debug!(nchw = ?nchw, epsilon, "MIOpen batch-norm backward");
        self.api.batch_norm_backward(BackwardArgs {
            mode: BatchNormMode::Spatial,
            alpha_data: self.args.alpha,
            beta_data: self.args.beta,
            alpha_param: self.args.alpha,
            beta_param: self.args.beta,
            x_desc: self.descriptors.data(),
            x: x.as_f32()?,
            dy_desc: self.descriptors.data(),
            dy: dy.as_f32()?,
            dx_desc: self.descriptors.data(),
            dx: dx.as_f32_mut()?,
            param_desc: self.descriptors.param(),
            scale: scale.as_f32()?,
            scale_diff: dscale.as_f32_mut()?,
            bias_diff: dbias.as_f32_mut()?,
            epsilon,
            saved_mean: saved_mean.as_f32()?,
            saved_inv_variance: saved_inv_std.as_f32()?,
        })?;
        Ok(())
    }
}

impl std::fmt::Debug for MiopenSpatialBnGradientOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiopenSpatialBnGradientOp")
            .field("args", &self.args)
            .field("policy", &self.policy)
            .field("backend", &self.api.name())
            .field("descriptors", &self.descriptors)
            .field("fallback", &self.fallback.name())
            .finish()
    }
}
