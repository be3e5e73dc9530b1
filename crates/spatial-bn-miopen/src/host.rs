//! Host-memory reference backend.
//!
//! [`HostMiopen`] implements the spatial batch-norm entry points of
//! [`MiopenApi`] on host slices with the numerical conventions of MIOpen:
//!
//! * batch statistics are taken per channel over `N * H * W` elements,
//! * the running variance is updated with the unbiased batch variance,
//! * the saved statistics are the batch mean and `1 / sqrt(var + eps)`,
//! * results are blended into outputs as `alpha * result + beta * prior`.
//!
//! It is the backend of choice on machines without ROCm. A backend built with
//! [`HostMiopen::recording`] also keeps a log of every call it receives, for
//! tests that inspect the calls an operator made.

use crate::api::{
    BackwardArgs, BatchNormMode, DescriptorHandle, ForwardInferenceArgs, ForwardTrainingArgs,
    MiopenApi, MiopenDataType,
};
use crate::status::{MiopenError, MiopenStatus, Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// One call received by a [`HostMiopen`].
#[derive(Debug, Clone, PartialEq)]
pub enum MiopenCall {
    CreateTensorDescriptor(DescriptorHandle),
    SetTensorDescriptor { desc: DescriptorHandle, nchw: [usize; 4] },
    DeriveBnTensorDescriptor { derived: DescriptorHandle, x_desc: DescriptorHandle },
    DestroyTensorDescriptor(DescriptorHandle),
    ForwardInference { nchw: [usize; 4], epsilon: f64 },
    ForwardTraining { nchw: [usize; 4], epsilon: f64, exp_avg_factor: f64 },
    Backward { nchw: [usize; 4], epsilon: f64 },
}

impl MiopenCall {
    /// Whether this call ran a batch-norm computation.
    pub fn is_compute(&self) -> bool {
        matches!(
            self,
            Self::ForwardInference { .. } | Self::ForwardTraining { .. } | Self::Backward { .. }
        )
    }

    /// Epsilon passed to a compute call.
    pub fn epsilon(&self) -> Option<f64> {
        match self {
            Self::ForwardInference { epsilon, .. }
            | Self::ForwardTraining { epsilon, .. }
            | Self::Backward { epsilon, .. } => Some(*epsilon),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct HostDescriptor {
    dtype: Option<MiopenDataType>,
    nchw: Option<[usize; 4]>,
}

#[derive(Debug, Default)]
struct HostState {
    next_handle: usize,
    descriptors: HashMap<DescriptorHandle, HostDescriptor>,
    recording: bool,
    calls: Vec<MiopenCall>,
    compute_count: usize,
    pending_failure: Option<MiopenStatus>,
}

impl HostState {
    fn record(&mut self, call: MiopenCall) {
        if self.recording {
            self.calls.push(call);
        }
    }
}

/// Reference MIOpen backend operating on host memory.
#[derive(Debug, Default)]
pub struct HostMiopen {
    state: Mutex<HostState>,
}

impl HostMiopen {
    /// Backend that keeps no call history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that logs every call it receives, see [`HostMiopen::calls`].
    pub fn recording() -> Self {
        let host = Self::default();
        host.lock().recording = true;
        host
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Every call received so far, in order. Empty unless recording.
    pub fn calls(&self) -> Vec<MiopenCall> {
        self.lock().calls.clone()
    }

    /// Number of forward/backward computations received so far.
    pub fn compute_calls(&self) -> usize {
        self.lock().compute_count
    }

    /// Descriptors created and not yet destroyed.
    pub fn live_descriptors(&self) -> usize {
        self.lock().descriptors.len()
    }

    /// Extents a descriptor is currently configured with.
    pub fn descriptor_dims(&self, desc: DescriptorHandle) -> Option<[usize; 4]> {
        self.lock().descriptors.get(&desc).and_then(|d| d.nchw)
    }

    /// Make the next forward or backward call fail with `status`.
    pub fn fail_next_compute(&self, status: MiopenStatus) {
        self.lock().pending_failure = Some(status);
    }

    fn begin_compute(&self, call: &'static str, record: MiopenCall) -> Result<()> {
        let mut state = self.lock();
        state.compute_count += 1;
        state.record(record);
        match state.pending_failure.take() {
            Some(status) => Err(MiopenError::Status { call, status }),
            None => Ok(()),
        }
    }

    fn configured(&self, call: &'static str, desc: DescriptorHandle) -> Result<[usize; 4]> {
        let state = self.lock();
        let entry = state.descriptors.get(&desc).ok_or(MiopenError::UnknownDescriptor(desc))?;
        match (entry.dtype, entry.nchw) {
            (Some(MiopenDataType::Float), Some(nchw)) => Ok(nchw),
            (Some(MiopenDataType::Half), _) => {
                Err(MiopenError::Status { call, status: MiopenStatus::NotImplemented })
            }
            _ => Err(MiopenError::Status { call, status: MiopenStatus::NotInitialized }),
        }
    }

    /// Resolve the input extents and check that the other descriptors agree.
    fn spatial_extents(
        &self,
        call: &'static str,
        mode: BatchNormMode,
        x_desc: DescriptorHandle,
        other: &[DescriptorHandle],
        param_desc: DescriptorHandle,
    ) -> Result<[usize; 4]> {
        if mode != BatchNormMode::Spatial {
            return Err(MiopenError::Status { call, status: MiopenStatus::NotImplemented });
        }
        let nchw = self.configured(call, x_desc)?;
        for &desc in other {
            if self.configured(call, desc)? != nchw {
                return Err(bad_parm(call));
            }
        }
        if self.configured(call, param_desc)? != [1, nchw[1], 1, 1] {
            return Err(bad_parm(call));
        }
        if nchw[0] * nchw[2] * nchw[3] == 0 || nchw[1] == 0 {
            return Err(bad_parm(call));
        }
        Ok(nchw)
    }
}

fn bad_parm(call: &'static str) -> MiopenError {
    MiopenError::Status { call, status: MiopenStatus::BadParm }
}

fn check_len(call: &'static str, len: usize, expected: usize) -> Result<()> {
    if len == expected { Ok(()) } else { Err(bad_parm(call)) }
}

fn blend(alpha: f32, beta: f32, result: f64, prior: f32) -> f32 {
    if beta == 0.0 {
        (f64::from(alpha) * result) as f32
    } else {
        (f64::from(alpha) * result + f64::from(beta) * f64::from(prior)) as f32
    }
}

/// Flat NCHW offsets of channel `c`, in batch-then-spatial order.
fn channel_offsets(nchw: [usize; 4], c: usize) -> impl Iterator<Item = usize> {
    let [n, channels, h, w] = nchw;
    let hw = h * w;
    (0..n).flat_map(move |b| {
        let base = (b * channels + c) * hw;
        base..base + hw
    })
}

impl MiopenApi for HostMiopen {
    fn name(&self) -> &'static str {
        "host"
    }

    fn create_tensor_descriptor(&self) -> Result<DescriptorHandle> {
        let mut state = self.lock();
        state.next_handle += 1;
        let handle = DescriptorHandle::from_raw(state.next_handle);
        state.descriptors.insert(handle, HostDescriptor::default());
        state.record(MiopenCall::CreateTensorDescriptor(handle));
        Ok(handle)
    }

    fn set_4d_tensor_descriptor(
        &self,
        desc: DescriptorHandle,
        dtype: MiopenDataType,
        nchw: [usize; 4],
    ) -> Result<()> {
        const CALL: &str = "miopenSet4dTensorDescriptor";
        let mut state = self.lock();
        state.record(MiopenCall::SetTensorDescriptor { desc, nchw });
        if nchw.iter().any(|&d| i32::try_from(d).is_err()) {
            return Err(bad_parm(CALL));
        }
        let entry = state.descriptors.get_mut(&desc).ok_or(MiopenError::UnknownDescriptor(desc))?;
        entry.dtype = Some(dtype);
        entry.nchw = Some(nchw);
        Ok(())
    }

    fn derive_bn_tensor_descriptor(
        &self,
        derived: DescriptorHandle,
        x_desc: DescriptorHandle,
        mode: BatchNormMode,
    ) -> Result<()> {
        const CALL: &str = "miopenDeriveBNTensorDescriptor";
        let mut state = self.lock();
        state.record(MiopenCall::DeriveBnTensorDescriptor { derived, x_desc });
        let x = *state.descriptors.get(&x_desc).ok_or(MiopenError::UnknownDescriptor(x_desc))?;
        let [_, c, h, w] = x.nchw.ok_or(MiopenError::Status {
            call: CALL,
            status: MiopenStatus::NotInitialized,
        })?;
        let entry =
            state.descriptors.get_mut(&derived).ok_or(MiopenError::UnknownDescriptor(derived))?;
        entry.dtype = x.dtype;
        entry.nchw = Some(match mode {
            BatchNormMode::Spatial => [1, c, 1, 1],
            BatchNormMode::PerActivation => [1, c, h, w],
        });
        Ok(())
    }

    fn destroy_tensor_descriptor(&self, desc: DescriptorHandle) -> Result<()> {
        let mut state = self.lock();
        state.record(MiopenCall::DestroyTensorDescriptor(desc));
        state.descriptors.remove(&desc).map(|_| ()).ok_or(MiopenError::UnknownDescriptor(desc))
    }

    fn batch_norm_forward_inference(&self, args: ForwardInferenceArgs<'_>) -> Result<()> {
        const CALL: &str = "miopenBatchNormalizationForwardInference";
        let nchw = self.configured(CALL, args.x_desc)?;
        self.begin_compute(CALL, MiopenCall::ForwardInference { nchw, epsilon: args.epsilon })?;
        let nchw =
            self.spatial_extents(CALL, args.mode, args.x_desc, &[args.y_desc], args.param_desc)?;
        let numel: usize = nchw.iter().product();
        let c = nchw[1];
        check_len(CALL, args.x.len(), numel)?;
        check_len(CALL, args.y.len(), numel)?;
        for param in [args.scale, args.bias, args.estimated_mean, args.estimated_variance] {
            check_len(CALL, param.len(), c)?;
        }
        debug!(nchw = ?nchw, epsilon = args.epsilon, "host batch-norm inference");

        for ch in 0..c {
            let mean = f64::from(args.estimated_mean[ch]);
            let inv_std = 1.0 / (f64::from(args.estimated_variance[ch]) + args.epsilon).sqrt();
            let scale = f64::from(args.scale[ch]);
            let bias = f64::from(args.bias[ch]);
            for idx in channel_offsets(nchw, ch) {
                let r = scale * (f64::from(args.x[idx]) - mean) * inv_std + bias;
                args.y[idx] = blend(args.alpha, args.beta, r, args.y[idx]);
            }
        }
        Ok(())
    }

    fn batch_norm_forward_training(&self, args: ForwardTrainingArgs<'_>) -> Result<()> {
        const CALL: &str = "miopenBatchNormalizationForwardTraining";
        let nchw = self.configured(CALL, args.x_desc)?;
        self.begin_compute(
            CALL,
            MiopenCall::ForwardTraining {
                nchw,
                epsilon: args.epsilon,
                exp_avg_factor: args.exp_avg_factor,
            },
        )?;
        let nchw =
            self.spatial_extents(CALL, args.mode, args.x_desc, &[args.y_desc], args.param_desc)?;
        let numel: usize = nchw.iter().product();
        let c = nchw[1];
        check_len(CALL, args.x.len(), numel)?;
        check_len(CALL, args.y.len(), numel)?;
        for len in [
            args.scale.len(),
            args.bias.len(),
            args.running_mean.len(),
            args.running_variance.len(),
            args.saved_mean.len(),
            args.saved_inv_variance.len(),
        ] {
            check_len(CALL, len, c)?;
        }
        debug!(
            nchw = ?nchw,
            epsilon = args.epsilon,
            exp_avg_factor = args.exp_avg_factor,
            "host batch-norm training"
        );

        let m = (nchw[0] * nchw[2] * nchw[3]) as f64;
        let factor = args.exp_avg_factor;
        for ch in 0..c {
            let sum: f64 = channel_offsets(nchw, ch).map(|i| f64::from(args.x[i])).sum();
            let mean = sum / m;
            let sq: f64 = channel_offsets(nchw, ch)
                .map(|i| {
                    let d = f64::from(args.x[i]) - mean;
                    d * d
                })
                .sum();
            let var = sq / m;
            let inv_std = 1.0 / (var + args.epsilon).sqrt();
            let scale = f64::from(args.scale[ch]);
            let bias = f64::from(args.bias[ch]);
            for idx in channel_offsets(nchw, ch) {
                let r = scale * (f64::from(args.x[idx]) - mean) * inv_std + bias;
                args.y[idx] = blend(args.alpha, args.beta, r, args.y[idx]);
            }

            let unbiased = if m > 1.0 { sq / (m - 1.0) } else { var };
            args.running_mean[ch] =
                ((1.0 - factor) * f64::from(args.running_mean[ch]) + factor * mean) as f32;
            args.running_variance[ch] =
                ((1.0 - factor) * f64::from(args.running_variance[ch]) + factor * unbiased) as f32;
            args.saved_mean[ch] = mean as f32;
            args.saved_inv_variance[ch] = inv_std as f32;
        }
        Ok(())
    }

    fn batch_norm_backward(&self, args: BackwardArgs<'_>) -> Result<()> {
        const CALL: &str = "miopenBatchNormalizationBackward";
        let nchw = self.configured(CALL, args.x_desc)?;
        self.begin_compute(CALL, MiopenCall::Backward { nchw, epsilon: args.epsilon })?;
        let nchw = self.spatial_extents(
            CALL,
            args.mode,
            args.x_desc,
            &[args.dy_desc, args.dx_desc],
            args.param_desc,
        )?;
        let numel: usize = nchw.iter().product();
        let c = nchw[1];
        check_len(CALL, args.x.len(), numel)?;
        check_len(CALL, args.dy.len(), numel)?;
        check_len(CALL, args.dx.len(), numel)?;
        for len in [
            args.scale.len(),
            args.scale_diff.len(),
            args.bias_diff.len(),
            args.saved_mean.len(),
            args.saved_inv_variance.len(),
        ] {
            check_len(CALL, len, c)?;
        }
        debug!(nchw = ?nchw, epsilon = args.epsilon, "host batch-norm backward");

        let m = (nchw[0] * nchw[2] * nchw[3]) as f64;
        for ch in 0..c {
            let mean = f64::from(args.saved_mean[ch]);
            let inv_std = f64::from(args.saved_inv_variance[ch]);
            let mut sum_dy = 0.0f64;
            let mut sum_dy_xhat = 0.0f64;
            for idx in channel_offsets(nchw, ch) {
                let dy = f64::from(args.dy[idx]);
                sum_dy += dy;
                sum_dy_xhat += dy * (f64::from(args.x[idx]) - mean) * inv_std;
            }

            let k = f64::from(args.scale[ch]) * inv_std / m;
            for idx in channel_offsets(nchw, ch) {
                let x_hat = (f64::from(args.x[idx]) - mean) * inv_std;
                let dx = k * (m * f64::from(args.dy[idx]) - sum_dy - x_hat * sum_dy_xhat);
                args.dx[idx] = blend(args.alpha_data, args.beta_data, dx, args.dx[idx]);
            }
            args.scale_diff[ch] =
                blend(args.alpha_param, args.beta_param, sum_dy_xhat, args.scale_diff[ch]);
            args.bias_diff[ch] = blend(args.alpha_param, args.beta_param, sum_dy, args.bias_diff[ch]);
        }
        Ok(())
    }
}
