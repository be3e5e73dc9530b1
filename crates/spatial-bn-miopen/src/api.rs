//! The vendor boundary: the subset of the MIOpen API used by spatial BN.
//!
//! Every entry point returns a [`Result`]; implementations map any
//! non-success `miopenStatus_t` to [`MiopenError::Status`](crate::MiopenError).

use crate::status::Result;

/// Smallest epsilon MIOpen accepts for batch normalization.
pub const MIOPEN_BN_MIN_EPSILON: f64 = 1e-6;

/// Opaque handle to a tensor descriptor owned by a [`MiopenApi`] backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHandle(usize);

impl DescriptorHandle {
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> usize {
        self.0
    }
}

/// `miopenDataType_t` values used here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MiopenDataType {
    Half = 0,
    Float = 1,
}

/// `miopenBatchNormMode_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum BatchNormMode {
    PerActivation = 0,
    /// Statistics per channel over batch and spatial axes.
    Spatial = 1,
}

/// Arguments of `miopenBatchNormalizationForwardInference`.
pub struct ForwardInferenceArgs<'a> {
    pub mode: BatchNormMode,
    pub alpha: f32,
    pub beta: f32,
    pub x_desc: DescriptorHandle,
    pub x: &'a [f32],
    pub y_desc: DescriptorHandle,
    pub y: &'a mut [f32],
    pub param_desc: DescriptorHandle,
    pub scale: &'a [f32],
    pub bias: &'a [f32],
    pub estimated_mean: &'a [f32],
    pub estimated_variance: &'a [f32],
    pub epsilon: f64,
}

/// Arguments of `miopenBatchNormalizationForwardTraining`.
pub struct ForwardTrainingArgs<'a> {
    pub mode: BatchNormMode,
    pub alpha: f32,
    pub beta: f32,
    pub x_desc: DescriptorHandle,
    pub x: &'a [f32],
    pub y_desc: DescriptorHandle,
    pub y: &'a mut [f32],
    pub param_desc: DescriptorHandle,
    pub scale: &'a [f32],
    pub bias: &'a [f32],
    /// Weight of the current batch in the running-statistics update.
    pub exp_avg_factor: f64,
    pub running_mean: &'a mut [f32],
    pub running_variance: &'a mut [f32],
    pub epsilon: f64,
    pub saved_mean: &'a mut [f32],
    pub saved_inv_variance: &'a mut [f32],
}

/// Arguments of `miopenBatchNormalizationBackward`.
pub struct BackwardArgs<'a> {
    pub mode: BatchNormMode,
    pub alpha_data: f32,
    pub beta_data: f32,
    pub alpha_param: f32,
    pub beta_param: f32,
    pub x_desc: DescriptorHandle,
    pub x: &'a [f32],
    pub dy_desc: DescriptorHandle,
    pub dy: &'a [f32],
    pub dx_desc: DescriptorHandle,
    pub dx: &'a mut [f32],
    pub param_desc: DescriptorHandle,
    pub scale: &'a [f32],
    pub scale_diff: &'a mut [f32],
    pub bias_diff: &'a mut [f32],
    pub epsilon: f64,
    pub saved_mean: &'a [f32],
    pub saved_inv_variance: &'a [f32],
}

/// A loaded MIOpen library (or a stand-in) bound to one device handle.
pub trait MiopenApi: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    fn create_tensor_descriptor(&self) -> Result<DescriptorHandle>;

    fn set_4d_tensor_descriptor(
        &self,
        desc: DescriptorHandle,
        dtype: MiopenDataType,
        nchw: [usize; 4],
    ) -> Result<()>;

    /// Configure `derived` as the scale/bias/statistics descriptor matching `x_desc`.
    fn derive_bn_tensor_descriptor(
        &self,
        derived: DescriptorHandle,
        x_desc: DescriptorHandle,
        mode: BatchNormMode,
    ) -> Result<()>;

    fn destroy_tensor_descriptor(&self, desc: DescriptorHandle) -> Result<()>;

    fn batch_norm_forward_inference(&self, args: ForwardInferenceArgs<'_>) -> Result<()>;

    fn batch_norm_forward_training(&self, args: ForwardTrainingArgs<'_>) -> Result<()>;

    fn batch_norm_backward(&self, args: BackwardArgs<'_>) -> Result<()>;
}
