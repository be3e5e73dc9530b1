//! Owned tensor descriptors and the shape-keyed descriptor pair.

use crate::api::{BatchNormMode, DescriptorHandle, MiopenApi, MiopenDataType};
use crate::status::Result;
use std::sync::Arc;
use tracing::{debug, warn};

/// A tensor descriptor destroyed exactly once when dropped.
pub struct TensorDescriptor {
    api: Arc<dyn MiopenApi>,
    handle: DescriptorHandle,
}

impl TensorDescriptor {
    pub fn new(api: Arc<dyn MiopenApi>) -> Result<Self> {
        let handle = api.create_tensor_descriptor()?;
        Ok(Self { api, handle })
    }

    pub fn handle(&self) -> DescriptorHandle {
        self.handle
    }

    pub fn set_4d(&self, dtype: MiopenDataType, nchw: [usize; 4]) -> Result<()> {
        self.api.set_4d_tensor_descriptor(self.handle, dtype, nchw)
    }

    pub fn derive_bn(&self, x: &TensorDescriptor, mode: BatchNormMode) -> Result<()> {
        self.api.derive_bn_tensor_descriptor(self.handle, x.handle, mode)
    }
}

impl Drop for TensorDescriptor {
    fn drop(&mut self) {
        if let Err(e) = self.api.destroy_tensor_descriptor(self.handle) {
            warn!(handle = ?self.handle, error = %e, "failed to destroy tensor descriptor");
        }
    }
}

impl std::fmt::Debug for TensorDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorDescriptor")
            .field("backend", &self.api.name())
            .field("handle", &self.handle)
            .finish()
    }
}

/// Data and parameter descriptors, reconfigured only when the input shape changes.
///
/// The cache key is the full dims of the observed input, so inputs that fold
/// to the same NCHW extents but differ in rank still trigger a refresh.
#[derive(Debug)]
pub struct DescriptorPair {
    data: TensorDescriptor,
    param: TensorDescriptor,
    shape_key: Vec<usize>,
}

impl DescriptorPair {
    pub fn new(api: &Arc<dyn MiopenApi>) -> Result<Self> {
        Ok(Self {
            data: TensorDescriptor::new(Arc::clone(api))?,
            param: TensorDescriptor::new(Arc::clone(api))?,
            shape_key: Vec::new(),
        })
    }

    /// Reconfigure both descriptors for `dims` unless they already describe it.
    ///
    /// Returns `true` when the descriptors were reconfigured. A failure leaves
    /// the cache key stale so the next call retries.
    pub fn refresh(&mut self, dims: &[usize], nchw: [usize; 4]) -> Result<bool> {
        if self.shape_key == dims {
            return Ok(false);
        }
        self.data.set_4d(MiopenDataType::Float, nchw)?;
        self.param.derive_bn(&self.data, BatchNormMode::Spatial)?;
        debug!(dims = ?dims, nchw = ?nchw, "configured batch-norm descriptors");
        self.shape_key = dims.to_vec();
        Ok(true)
    }

    pub fn data(&self) -> DescriptorHandle {
        self.data.handle()
    }

    pub fn param(&self) -> DescriptorHandle {
        self.param.handle()
    }

    /// Dims the descriptors were last configured for; empty before the first refresh.
    pub fn shape_key(&self) -> &[usize] {
        &self.shape_key
    }
}
