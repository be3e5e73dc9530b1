//! MIOpen boundary for spatial batch normalization
//!
//! [`MiopenApi`] is the seam between the operators and the vendor library.
//! Two backends implement it:
//!
//! - [`HostMiopen`]: a host-memory reference with MIOpen semantics that also
//!   records every call, used when no ROCm runtime is present and in tests.
//! - `DynamicMiopen` (feature `rocm`): the real library, loaded at runtime.

pub mod api;
pub mod descriptor;
#[cfg(feature = "rocm")]
pub mod ffi;
pub mod host;
pub mod status;

pub use api::{
    BackwardArgs, BatchNormMode, DescriptorHandle, ForwardInferenceArgs, ForwardTrainingArgs,
    MIOPEN_BN_MIN_EPSILON, MiopenApi, MiopenDataType,
};
pub use descriptor::{DescriptorPair, TensorDescriptor};
#[cfg(feature = "rocm")]
pub use ffi::DynamicMiopen;
pub use host::{HostMiopen, MiopenCall};
pub use status::{MiopenError, MiopenStatus, check_status};

use std::sync::Arc;
use tracing::info;

/// Pick the best available backend.
///
/// With the `rocm` feature the real library is tried first; any load failure
/// falls back to [`HostMiopen`].
pub fn select_backend() -> Arc<dyn MiopenApi> {
    #[cfg(feature = "rocm")]
    {
        match DynamicMiopen::load() {
            Ok(miopen) => return Arc::new(miopen),
            Err(e) => info!(error = %e, "MIOpen unavailable, using host backend"),
        }
    }
    #[cfg(not(feature = "rocm"))]
    info!("built without rocm support, using host backend");

    Arc::new(HostMiopen::new())
}
