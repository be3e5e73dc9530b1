//! Dynamically loaded MIOpen binding.
//!
//! [`DynamicMiopen`] resolves the MIOpen and HIP runtime symbols with
//! `libloading`, so the crate builds without ROCm installed. Host slices are
//! staged through device memory for each call: inputs and outputs are copied
//! to the device, the MIOpen entry point runs, outputs are copied back.

use crate::api::{
    BackwardArgs, BatchNormMode, DescriptorHandle, ForwardInferenceArgs, ForwardTrainingArgs,
    MiopenApi, MiopenDataType,
};
use crate::status::{MiopenError, Result, check_status};
use libloading::Library;
use std::ffi::{CStr, c_char, c_int, c_void};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Overrides the MIOpen shared library path.
pub const MIOPEN_LIBRARY_ENV: &str = "SPATIAL_BN_MIOPEN_LIB";

#[cfg(target_os = "windows")]
const MIOPEN_LIBRARY: &str = "MIOpen.dll";
#[cfg(not(target_os = "windows"))]
const MIOPEN_LIBRARY: &str = "libMIOpen.so";

#[cfg(target_os = "windows")]
const HIP_LIBRARY: &str = "amdhip64.dll";
#[cfg(not(target_os = "windows"))]
const HIP_LIBRARY: &str = "libamdhip64.so";

type MiopenHandle = *mut c_void;
type RawDescriptor = *mut c_void;

// hipMemcpyKind
const HIP_MEMCPY_H2D: c_int = 1;
const HIP_MEMCPY_D2H: c_int = 2;

struct MiopenFns {
    create: unsafe extern "C" fn(*mut MiopenHandle) -> c_int,
    destroy: unsafe extern "C" fn(MiopenHandle) -> c_int,
    get_error_string: unsafe extern "C" fn(c_int) -> *const c_char,
    create_tensor_descriptor: unsafe extern "C" fn(*mut RawDescriptor) -> c_int,
    set_4d_tensor_descriptor:
        unsafe extern "C" fn(RawDescriptor, c_int, c_int, c_int, c_int, c_int) -> c_int,
    derive_bn_tensor_descriptor: unsafe extern "C" fn(RawDescriptor, RawDescriptor, c_int) -> c_int,
    destroy_tensor_descriptor: unsafe extern "C" fn(RawDescriptor) -> c_int,
    forward_inference: unsafe extern "C" fn(
        MiopenHandle,
        c_int,
        *mut c_void,
        *mut c_void,
        RawDescriptor,
        *const c_void,
        RawDescriptor,
        *mut c_void,
        RawDescriptor,
        *mut c_void,
        *mut c_void,
        *mut c_void,
        *mut c_void,
        f64,
    ) -> c_int,
    forward_training: unsafe extern "C" fn(
        MiopenHandle,
        c_int,
        *mut c_void,
        *mut c_void,
        RawDescriptor,
        *const c_void,
        RawDescriptor,
        *mut c_void,
        RawDescriptor,
        *mut c_void,
        *mut c_void,
        f64,
        *mut c_void,
        *mut c_void,
        f64,
        *mut c_void,
        *mut c_void,
    ) -> c_int,
    backward: unsafe extern "C" fn(
        MiopenHandle,
        c_int,
        *const c_void,
        *const c_void,
        *const c_void,
        *const c_void,
        RawDescriptor,
        *const c_void,
        RawDescriptor,
        *const c_void,
        RawDescriptor,
        *mut c_void,
        RawDescriptor,
        *const c_void,
        *mut c_void,
        *mut c_void,
        f64,
        *const c_void,
        *const c_void,
    ) -> c_int,
}

struct HipFns {
    malloc: unsafe extern "C" fn(*mut *mut c_void, usize) -> c_int,
    free: unsafe extern "C" fn(*mut c_void) -> c_int,
    memcpy: unsafe extern "C" fn(*mut c_void, *const c_void, usize, c_int) -> c_int,
    device_synchronize: unsafe extern "C" fn() -> c_int,
}

/// Copy a function pointer out of `lib`.
///
/// # Safety
/// `T` must be the exact function-pointer type of the symbol.
unsafe fn symbol<T: Copy>(lib: &Library, name: &'static str) -> Result<T> {
    match unsafe { lib.get::<T>(name.as_bytes()) } {
        Ok(sym) => Ok(*sym),
        Err(_) => Err(MiopenError::MissingSymbol(name)),
    }
}

fn open_library(path: &str) -> Result<Library> {
    unsafe { Library::new(path) }
        .map_err(|e| MiopenError::LibraryLoad { library: path.to_string(), reason: e.to_string() })
}

fn hip_check(code: c_int, call: &'static str) -> Result<()> {
    if code == 0 { Ok(()) } else { Err(MiopenError::Hip { call, code }) }
}

/// Device allocation freed on drop.
struct DeviceBuffer<'a> {
    hip: &'a HipFns,
    ptr: *mut c_void,
    len: usize,
}

impl<'a> DeviceBuffer<'a> {
    fn upload(hip: &'a HipFns, data: &[f32]) -> Result<Self> {
        let bytes = std::mem::size_of_val(data);
        let mut ptr: *mut c_void = std::ptr::null_mut();
        hip_check(unsafe { (hip.malloc)(&mut ptr, bytes) }, "hipMalloc")?;
        let buffer = Self { hip, ptr, len: data.len() };
        hip_check(
            unsafe { (hip.memcpy)(ptr, data.as_ptr().cast(), bytes, HIP_MEMCPY_H2D) },
            "hipMemcpy(H2D)",
        )?;
        Ok(buffer)
    }

    fn download(&self, out: &mut [f32]) -> Result<()> {
        let bytes = std::mem::size_of_val(out).min(self.len * std::mem::size_of::<f32>());
        hip_check(
            unsafe { (self.hip.memcpy)(out.as_mut_ptr().cast(), self.ptr, bytes, HIP_MEMCPY_D2H) },
            "hipMemcpy(D2H)",
        )
    }

    fn ptr(&self) -> *mut c_void {
        self.ptr
    }
}

impl Drop for DeviceBuffer<'_> {
    fn drop(&mut self) {
        let rc = unsafe { (self.hip.free)(self.ptr) };
        if rc != 0 {
            debug!(code = rc, "hipFree failed");
        }
    }
}

fn raw(desc: DescriptorHandle) -> RawDescriptor {
    desc.as_raw() as RawDescriptor
}

fn host_scalar(value: &f32) -> *mut c_void {
    (value as *const f32).cast_mut().cast()
}

/// MIOpen loaded at runtime, bound to one `miopenHandle_t` on the default stream.
pub struct DynamicMiopen {
    handle: MiopenHandle,
    miopen: MiopenFns,
    hip: HipFns,
    // Serialises use of `handle`; MIOpen handles are not thread-safe.
    call_lock: Mutex<()>,
    _miopen_lib: Library,
    _hip_lib: Library,
}

// The raw handle is only used while `call_lock` is held.
unsafe impl Send for DynamicMiopen {}
unsafe impl Sync for DynamicMiopen {}

impl DynamicMiopen {
    /// Load MIOpen and the HIP runtime, and create a library handle.
    pub fn load() -> Result<Self> {
        let miopen_path =
            std::env::var(MIOPEN_LIBRARY_ENV).unwrap_or_else(|_| MIOPEN_LIBRARY.to_string());
        let miopen_lib = open_library(&miopen_path)?;
        let hip_lib = open_library(HIP_LIBRARY)?;

        let miopen = unsafe {
            MiopenFns {
                create: symbol(&miopen_lib, "miopenCreate")?,
                destroy: symbol(&miopen_lib, "miopenDestroy")?,
                get_error_string: symbol(&miopen_lib, "miopenGetErrorString")?,
                create_tensor_descriptor: symbol(&miopen_lib, "miopenCreateTensorDescriptor")?,
                set_4d_tensor_descriptor: symbol(&miopen_lib, "miopenSet4dTensorDescriptor")?,
                derive_bn_tensor_descriptor: symbol(&miopen_lib, "miopenDeriveBNTensorDescriptor")?,
                destroy_tensor_descriptor: symbol(&miopen_lib, "miopenDestroyTensorDescriptor")?,
                forward_inference: symbol(
                    &miopen_lib,
                    "miopenBatchNormalizationForwardInference",
                )?,
                forward_training: symbol(&miopen_lib, "miopenBatchNormalizationForwardTraining")?,
                backward: symbol(&miopen_lib, "miopenBatchNormalizationBackward")?,
            }
        };
        let hip = unsafe {
            HipFns {
                malloc: symbol(&hip_lib, "hipMalloc")?,
                free: symbol(&hip_lib, "hipFree")?,
                memcpy: symbol(&hip_lib, "hipMemcpy")?,
                device_synchronize: symbol(&hip_lib, "hipDeviceSynchronize")?,
            }
        };

        let mut handle: MiopenHandle = std::ptr::null_mut();
        check_status(unsafe { (miopen.create)(&mut handle) }, "miopenCreate")?;
        info!(library = %miopen_path, "loaded MIOpen");

        Ok(Self {
            handle,
            miopen,
            hip,
            call_lock: Mutex::new(()),
            _miopen_lib: miopen_lib,
            _hip_lib: hip_lib,
        })
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        match self.call_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check(&self, raw: c_int, call: &'static str) -> Result<()> {
        if raw != 0 {
            let text = unsafe { (self.miopen.get_error_string)(raw) };
            if !text.is_null() {
                let text = unsafe { CStr::from_ptr(text) }.to_string_lossy();
                debug!(call, code = raw, message = %text, "MIOpen call failed");
            }
        }
        check_status(raw, call)
    }

    fn synchronize(&self) -> Result<()> {
        hip_check(unsafe { (self.hip.device_synchronize)() }, "hipDeviceSynchronize")
    }
}

impl Drop for DynamicMiopen {
    fn drop(&mut self) {
        let rc = unsafe { (self.miopen.destroy)(self.handle) };
        if rc != 0 {
            warn!(code = rc, "miopenDestroy failed");
        }
    }
}

fn dim(d: usize, call: &'static str) -> Result<c_int> {
    c_int::try_from(d).map_err(|_| MiopenError::Status {
        call,
        status: crate::status::MiopenStatus::BadParm,
    })
}

impl MiopenApi for DynamicMiopen {
    fn name(&self) -> &'static str {
        "miopen"
    }

    fn create_tensor_descriptor(&self) -> Result<DescriptorHandle> {
        let mut desc: RawDescriptor = std::ptr::null_mut();
        self.check(
            unsafe { (self.miopen.create_tensor_descriptor)(&mut desc) },
            "miopenCreateTensorDescriptor",
        )?;
        Ok(DescriptorHandle::from_raw(desc as usize))
    }

    fn set_4d_tensor_descriptor(
        &self,
        desc: DescriptorHandle,
        dtype: MiopenDataType,
        nchw: [usize; 4],
    ) -> Result<()> {
        const CALL: &str = "miopenSet4dTensorDescriptor";
        let [n, c, h, w] = nchw;
        let rc = unsafe {
            (self.miopen.set_4d_tensor_descriptor)(
                raw(desc),
                dtype as c_int,
                dim(n, CALL)?,
                dim(c, CALL)?,
                dim(h, CALL)?,
                dim(w, CALL)?,
            )
        };
        self.check(rc, CALL)
    }

    fn derive_bn_tensor_descriptor(
        &self,
        derived: DescriptorHandle,
        x_desc: DescriptorHandle,
        mode: BatchNormMode,
    ) -> Result<()> {
        let rc = unsafe {
            (self.miopen.derive_bn_tensor_descriptor)(raw(derived), raw(x_desc), mode as c_int)
        };
        self.check(rc, "miopenDeriveBNTensorDescriptor")
    }

    fn destroy_tensor_descriptor(&self, desc: DescriptorHandle) -> Result<()> {
        let rc = unsafe { (self.miopen.destroy_tensor_descriptor)(raw(desc)) };
        self.check(rc, "miopenDestroyTensorDescriptor")
    }

    fn batch_norm_forward_inference(&self, args: ForwardInferenceArgs<'_>) -> Result<()> {
        let _guard = self.guard();
        let hip = &self.hip;
        let x = DeviceBuffer::upload(hip, args.x)?;
        let y = DeviceBuffer::upload(hip, args.y)?;
        let scale = DeviceBuffer::upload(hip, args.scale)?;
        let bias = DeviceBuffer::upload(hip, args.bias)?;
        let mean = DeviceBuffer::upload(hip, args.estimated_mean)?;
        let var = DeviceBuffer::upload(hip, args.estimated_variance)?;

        let rc = unsafe {
            (self.miopen.forward_inference)(
                self.handle,
                args.mode as c_int,
                host_scalar(&args.alpha),
                host_scalar(&args.beta),
                raw(args.x_desc),
                x.ptr(),
                raw(args.y_desc),
                y.ptr(),
                raw(args.param_desc),
                scale.ptr(),
                bias.ptr(),
                mean.ptr(),
                var.ptr(),
                args.epsilon,
            )
        };
        self.check(rc, "miopenBatchNormalizationForwardInference")?;
        self.synchronize()?;
        y.download(args.y)
    }

    fn batch_norm_forward_training(&self, args: ForwardTrainingArgs<'_>) -> Result<()> {
        let _guard = self.guard();
        let hip = &self.hip;
        let x = DeviceBuffer::upload(hip, args.x)?;
        let y = DeviceBuffer::upload(hip, args.y)?;
        let scale = DeviceBuffer::upload(hip, args.scale)?;
        let bias = DeviceBuffer::upload(hip, args.bias)?;
        let running_mean = DeviceBuffer::upload(hip, args.running_mean)?;
        let running_var = DeviceBuffer::upload(hip, args.running_variance)?;
        let saved_mean = DeviceBuffer::upload(hip, args.saved_mean)?;
        let saved_inv_var = DeviceBuffer::upload(hip, args.saved_inv_variance)?;

        let rc = unsafe {
            (self.miopen.forward_training)(
                self.handle,
                args.mode as c_int,
                host_scalar(&args.alpha),
                host_scalar(&args.beta),
                raw(args.x_desc),
                x.ptr(),
                raw(args.y_desc),
                y.ptr(),
                raw(args.param_desc),
                scale.ptr(),
                bias.ptr(),
                args.exp_avg_factor,
                running_mean.ptr(),
                running_var.ptr(),
                args.epsilon,
                saved_mean.ptr(),
                saved_inv_var.ptr(),
            )
        };
        self.check(rc, "miopenBatchNormalizationForwardTraining")?;
        self.synchronize()?;
        y.download(args.y)?;
        running_mean.download(args.running_mean)?;
        running_var.download(args.running_variance)?;
        saved_mean.download(args.saved_mean)?;
        saved_inv_var.download(args.saved_inv_variance)
    }

    fn batch_norm_backward(&self, args: BackwardArgs<'_>) -> Result<()> {
        let _guard = self.guard();
        let hip = &self.hip;
        let x = DeviceBuffer::upload(hip, args.x)?;
        let dy = DeviceBuffer::upload(hip, args.dy)?;
        let dx = DeviceBuffer::upload(hip, args.dx)?;
        let scale = DeviceBuffer::upload(hip, args.scale)?;
        let scale_diff = DeviceBuffer::upload(hip, args.scale_diff)?;
        let bias_diff = DeviceBuffer::upload(hip, args.bias_diff)?;
        let saved_mean = DeviceBuffer::upload(hip, args.saved_mean)?;
        let saved_inv_var = DeviceBuffer::upload(hip, args.saved_inv_variance)?;

        let rc = unsafe {
            (self.miopen.backward)(
                self.handle,
                args.mode as c_int,
                host_scalar(&args.alpha_data),
                host_scalar(&args.beta_data),
                host_scalar(&args.alpha_param),
                host_scalar(&args.beta_param),
                raw(args.x_desc),
                x.ptr(),
                raw(args.dy_desc),
                dy.ptr(),
                raw(args.dx_desc),
                dx.ptr(),
                raw(args.param_desc),
                scale.ptr(),
                scale_diff.ptr(),
                bias_diff.ptr(),
                args.epsilon,
                saved_mean.ptr(),
                saved_inv_var.ptr(),
            )
        };
        self.check(rc, "miopenBatchNormalizationBackward")?;
        self.synchronize()?;
        dx.download(args.dx)?;
        scale_diff.download(args.scale_diff)?;
        bias_diff.download(args.bias_diff)
    }
}
