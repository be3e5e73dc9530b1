//! MIOpen status codes and error types.

use crate::api::DescriptorHandle;
use spatial_bn_common::SpatialBnError;
use std::fmt;
use thiserror::Error;

/// `miopenStatus_t` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MiopenStatus {
    Success = 0,
    NotInitialized = 1,
    InvalidValue = 2,
    BadParm = 3,
    AllocFailed = 4,
    InternalError = 5,
    NotImplemented = 6,
    UnknownError = 7,
    UnsupportedOp = 8,
    GpuOperationsSkipped = 9,
    VersionMismatch = 10,
}

impl MiopenStatus {
    pub fn from_raw(code: i32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::NotInitialized,
            2 => Self::InvalidValue,
            3 => Self::BadParm,
            4 => Self::AllocFailed,
            5 => Self::InternalError,
            6 => Self::NotImplemented,
            8 => Self::UnsupportedOp,
            9 => Self::GpuOperationsSkipped,
            10 => Self::VersionMismatch,
            _ => Self::UnknownError,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for MiopenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "miopenStatusSuccess",
            Self::NotInitialized => "miopenStatusNotInitialized",
            Self::InvalidValue => "miopenStatusInvalidValue",
            Self::BadParm => "miopenStatusBadParm",
            Self::AllocFailed => "miopenStatusAllocFailed",
            Self::InternalError => "miopenStatusInternalError",
            Self::NotImplemented => "miopenStatusNotImplemented",
            Self::UnknownError => "miopenStatusUnknownError",
            Self::UnsupportedOp => "miopenStatusUnsupportedOp",
            Self::GpuOperationsSkipped => "miopenStatusGpuOperationsSkipped",
            Self::VersionMismatch => "miopenStatusVersionMismatch",
        };
        f.write_str(name)
    }
}

/// Errors produced at the MIOpen boundary.
#[derive(Debug, Error)]
pub enum MiopenError {
    #[error("{call} returned {status}")]
    Status { call: &'static str, status: MiopenStatus },

    #[error("HIP call {call} failed with code {code}")]
    Hip { call: &'static str, code: i32 },

    #[error("failed to load {library}: {reason}")]
    LibraryLoad { library: String, reason: String },

    #[error("symbol {0} not found in the loaded library")]
    MissingSymbol(&'static str),

    #[error("unknown tensor descriptor {0:?}")]
    UnknownDescriptor(DescriptorHandle),
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, MiopenError>;

/// Turn a raw `miopenStatus_t` into a `Result`.
pub fn check_status(raw: i32, call: &'static str) -> Result<()> {
    match MiopenStatus::from_raw(raw) {
        MiopenStatus::Success => Ok(()),
        status => Err(MiopenError::Status { call, status }),
    }
}

impl From<MiopenError> for SpatialBnError {
    fn from(err: MiopenError) -> Self {
        match err {
            MiopenError::Status { call, status } => {
                SpatialBnError::Vendor { call, code: status.code(), message: status.to_string() }
            }
            MiopenError::Hip { call, code } => {
                SpatialBnError::Vendor { call, code, message: "HIP runtime error".into() }
            }
            MiopenError::UnknownDescriptor(handle) => SpatialBnError::Vendor {
                call: "descriptor lookup",
                code: MiopenStatus::BadParm.code(),
                message: format!("unknown descriptor {handle:?}"),
            },
            other => SpatialBnError::Config(other.to_string()),
        }
    }
}
