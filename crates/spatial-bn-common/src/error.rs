//! Error types shared across the spatial batch-norm workspace.

use crate::tensor::DataType;
use thiserror::Error;

/// Top-level error for spatial batch normalization.
///
/// Every variant is unrecoverable from the operator's point of view: the
/// call that produced it has written no partial result worth keeping.
#[derive(Debug, Error)]
pub enum SpatialBnError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Only `float32` inputs are accepted by the operators.
    #[error("Unsupported data type {dtype} for operator {operator}; only float32 is supported")]
    UnsupportedDataType { operator: &'static str, dtype: DataType },

    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("MIOpen call {call} failed with status {code} ({message})")]
    Vendor { call: &'static str, code: i32, message: String },
}

impl SpatialBnError {
    /// Build a [`SpatialBnError::Validation`] from anything printable.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    /// Status code reported by the vendor library, if this error came from it.
    pub fn vendor_code(&self) -> Option<i32> {
        match self {
            Self::Vendor { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Errors raised by the CPU fallback kernels.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Invalid kernel arguments: {reason}")]
    InvalidArguments { reason: String },
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, SpatialBnError>;
