//! Common types for spatial batch normalization
//!
//! This crate provides the foundational types shared by the MIOpen binding,
//! the CPU fallback kernels and the operators: operator arguments, error
//! handling, a host tensor abstraction and rate-limited warnings.

pub mod config;
pub mod error;
pub mod io;
pub mod tensor;
pub mod warn_once;

pub use config::*;
pub use error::*;
pub use io::*;
pub use tensor::*;
pub use warn_once::warn_once_fn;
