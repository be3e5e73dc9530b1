//! Host tensor abstraction
//!
//! Operators only borrow tensors: the caller owns every buffer, and
//! operators resize or write outputs in place.

use crate::{Result, SpatialBnError};
use half::f16;
use std::fmt;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F16,
    F32,
    F64,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F16 => f.write_str("float16"),
            Self::F32 => f.write_str("float32"),
            Self::F64 => f.write_str("float64"),
        }
    }
}

/// Typed element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F16(Vec<f16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl TensorData {
    fn len(&self) -> usize {
        match self {
            Self::F16(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
        }
    }

    fn dtype(&self) -> DataType {
        match self {
            Self::F16(_) => DataType::F16,
            Self::F32(_) => DataType::F32,
            Self::F64(_) => DataType::F64,
        }
    }
}

/// N-dimensional host tensor with explicit per-axis extents.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dims: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    fn checked(dims: Vec<usize>, data: TensorData) -> Result<Self> {
        let expected: usize = dims.iter().product();
        if data.len() != expected {
            return Err(SpatialBnError::validation(format!(
                "tensor with dims {dims:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { dims, data })
    }

    pub fn from_f32(dims: &[usize], data: Vec<f32>) -> Result<Self> {
        Self::checked(dims.to_vec(), TensorData::F32(data))
    }

    pub fn from_f16(dims: &[usize], data: Vec<f16>) -> Result<Self> {
        Self::checked(dims.to_vec(), TensorData::F16(data))
    }

    pub fn from_f64(dims: &[usize], data: Vec<f64>) -> Result<Self> {
        Self::checked(dims.to_vec(), TensorData::F64(data))
    }

    /// Zero-filled f32 tensor.
    pub fn zeros(dims: &[usize]) -> Self {
        let numel = dims.iter().product();
        Self { dims: dims.to_vec(), data: TensorData::F32(vec![0.0; numel]) }
    }

    /// Rank-1 f32 tensor with no elements, the state of a never-written output slot.
    pub fn empty() -> Self {
        Self::zeros(&[0])
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Extent of axis `axis`.
    ///
    /// # Panics
    ///
    /// Panics if `axis >= self.ndim()`.
    pub fn dim(&self, axis: usize) -> usize {
        self.dims[axis]
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Ok(v),
            other => Err(SpatialBnError::validation(format!(
                "expected float32 tensor, got {}",
                other.dtype()
            ))),
        }
    }

    pub fn as_f32_mut(&mut self) -> Result<&mut [f32]> {
        match &mut self.data {
            TensorData::F32(v) => Ok(v),
            other => Err(SpatialBnError::validation(format!(
                "expected float32 tensor, got {}",
                other.dtype()
            ))),
        }
    }

    /// Fail with [`SpatialBnError::UnsupportedDataType`] unless the tensor is f32.
    pub fn require_f32(&self, operator: &'static str) -> Result<()> {
        match self.dtype() {
            DataType::F32 => Ok(()),
            dtype => Err(SpatialBnError::UnsupportedDataType { operator, dtype }),
        }
    }

    /// Check that this is a rank-1 tensor of `len` elements.
    pub fn check_vector(&self, name: &str, len: usize) -> Result<()> {
        if self.ndim() != 1 || self.dims[0] != len {
            return Err(SpatialBnError::validation(format!(
                "{name} must have dims [{len}], got {:?}",
                self.dims
            )));
        }
        Ok(())
    }

    /// Reshape to `dims` as an f32 tensor.
    ///
    /// Storage is kept when the element type is already f32 and the element
    /// count is unchanged; otherwise fresh zeroed f32 storage is allocated.
    pub fn resize(&mut self, dims: &[usize]) {
        let numel: usize = dims.iter().product();
        let keep = matches!(&self.data, TensorData::F32(v) if v.len() == numel);
        if !keep {
            self.data = TensorData::F32(vec![0.0; numel]);
        }
        self.dims = dims.to_vec();
    }

    /// Overwrite every element with zero, keeping the element type.
    pub fn fill_zero(&mut self) {
        match &mut self.data {
            TensorData::F16(v) => v.fill(f16::ZERO),
            TensorData::F32(v) => v.fill(0.0),
            TensorData::F64(v) => v.fill(0.0),
        }
    }
}
