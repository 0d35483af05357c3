//! Opaque tensor values.
//!
//! The scheduler moves tensors between submitters, models and results but
//! never inspects their contents. Cloning is cheap: the byte buffer is
//! shared, so a task holding inputs and a result holding outputs do not
//! duplicate storage.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Float32,
    Float16,
    Int32,
    Int8,
    UInt8,
    Bool,
}

impl DataType {
    /// Size of one element in bytes.
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::Float32 | DataType::Int32 => 4,
            DataType::Float16 => 2,
            DataType::Int8 | DataType::UInt8 | DataType::Bool => 1,
        }
    }
}

/// Placement of a tensor's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    /// CUDA device with its ordinal.
    Cuda(usize),
}

impl Default for Device {
    fn default() -> Self {
        Device::Cpu
    }
}

/// Tensor shape. A `-1` entry marks a dynamic dimension (resolved per batch).
pub type Shape = Vec<i64>;

/// Number of elements for a shape, treating dynamic dimensions as 1.
#[must_use]
pub fn element_count(shape: &[i64]) -> usize {
    shape
        .iter()
        .map(|&d| if d < 0 { 1 } else { d as usize })
        .product()
}

/// An opaque, cheaply cloneable tensor value.
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Shape,
    dtype: DataType,
    device: Device,
    data: Arc<Vec<u8>>,
}

impl Tensor {
    /// Create a zero-filled tensor. All dimensions must be concrete.
    pub fn zeros(shape: Shape, dtype: DataType, device: Device) -> Result<Self> {
        if shape.iter().any(|&d| d < 0) {
            return Err(Error::InvalidArgument(format!(
                "cannot allocate tensor with dynamic shape {shape:?}"
            )));
        }
        let bytes = element_count(&shape) * dtype.size_in_bytes();
        Ok(Self {
            shape,
            dtype,
            device,
            data: Arc::new(vec![0u8; bytes]),
        })
    }

    /// Wrap an existing byte buffer. The buffer length must match the shape.
    pub fn from_bytes(
        data: Vec<u8>,
        shape: Shape,
        dtype: DataType,
        device: Device,
    ) -> Result<Self> {
        if shape.iter().any(|&d| d < 0) {
            return Err(Error::InvalidArgument(format!(
                "cannot wrap buffer with dynamic shape {shape:?}"
            )));
        }
        let expected = element_count(&shape) * dtype.size_in_bytes();
        if data.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "buffer of {} bytes does not match shape {shape:?} ({expected} bytes)",
                data.len()
            )));
        }
        Ok(Self {
            shape,
            dtype,
            device,
            data: Arc::new(data),
        })
    }

    #[must_use]
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    #[must_use]
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw bytes of the tensor. Backends interpret these; the scheduler
    /// never does.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Reinterpret the tensor with a new shape of the same element count.
    /// No data is copied.
    pub fn reshape(&self, new_shape: Shape) -> Result<Self> {
        if new_shape.iter().any(|&d| d < 0)
            || element_count(&new_shape) != element_count(&self.shape)
        {
            return Err(Error::InvalidArgument(format!(
                "cannot reshape {:?} into {new_shape:?}",
                self.shape
            )));
        }
        Ok(Self {
            shape: new_shape,
            dtype: self.dtype,
            device: self.device,
            data: Arc::clone(&self.data),
        })
    }

    /// Retarget the tensor to another device. The core treats placement as a
    /// label; actual transfer is the backend's concern.
    #[must_use]
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            shape: self.shape.clone(),
            dtype: self.dtype,
            device,
            data: Arc::clone(&self.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros_allocates_expected_bytes() {
        let t = Tensor::zeros(vec![2, 3], DataType::Float32, Device::Cpu).unwrap();
        assert_eq!(t.byte_size(), 2 * 3 * 4);
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.dtype(), DataType::Float32);
    }

    #[test]
    fn test_zeros_rejects_dynamic_shape() {
        let err = Tensor::zeros(vec![-1, 3], DataType::Float32, Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_from_bytes_checks_length() {
        let err =
            Tensor::from_bytes(vec![0u8; 7], vec![2], DataType::Float32, Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let ok = Tensor::from_bytes(vec![0u8; 8], vec![2], DataType::Float32, Device::Cpu);
        assert!(ok.is_ok());
    }

    #[test]
    fn test_clone_shares_buffer() {
        let t = Tensor::zeros(vec![16], DataType::UInt8, Device::Cpu).unwrap();
        let c = t.clone();
        assert!(Arc::ptr_eq(&t.data, &c.data));
    }

    #[test]
    fn test_reshape_preserves_element_count() {
        let t = Tensor::zeros(vec![2, 6], DataType::Int8, Device::Cpu).unwrap();
        let r = t.reshape(vec![3, 4]).unwrap();
        assert_eq!(r.shape(), &[3, 4]);
        assert!(t.reshape(vec![5]).is_err());
    }

    #[test]
    fn test_element_count_treats_dynamic_as_one() {
        assert_eq!(element_count(&[-1, 3, 224, 224]), 3 * 224 * 224);
    }
}
