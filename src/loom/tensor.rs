use std::sync::Arc;

use derive_more::Display;
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    device::{Device, DeviceError},
    num::{Bool, DataType, Scalar},
};

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("tensor type error: data type {0} mismatches {1}")]
    Type(DataType, DataType),
    #[error("tensor creation error: dims {dims:?} of {data_type} not match data size {size}")]
    Create {
        dims: Arc<[usize]>,
        data_type: DataType,
        size: usize,
    },
    #[error("tensor integer view error: data type {0} is not an integer type")]
    Integer(DataType),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId;

/// Where the contents of a tensor come from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Origin {
    /// Fixed at model-load time.
    Initializer,
    /// Computed while the model runs.
    #[default]
    Runtime,
}

/// Number of elements implied by `dims`. A rank-0 tensor holds one element.
#[inline]
pub fn element_count(dims: &[usize]) -> usize {
    dims.iter().product()
}

/// Byte size of `dims` elements of `r#type`, or `None` if it does not fit in `usize`.
pub fn checked_data_size(dims: &[usize], r#type: DataType) -> Option<usize> {
    dims.iter().try_fold(r#type.size(), |acc, &x| acc.checked_mul(x))
}

/// An N-dimensional array living on a device. The shape never changes after construction.
#[derive(Debug, Clone)]
pub struct Tensor<D: Device> {
    device: D,
    dims: Arc<[usize]>,
    r#type: DataType,
    origin: Origin,
    buffer: D::Buffer,
    /// Host copy of the contents, kept for integer tensors created from host data.
    host: Option<Arc<[u8]>>,
    id: uid::Id<TensorId>,
}

impl<D: Device> Tensor<D> {
    /// Wraps a device buffer. Fails if the buffer's size does not match the dims and type.
    pub fn from_buffer(
        device: D,
        dims: impl Into<Arc<[usize]>>,
        r#type: DataType,
        origin: Origin,
        buffer: D::Buffer,
    ) -> Result<Self, TensorError> {
        let dims = dims.into();
        let size = device.size(&buffer);
        if checked_data_size(&dims, r#type) != Some(size) {
            let data_type = r#type;
            return Err(TensorError::Create {
                dims,
                data_type,
                size,
            });
        }
        let id = uid::Id::new();
        Ok(Self {
            device,
            dims,
            r#type,
            origin,
            buffer,
            host: None,
            id,
        })
    }

    fn upload<T: Scalar>(
        device: &D,
        dims: impl Into<Arc<[usize]>>,
        contents: &[T],
        origin: Origin,
    ) -> Result<Self, TensorError> {
        let dims = dims.into();
        let r#type = T::DATA_TYPE;
        let contents: &[u8] = bytemuck::cast_slice(contents);
        if checked_data_size(&dims, r#type) != Some(contents.len()) {
            let (data_type, size) = (r#type, contents.len());
            return Err(TensorError::Create {
                dims,
                data_type,
                size,
            });
        }

        let buffer = device.upload(r#type, contents)?;
        let mut tensor = Self::from_buffer(device.clone(), dims, r#type, origin, buffer)?;
        if r#type.is_integer() {
            tensor.host = Some(contents.into());
        }
        Ok(tensor)
    }

    /// Create a runtime tensor from host data.
    #[inline]
    pub fn create<T: Scalar>(
        device: &D,
        dims: impl Into<Arc<[usize]>>,
        contents: &[T],
    ) -> Result<Self, TensorError> {
        Self::upload(device, dims, contents, Origin::Runtime)
    }

    /// Create an initializer tensor from host data.
    #[inline]
    pub fn initializer<T: Scalar>(
        device: &D,
        dims: impl Into<Arc<[usize]>>,
        contents: &[T],
    ) -> Result<Self, TensorError> {
        Self::upload(device, dims, contents, Origin::Initializer)
    }

    /// Create a runtime [`DataType::Bool`] tensor from host booleans.
    pub fn from_bools(
        device: &D,
        dims: impl Into<Arc<[usize]>>,
        contents: &[bool],
    ) -> Result<Self, TensorError> {
        let contents = contents.iter().map(|&x| Bool::from(x)).collect_vec();
        Self::create(device, dims, &contents)
    }

    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[inline]
    pub fn dims(&self) -> Arc<[usize]> {
        self.dims.clone()
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        element_count(&self.dims)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.r#type
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.len() * self.r#type.size()
    }

    #[inline]
    pub fn origin(&self) -> Origin {
        self.origin
    }

    #[inline]
    pub fn is_initializer(&self) -> bool {
        matches!(self.origin, Origin::Initializer)
    }

    #[inline]
    pub fn buffer(&self) -> &D::Buffer {
        &self.buffer
    }

    #[inline]
    pub fn id(&self) -> uid::Id<TensorId> {
        self.id
    }

    /// Raw contents, from the host copy if there is one, otherwise read back from the device.
    fn bytes(&self) -> Result<Arc<[u8]>, TensorError> {
        match &self.host {
            Some(host) => Ok(host.clone()),
            None => Ok(self.device.read(self.r#type, &self.buffer)?.into()),
        }
    }

    /// Host-readable view of an integer tensor, widened to `i64`.
    pub fn integer_data(&self) -> Result<Arc<[i64]>, TensorError> {
        if !self.r#type.is_integer() {
            return Err(TensorError::Integer(self.r#type));
        }
        let bytes = self.bytes()?;
        let data = bytes
            .chunks_exact(self.r#type.size())
            .map(|x| self.r#type.to_integer(x))
            .collect::<Option<Arc<[i64]>>>()
            .ok_or(TensorError::Integer(self.r#type))?;
        Ok(data)
    }

    /// Read back the contents of the tensor from the device.
    pub fn back<T: Scalar>(&self) -> Result<Box<[T]>, TensorError> {
        if self.r#type != T::DATA_TYPE {
            return Err(TensorError::Type(self.r#type, T::DATA_TYPE));
        }
        let bytes = self.bytes()?;
        Ok(bytemuck::pod_collect_to_vec(&bytes[..]).into_boxed_slice())
    }

    /// Boolean view of the tensor: every strictly positive element reads as `true`.
    /// A [`DataType::Bool`] tensor is returned as is.
    pub fn logical(&self) -> Result<Self, TensorError> {
        if self.r#type == DataType::Bool {
            return Ok(self.clone());
        }
        let buffer = self.device.logical(self.r#type, &self.buffer)?;
        let dims = self.dims.clone();
        Self::from_buffer(self.device.clone(), dims, DataType::Bool, self.origin, buffer)
    }
}
