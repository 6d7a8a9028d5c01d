//! Typed n-dimensional arrays exchanged with the neural runtime.
//!
//! A [`Tensor`] couples a shape, an element type, and contiguous storage.
//! Storage is reference-counted: cloning a tensor (e.g. handing the acoustic
//! stage's `mel` and `f0` to the vocoder) bumps a refcount instead of copying
//! bytes. [`Tensor::mutable_data`] is copy-on-write, so a uniquely owned
//! tensor mutates in place.
//!
//! Shape validation beyond element-count consistency is the caller's
//! responsibility.

use std::sync::Arc;

use crate::{Error, Result};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Float32,
    Int64,
    Bool,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn byte_width(self) -> usize {
        match self {
            DataType::Float32 => 4,
            DataType::Int64 => 8,
            DataType::Bool => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::Float32 => "float32",
            DataType::Int64 => "int64",
            DataType::Bool => "bool",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Storage {
    F32(Vec<f32>),
    I64(Vec<i64>),
    Bool(Vec<u8>),
}

impl Storage {
    fn dtype(&self) -> DataType {
        match self {
            Storage::F32(_) => DataType::Float32,
            Storage::I64(_) => DataType::Int64,
            Storage::Bool(_) => DataType::Bool,
        }
    }

    fn len(&self) -> usize {
        match self {
            Storage::F32(v) => v.len(),
            Storage::I64(v) => v.len(),
            Storage::Bool(v) => v.len(),
        }
    }

    fn zeroed(dtype: DataType, len: usize) -> Storage {
        match dtype {
            DataType::Float32 => Storage::F32(vec![0.0; len]),
            DataType::Int64 => Storage::I64(vec![0; len]),
            DataType::Bool => Storage::Bool(vec![0; len]),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        match self {
            Storage::F32(v) => {
                let mut bytes = Vec::with_capacity(v.len() * 4);
                for x in v {
                    bytes.extend_from_slice(&x.to_le_bytes());
                }
                bytes
            }
            Storage::I64(v) => {
                let mut bytes = Vec::with_capacity(v.len() * 8);
                for x in v {
                    bytes.extend_from_slice(&x.to_le_bytes());
                }
                bytes
            }
            Storage::Bool(v) => v.clone(),
        }
    }

    fn from_bytes(dtype: DataType, bytes: &[u8]) -> Storage {
        match dtype {
            DataType::Float32 => Storage::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DataType::Int64 => Storage::I64(
                bytes
                    .chunks_exact(8)
                    .map(|c| {
                        i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                    })
                    .collect(),
            ),
            DataType::Bool => Storage::Bool(bytes.to_vec()),
        }
    }
}

mod sealed {
    use super::{DataType, Storage};

    pub trait Sealed: Copy + Default {
        const DATA_TYPE: DataType;
        fn slice(storage: &Storage) -> Option<&[Self]>;
        fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]>;
        fn into_storage(data: Vec<Self>) -> Storage;
    }

    impl Sealed for f32 {
        const DATA_TYPE: DataType = DataType::Float32;
        fn slice(storage: &Storage) -> Option<&[f32]> {
            match storage {
                Storage::F32(v) => Some(v),
                _ => None,
            }
        }
        fn slice_mut(storage: &mut Storage) -> Option<&mut [f32]> {
            match storage {
                Storage::F32(v) => Some(v),
                _ => None,
            }
        }
        fn into_storage(data: Vec<f32>) -> Storage {
            Storage::F32(data)
        }
    }

    impl Sealed for i64 {
        const DATA_TYPE: DataType = DataType::Int64;
        fn slice(storage: &Storage) -> Option<&[i64]> {
            match storage {
                Storage::I64(v) => Some(v),
                _ => None,
            }
        }
        fn slice_mut(storage: &mut Storage) -> Option<&mut [i64]> {
            match storage {
                Storage::I64(v) => Some(v),
                _ => None,
            }
        }
        fn into_storage(data: Vec<i64>) -> Storage {
            Storage::I64(data)
        }
    }

    /// Bool tensors are exchanged as one byte per element (0 or 1), the way
    /// ONNX-style runtimes lay them out.
    impl Sealed for u8 {
        const DATA_TYPE: DataType = DataType::Bool;
        fn slice(storage: &Storage) -> Option<&[u8]> {
            match storage {
                Storage::Bool(v) => Some(v),
                _ => None,
            }
        }
        fn slice_mut(storage: &mut Storage) -> Option<&mut [u8]> {
            match storage {
                Storage::Bool(v) => Some(v),
                _ => None,
            }
        }
        fn into_storage(data: Vec<u8>) -> Storage {
            Storage::Bool(data)
        }
    }
}

/// Rust element types a tensor can hold: `f32`, `i64`, and `u8` (bool).
pub trait Element: sealed::Sealed {}

impl Element for f32 {}
impl Element for i64 {}
impl Element for u8 {}

/// A typed n-dimensional array with reference-counted storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<i64>,
    storage: Arc<Storage>,
}

impl Tensor {
    /// Create a zero-initialised tensor of the given type and shape.
    pub fn create(dtype: DataType, shape: Vec<i64>) -> Result<Tensor> {
        let count = checked_element_count(&shape)?;
        Ok(Tensor {
            shape,
            storage: Arc::new(Storage::zeroed(dtype, count)),
        })
    }

    /// Create a tensor with every element set to `value`.
    pub fn create_filled<T: Element>(shape: Vec<i64>, value: T) -> Result<Tensor> {
        let count = checked_element_count(&shape)?;
        Ok(Tensor {
            shape,
            storage: Arc::new(T::into_storage(vec![value; count])),
        })
    }

    /// Create a rank-0 (scalar) tensor.
    pub fn create_scalar<T: Element>(value: T) -> Tensor {
        Tensor {
            shape: Vec::new(),
            storage: Arc::new(T::into_storage(vec![value])),
        }
    }

    /// Create a tensor by copying a typed slice. The slice length must match
    /// the shape's element count.
    pub fn create_from_view<T: Element>(shape: Vec<i64>, view: &[T]) -> Result<Tensor> {
        let count = checked_element_count(&shape)?;
        if view.len() != count {
            return Err(Error::InvalidArgument(format!(
                "tensor data length mismatch: shape {:?} needs {} elements, got {}",
                shape,
                count,
                view.len()
            )));
        }
        Ok(Tensor {
            shape,
            storage: Arc::new(T::into_storage(view.to_vec())),
        })
    }

    /// Create a tensor from little-endian raw bytes, taking ownership.
    pub fn create_from_raw(dtype: DataType, shape: Vec<i64>, bytes: Vec<u8>) -> Result<Tensor> {
        let count = checked_element_count(&shape)?;
        let expected = count * dtype.byte_width();
        if bytes.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "tensor byte length mismatch: shape {:?} as {} needs {} bytes, got {}",
                shape,
                dtype.name(),
                expected,
                bytes.len()
            )));
        }
        Ok(Tensor {
            shape,
            storage: Arc::new(Storage::from_bytes(dtype, &bytes)),
        })
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.storage.dtype()
    }

    pub fn element_count(&self) -> usize {
        self.storage.len()
    }

    pub fn byte_size(&self) -> usize {
        self.storage.len() * self.storage.dtype().byte_width()
    }

    /// Serialise the storage to little-endian bytes.
    pub fn raw_bytes(&self) -> Vec<u8> {
        self.storage.to_bytes()
    }

    /// Typed read-only view. Fails if `T` does not match the element type.
    pub fn view<T: Element>(&self) -> Result<&[T]> {
        T::slice(&self.storage).ok_or_else(|| self.dtype_mismatch::<T>())
    }

    /// Typed mutable view. Fails if `T` does not match the element type.
    ///
    /// Copy-on-write: if the storage is shared, it is cloned first.
    pub fn mutable_data<T: Element>(&mut self) -> Result<&mut [T]> {
        // Probe the type before make_mut so a mismatch does not force a copy.
        if T::slice(&self.storage).is_none() {
            return Err(self.dtype_mismatch::<T>());
        }
        let storage = Arc::make_mut(&mut self.storage);
        T::slice_mut(storage).ok_or_else(|| {
            Error::Session("tensor storage changed type during mutation".to_string())
        })
    }

    fn dtype_mismatch<T: Element>(&self) -> Error {
        Error::InvalidArgument(format!(
            "tensor element type mismatch: requested {}, stored {}",
            T::DATA_TYPE.name(),
            self.dtype().name()
        ))
    }
}

fn checked_element_count(shape: &[i64]) -> Result<usize> {
    let mut count: usize = 1;
    for &dim in shape {
        if dim < 0 {
            return Err(Error::InvalidArgument(format!(
                "tensor shape {shape:?} has a negative dimension"
            )));
        }
        count = count.checked_mul(dim as usize).ok_or_else(|| {
            Error::InvalidArgument(format!("tensor shape {shape:?} overflows element count"))
        })?;
    }
    Ok(count)
}
