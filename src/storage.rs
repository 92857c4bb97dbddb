//! Tensor storage abstraction
//!
//! A `Storage` is a flat typed host buffer. Tensors hold it through a
//! reference-counted [`Memory`] so that view ops (reshape) alias the same
//! buffer instead of copying.

use crate::dtype::{DType, Element};
use crate::error::{GraphError, Result};
use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

/// Flat host buffer, tagged by element type
#[derive(Clone, PartialEq)]
pub enum Storage {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
}

impl Storage {
    /// Zero-filled buffer of `len` elements
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => Storage::F32(vec![0.0; len]),
            DType::F64 => Storage::F64(vec![0.0; len]),
            DType::I32 => Storage::I32(vec![0; len]),
        }
    }

    /// Buffer filled with a constant, converted to `dtype`
    pub fn filled(dtype: DType, len: usize, value: f64) -> Self {
        match dtype {
            DType::F32 => Storage::F32(vec![value as f32; len]),
            DType::F64 => Storage::F64(vec![value; len]),
            DType::I32 => Storage::I32(vec![value as i32; len]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Storage::F32(_) => DType::F32,
            Storage::F64(_) => DType::F64,
            Storage::I32(_) => DType::I32,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Storage::F32(d) => d.len(),
            Storage::F64(d) => d.len(),
            Storage::I32(d) => d.len(),
        }
    }
}

impl<T: Element> From<Vec<T>> for Storage {
    fn from(data: Vec<T>) -> Self {
        let mut storage = Storage::zeros(T::DTYPE, data.len());
        if let Some(dest) = T::slice_mut(&mut storage) {
            dest.copy_from_slice(&data);
        }
        storage
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Storage::{}({} elements)", self.dtype(), self.len())
    }
}

/// Shared handle to a buffer. Cloning aliases, it never copies.
pub type MemoryRef = Rc<Memory>;

/// Interior-mutable buffer owned by one or more tensors
#[derive(Debug)]
pub struct Memory {
    storage: RefCell<Storage>,
}

impl Memory {
    pub fn new(storage: Storage) -> MemoryRef {
        Rc::new(Memory {
            storage: RefCell::new(storage),
        })
    }

    pub fn zeros(dtype: DType, len: usize) -> MemoryRef {
        Self::new(Storage::zeros(dtype, len))
    }

    pub fn dtype(&self) -> DType {
        self.storage.borrow().dtype()
    }

    pub(crate) fn len(&self) -> usize {
        self.storage.borrow().len()
    }

    /// Read-only typed view of the buffer
    pub fn host_data<T: Element>(&self) -> Result<Ref<'_, [T]>> {
        let storage = self.storage.borrow();
        let actual = storage.dtype();
        Ref::filter_map(storage, |s| T::slice(s)).map_err(|_| GraphError::DTypeMismatch {
            expected: T::DTYPE,
            actual,
        })
    }

    /// Mutable typed view of the buffer
    ///
    /// This does not touch any dirty flags; callers going through a
    /// `Tensor` should use its mutable accessors instead.
    pub fn mutable_host_data<T: Element>(&self) -> Result<RefMut<'_, [T]>> {
        let storage = self.storage.borrow_mut();
        let actual = storage.dtype();
        RefMut::filter_map(storage, |s| T::slice_mut(s)).map_err(|_| {
            GraphError::DTypeMismatch {
                expected: T::DTYPE,
                actual,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_from_vec() {
        let s = Storage::from(vec![1.0f32, 2.0, 3.0]);
        assert_eq!(s.dtype(), DType::F32);
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn test_memory_alias_sees_writes() {
        let mem = Memory::new(Storage::from(vec![1.0f32, 2.0]));
        let alias = Rc::clone(&mem);
        mem.mutable_host_data::<f32>().unwrap()[1] = 5.0;
        assert_eq!(&*alias.host_data::<f32>().unwrap(), &[1.0, 5.0]);
    }

    #[test]
    fn test_memory_dtype_mismatch() {
        let mem = Memory::zeros(DType::I32, 4);
        assert!(matches!(
            mem.host_data::<f32>(),
            Err(GraphError::DTypeMismatch {
                expected: DType::F32,
                actual: DType::I32
            })
        ));
    }
}
