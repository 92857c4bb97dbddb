//! Element type tags for tensor buffers
//!
//! Every buffer carries a `DType` tag. Kernels declare the tags they accept
//! in their `OpAlgoSchema`, and typed buffer access goes through the
//! [`Element`] trait so a mismatched read fails instead of reinterpreting bytes.

use crate::storage::Storage;
use std::fmt;

/// Supported tensor element types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum DType {
    /// 32-bit floating point (default)
    #[default]
    F32 = 0,
    /// 64-bit floating point
    F64 = 1,
    /// 32-bit signed integer
    I32 = 2,
}

impl DType {
    /// Returns the name of this dtype as used in op schemas
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::I32 => "int32",
        }
    }

    #[must_use]
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A scalar type that can live in a tensor buffer
pub trait Element: Copy + Default + fmt::Debug + 'static {
    const DTYPE: DType;

    fn slice(storage: &Storage) -> Option<&[Self]>;

    fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]>;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    fn slice(storage: &Storage) -> Option<&[Self]> {
        match storage {
            Storage::F32(data) => Some(data),
            _ => None,
        }
    }

    fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]> {
        match storage {
            Storage::F32(data) => Some(data),
            _ => None,
        }
    }
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;

    fn slice(storage: &Storage) -> Option<&[Self]> {
        match storage {
            Storage::F64(data) => Some(data),
            _ => None,
        }
    }

    fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]> {
        match storage {
            Storage::F64(data) => Some(data),
            _ => None,
        }
    }
}

impl Element for i32 {
    const DTYPE: DType = DType::I32;

    fn slice(storage: &Storage) -> Option<&[Self]> {
        match storage {
            Storage::I32(data) => Some(data),
            _ => None,
        }
    }

    fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]> {
        match storage {
            Storage::I32(data) => Some(data),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_name() {
        assert_eq!(DType::F32.name(), "float32");
        assert_eq!(DType::I32.to_string(), "int32");
        assert!(DType::F64.is_float());
        assert!(!DType::I32.is_float());
    }

    #[test]
    fn test_element_slice_rejects_other_dtype() {
        let storage = Storage::zeros(DType::F32, 3);
        assert_eq!(f32::slice(&storage), Some(&[0.0f32; 3][..]));
        assert!(f64::slice(&storage).is_none());
        assert!(i32::slice(&storage).is_none());
    }
}
