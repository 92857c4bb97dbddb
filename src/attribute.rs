//! Typed attribute side-channel
//!
//! Functional builders use attributes to pass scalars and small arrays
//! (a target shape, a dropout ratio) to kernel constructors. Values are a
//! tagged union; reading one with the wrong type is an error.

use crate::error::{GraphError, Result};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    I32(i32),
    F32(f32),
    F64(f64),
    Str(String),
    I32s(Vec<i32>),
    F32s(Vec<f32>),
}

impl AttrValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Bool(_) => "bool",
            AttrValue::I32(_) => "int32",
            AttrValue::F32(_) => "float32",
            AttrValue::F64(_) => "float64",
            AttrValue::Str(_) => "string",
            AttrValue::I32s(_) => "int32s",
            AttrValue::F32s(_) => "float32s",
        }
    }
}

/// Conversion out of an [`AttrValue`] for checked reads
pub trait FromAttr: Sized {
    const TYPE_NAME: &'static str;

    fn from_attr(value: &AttrValue) -> Option<Self>;
}

macro_rules! impl_attr {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl FromAttr for $ty {
            const TYPE_NAME: &'static str = $name;

            fn from_attr(value: &AttrValue) -> Option<Self> {
                match value {
                    AttrValue::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }

        impl From<$ty> for AttrValue {
            fn from(v: $ty) -> Self {
                AttrValue::$variant(v)
            }
        }
    };
}

impl_attr!(bool, Bool, "bool");
impl_attr!(i32, I32, "int32");
impl_attr!(f32, F32, "float32");
impl_attr!(f64, F64, "float64");
impl_attr!(String, Str, "string");
impl_attr!(Vec<i32>, I32s, "int32s");
impl_attr!(Vec<f32>, F32s, "float32s");

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

/// Named attribute set, ordered by name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    attrs: BTreeMap<String, AttrValue>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an attribute
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) {
        self.attrs.insert(name.into(), value.into());
    }

    pub fn has(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    pub fn get_raw(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    pub fn get<T: FromAttr>(&self, name: &str) -> Result<T> {
        let value = self
            .get_raw(name)
            .ok_or_else(|| GraphError::AttrNotFound(name.to_string()))?;
        T::from_attr(value).ok_or_else(|| GraphError::AttrTypeMismatch {
            name: name.to_string(),
            expected: T::TYPE_NAME,
            actual: value.type_name(),
        })
    }

    /// Read an `int32s` attribute as a shape
    pub fn get_shape(&self, name: &str) -> Result<Vec<usize>> {
        self.get::<Vec<i32>>(name)?
            .into_iter()
            .map(|d| {
                usize::try_from(d).map_err(|_| {
                    GraphError::InvalidParameter(format!("attribute `{name}` has negative dim {d}"))
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Convert a shape into the `int32s` representation used by attributes
pub fn shape_attr(shape: &[usize]) -> Result<AttrValue> {
    shape
        .iter()
        .map(|&d| {
            i32::try_from(d).map_err(|_| {
                GraphError::InvalidParameter(format!("dim {d} does not fit an int32 attribute"))
            })
        })
        .collect::<Result<Vec<_>>>()
        .map(AttrValue::I32s)
}
