use crate::dtype::DType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("{op} is not supported.")]
    UnsupportedOp { op: String },

    #[error("OpAlgoRegistry::get_op_algo - not found for {0}")]
    OpAlgoNotFound(String),

    #[error("{what} - index {index} too large for {len} entries")]
    IndexOutOfBounds {
        what: &'static str,
        index: usize,
        len: usize,
    },

    #[error("{op}: shape mismatch {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },

    #[error("Cannot broadcast shape {0:?} to {1:?}")]
    BroadcastError(Vec<usize>, Vec<usize>),

    #[error("{op}: invalid shape, {reason}")]
    InvalidShape { op: &'static str, reason: String },

    #[error("DType mismatch: expected {expected:?}, got {actual:?}")]
    DTypeMismatch { expected: DType, actual: DType },

    #[error("Attribute `{0}` not found")]
    AttrNotFound(String),

    #[error("Attribute `{name}` has type {actual}, requested {expected}")]
    AttrTypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("No gradient helper registered for op {op}")]
    MissingGradientHelper { op: String },

    #[error("Gradient helper for {op} returned {actual} gradients for {expected} inputs")]
    GradientArity {
        op: String,
        expected: usize,
        actual: usize,
    },

    #[error("Tensor has no memory attached")]
    NoMemory,

    #[error("Registries are already finalized; register extensions before the first graph is built")]
    RegistryFinalized,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;
