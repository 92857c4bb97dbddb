//! Lazy computation graphs over tensors, with a kernel registry and
//! reverse-mode automatic differentiation.
//!
//! Graphs are built with the [`functional`] builders. Each builder binds a
//! kernel chosen by op name and the enabled device (see [`config`]), but
//! nothing runs until [`Tensor::eval`]. Re-evaluating only recomputes nodes
//! whose inputs changed. [`Tensor::backprop`] extends the graph with gradient
//! nodes and evaluates them.
//!
//! ```ignore
//! use volta_graph::functional as F;
//!
//! let x1 = F::from_vec(vec![1.0f32, 2.0, 3.0], &[3])?;
//! let x2 = F::constant(0.0, &[3])?;
//! let y = F::squared_difference(&x1, &x2)?;
//! y.eval();                       // [1, 4, 9]
//! y.backprop()?;
//! let dx1 = x1.grad().unwrap();   // [2, 4, 6]
//! ```
//!
//! New ops are added by registering a kernel (and optionally a gradient
//! helper) through [`registry::extend`] before the first graph is built.

pub mod attribute;
pub mod config;
pub mod device;
pub mod dtype;
pub mod error;
pub mod functional;
pub mod gradcheck;
pub mod gradient;
pub mod kernels;
pub mod op_algo;
pub mod registry;
pub mod storage;
pub mod tensor;

pub use attribute::{AttrValue, Attributes};
pub use config::{EngineConfig, enabled_device, manual_seed, set_enabled_device};
pub use device::{Device, EnabledDevice};
pub use dtype::{DType, Element};
pub use error::{GraphError, Result};
pub use gradcheck::{GradCheck, check_gradients};
pub use gradient::{GradientHelper, GradientHelperRegistry};
pub use op_algo::{OpAlgo, OpAlgoContext, OpAlgoRegistry, OpAlgoSchema};
pub use storage::{Memory, MemoryRef, Storage};
pub use tensor::{Tensor, WeakTensor};
