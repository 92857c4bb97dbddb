//! Reference host kernels and gradient helpers for the built-in op catalog
//!
//! Everything here is registered for device `CPU`, except `Identity`, which
//! any device can run and is registered for `Any`.

pub mod broadcast;
pub mod dropout;
pub mod elementwise;
pub mod matmul;
pub mod reduce;
pub mod softmax_xent;

use crate::attribute::FromAttr;
use crate::dtype::DType;
use crate::error::{GraphError, Result};
use crate::gradient::GradientHelperRegistry;
use crate::op_algo::{OpAlgo, OpAlgoContext, OpAlgoRegistry, OpAlgoSchema};
use crate::storage::{Memory, MemoryRef};
use crate::tensor::Tensor;
use std::cell::{Ref, RefMut};

pub(crate) const CPU: &str = "CPU";

pub fn register_builtin_algos(registry: &mut OpAlgoRegistry) {
    registry.register(
        OpAlgoSchema::builder("Identity")
            .output("Y", DType::F32)
            .device("Any")
            .creator(IdentityKernel::create)
            .finish(),
    );
    elementwise::register_algos(registry);
    broadcast::register_algos(registry);
    matmul::register_algos(registry);
    reduce::register_algos(registry);
    dropout::register_algos(registry);
    softmax_xent::register_algos(registry);
}

pub fn register_builtin_helpers(registry: &mut GradientHelperRegistry) {
    registry.register("Identity", |_ctx| Box::new(IdentityGradient));
    elementwise::register_helpers(registry);
    broadcast::register_helpers(registry);
    matmul::register_helpers(registry);
    reduce::register_helpers(registry);
    dropout::register_helpers(registry);
    softmax_xent::register_helpers(registry);
}

// ===== IDENTITY =====

/// Kernel for leaves: the buffer already holds the value
struct IdentityKernel;

impl IdentityKernel {
    fn create(_ctx: &OpAlgoContext) -> Result<Box<dyn OpAlgo>> {
        Ok(Box::new(IdentityKernel))
    }
}

impl OpAlgo for IdentityKernel {
    fn name(&self) -> &str {
        "Identity"
    }

    fn compute(&mut self) {}
}

struct IdentityGradient;

impl crate::gradient::GradientHelper for IdentityGradient {
    fn compute_gradient(&self, _y: &Tensor, _dy: &Tensor) -> Result<Vec<Tensor>> {
        Ok(Vec::new())
    }
}

// ===== SHARED HELPERS =====

/// Buffer of `t`, which must be `float32`
pub(crate) fn f32_memory(t: &Tensor) -> Result<MemoryRef> {
    if t.dtype() != DType::F32 {
        return Err(GraphError::DTypeMismatch {
            expected: DType::F32,
            actual: t.dtype(),
        });
    }
    t.memory().ok_or(GraphError::NoMemory)
}

/// `f32_memory` of input `idx`
pub(crate) fn input_memory(ctx: &OpAlgoContext, idx: usize) -> Result<MemoryRef> {
    f32_memory(&ctx.input(idx)?)
}

/// `f32_memory` of the bound output
pub(crate) fn output_memory(ctx: &OpAlgoContext) -> Result<MemoryRef> {
    f32_memory(&ctx.bound_output()?)
}

// Buffers are type-checked when the kernel is created; a failed borrow here
// means the graph is being mutated while it executes.
pub(crate) fn read_f32(memory: &Memory) -> Option<Ref<'_, [f32]>> {
    memory
        .host_data::<f32>()
        .inspect_err(|e| log::error!("kernel input unavailable: {e}"))
        .ok()
}

pub(crate) fn write_f32(memory: &Memory) -> Option<RefMut<'_, [f32]>> {
    memory
        .mutable_host_data::<f32>()
        .inspect_err(|e| log::error!("kernel output unavailable: {e}"))
        .ok()
}

/// Attribute the forward op producing `y` was bound with
pub(crate) fn bound_attr<T: FromAttr>(y: &Tensor, name: &str) -> Result<T> {
    let ctx = y
        .context()
        .ok_or_else(|| GraphError::AttrNotFound(name.to_string()))?;
    ctx.attr(name)
}

/// Row-major strides for `shape`
pub(crate) fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}
