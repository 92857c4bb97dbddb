use super::{CPU, compute_strides, input_memory, output_memory, read_f32, write_f32};
use crate::dtype::DType;
use crate::error::{GraphError, Result};
use crate::functional;
use crate::gradient::{GradientHelper, GradientHelperRegistry};
use crate::op_algo::{OpAlgo, OpAlgoContext, OpAlgoRegistry, OpAlgoSchema};
use crate::storage::MemoryRef;
use crate::tensor::Tensor;

/// For every element of `to_shape`, the flat index of the `from_shape`
/// element it repeats
///
/// `from_shape` is padded with leading 1s; size-1 dims map every
/// coordinate to 0.
pub(crate) fn broadcast_index_map(from_shape: &[usize], to_shape: &[usize]) -> Vec<usize> {
    let offset = to_shape.len() - from_shape.len();
    let mut padded_from = vec![1; to_shape.len()];
    padded_from[offset..].copy_from_slice(from_shape);

    let from_strides = compute_strides(&padded_from);
    let to_strides = compute_strides(to_shape);
    let to_size: usize = to_shape.iter().product();

    (0..to_size)
        .map(|i| {
            let mut from_idx = 0;
            let mut remainder = i;
            for dim in 0..to_shape.len() {
                let coord = remainder / to_strides[dim];
                remainder %= to_strides[dim];
                if padded_from[dim] != 1 {
                    from_idx += coord * from_strides[dim];
                }
            }
            from_idx
        })
        .collect()
}

// ===== KERNELS =====

/// Repeat the input over broadcast dimensions
struct BroadcastKernel {
    x: MemoryRef,
    y: MemoryRef,
    index_map: Vec<usize>,
}

impl BroadcastKernel {
    fn create(ctx: &OpAlgoContext) -> Result<Box<dyn OpAlgo>> {
        let x = ctx.input(0)?;
        let shape = ctx.attrs().get_shape("broadcasting_shape")?;
        if x.dims() > shape.len() {
            return Err(GraphError::BroadcastError(x.shape().to_vec(), shape));
        }
        Ok(Box::new(BroadcastKernel {
            index_map: broadcast_index_map(x.shape(), &shape),
            x: input_memory(ctx, 0)?,
            y: output_memory(ctx)?,
        }))
    }
}

impl OpAlgo for BroadcastKernel {
    fn name(&self) -> &str {
        "Broadcasting"
    }

    fn compute(&mut self) {
        let (Some(x), Some(mut y)) = (read_f32(&self.x), write_f32(&self.y)) else {
            return;
        };
        for (y, &src) in y.iter_mut().zip(&self.index_map) {
            *y = x[src];
        }
    }
}

/// Sum the incoming gradient over broadcast dimensions
struct BroadcastGradientKernel {
    dy: MemoryRef,
    dx: MemoryRef,
    index_map: Vec<usize>,
}

impl BroadcastGradientKernel {
    fn create(ctx: &OpAlgoContext) -> Result<Box<dyn OpAlgo>> {
        let dy = ctx.input(0)?;
        let dx = ctx.bound_output()?;
        if dx.dims() > dy.dims() {
            return Err(GraphError::BroadcastError(
                dx.shape().to_vec(),
                dy.shape().to_vec(),
            ));
        }
        Ok(Box::new(BroadcastGradientKernel {
            index_map: broadcast_index_map(dx.shape(), dy.shape()),
            dy: input_memory(ctx, 0)?,
            dx: output_memory(ctx)?,
        }))
    }
}

impl OpAlgo for BroadcastGradientKernel {
    fn name(&self) -> &str {
        "BroadcastingGradient"
    }

    fn compute(&mut self) {
        let (Some(dy), Some(mut dx)) = (read_f32(&self.dy), write_f32(&self.dx)) else {
            return;
        };
        dx.fill(0.0);
        for (&g, &dst) in dy.iter().zip(&self.index_map) {
            dx[dst] += g;
        }
    }
}

pub(super) fn register_algos(registry: &mut OpAlgoRegistry) {
    registry.register(
        OpAlgoSchema::builder("Broadcasting")
            .input("X", DType::F32)
            .output("Y", DType::F32)
            .device(CPU)
            .creator(BroadcastKernel::create)
            .finish(),
    );
    registry.register(
        OpAlgoSchema::builder("BroadcastingGradient")
            .input("dY", DType::F32)
            .output("dX", DType::F32)
            .device(CPU)
            .creator(BroadcastGradientKernel::create)
            .finish(),
    );
}

// ===== GRADIENT HELPER =====

struct BroadcastingGradient;

impl GradientHelper for BroadcastingGradient {
    fn compute_gradient(&self, y: &Tensor, dy: &Tensor) -> Result<Vec<Tensor>> {
        let x = &y.children()[0];
        let dx = functional::apply(OpAlgoContext::new("BroadcastingGradient"), &[dy], x.shape())?;
        Ok(vec![dx])
    }
}

pub(super) fn register_helpers(registry: &mut GradientHelperRegistry) {
    registry.register("Broadcasting", |_ctx| Box::new(BroadcastingGradient));
}
