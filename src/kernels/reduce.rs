use super::{CPU, input_memory, output_memory, read_f32, write_f32};
use crate::dtype::DType;
use crate::error::Result;
use crate::functional;
use crate::gradient::{GradientHelper, GradientHelperRegistry};
use crate::op_algo::{OpAlgo, OpAlgoContext, OpAlgoRegistry, OpAlgoSchema};
use crate::storage::MemoryRef;
use crate::tensor::Tensor;

/// Mean of every element into a `[1]` output
struct ReduceMeanKernel {
    x: MemoryRef,
    y: MemoryRef,
}

impl ReduceMeanKernel {
    fn create(ctx: &OpAlgoContext) -> Result<Box<dyn OpAlgo>> {
        Ok(Box::new(ReduceMeanKernel {
            x: input_memory(ctx, 0)?,
            y: output_memory(ctx)?,
        }))
    }
}

impl OpAlgo for ReduceMeanKernel {
    fn name(&self) -> &str {
        "ReduceMean"
    }

    fn compute(&mut self) {
        let (Some(x), Some(mut y)) = (read_f32(&self.x), write_f32(&self.y)) else {
            return;
        };
        y[0] = x.iter().sum::<f32>() / x.len() as f32;
    }
}

/// Spread `dy / n` over every input element
struct ReduceMeanGradientKernel {
    dy: MemoryRef,
    dx: MemoryRef,
}

impl ReduceMeanGradientKernel {
    fn create(ctx: &OpAlgoContext) -> Result<Box<dyn OpAlgo>> {
        Ok(Box::new(ReduceMeanGradientKernel {
            dy: input_memory(ctx, 0)?,
            dx: output_memory(ctx)?,
        }))
    }
}

impl OpAlgo for ReduceMeanGradientKernel {
    fn name(&self) -> &str {
        "ReduceMeanGradient"
    }

    fn compute(&mut self) {
        let (Some(dy), Some(mut dx)) = (read_f32(&self.dy), write_f32(&self.dx)) else {
            return;
        };
        let g = dy[0] / dx.len() as f32;
        dx.fill(g);
    }
}

pub(super) fn register_algos(registry: &mut OpAlgoRegistry) {
    registry.register(
        OpAlgoSchema::builder("ReduceMean")
            .input("X", DType::F32)
            .output("Y", DType::F32)
            .device(CPU)
            .creator(ReduceMeanKernel::create)
            .finish(),
    );
    registry.register(
        OpAlgoSchema::builder("ReduceMeanGradient")
            .input("dY", DType::F32)
            .output("dX", DType::F32)
            .device(CPU)
            .creator(ReduceMeanGradientKernel::create)
            .finish(),
    );
}

struct ReduceMeanGradient;

impl GradientHelper for ReduceMeanGradient {
    fn compute_gradient(&self, y: &Tensor, dy: &Tensor) -> Result<Vec<Tensor>> {
        let x = &y.children()[0];
        let dx = functional::apply(OpAlgoContext::new("ReduceMeanGradient"), &[dy], x.shape())?;
        Ok(vec![dx])
    }
}

pub(super) fn register_helpers(registry: &mut GradientHelperRegistry) {
    registry.register("ReduceMean", |_ctx| Box::new(ReduceMeanGradient));
}

#[cfg(test)]
mod tests {
    use crate::functional as F;
    use approx::assert_relative_eq;

    #[test]
    fn test_reduce_mean() {
        let x = F::from_vec(vec![1.0f32, 2.0, 3.0, 6.0], &[2, 2]).unwrap();
        let y = F::reduce_mean(&x).unwrap();
        assert_eq!(y.shape(), &[1]);
        y.eval();
        assert_relative_eq!(y.to_vec::<f32>().unwrap()[0], 3.0);

        y.backprop().unwrap();
        assert_eq!(x.grad().unwrap().to_vec::<f32>().unwrap(), vec![0.25; 4]);
    }
}
