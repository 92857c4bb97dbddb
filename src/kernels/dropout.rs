use super::{CPU, f32_memory, input_memory, output_memory, read_f32, write_f32};
use crate::config;
use crate::dtype::DType;
use crate::error::{GraphError, Result};
use crate::functional;
use crate::gradient::{GradientHelper, GradientHelperRegistry};
use crate::op_algo::{OpAlgo, OpAlgoContext, OpAlgoRegistry, OpAlgoSchema};
use crate::storage::MemoryRef;
use crate::tensor::Tensor;
use rand::Rng;

/// Inverted dropout. The mask stores the applied scale per element:
/// `1 / (1 - ratio)` for kept elements, `0` for dropped ones.
struct DropoutKernel {
    x: MemoryRef,
    y: MemoryRef,
    // Owned here so the auxiliary output lives as long as the op
    _mask: Tensor,
    mask: MemoryRef,
    ratio: f32,
    training: bool,
}

impl DropoutKernel {
    fn create(ctx: &OpAlgoContext) -> Result<Box<dyn OpAlgo>> {
        let mask = ctx.output(0)?;
        Ok(Box::new(DropoutKernel {
            x: input_memory(ctx, 0)?,
            y: output_memory(ctx)?,
            mask: f32_memory(&mask)?,
            _mask: mask,
            ratio: ctx.attr("dropout_ratio")?,
            training: ctx.attr("is_training_step")?,
        }))
    }
}

impl OpAlgo for DropoutKernel {
    fn name(&self) -> &str {
        "Dropout"
    }

    fn compute(&mut self) {
        let (Some(x), Some(mut y), Some(mut mask)) = (
            read_f32(&self.x),
            write_f32(&self.y),
            write_f32(&self.mask),
        ) else {
            return;
        };
        if !self.training {
            mask.fill(1.0);
            y.copy_from_slice(&x);
            return;
        }
        let keep_prob = 1.0 - self.ratio;
        let scale = 1.0 / keep_prob;
        config::with_rng(|rng| {
            for m in mask.iter_mut() {
                *m = if rng.random::<f32>() < keep_prob { scale } else { 0.0 };
            }
        });
        for ((y, &x), &m) in y.iter_mut().zip(x.iter()).zip(mask.iter()) {
            *y = x * m;
        }
    }
}

/// `dx = dy * mask`
struct DropoutGradientKernel {
    dy: MemoryRef,
    mask: MemoryRef,
    dx: MemoryRef,
}

impl DropoutGradientKernel {
    fn create(ctx: &OpAlgoContext) -> Result<Box<dyn OpAlgo>> {
        Ok(Box::new(DropoutGradientKernel {
            dy: input_memory(ctx, 0)?,
            mask: input_memory(ctx, 2)?,
            dx: output_memory(ctx)?,
        }))
    }
}

impl OpAlgo for DropoutGradientKernel {
    fn name(&self) -> &str {
        "DropoutGradient"
    }

    fn compute(&mut self) {
        let (Some(dy), Some(mask), Some(mut dx)) =
            (read_f32(&self.dy), read_f32(&self.mask), write_f32(&self.dx))
        else {
            return;
        };
        for ((dx, &g), &m) in dx.iter_mut().zip(dy.iter()).zip(mask.iter()) {
            *dx = g * m;
        }
    }
}

pub(super) fn register_algos(registry: &mut OpAlgoRegistry) {
    registry.register(
        OpAlgoSchema::builder("Dropout")
            .input("X", DType::F32)
            .output("Mask", DType::F32)
            .output("Y", DType::F32)
            .device(CPU)
            .creator(DropoutKernel::create)
            .finish(),
    );
    registry.register(
        OpAlgoSchema::builder("DropoutGradient")
            .input("dY", DType::F32)
            .input("Y", DType::F32)
            .input("Mask", DType::F32)
            .output("dX", DType::F32)
            .device(CPU)
            .creator(DropoutGradientKernel::create)
            .finish(),
    );
}

/// Reads `y` so the mask is sampled before it is used
struct DropoutGradient;

impl GradientHelper for DropoutGradient {
    fn compute_gradient(&self, y: &Tensor, dy: &Tensor) -> Result<Vec<Tensor>> {
        let ctx = y.context().ok_or_else(|| {
            GraphError::InvalidParameter("dropout output is not bound".to_string())
        })?;
        let mask = ctx.output(0)?;
        let dx = functional::apply(
            OpAlgoContext::new("DropoutGradient"),
            &[dy, y, &mask],
            y.shape(),
        )?;
        Ok(vec![dx])
    }
}

pub(super) fn register_helpers(registry: &mut GradientHelperRegistry) {
    registry.register("Dropout", |_ctx| Box::new(DropoutGradient));
}
