use super::{CPU, input_memory, output_memory, read_f32, write_f32};
use crate::dtype::DType;
use crate::error::Result;
use crate::functional as F;
use crate::gradient::{GradientHelper, GradientHelperRegistry};
use crate::op_algo::{OpAlgo, OpAlgoContext, OpAlgoRegistry, OpAlgoSchema};
use crate::storage::MemoryRef;
use crate::tensor::Tensor;

/// Binary element-wise operations over equally shaped inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,               // x1 + x2
    Sub,               // x1 - x2
    Mul,               // x1 * x2
    SquaredDifference, // (x1 - x2)^2
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 4] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::SquaredDifference,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "Add",
            BinaryOp::Sub => "Sub",
            BinaryOp::Mul => "Mul",
            BinaryOp::SquaredDifference => "SquaredDifference",
        }
    }

    #[inline]
    fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::SquaredDifference => (a - b) * (a - b),
        }
    }
}

/// Unary element-wise operations
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Negative,
    Scale(f32),
}

impl UnaryOp {
    fn name(self) -> &'static str {
        match self {
            UnaryOp::Negative => "Negative",
            UnaryOp::Scale(_) => "Scale",
        }
    }

    #[inline]
    fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Negative => -x,
            UnaryOp::Scale(alpha) => alpha * x,
        }
    }
}

// ===== KERNELS =====

struct BinaryKernel {
    op: BinaryOp,
    x1: MemoryRef,
    x2: MemoryRef,
    y: MemoryRef,
}

impl BinaryKernel {
    fn create(ctx: &OpAlgoContext, op: BinaryOp) -> Result<Box<dyn OpAlgo>> {
        Ok(Box::new(BinaryKernel {
            op,
            x1: input_memory(ctx, 0)?,
            x2: input_memory(ctx, 1)?,
            y: output_memory(ctx)?,
        }))
    }
}

impl OpAlgo for BinaryKernel {
    fn name(&self) -> &str {
        self.op.name()
    }

    fn compute(&mut self) {
        let (Some(x1), Some(x2), Some(mut y)) =
            (read_f32(&self.x1), read_f32(&self.x2), write_f32(&self.y))
        else {
            return;
        };
        for ((y, &a), &b) in y.iter_mut().zip(x1.iter()).zip(x2.iter()) {
            *y = self.op.apply(a, b);
        }
    }
}

struct UnaryKernel {
    op: UnaryOp,
    x: MemoryRef,
    y: MemoryRef,
}

impl UnaryKernel {
    fn create_negative(ctx: &OpAlgoContext) -> Result<Box<dyn OpAlgo>> {
        Self::create(ctx, UnaryOp::Negative)
    }

    fn create_scale(ctx: &OpAlgoContext) -> Result<Box<dyn OpAlgo>> {
        Self::create(ctx, UnaryOp::Scale(ctx.attr("alpha")?))
    }

    fn create(ctx: &OpAlgoContext, op: UnaryOp) -> Result<Box<dyn OpAlgo>> {
        Ok(Box::new(UnaryKernel {
            op,
            x: input_memory(ctx, 0)?,
            y: output_memory(ctx)?,
        }))
    }
}

impl OpAlgo for UnaryKernel {
    fn name(&self) -> &str {
        self.op.name()
    }

    fn compute(&mut self) {
        let (Some(x), Some(mut y)) = (read_f32(&self.x), write_f32(&self.y)) else {
            return;
        };
        for (y, &x) in y.iter_mut().zip(x.iter()) {
            *y = self.op.apply(x);
        }
    }
}

/// Sum of any number of inputs
struct AddNKernel {
    xs: Vec<MemoryRef>,
    y: MemoryRef,
}

impl AddNKernel {
    fn create(ctx: &OpAlgoContext) -> Result<Box<dyn OpAlgo>> {
        let xs = (0..ctx.num_inputs())
            .map(|i| input_memory(ctx, i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Box::new(AddNKernel {
            xs,
            y: output_memory(ctx)?,
        }))
    }
}

impl OpAlgo for AddNKernel {
    fn name(&self) -> &str {
        "AddN"
    }

    fn compute(&mut self) {
        let Some(mut y) = write_f32(&self.y) else {
            return;
        };
        y.fill(0.0);
        for x in &self.xs {
            let Some(x) = read_f32(x) else {
                return;
            };
            for (y, &x) in y.iter_mut().zip(x.iter()) {
                *y += x;
            }
        }
    }
}

pub(super) fn register_algos(registry: &mut OpAlgoRegistry) {
    for op in BinaryOp::ALL {
        registry.register(
            OpAlgoSchema::builder(op.name())
                .input("X1", DType::F32)
                .input("X2", DType::F32)
                .output("Y", DType::F32)
                .device(CPU)
                .creator(move |ctx| BinaryKernel::create(ctx, op))
                .finish(),
        );
    }
    registry.register(
        OpAlgoSchema::builder("Negative")
            .input("X", DType::F32)
            .output("Y", DType::F32)
            .device(CPU)
            .creator(UnaryKernel::create_negative)
            .finish(),
    );
    registry.register(
        OpAlgoSchema::builder("Scale")
            .input("X", DType::F32)
            .output("Y", DType::F32)
            .device(CPU)
            .creator(UnaryKernel::create_scale)
            .finish(),
    );
    registry.register(
        OpAlgoSchema::builder("AddN")
            .input("Xs", DType::F32)
            .output("Y", DType::F32)
            .device(CPU)
            .creator(AddNKernel::create)
            .finish(),
    );
}

// ===== GRADIENT HELPERS =====

struct AddGradient;

impl GradientHelper for AddGradient {
    fn compute_gradient(&self, _y: &Tensor, dy: &Tensor) -> Result<Vec<Tensor>> {
        Ok(vec![dy.clone(), dy.clone()])
    }
}

struct SubGradient;

impl GradientHelper for SubGradient {
    fn compute_gradient(&self, _y: &Tensor, dy: &Tensor) -> Result<Vec<Tensor>> {
        Ok(vec![dy.clone(), F::negative(dy)?])
    }
}

struct MulGradient;

impl GradientHelper for MulGradient {
    fn compute_gradient(&self, y: &Tensor, dy: &Tensor) -> Result<Vec<Tensor>> {
        let xs = y.children();
        Ok(vec![F::mul(dy, &xs[1])?, F::mul(dy, &xs[0])?])
    }
}

struct NegativeGradient;

impl GradientHelper for NegativeGradient {
    fn compute_gradient(&self, _y: &Tensor, dy: &Tensor) -> Result<Vec<Tensor>> {
        Ok(vec![F::negative(dy)?])
    }
}

struct ScaleGradient;

impl GradientHelper for ScaleGradient {
    fn compute_gradient(&self, y: &Tensor, dy: &Tensor) -> Result<Vec<Tensor>> {
        let alpha: f32 = super::bound_attr(y, "alpha")?;
        Ok(vec![F::scale(dy, alpha)?])
    }
}

struct AddNGradient;

impl GradientHelper for AddNGradient {
    fn compute_gradient(&self, y: &Tensor, dy: &Tensor) -> Result<Vec<Tensor>> {
        Ok(vec![dy.clone(); y.children().len()])
    }
}

/// `dx1 = 2 (x1 - x2) dy`, `dx2 = -dx1`
struct SquaredDifferenceGradient;

impl GradientHelper for SquaredDifferenceGradient {
    fn compute_gradient(&self, y: &Tensor, dy: &Tensor) -> Result<Vec<Tensor>> {
        let xs = y.children();
        let two_diff = F::scale(&F::sub(&xs[0], &xs[1])?, 2.0)?;
        let dx1 = F::mul(&two_diff, dy)?;
        let dx2 = F::negative(&dx1)?;
        Ok(vec![dx1, dx2])
    }
}

pub(super) fn register_helpers(registry: &mut GradientHelperRegistry) {
    registry.register("Add", |_ctx| Box::new(AddGradient));
    registry.register("Sub", |_ctx| Box::new(SubGradient));
    registry.register("Mul", |_ctx| Box::new(MulGradient));
    registry.register("Negative", |_ctx| Box::new(NegativeGradient));
    registry.register("Scale", |_ctx| Box::new(ScaleGradient));
    registry.register("AddN", |_ctx| Box::new(AddNGradient));
    registry.register("SquaredDifference", |_ctx| {
        Box::new(SquaredDifferenceGradient)
    });
}
