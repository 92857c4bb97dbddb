use super::{CPU, f32_memory, input_memory, output_memory, read_f32, write_f32};
use crate::dtype::DType;
use crate::error::{GraphError, Result};
use crate::functional;
use crate::gradient::{GradientHelper, GradientHelperRegistry};
use crate::op_algo::{OpAlgo, OpAlgoContext, OpAlgoRegistry, OpAlgoSchema};
use crate::storage::MemoryRef;
use crate::tensor::Tensor;

// Kernels walk the buffers row by row, so rows must be non-empty
fn row_width(t: &Tensor) -> Result<usize> {
    match t.shape() {
        &[_, n] if n > 0 => Ok(n),
        shape => Err(GraphError::InvalidShape {
            op: "softmax_cross_entropy",
            reason: format!("expected [rows, classes] with classes > 0, got {shape:?}"),
        }),
    }
}

/// Row-wise softmax of `logits` (shifted by the row max) and per-row
/// cross-entropy `-sum(labels * ln(prob))`
struct SoftmaxXentKernel {
    logits: MemoryRef,
    labels: MemoryRef,
    _prob: Tensor,
    prob: MemoryRef,
    loss: MemoryRef,
    cols: usize,
}

impl SoftmaxXentKernel {
    fn create(ctx: &OpAlgoContext) -> Result<Box<dyn OpAlgo>> {
        let prob = ctx.output(0)?;
        let cols = row_width(&ctx.input(0)?)?;
        Ok(Box::new(SoftmaxXentKernel {
            logits: input_memory(ctx, 0)?,
            labels: input_memory(ctx, 1)?,
            prob: f32_memory(&prob)?,
            _prob: prob,
            loss: output_memory(ctx)?,
            cols,
        }))
    }
}

impl OpAlgo for SoftmaxXentKernel {
    fn name(&self) -> &str {
        "SoftmaxCrossEntropy"
    }

    fn compute(&mut self) {
        let (Some(logits), Some(labels), Some(mut prob), Some(mut loss)) = (
            read_f32(&self.logits),
            read_f32(&self.labels),
            write_f32(&self.prob),
            write_f32(&self.loss),
        ) else {
            return;
        };
        let rows = logits
            .chunks(self.cols)
            .zip(labels.chunks(self.cols))
            .zip(prob.chunks_mut(self.cols));
        for (((x, l), p), loss) in rows.zip(loss.iter_mut()) {
            let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            for (p, &x) in p.iter_mut().zip(x) {
                *p = (x - max).exp();
            }
            let sum: f32 = p.iter().sum();
            for p in p.iter_mut() {
                *p /= sum;
            }
            // ln(p) computed from the shifted logits stays finite for p -> 0
            let log_sum = sum.ln();
            *loss = -x
                .iter()
                .zip(l)
                .map(|(&x, &l)| l * (x - max - log_sum))
                .sum::<f32>();
        }
    }
}

/// `dlogits[i, j] = dy[i] * (prob[i, j] * sum_k labels[i, k] - labels[i, j])`
struct SoftmaxXentGradientKernel {
    dy: MemoryRef,
    prob: MemoryRef,
    labels: MemoryRef,
    dx: MemoryRef,
    cols: usize,
}

impl SoftmaxXentGradientKernel {
    fn create(ctx: &OpAlgoContext) -> Result<Box<dyn OpAlgo>> {
        let cols = row_width(&ctx.bound_output()?)?;
        Ok(Box::new(SoftmaxXentGradientKernel {
            dy: input_memory(ctx, 0)?,
            prob: input_memory(ctx, 2)?,
            labels: input_memory(ctx, 3)?,
            dx: output_memory(ctx)?,
            cols,
        }))
    }
}

impl OpAlgo for SoftmaxXentGradientKernel {
    fn name(&self) -> &str {
        "SoftmaxCrossEntropyGradient"
    }

    fn compute(&mut self) {
        let (Some(dy), Some(prob), Some(labels), Some(mut dx)) = (
            read_f32(&self.dy),
            read_f32(&self.prob),
            read_f32(&self.labels),
            write_f32(&self.dx),
        ) else {
            return;
        };
        let rows = prob
            .chunks(self.cols)
            .zip(labels.chunks(self.cols))
            .zip(dx.chunks_mut(self.cols));
        for (((p, l), dx), &g) in rows.zip(dy.iter()) {
            let label_sum: f32 = l.iter().sum();
            for ((dx, &p), &l) in dx.iter_mut().zip(p).zip(l) {
                *dx = g * (p * label_sum - l);
            }
        }
    }
}

pub(super) fn register_algos(registry: &mut OpAlgoRegistry) {
    registry.register(
        OpAlgoSchema::builder("SoftmaxCrossEntropy")
            .input("Logits", DType::F32)
            .input("Labels", DType::F32)
            .output("Prob", DType::F32)
            .output("Loss", DType::F32)
            .device(CPU)
            .creator(SoftmaxXentKernel::create)
            .finish(),
    );
    registry.register(
        OpAlgoSchema::builder("SoftmaxCrossEntropyGradient")
            .input("dY", DType::F32)
            .input("Y", DType::F32)
            .input("Prob", DType::F32)
            .input("Labels", DType::F32)
            .output("dX", DType::F32)
            .device(CPU)
            .creator(SoftmaxXentGradientKernel::create)
            .finish(),
    );
}

/// Logits get the cross-entropy gradient, labels get zeros
struct SoftmaxCrossEntropyGradient;

impl GradientHelper for SoftmaxCrossEntropyGradient {
    fn compute_gradient(&self, y: &Tensor, dy: &Tensor) -> Result<Vec<Tensor>> {
        let ctx = y.context().ok_or_else(|| {
            GraphError::InvalidParameter("softmax_cross_entropy output is not bound".to_string())
        })?;
        let prob = ctx.output(0)?;
        let (logits, labels) = (ctx.input(0)?, ctx.input(1)?);
        let dlogits = functional::apply(
            OpAlgoContext::new("SoftmaxCrossEntropyGradient"),
            &[dy, y, &prob, &labels],
            logits.shape(),
        )?;
        let dlabels = functional::full(labels.shape(), 0.0, labels.dtype())?;
        Ok(vec![dlogits, dlabels])
    }
}

pub(super) fn register_helpers(registry: &mut GradientHelperRegistry) {
    registry.register("SoftmaxCrossEntropy", |_ctx| {
        Box::new(SoftmaxCrossEntropyGradient)
    });
}
