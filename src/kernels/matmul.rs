use super::{CPU, bound_attr, input_memory, output_memory, read_f32, write_f32};
use crate::dtype::DType;
use crate::error::Result;
use crate::functional as F;
use crate::gradient::{GradientHelper, GradientHelperRegistry};
use crate::op_algo::{OpAlgo, OpAlgoContext, OpAlgoRegistry, OpAlgoSchema};
use crate::storage::MemoryRef;
use crate::tensor::Tensor;

/// Row-major `c = op(a) @ op(b)` with `op(a): (m,k)`, `op(b): (k,n)`
///
/// Naive O(mnk) loop; `trans_*` select the transposed operand without
/// materializing it.
#[allow(clippy::too_many_arguments)]
pub(crate) fn gemm(
    trans_a: bool,
    trans_b: bool,
    m: usize,
    n: usize,
    k: usize,
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
) {
    let a_at = |i: usize, p: usize| if trans_a { a[p * m + i] } else { a[i * k + p] };
    let b_at = |p: usize, j: usize| if trans_b { b[j * k + p] } else { b[p * n + j] };
    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0;
            for p in 0..k {
                sum += a_at(i, p) * b_at(p, j);
            }
            c[i * n + j] = sum;
        }
    }
}

struct MatMulKernel {
    a: MemoryRef,
    b: MemoryRef,
    c: MemoryRef,
    trans_a: bool,
    trans_b: bool,
    m: usize,
    n: usize,
    k: usize,
}

impl MatMulKernel {
    fn create(ctx: &OpAlgoContext) -> Result<Box<dyn OpAlgo>> {
        let trans_a: bool = ctx.attr("trans_a")?;
        let trans_b: bool = ctx.attr("trans_b")?;
        let a = ctx.input(0)?;
        let c = ctx.bound_output()?;
        let (m, n) = (c.shape()[0], c.shape()[1]);
        let k = if trans_a { a.shape()[0] } else { a.shape()[1] };
        Ok(Box::new(MatMulKernel {
            a: input_memory(ctx, 0)?,
            b: input_memory(ctx, 1)?,
            c: output_memory(ctx)?,
            trans_a,
            trans_b,
            m,
            n,
            k,
        }))
    }
}

impl OpAlgo for MatMulKernel {
    fn name(&self) -> &str {
        "MatMul"
    }

    fn compute(&mut self) {
        let (Some(a), Some(b), Some(mut c)) =
            (read_f32(&self.a), read_f32(&self.b), write_f32(&self.c))
        else {
            return;
        };
        gemm(
            self.trans_a,
            self.trans_b,
            self.m,
            self.n,
            self.k,
            &a,
            &b,
            &mut c,
        );
    }
}

pub(super) fn register_algos(registry: &mut OpAlgoRegistry) {
    registry.register(
        OpAlgoSchema::builder("MatMul")
            .input("A", DType::F32)
            .input("B", DType::F32)
            .output("Y", DType::F32)
            .device(CPU)
            .creator(MatMulKernel::create)
            .finish(),
    );
}

/// Gradients of `y = op(a) @ op(b)`, expressed as matmuls of `dy`
struct MatMulGradient;

impl GradientHelper for MatMulGradient {
    fn compute_gradient(&self, y: &Tensor, dy: &Tensor) -> Result<Vec<Tensor>> {
        let trans_a: bool = bound_attr(y, "trans_a")?;
        let trans_b: bool = bound_attr(y, "trans_b")?;
        let xs = y.children();
        let (a, b) = (&xs[0], &xs[1]);
        let (da, db) = match (trans_a, trans_b) {
            (false, false) => (F::matmul(dy, b, false, true)?, F::matmul(a, dy, true, false)?),
            (true, false) => (F::matmul(b, dy, false, true)?, F::matmul(a, dy, false, false)?),
            (false, true) => (F::matmul(dy, b, false, false)?, F::matmul(dy, a, true, false)?),
            (true, true) => (F::matmul(b, dy, true, true)?, F::matmul(dy, a, true, true)?),
        };
        Ok(vec![da, db])
    }
}

pub(super) fn register_helpers(registry: &mut GradientHelperRegistry) {
    registry.register("MatMul", |_ctx| Box::new(MatMulGradient));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemm_transposes() {
        // a = [[1,2,3],[4,5,6]], b = [[1,0],[0,1],[1,1]]
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let mut c = [0.0; 4];
        gemm(false, false, 2, 2, 3, &a, &b, &mut c);
        assert_eq!(c, [4.0, 5.0, 10.0, 11.0]);

        // a^T stored as [3,2], b^T stored as [2,3]
        let at = [1.0, 4.0, 2.0, 5.0, 3.0, 6.0];
        let bt = [1.0, 0.0, 1.0, 0.0, 1.0, 1.0];
        let mut c2 = [0.0; 4];
        gemm(true, true, 2, 2, 3, &at, &bt, &mut c2);
        assert_eq!(c2, c);
    }

    #[test]
    fn test_matmul_forward_and_gradient() {
        let a = F::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let b = F::from_vec(vec![5.0f32, 6.0, 7.0, 8.0], &[2, 2]).unwrap();
        let y = F::matmul(&a, &b, false, false).unwrap();
        y.eval();
        assert_eq!(y.to_vec::<f32>().unwrap(), vec![19.0, 22.0, 43.0, 50.0]);

        y.backprop().unwrap();
        // dA = 1 @ B^T, dB = A^T @ 1
        assert_eq!(
            a.grad().unwrap().to_vec::<f32>().unwrap(),
            vec![11.0, 15.0, 11.0, 15.0]
        );
        assert_eq!(
            b.grad().unwrap().to_vec::<f32>().unwrap(),
            vec![4.0, 4.0, 6.0, 6.0]
        );
    }
}
