//! Functional op builders
//!
//! Each builder allocates an output tensor, links it to its inputs, and
//! binds the kernel registered for the enabled device. Nothing is computed
//! until [`Tensor::eval`] is called on a downstream tensor.
//!
//! ```ignore
//! use volta_graph::functional as F;
//!
//! let x = F::from_vec(vec![1.0f32, 2.0, 3.0], &[3])?;
//! let t = F::constant(0.0, &[3])?;
//! let loss = F::reduce_mean(&F::squared_difference(&x, &t)?)?;
//! loss.eval();
//! loss.backprop()?;
//! ```

use crate::attribute::shape_attr;
use crate::config;
use crate::dtype::{DType, Element};
use crate::error::{GraphError, Result};
use crate::op_algo::OpAlgoContext;
use crate::storage::Storage;
use crate::tensor::Tensor;
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Link `inputs` as children of a fresh output of `shape` and bind `ctx`.
///
/// The output takes the dtype of the first input (`float32` without inputs).
pub(crate) fn apply(mut ctx: OpAlgoContext, inputs: &[&Tensor], shape: &[usize]) -> Result<Tensor> {
    let dtype = inputs.first().map_or(DType::F32, |x| x.dtype());
    let y = Tensor::new(shape, dtype);
    for x in inputs {
        ctx.add_input(x);
        y.add_child(x)?;
    }
    y.bind_op(ctx)?;
    Ok(y)
}

fn bind_leaf(t: Tensor) -> Result<Tensor> {
    t.bind_op(OpAlgoContext::new("Identity"))?;
    Ok(t)
}

fn check_same_shape(op: &'static str, a: &Tensor, b: &Tensor) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(GraphError::ShapeMismatch {
            op,
            lhs: a.shape().to_vec(),
            rhs: b.shape().to_vec(),
        });
    }
    Ok(())
}

// ===== LEAVES =====

/// Zero-filled `float32` leaf
pub fn create_variable(shape: &[usize]) -> Result<Tensor> {
    create_variable_with_dtype(shape, DType::F32)
}

pub fn create_variable_with_dtype(shape: &[usize], dtype: DType) -> Result<Tensor> {
    bind_leaf(Tensor::new(shape, dtype))
}

/// Leaf holding `data`
pub fn from_vec<T: Element>(data: Vec<T>, shape: &[usize]) -> Result<Tensor> {
    bind_leaf(Tensor::from_storage(Storage::from(data), shape)?)
}

/// `float32` leaf filled with `value`
pub fn constant(value: f32, shape: &[usize]) -> Result<Tensor> {
    full(shape, f64::from(value), DType::F32)
}

pub fn full(shape: &[usize], value: f64, dtype: DType) -> Result<Tensor> {
    let len = shape.iter().product();
    bind_leaf(Tensor::from_storage(Storage::filled(dtype, len, value), shape)?)
}

/// Leaf sampled from `N(mean, std^2)` with the thread's generator
pub fn normal(shape: &[usize], mean: f32, std: f32) -> Result<Tensor> {
    let dist = Normal::new(mean, std)
        .map_err(|e| GraphError::InvalidParameter(format!("normal({mean}, {std}): {e}")))?;
    let len: usize = shape.iter().product();
    let data: Vec<f32> = config::with_rng(|rng| (0..len).map(|_| dist.sample(&mut *rng)).collect());
    from_vec(data, shape)
}

/// Xavier uniform initialization
///
/// Samples from `[-limit, limit]` with `limit = sqrt(6 / (fan_in + fan_out))`,
/// where `shape = [fan_out, fan_in]` as for [`dense`] weights.
pub fn xavier_uniform(shape: &[usize]) -> Result<Tensor> {
    let &[fan_out, fan_in] = shape else {
        return Err(GraphError::InvalidShape {
            op: "xavier_uniform",
            reason: format!("expected a rank-2 shape, got {shape:?}"),
        });
    };
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    let data: Vec<f32> = config::with_rng(|rng| {
        (0..fan_in * fan_out)
            .map(|_| rng.random_range(-limit..=limit))
            .collect()
    });
    from_vec(data, shape)
}

// ===== ELEMENT-WISE =====

pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    check_same_shape("add", a, b)?;
    apply(OpAlgoContext::new("Add"), &[a, b], a.shape())
}

pub fn sub(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    check_same_shape("sub", a, b)?;
    apply(OpAlgoContext::new("Sub"), &[a, b], a.shape())
}

pub fn mul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    check_same_shape("mul", a, b)?;
    apply(OpAlgoContext::new("Mul"), &[a, b], a.shape())
}

pub fn negative(x: &Tensor) -> Result<Tensor> {
    apply(OpAlgoContext::new("Negative"), &[x], x.shape())
}

/// `alpha * x`
pub fn scale(x: &Tensor, alpha: f32) -> Result<Tensor> {
    let mut ctx = OpAlgoContext::new("Scale");
    ctx.add_attr("alpha", alpha);
    apply(ctx, &[x], x.shape())
}

/// `(x1 - x2)^2`
pub fn squared_difference(x1: &Tensor, x2: &Tensor) -> Result<Tensor> {
    check_same_shape("squared_difference", x1, x2)?;
    apply(OpAlgoContext::new("SquaredDifference"), &[x1, x2], x1.shape())
}

/// Sum of equally shaped tensors. A single term is returned as is.
pub fn add_n(xs: &[Tensor]) -> Result<Tensor> {
    let Some(first) = xs.first() else {
        return Err(GraphError::InvalidParameter(
            "add_n needs at least one input".to_string(),
        ));
    };
    if xs.len() == 1 {
        return Ok(first.clone());
    }
    for x in &xs[1..] {
        check_same_shape("add_n", first, x)?;
    }
    let inputs: Vec<&Tensor> = xs.iter().collect();
    apply(OpAlgoContext::new("AddN"), &inputs, first.shape())
}

// ===== SHAPE =====

/// View of `x` with a new shape
///
/// Shares `x`'s buffer and never runs a kernel. Gradients pass through
/// unchanged.
pub fn reshape(x: &Tensor, shape: &[usize]) -> Result<Tensor> {
    let size: usize = shape.iter().product();
    if size != x.size() {
        return Err(GraphError::InvalidShape {
            op: "reshape",
            reason: format!(
                "cannot view {:?} ({} elements) as {shape:?} ({size} elements)",
                x.shape(),
                x.size()
            ),
        });
    }
    let y = Tensor::alias(x, shape)?;
    let mut ctx = OpAlgoContext::new("Reshape");
    ctx.add_input(x);
    ctx.add_attr("shape", shape_attr(shape)?);
    y.add_child(x)?;
    y.bind_view(ctx);
    Ok(y)
}

/// Shape two operands broadcast to, aligning trailing dimensions
///
/// - (3, 1) and (1, 4) -> (3, 4)
/// - (5, 3, 1) and (1, 4) -> (5, 3, 4)
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let dim = |s: &[usize], i: usize| {
        if i < rank - s.len() { 1 } else { s[i - (rank - s.len())] }
    };
    (0..rank)
        .map(|i| match (dim(a, i), dim(b, i)) {
            (x, y) if x == y => Ok(x),
            (1, y) => Ok(y),
            (x, 1) => Ok(x),
            _ => Err(GraphError::BroadcastError(a.to_vec(), b.to_vec())),
        })
        .collect()
}

/// Repeat `x` along size-1 (or missing leading) dimensions to `shape`
pub fn broadcast(x: &Tensor, shape: &[usize]) -> Result<Tensor> {
    if broadcast_shape(x.shape(), shape)? != shape {
        return Err(GraphError::BroadcastError(x.shape().to_vec(), shape.to_vec()));
    }
    let mut ctx = OpAlgoContext::new("Broadcasting");
    ctx.add_attr("broadcasting_shape", shape_attr(shape)?);
    apply(ctx, &[x], shape)
}

// ===== LINEAR ALGEBRA =====

/// `op(a) @ op(b)` for rank-2 operands, `op` transposing when requested
pub fn matmul(a: &Tensor, b: &Tensor, trans_a: bool, trans_b: bool) -> Result<Tensor> {
    let (&[ar, ac], &[br, bc]) = (a.shape(), b.shape()) else {
        return Err(GraphError::InvalidShape {
            op: "matmul",
            reason: format!("expected rank-2 operands, got {:?} and {:?}", a.shape(), b.shape()),
        });
    };
    let (m, k) = if trans_a { (ac, ar) } else { (ar, ac) };
    let (kb, n) = if trans_b { (bc, br) } else { (br, bc) };
    if k != kb {
        return Err(GraphError::ShapeMismatch {
            op: "matmul",
            lhs: a.shape().to_vec(),
            rhs: b.shape().to_vec(),
        });
    }
    let mut ctx = OpAlgoContext::new("MatMul");
    ctx.add_attr("trans_a", trans_a);
    ctx.add_attr("trans_b", trans_b);
    apply(ctx, &[a, b], &[m, n])
}

/// Fully connected layer: `x @ w^T + b`
///
/// `x: [batch, in]`, `w: [out, in]`, `b: [out]`.
pub fn dense(x: &Tensor, w: &Tensor, b: &Tensor) -> Result<Tensor> {
    let xw = matmul(x, w, false, true)?;
    let bias = broadcast(b, xw.shape())?;
    add(&xw, &bias)
}

/// Mean of all elements, shape `[1]`
pub fn reduce_mean(x: &Tensor) -> Result<Tensor> {
    if x.size() == 0 {
        return Err(GraphError::InvalidShape {
            op: "reduce_mean",
            reason: "mean of an empty tensor".to_string(),
        });
    }
    apply(OpAlgoContext::new("ReduceMean"), &[x], &[1])
}

// ===== NEURAL NETWORK =====

/// Inverted dropout
///
/// While training, each element is zeroed with probability `ratio` and the
/// survivors are scaled by `1 / (1 - ratio)`; otherwise `x` is copied. The
/// sampled mask is kept as an auxiliary output of the op.
pub fn dropout(x: &Tensor, ratio: f32, training: bool) -> Result<Tensor> {
    if !(0.0..1.0).contains(&ratio) {
        return Err(GraphError::InvalidParameter(format!(
            "dropout ratio must be in [0, 1), got {ratio}"
        )));
    }
    let mask = Tensor::new(x.shape(), x.dtype());
    let mut ctx = OpAlgoContext::new("Dropout");
    ctx.add_output(&mask);
    ctx.add_attr("dropout_ratio", ratio);
    ctx.add_attr("is_training_step", training);
    apply(ctx, &[x], x.shape())
}

/// Softmax over each row of `logits` followed by cross-entropy against
/// `labels`
///
/// `logits`, `labels: [m, n]`; the result is the per-row loss `[m]`. The
/// softmax probabilities are kept as an auxiliary output of the op.
pub fn softmax_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    check_same_shape("softmax_cross_entropy", logits, labels)?;
    let &[m, n] = logits.shape() else {
        return Err(GraphError::InvalidShape {
            op: "softmax_cross_entropy",
            reason: format!("expected rank-2 logits, got {:?}", logits.shape()),
        });
    };
    if n == 0 {
        return Err(GraphError::InvalidShape {
            op: "softmax_cross_entropy",
            reason: "logits need at least one class".to_string(),
        });
    }
    let prob = Tensor::new(logits.shape(), logits.dtype());
    let mut ctx = OpAlgoContext::new("SoftmaxCrossEntropy");
    ctx.add_output(&prob);
    apply(ctx, &[logits, labels], &[m])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_shape() {
        assert_eq!(broadcast_shape(&[3, 1], &[1, 4]).unwrap(), vec![3, 4]);
        assert_eq!(broadcast_shape(&[5, 3, 1], &[1, 4]).unwrap(), vec![5, 3, 4]);
        assert_eq!(broadcast_shape(&[4], &[2, 4]).unwrap(), vec![2, 4]);
        assert!(matches!(
            broadcast_shape(&[3], &[4]),
            Err(GraphError::BroadcastError(_, _))
        ));
    }

    #[test]
    fn test_shape_errors_before_binding() {
        let a = create_variable(&[2, 3]).unwrap();
        let b = create_variable(&[3, 2]).unwrap();
        assert!(matches!(add(&a, &b), Err(GraphError::ShapeMismatch { op: "add", .. })));
        assert!(matmul(&a, &a, false, false).is_err());
        assert_eq!(matmul(&a, &a, false, true).unwrap().shape(), &[2, 2]);
        assert_eq!(matmul(&a, &a, true, false).unwrap().shape(), &[3, 3]);
        assert!(reshape(&a, &[4]).is_err());
        assert!(broadcast(&a, &[3]).is_err());
        assert!(dropout(&a, 1.0, true).is_err());
    }

    #[test]
    fn test_softmax_cross_entropy_needs_classes() {
        let empty = create_variable(&[2, 0]).unwrap();
        assert!(matches!(
            softmax_cross_entropy(&empty, &empty),
            Err(GraphError::InvalidShape { op: "softmax_cross_entropy", .. })
        ));

        // zero rows is fine: an empty loss
        let rows = create_variable(&[0, 3]).unwrap();
        let loss = softmax_cross_entropy(&rows, &rows).unwrap();
        loss.eval();
        assert_eq!(loss.shape(), &[0]);
    }

    #[test]
    fn test_add_n_single_term_is_identity() {
        let a = constant(1.0, &[2]).unwrap();
        assert_eq!(add_n(std::slice::from_ref(&a)).unwrap(), a);
        assert!(add_n(&[]).is_err());
    }

    #[test]
    fn test_leaves() {
        let x = from_vec(vec![1i32, 2, 3, 4], &[2, 2]).unwrap();
        assert_eq!(x.dtype(), DType::I32);
        assert_eq!(x.op_name().as_deref(), Some("Identity"));
        assert!(from_vec(vec![1.0f32; 3], &[2, 2]).is_err());

        let c = full(&[3], 2.5, DType::F64).unwrap();
        assert_eq!(c.to_vec::<f64>().unwrap(), vec![2.5; 3]);
    }

    #[test]
    fn test_xavier_uniform_bounds() {
        config::manual_seed(0);
        let w = xavier_uniform(&[4, 8]).unwrap();
        let limit = (6.0f32 / 12.0).sqrt();
        assert!(w.to_vec::<f32>().unwrap().iter().all(|v| v.abs() <= limit));
        assert!(xavier_uniform(&[4]).is_err());
    }

    #[test]
    fn test_normal_is_seeded() {
        config::manual_seed(11);
        let a = normal(&[16], 0.0, 1.0).unwrap().to_vec::<f32>().unwrap();
        config::manual_seed(11);
        let b = normal(&[16], 0.0, 1.0).unwrap().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
        assert!(normal(&[2], 0.0, -1.0).is_err());
    }
}
