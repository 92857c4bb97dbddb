// ===== NUMERICAL GRADIENT CHECKING =====

use crate::error::{GraphError, Result};
use crate::tensor::Tensor;

/// Outcome of [`check_gradients`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradCheck {
    pub max_error: f32,
    pub mean_error: f32,
    pub passed: bool,
}

/// Compare the gradient `backprop` computes for `input` against central
/// differences `(f(x+e) - f(x-e)) / 2e`, where `f` is the sum of `loss`.
///
/// `loss` must be built from `input` and evaluate deterministically
/// (no training-mode dropout). The graph is reused: each perturbation
/// rewrites `input` in place and re-evaluates only what it dirtied.
/// Errors are relative for gradients of magnitude above 1, absolute below.
pub fn check_gradients(
    input: &Tensor,
    loss: &Tensor,
    epsilon: f32,
    tolerance: f32,
) -> Result<GradCheck> {
    loss.eval();
    loss.backprop()?;
    let grad = input.grad().ok_or_else(|| {
        GraphError::InvalidParameter("input is not reachable from the loss".to_string())
    })?;
    let analytical = grad.to_vec::<f32>()?;
    let original = input.to_vec::<f32>()?;

    let loss_at = |i: usize, value: f32| -> Result<f32> {
        input.with_data_mut(|data: &mut [f32]| data[i] = value)?;
        loss.eval();
        loss.with_data(|l: &[f32]| l.iter().sum())
    };

    let mut max_error: f32 = 0.0;
    let mut total_error: f32 = 0.0;
    for (i, (&x, &a)) in original.iter().zip(&analytical).enumerate() {
        let plus = loss_at(i, x + epsilon)?;
        let minus = loss_at(i, x - epsilon)?;
        loss_at(i, x)?;
        let numerical = (plus - minus) / (2.0 * epsilon);

        let error = (a - numerical).abs() / numerical.abs().max(1.0);
        if error > tolerance {
            log::warn!(
                "gradient mismatch at index {i}: analytical={a:.6e}, numerical={numerical:.6e}, error={error:.6e}"
            );
        }
        max_error = max_error.max(error);
        total_error += error;
    }

    let mean_error = total_error / analytical.len().max(1) as f32;
    Ok(GradCheck {
        max_error,
        mean_error,
        passed: max_error < tolerance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functional as F;

    #[test]
    fn test_squared_difference_passes() {
        let x = F::from_vec(vec![0.5f32, -1.0, 2.0], &[3]).unwrap();
        let t = F::from_vec(vec![1.0f32, 1.0, 1.0], &[3]).unwrap();
        let loss = F::reduce_mean(&F::squared_difference(&x, &t).unwrap()).unwrap();

        let check = check_gradients(&x, &loss, 1e-2, 1e-2).unwrap();
        assert!(check.passed, "{check:?}");
        // input restored
        assert_eq!(x.to_vec::<f32>().unwrap(), vec![0.5, -1.0, 2.0]);
    }

    #[test]
    fn test_unreachable_input() {
        let x = F::constant(1.0, &[2]).unwrap();
        let other = F::constant(1.0, &[2]).unwrap();
        let loss = F::reduce_mean(&other).unwrap();
        assert!(check_gradients(&x, &loss, 1e-2, 1e-2).is_err());
    }
}
