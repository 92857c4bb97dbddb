mod common;

use approx::assert_relative_eq;
use common::*;
use volta_graph::functional as F;
use volta_graph::*;

#[test]
fn test_squared_difference_end_to_end() {
    setup();
    let x1 = leaf(&[1.0, 2.0, 3.0]);
    let x2 = leaf(&[0.0, 0.0, 0.0]);
    let y = F::squared_difference(&x1, &x2).unwrap();

    y.eval();
    assert_eq!(values(&y), vec![1.0, 4.0, 9.0]);

    y.backprop().unwrap();
    assert_eq!(grad_values(&y), vec![1.0; 3]);
    assert_eq!(grad_values(&x1), vec![2.0, 4.0, 6.0]);
    assert_eq!(grad_values(&x2), vec![-2.0, -4.0, -6.0]);
}

#[test]
fn test_fan_in_gradients_are_summed() {
    setup();
    let x = leaf(&[1.0, 2.0]);
    let g1 = F::scale(&x, 2.0).unwrap();
    let g2 = F::scale(&x, 3.0).unwrap();
    let z = F::add(&g1, &g2).unwrap();

    z.eval();
    z.backprop().unwrap();
    assert_eq!(grad_values(&x), vec![5.0, 5.0]);

    // the summed gradient is recorded in the backward list
    let grad = x.grad().unwrap();
    assert!(z.backward_list().contains(&grad));
    assert_eq!(grad.op_name().as_deref(), Some("AddN"));
}

#[test]
fn test_same_input_twice() {
    setup();
    let x = leaf(&[3.0]);
    let y = F::mul(&x, &x).unwrap();
    y.eval();
    y.backprop().unwrap();
    assert_eq!(grad_values(&x), vec![6.0]);
}

#[test]
fn test_gradients_follow_input_order() {
    setup();
    let a = leaf(&[1.0, 2.0]);
    let b = leaf(&[10.0, 20.0]);
    let y = F::sub(&a, &b).unwrap();
    y.eval();
    y.backprop().unwrap();
    assert_eq!(grad_values(&a), vec![1.0, 1.0]);
    assert_eq!(grad_values(&b), vec![-1.0, -1.0]);

    let p = F::mul(&a, &b).unwrap();
    p.eval();
    p.backprop().unwrap();
    assert_eq!(grad_values(&a), vec![10.0, 20.0]);
    assert_eq!(grad_values(&b), vec![1.0, 2.0]);
}

#[test]
fn test_backprop_is_idempotent() {
    setup();
    let x = leaf(&[1.0, 2.0, 3.0]);
    let t = leaf(&[0.5, 0.5, 0.5]);
    let loss = F::reduce_mean(&F::squared_difference(&x, &t).unwrap()).unwrap();
    loss.eval();

    loss.backprop().unwrap();
    let first_list = loss.backward_list();
    let first = grad_values(&x);

    loss.backprop().unwrap();
    assert_eq!(loss.backward_list(), first_list);
    assert_eq!(grad_values(&x), first);
}

#[test]
fn test_gradients_refresh_after_mutation() {
    setup();
    let x = leaf(&[1.0, 2.0]);
    let t = leaf(&[0.0, 0.0]);
    let y = F::squared_difference(&x, &t).unwrap();
    y.eval();
    y.backprop().unwrap();
    assert_eq!(grad_values(&x), vec![2.0, 4.0]);

    x.set_data(&[5.0f32, -1.0]).unwrap();
    y.eval();
    y.backprop().unwrap();
    assert_eq!(grad_values(&x), vec![10.0, -2.0]);
}

#[test]
fn test_clear_grad_releases_the_step_graph() {
    setup();
    let w = leaf(&[0.5, -1.0]);
    let c = leaf(&[2.0, 3.0]);
    let (hidden, loss_ref) = {
        let y = F::negative(&w).unwrap();
        let loss = F::reduce_mean(&F::mul(&y, &c).unwrap()).unwrap();
        loss.eval();
        loss.backprop().unwrap();
        assert_eq!(grad_values(&w), vec![-1.0, -1.5]);

        loss.clear_grad();
        assert!(loss.backward_list().is_empty());
        assert!(w.grad().is_none() && c.grad().is_none() && y.grad().is_none());
        (y.downgrade(), loss.downgrade())
    };
    assert!(hidden.upgrade().is_none());
    assert!(loss_ref.upgrade().is_none());
    assert!(w.parents().is_empty());
}

#[test]
fn test_backprop_after_clear_grad_rebuilds() {
    setup();
    let x = leaf(&[1.0, 2.0]);
    let t = leaf(&[0.0, 0.0]);
    let y = F::squared_difference(&x, &t).unwrap();
    y.eval();
    y.backprop().unwrap();
    let first = y.backward_list();

    y.clear_grad();
    y.backprop().unwrap();
    assert_eq!(grad_values(&x), vec![2.0, 4.0]);
    assert_eq!(y.backward_list().len(), first.len());
    assert!(y.backward_list().iter().all(|g| !first.contains(g)));
}

#[test]
fn test_leaf_root_gets_seed_only() {
    setup();
    let x = leaf(&[1.0, 2.0]);
    x.backprop().unwrap();
    assert_eq!(grad_values(&x), vec![1.0, 1.0]);
    assert!(x.backward_list().is_empty());
}

#[test]
fn test_gradient_passes_through_reshape() {
    setup();
    let x = F::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    let v = F::reshape(&x, &[6]).unwrap();
    let zeros = F::constant(0.0, &[6]).unwrap();
    let loss = F::reduce_mean(&F::squared_difference(&v, &zeros).unwrap()).unwrap();

    loss.eval();
    loss.backprop().unwrap();

    let grad = x.grad().unwrap();
    assert_eq!(grad.shape(), &[2, 3]);
    for (g, x) in values(&grad).into_iter().zip(1..=6) {
        assert_relative_eq!(g, 2.0 * x as f32 / 6.0, epsilon = 1e-6);
    }
}

#[test]
fn test_custom_op_gradient() {
    setup();
    let x = leaf(&[1.0, 2.0]);
    let y = F::scale(&counted(&x, "custom-grad"), 4.0).unwrap();
    y.eval();
    y.backprop().unwrap();
    assert_eq!(values(&y), vec![8.0, 12.0]);
    assert_eq!(grad_values(&x), vec![4.0, 4.0]);
}

#[test]
fn test_missing_gradient_helper() {
    setup();
    let x = leaf(&[1.0]);
    let y = unary_op("NoGrad", &x).unwrap();
    y.eval();
    match y.backprop() {
        Err(GraphError::MissingGradientHelper { op }) => assert_eq!(op, "NoGrad"),
        other => panic!("expected MissingGradientHelper, got {other:?}"),
    }
}

#[test]
fn test_gradient_arity_checked() {
    setup();
    let x = leaf(&[1.0]);
    let y = unary_op("BadArity", &x).unwrap();
    assert!(matches!(
        y.backprop(),
        Err(GraphError::GradientArity {
            expected: 1,
            actual: 0,
            ..
        })
    ));
}

// ===== NUMERICAL CHECKS =====

fn assert_gradients(input: &Tensor, loss: &Tensor) {
    let check = check_gradients(input, loss, 1e-2, 1e-2).unwrap();
    assert!(check.passed, "gradient check failed: {check:?}");
}

#[test]
fn test_dense_gradients() {
    setup();
    manual_seed(42);
    let x = F::normal(&[3, 4], 0.0, 1.0).unwrap();
    let w = F::xavier_uniform(&[2, 4]).unwrap();
    let b = F::from_vec(vec![0.1f32, -0.2], &[2]).unwrap();
    let target = F::normal(&[3, 2], 0.0, 1.0).unwrap();

    let y = F::dense(&x, &w, &b).unwrap();
    assert_eq!(y.shape(), &[3, 2]);
    let loss = F::reduce_mean(&F::squared_difference(&y, &target).unwrap()).unwrap();

    assert_gradients(&x, &loss);
    assert_gradients(&w, &loss);
    assert_gradients(&b, &loss);
}

#[test]
fn test_matmul_transpose_gradients() {
    setup();
    manual_seed(7);
    for (trans_a, trans_b) in [(false, false), (true, false), (false, true), (true, true)] {
        let a_shape = if trans_a { [3, 2] } else { [2, 3] };
        let b_shape = if trans_b { [4, 3] } else { [3, 4] };
        let a = F::normal(&a_shape, 0.0, 1.0).unwrap();
        let b = F::normal(&b_shape, 0.0, 1.0).unwrap();
        let y = F::matmul(&a, &b, trans_a, trans_b).unwrap();
        assert_eq!(y.shape(), &[2, 4]);

        let loss = F::reduce_mean(&F::mul(&y, &y).unwrap()).unwrap();
        assert_gradients(&a, &loss);
        assert_gradients(&b, &loss);
    }
}

#[test]
fn test_softmax_cross_entropy_gradients() {
    setup();
    manual_seed(3);
    let logits = F::normal(&[2, 3], 0.0, 1.0).unwrap();
    let labels = F::from_vec(vec![0.0f32, 1.0, 0.0, 0.2, 0.3, 0.5], &[2, 3]).unwrap();
    let loss = F::reduce_mean(&F::softmax_cross_entropy(&logits, &labels).unwrap()).unwrap();

    assert_gradients(&logits, &loss);
    assert_eq!(grad_values(&labels), vec![0.0; 6]);
}

#[test]
fn test_broadcast_gradients() {
    setup();
    let x = F::from_vec(vec![0.5f32, -1.5], &[2, 1]).unwrap();
    let w = F::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    let y = F::mul(&F::broadcast(&x, &[2, 3]).unwrap(), &w).unwrap();
    let loss = F::reduce_mean(&F::mul(&y, &y).unwrap()).unwrap();
    assert_gradients(&x, &loss);
}
