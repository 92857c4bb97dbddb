//! Test-only ops, registered through the public extension API
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, Once};
use volta_graph::functional as F;
use volta_graph::registry;
use volta_graph::*;

static SETUP: Once = Once::new();

static COUNTS: LazyLock<Mutex<HashMap<String, usize>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Register the test ops and finalize the registries. Call first in every test.
pub fn setup() {
    SETUP.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
        registry::extend(register_test_ops).expect("registries finalized before setup");
        registry::finalize();
    });
}

/// Number of times a `Counted` kernel tagged `tag` has run
pub fn count(tag: &str) -> usize {
    COUNTS.lock().unwrap().get(tag).copied().unwrap_or(0)
}

fn register_test_ops(algos: &mut OpAlgoRegistry, helpers: &mut GradientHelperRegistry) {
    for (device, name) in [("Any", "tier/any"), ("CPU", "tier/cpu"), ("CPU(SIMD)", "tier/simd")] {
        algos.register(
            OpAlgoSchema::builder("TierOp")
                .input("X", DType::F32)
                .output("Y", DType::F32)
                .device(device)
                .creator(move |_ctx| Ok(Box::new(Named(name)) as Box<dyn OpAlgo>))
                .finish(),
        );
    }
    algos.register(
        OpAlgoSchema::builder("AnyOnly")
            .output("Y", DType::F32)
            .device("Any")
            .creator(|_ctx| Ok(Box::new(Named("any-only")) as Box<dyn OpAlgo>))
            .finish(),
    );
    algos.register(
        OpAlgoSchema::builder("Counted")
            .input("X", DType::F32)
            .output("Y", DType::F32)
            .device("CPU")
            .creator(CountedKernel::create)
            .finish(),
    );
    helpers.register("Counted", |_ctx| Box::new(PassThrough));

    // Kernel without a gradient helper
    algos.register(
        OpAlgoSchema::builder("NoGrad")
            .input("X", DType::F32)
            .output("Y", DType::F32)
            .device("Any")
            .creator(|_ctx| Ok(Box::new(Named("no-grad")) as Box<dyn OpAlgo>))
            .finish(),
    );

    // Helper that forgets its input
    algos.register(
        OpAlgoSchema::builder("BadArity")
            .input("X", DType::F32)
            .output("Y", DType::F32)
            .device("Any")
            .creator(|_ctx| Ok(Box::new(Named("bad-arity")) as Box<dyn OpAlgo>))
            .finish(),
    );
    helpers.register("BadArity", |_ctx| Box::new(NoGradients));
}

struct Named(&'static str);

impl OpAlgo for Named {
    fn name(&self) -> &str {
        self.0
    }

    fn compute(&mut self) {}
}

/// `y = x + 1`, counting invocations per tag
struct CountedKernel {
    tag: String,
    x: MemoryRef,
    y: MemoryRef,
}

impl CountedKernel {
    fn create(ctx: &OpAlgoContext) -> Result<Box<dyn OpAlgo>> {
        let x = ctx.input(0)?.memory().ok_or(GraphError::NoMemory)?;
        let y = ctx.bound_output()?.memory().ok_or(GraphError::NoMemory)?;
        Ok(Box::new(CountedKernel {
            tag: ctx.attr("tag")?,
            x,
            y,
        }))
    }
}

impl OpAlgo for CountedKernel {
    fn name(&self) -> &str {
        "Counted"
    }

    fn compute(&mut self) {
        *COUNTS.lock().unwrap().entry(self.tag.clone()).or_default() += 1;
        let x = self.x.host_data::<f32>().unwrap();
        let mut y = self.y.mutable_host_data::<f32>().unwrap();
        for (y, &x) in y.iter_mut().zip(x.iter()) {
            *y = x + 1.0;
        }
    }
}

struct PassThrough;

impl GradientHelper for PassThrough {
    fn compute_gradient(&self, _y: &Tensor, dy: &Tensor) -> Result<Vec<Tensor>> {
        Ok(vec![dy.clone()])
    }
}

struct NoGradients;

impl GradientHelper for NoGradients {
    fn compute_gradient(&self, _y: &Tensor, _dy: &Tensor) -> Result<Vec<Tensor>> {
        Ok(Vec::new())
    }
}

/// Bind a unary test op the same way the built-in builders do
pub fn unary_op(op: &str, x: &Tensor) -> Result<Tensor> {
    unary_op_with(OpAlgoContext::new(op), x)
}

pub fn unary_op_with(mut ctx: OpAlgoContext, x: &Tensor) -> Result<Tensor> {
    let y = Tensor::new(x.shape(), x.dtype());
    ctx.add_input(x);
    y.add_child(x)?;
    y.bind_op(ctx)?;
    Ok(y)
}

/// `x + 1`, recorded under `tag`
pub fn counted(x: &Tensor, tag: &str) -> Tensor {
    let mut ctx = OpAlgoContext::new("Counted");
    ctx.add_attr("tag", tag);
    unary_op_with(ctx, x).unwrap()
}

pub fn values(t: &Tensor) -> Vec<f32> {
    t.to_vec::<f32>().unwrap()
}

pub fn grad_values(t: &Tensor) -> Vec<f32> {
    values(&t.grad().expect("tensor has no gradient"))
}

pub fn leaf(data: &[f32]) -> Tensor {
    F::from_vec(data.to_vec(), &[data.len()]).unwrap()
}
