use crate::config;
use crate::dtype::{DType, Element};
use crate::error::{GraphError, Result};
use crate::functional;
use crate::gradient::GradientHelperRegistry;
use crate::op_algo::{OpAlgo, OpAlgoContext, OpAlgoRegistry, resolve_op_key};
use crate::storage::{Memory, MemoryRef, Storage};
use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

/// Handle to a node of the computation graph.
///
/// Cloning a `Tensor` aliases the same node; equality and hashing are by
/// node identity, not by value.
///
/// Edge naming follows the data flow backwards: a node's **children** are
/// the inputs it reads, its **parents** are the nodes that consume it.
/// Children are held strongly, parents weakly, so dropping the output of a
/// graph releases everything only it referenced.
///
/// **Note**: single-threaded only (`Rc`/`RefCell`).
#[derive(Clone)]
pub struct Tensor {
    inner: Rc<TensorInner>,
}

/// Non-owning handle, see [`Tensor::downgrade`]
#[derive(Clone)]
pub struct WeakTensor {
    inner: Weak<TensorInner>,
}

impl WeakTensor {
    pub fn upgrade(&self) -> Option<Tensor> {
        self.inner.upgrade().map(|inner| Tensor { inner })
    }
}

// ===== NODE STRUCTURE =====

struct TensorInner {
    shape: Vec<usize>,
    dtype: DType,
    memory: Option<MemoryRef>,
    parents: RefCell<Vec<Weak<TensorInner>>>,
    children: RefCell<Vec<Tensor>>,
    exec_order: Cell<usize>,
    kernel: RefCell<Option<Box<dyn OpAlgo>>>,
    context: RefCell<Option<OpAlgoContext>>,
    gradient: RefCell<Option<Tensor>>,
    dirty: Cell<bool>,
    is_view: Cell<bool>,
    // Dependencies in execution order, excluding the node itself
    plan: RefCell<Vec<Tensor>>,
    plan_stale: Cell<bool>,
    backward_list: RefCell<Option<Vec<Tensor>>>,
}

// ===== CONSTRUCTORS =====

impl Tensor {
    fn from_parts(shape: Vec<usize>, dtype: DType, memory: MemoryRef) -> Tensor {
        Tensor {
            inner: Rc::new(TensorInner {
                shape,
                dtype,
                memory: Some(memory),
                parents: RefCell::new(Vec::new()),
                children: RefCell::new(Vec::new()),
                exec_order: Cell::new(0),
                kernel: RefCell::new(None),
                context: RefCell::new(None),
                gradient: RefCell::new(None),
                dirty: Cell::new(true),
                is_view: Cell::new(false),
                plan: RefCell::new(Vec::new()),
                plan_stale: Cell::new(true),
                backward_list: RefCell::new(None),
            }),
        }
    }

    /// Unbound node with a zero-filled buffer
    ///
    /// Functional builders allocate their outputs with this and then bind a
    /// kernel through [`Tensor::bind_op`].
    pub fn new(shape: &[usize], dtype: DType) -> Tensor {
        let len = shape.iter().product();
        Self::from_parts(shape.to_vec(), dtype, Memory::zeros(dtype, len))
    }

    /// Unbound node owning `storage`
    pub fn from_storage(storage: Storage, shape: &[usize]) -> Result<Tensor> {
        let expected: usize = shape.iter().product();
        if storage.len() != expected {
            return Err(GraphError::InvalidShape {
                op: "from_storage",
                reason: format!(
                    "{} elements do not fill shape {shape:?} ({expected} elements)",
                    storage.len()
                ),
            });
        }
        let dtype = storage.dtype();
        Ok(Self::from_parts(shape.to_vec(), dtype, Memory::new(storage)))
    }

    /// Unbound node aliasing `source`'s buffer under a new shape
    pub(crate) fn alias(source: &Tensor, shape: &[usize]) -> Result<Tensor> {
        let memory = source.memory().ok_or(GraphError::NoMemory)?;
        let expected: usize = shape.iter().product();
        if memory.len() != expected {
            return Err(GraphError::InvalidShape {
                op: "alias",
                reason: format!(
                    "buffer of {} elements cannot be viewed as {shape:?}",
                    memory.len()
                ),
            });
        }
        let dtype = memory.dtype();
        Ok(Self::from_parts(shape.to_vec(), dtype, memory))
    }
}

// ===== ACCESSORS =====

impl Tensor {
    pub fn shape(&self) -> &[usize] {
        &self.inner.shape
    }

    /// Number of dimensions
    pub fn dims(&self) -> usize {
        self.inner.shape.len()
    }

    /// Number of elements
    pub fn size(&self) -> usize {
        self.inner.shape.iter().product()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn memory(&self) -> Option<MemoryRef> {
        self.inner.memory.clone()
    }

    pub fn exec_order(&self) -> usize {
        self.inner.exec_order.get()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.get()
    }

    pub fn has_kernel(&self) -> bool {
        self.inner.kernel.borrow().is_some()
    }

    /// Name reported by the bound kernel
    pub fn kernel_name(&self) -> Option<String> {
        self.inner.kernel.borrow().as_ref().map(|k| k.name().to_string())
    }

    /// True for nodes that alias a child's buffer instead of computing
    pub fn is_view(&self) -> bool {
        self.inner.is_view.get()
    }

    /// Op this node was bound to, if any
    pub fn op_name(&self) -> Option<String> {
        self.inner
            .context
            .borrow()
            .as_ref()
            .map(|ctx| ctx.op_name().to_string())
    }

    pub fn context(&self) -> Option<OpAlgoContext> {
        self.inner.context.borrow().clone()
    }

    /// Gradient of the last `backprop` root with respect to this node
    pub fn grad(&self) -> Option<Tensor> {
        self.inner.gradient.borrow().clone()
    }

    /// Live consumers of this node
    pub fn parents(&self) -> Vec<Tensor> {
        self.inner
            .parents
            .borrow()
            .iter()
            .filter_map(|p| p.upgrade().map(|inner| Tensor { inner }))
            .collect()
    }

    /// Inputs of this node, in binding order
    pub fn children(&self) -> Vec<Tensor> {
        self.inner.children.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakTensor {
        WeakTensor {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Tensor {}

impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Rc::as_ptr(&self.inner).hash(state);
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.inner.shape)
            .field("dtype", &self.inner.dtype)
            .field("op", &self.op_name())
            .field("exec_order", &self.exec_order())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

// ===== GRAPH EDGES =====

impl Tensor {
    /// Record that `self` reads `child`.
    ///
    /// Raises `self`'s execution order above the child's and pushes the
    /// raise through every existing consumer of `self`, so the ordering
    /// holds on every edge of the graph. An edge that would make `self`
    /// depend on itself is refused with `InvalidParameter`.
    pub fn add_child(&self, child: &Tensor) -> Result<()> {
        if self.feeds(child) {
            return Err(GraphError::InvalidParameter(format!(
                "edge {self:?} -> {child:?} would create a cycle"
            )));
        }
        self.inner.children.borrow_mut().push(child.clone());
        {
            let mut parents = child.inner.parents.borrow_mut();
            parents.retain(|p| p.strong_count() > 0);
            parents.push(Rc::downgrade(&self.inner));
        }
        self.raise_exec_order(child.exec_order() + 1);
        self.invalidate_plans();
        Ok(())
    }

    /// Record that `parent` reads `self`
    pub fn add_parent(&self, parent: &Tensor) -> Result<()> {
        parent.add_child(self)
    }

    /// True if `target` is `self` or one of its (transitive) consumers.
    // Orders strictly increase along consumer edges, so nodes already at
    // or above `target`'s order cannot lead to it.
    fn feeds(&self, target: &Tensor) -> bool {
        let limit = target.exec_order();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([self.clone()]);
        while let Some(node) = queue.pop_front() {
            if node.ptr_eq(target) {
                return true;
            }
            if node.exec_order() >= limit || !seen.insert(node.clone()) {
                continue;
            }
            queue.extend(node.parents());
        }
        false
    }

    fn raise_exec_order(&self, at_least: usize) {
        let mut queue = VecDeque::from([(self.clone(), at_least)]);
        while let Some((node, at_least)) = queue.pop_front() {
            if node.exec_order() >= at_least {
                continue;
            }
            node.inner.exec_order.set(at_least);
            for parent in node.parents() {
                queue.push_back((parent, at_least + 1));
            }
        }
    }

    // A new dependency of `self` is a new dependency of every consumer.
    fn invalidate_plans(&self) {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([self.clone()]);
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node.clone()) {
                continue;
            }
            node.inner.plan_stale.set(true);
            queue.extend(node.parents());
        }
    }
}

/// Breadth-first walk over children, starting with (and including) `root`
fn visit_bfs(root: &Tensor) -> Vec<Tensor> {
    let mut visited = HashSet::from([root.clone()]);
    let mut queue = VecDeque::from([root.clone()]);
    let mut order = Vec::new();
    while let Some(node) = queue.pop_front() {
        for child in node.inner.children.borrow().iter() {
            if visited.insert(child.clone()) {
                queue.push_back(child.clone());
            }
        }
        order.push(node);
    }
    order
}

// ===== OP BINDING =====

impl Tensor {
    /// Bind `self` to the kernel selected for `ctx`'s op on the enabled
    /// device.
    ///
    /// Caches the forward plan, appends `self` as the last output of `ctx`
    /// and resolves `device(accelerator)`, `device`, then `Any`.
    /// Children must be linked with [`Tensor::add_child`] beforehand.
    pub fn bind_op(&self, mut ctx: OpAlgoContext) -> Result<()> {
        self.refresh_plan();
        ctx.add_output(self);

        let device = config::enabled_device();
        let registry = OpAlgoRegistry::global();
        let Some(key) = resolve_op_key(registry, ctx.op_name(), &device) else {
            return Err(GraphError::UnsupportedOp {
                op: ctx.op_name().to_string(),
            });
        };
        log::debug!("bind {} -> {key}", ctx.op_name());

        let kernel = registry.get_op_algo(&key, &ctx)?;
        *self.inner.kernel.borrow_mut() = Some(kernel);
        *self.inner.context.borrow_mut() = Some(ctx);
        Ok(())
    }

    /// Bind `self` as a view: no kernel runs, the buffer is shared with the
    /// child.
    pub(crate) fn bind_view(&self, mut ctx: OpAlgoContext) {
        self.refresh_plan();
        ctx.add_output(self);
        log::debug!("bind {} as view", ctx.op_name());
        self.inner.is_view.set(true);
        *self.inner.context.borrow_mut() = Some(ctx);
    }

    fn refresh_plan(&self) {
        if !self.inner.plan_stale.replace(false) {
            return;
        }
        let mut plan = visit_bfs(self);
        plan.reverse();
        // Reversed BFS alone misorders diamonds with unequal path lengths
        plan.sort_by_key(Tensor::exec_order);
        plan.retain(|node| !node.ptr_eq(self));
        *self.inner.plan.borrow_mut() = plan;
    }

    /// Forward execution plan: every dependency, then `self`
    pub fn compute_list(&self) -> Vec<Tensor> {
        self.refresh_plan();
        let mut list = self.inner.plan.borrow().clone();
        list.push(self.clone());
        list
    }
}

// ===== FORWARD EVALUATION =====

impl Tensor {
    /// Recompute every dirty node this tensor depends on, then itself.
    ///
    /// Clean nodes are skipped, so a second `eval` with no intervening
    /// mutation runs nothing.
    pub fn eval(&self) {
        self.refresh_plan();
        let plan = self.inner.plan.borrow().clone();
        for node in plan.iter().chain(std::iter::once(self)) {
            node.run_if_dirty();
        }
    }

    fn run_if_dirty(&self) {
        if !self.inner.dirty.get() {
            return;
        }
        if let Some(kernel) = self.inner.kernel.borrow_mut().as_mut() {
            log::trace!("compute {} (exec_order {})", kernel.name(), self.exec_order());
            kernel.compute();
        }
        // Kernel-less nodes (views) only relay the change to their consumers
        self.inner.dirty.set(false);
        self.mark_parents_dirty();
    }

    /// Mark this node and its consumers for recomputation
    pub fn mark_dirty(&self) {
        self.inner.dirty.set(true);
        self.mark_parents_dirty();
    }

    fn mark_parents_dirty(&self) {
        for parent in self.parents() {
            parent.inner.dirty.set(true);
        }
    }
}

// ===== BACKPROPAGATION =====

impl Tensor {
    /// Build (once) and evaluate the gradient graph rooted at `self`.
    ///
    /// `self` is seeded with ones of its own shape. Afterwards every node
    /// reachable through children carries its gradient in [`Tensor::grad`].
    /// Calling again reuses the cached backward list and only re-evaluates it.
    pub fn backprop(&self) -> Result<()> {
        if self.inner.backward_list.borrow().is_none() {
            let list = self.compute_gradient()?;
            *self.inner.backward_list.borrow_mut() = Some(list);
        }
        for grad in self.backward_list() {
            grad.eval();
        }
        Ok(())
    }

    /// Gradient nodes built by the last `backprop`, in creation order
    pub fn backward_list(&self) -> Vec<Tensor> {
        self.inner.backward_list.borrow().clone().unwrap_or_default()
    }

    /// Drop the gradient graph built by [`Tensor::backprop`] together with
    /// the gradient slot of every node reachable from `self`.
    ///
    /// Gradient nodes read the forward nodes they differentiate, so a
    /// backpropagated graph is only released once its gradients are cleared.
    /// The next `backprop` rebuilds the gradient graph.
    pub fn clear_grad(&self) {
        self.inner.backward_list.borrow_mut().take();
        for node in visit_bfs(self) {
            node.inner.gradient.borrow_mut().take();
        }
    }

    fn compute_gradient(&self) -> Result<Vec<Tensor>> {
        if !self.dtype().is_float() {
            return Err(GraphError::InvalidParameter(format!(
                "cannot differentiate a {} tensor",
                self.dtype()
            )));
        }
        let mut nodes = visit_bfs(self);
        nodes.sort_by_key(|node| Reverse(node.exec_order()));

        let seed = functional::full(self.shape(), 1.0, self.dtype())?;
        *self.inner.gradient.borrow_mut() = Some(seed.clone());

        let mut collector: HashMap<Tensor, Vec<Tensor>> = HashMap::new();
        collector.insert(self.clone(), vec![seed]);
        let mut backward_list = Vec::new();
        let helpers = GradientHelperRegistry::global();

        for var in &nodes {
            let Some(terms) = collector.remove(var) else {
                continue;
            };
            let (dy, grads) = if var.has_kernel() {
                let ctx = var.context().ok_or_else(|| {
                    GraphError::InvalidParameter("bound node has no context".to_string())
                })?;
                let helper = helpers.get_helper(ctx.op_name(), &ctx)?;
                let dy = functional::add_n(&terms)?;
                let grads = helper.compute_gradient(var, &dy)?;
                (dy, grads)
            } else if var.is_view() {
                // Views route the summed gradient back to their source unchanged
                let dy = functional::add_n(&terms)?;
                let grads = var
                    .children()
                    .iter()
                    .map(|child| functional::reshape(&dy, child.shape()))
                    .collect::<Result<Vec<_>>>()?;
                (dy, grads)
            } else {
                continue;
            };

            let children = var.children();
            if grads.len() != children.len() {
                return Err(GraphError::GradientArity {
                    op: var.op_name().unwrap_or_default(),
                    expected: children.len(),
                    actual: grads.len(),
                });
            }
            if terms.len() > 1 {
                *var.inner.gradient.borrow_mut() = Some(dy.clone());
                backward_list.push(dy);
            }
            for (child, grad) in children.iter().zip(grads) {
                collector.entry(child.clone()).or_default().push(grad.clone());
                *child.inner.gradient.borrow_mut() = Some(grad.clone());
                backward_list.push(grad);
            }
        }

        log::debug!(
            "backward graph: {} forward nodes, {} gradient nodes",
            nodes.len(),
            backward_list.len()
        );
        Ok(backward_list)
    }
}

// ===== DATA ACCESS =====

impl Tensor {
    /// Copy the buffer out. Does not evaluate.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.with_data(|data: &[T]| data.to_vec())
    }

    /// Borrow the buffer as `&[T]`
    pub fn with_data<T: Element, R>(&self, f: impl FnOnce(&[T]) -> R) -> Result<R> {
        let memory = self.inner.memory.as_ref().ok_or(GraphError::NoMemory)?;
        let data = memory.host_data::<T>()?;
        Ok(f(&data))
    }

    /// Mutate the buffer in place, marking this node and its consumers
    /// dirty.
    ///
    /// Views share memory with their source; writing through a view does
    /// not dirty the source's other consumers.
    pub fn with_data_mut<T: Element, R>(&self, f: impl FnOnce(&mut [T]) -> R) -> Result<R> {
        let memory = self.inner.memory.as_ref().ok_or(GraphError::NoMemory)?;
        let result = {
            let mut data = memory.mutable_host_data::<T>()?;
            f(&mut data)
        };
        self.mark_dirty();
        Ok(result)
    }

    /// Overwrite the whole buffer
    pub fn set_data<T: Element>(&self, values: &[T]) -> Result<()> {
        if values.len() != self.size() {
            return Err(GraphError::InvalidShape {
                op: "set_data",
                reason: format!(
                    "{} values for shape {:?} ({} elements)",
                    values.len(),
                    self.shape(),
                    self.size()
                ),
            });
        }
        self.with_data_mut(|data: &mut [T]| data.copy_from_slice(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_order_propagates_to_existing_parents() {
        let a = Tensor::new(&[1], DType::F32);
        let b = Tensor::new(&[1], DType::F32);
        let c = Tensor::new(&[1], DType::F32);
        b.add_child(&a).unwrap();
        assert_eq!(b.exec_order(), 1);

        // c gets a deeper child after b already depends on it
        a.add_child(&c).unwrap();
        assert_eq!(a.exec_order(), 1);
        assert_eq!(b.exec_order(), 2);
        for (p, ch) in [(&b, &a), (&a, &c)] {
            assert!(p.exec_order() > ch.exec_order());
        }
    }

    #[test]
    fn test_cycle_edges_are_refused() {
        let a = Tensor::new(&[1], DType::F32);
        let b = Tensor::new(&[1], DType::F32);
        let c = Tensor::new(&[1], DType::F32);
        a.add_child(&b).unwrap();
        c.add_child(&a).unwrap();

        assert!(matches!(a.add_child(&a), Err(GraphError::InvalidParameter(_))));
        assert!(matches!(b.add_child(&a), Err(GraphError::InvalidParameter(_))));
        assert!(matches!(b.add_child(&c), Err(GraphError::InvalidParameter(_))));
        assert!(a.add_parent(&b).is_err());

        // refused edges leave the graph untouched
        assert!(b.children().is_empty());
        assert_eq!((b.exec_order(), a.exec_order(), c.exec_order()), (0, 1, 2));
        assert_eq!(c.compute_list(), vec![b, a, c.clone()]);
    }

    #[test]
    fn test_edges_are_symmetric() {
        let x = Tensor::new(&[2], DType::F32);
        let y = Tensor::new(&[2], DType::F32);
        x.add_parent(&y).unwrap();
        assert_eq!(y.children(), vec![x.clone()]);
        assert_eq!(x.parents(), vec![y.clone()]);
    }

    #[test]
    fn test_parents_are_weak() {
        let x = Tensor::new(&[2], DType::F32);
        {
            let y = Tensor::new(&[2], DType::F32);
            y.add_child(&x).unwrap();
            assert_eq!(x.parents().len(), 1);
        }
        assert!(x.parents().is_empty());
    }

    #[test]
    fn test_compute_list_diamond_is_topological() {
        // z reads x directly and through y1 -> y2
        let x = Tensor::new(&[1], DType::F32);
        let y1 = Tensor::new(&[1], DType::F32);
        let y2 = Tensor::new(&[1], DType::F32);
        let z = Tensor::new(&[1], DType::F32);
        y1.add_child(&x).unwrap();
        y2.add_child(&y1).unwrap();
        z.add_child(&x).unwrap();
        z.add_child(&y2).unwrap();

        assert_eq!(z.compute_list(), vec![x, y1, y2, z.clone()]);
    }

    #[test]
    fn test_set_data_checks_length_and_marks_dirty() {
        let x = Tensor::new(&[3], DType::F32);
        let y = Tensor::new(&[3], DType::F32);
        y.add_child(&x).unwrap();
        x.eval();
        y.eval();
        assert!(!x.is_dirty());
        assert!(!y.is_dirty());

        assert!(x.set_data(&[1.0f32, 2.0]).is_err());
        x.set_data(&[1.0f32, 2.0, 3.0]).unwrap();
        assert!(x.is_dirty());
        assert!(y.is_dirty());
        assert_eq!(x.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_identity_equality() {
        let a = Tensor::new(&[1], DType::F32);
        let b = Tensor::new(&[1], DType::F32);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.downgrade().upgrade(), Some(a.clone()));
    }

    #[test]
    fn test_integer_root_cannot_backprop() {
        let x = Tensor::new(&[2], DType::I32);
        assert!(matches!(x.backprop(), Err(GraphError::InvalidParameter(_))));
        assert!(x.grad().is_none());
    }

    #[test]
    fn test_dead_parent_links_are_pruned() {
        let x = Tensor::new(&[1], DType::F32);
        for _ in 0..3 {
            let y = Tensor::new(&[1], DType::F32);
            y.add_child(&x).unwrap();
        }
        let y = Tensor::new(&[1], DType::F32);
        y.add_child(&x).unwrap();
        assert_eq!(x.inner.parents.borrow().len(), 1);
    }

    #[test]
    fn test_wrong_element_type() {
        let x = Tensor::new(&[2], DType::F32);
        assert!(matches!(
            x.to_vec::<i32>(),
            Err(GraphError::DTypeMismatch { .. })
        ));
    }
}
