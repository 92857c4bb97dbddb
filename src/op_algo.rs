//! Op algorithms (kernels), their schemas, and the registry that binds
//! op names to them.
//!
//! A kernel is registered under a key of the form
//! `Name:<op>/Device:<device>`, optionally qualified with an accelerator,
//! e.g. `Name:MatMul/Device:CPU(SIMD)`. Graph construction resolves the most
//! specific key available for the enabled device (see [`resolve_op_key`]).
//!
//! ```ignore
//! let schema = OpAlgoSchema::builder("Scale")
//!     .input("X", DType::F32)
//!     .output("Y", DType::F32)
//!     .device("CPU")
//!     .creator(ScaleKernel::create)
//!     .finish();
//! registry.register(schema);
//! ```

use crate::attribute::{AttrValue, Attributes, FromAttr};
use crate::device::{Device, EnabledDevice};
use crate::dtype::DType;
use crate::error::{GraphError, Result};
use crate::tensor::{Tensor, WeakTensor};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

// ===== KERNEL TRAIT =====

/// A concrete, device- and type-specialized implementation of an op.
///
/// Kernels pull their bound inputs, outputs and attributes out of the
/// [`OpAlgoContext`] when they are created. `compute` reads the inputs and
/// writes the outputs in place; it never touches other tensors.
pub trait OpAlgo {
    /// Op name this kernel implements (`"Add"`, `"MatMul"`, ...)
    fn name(&self) -> &str;

    fn compute(&mut self);
}

pub type OpAlgoCreator = Arc<dyn Fn(&OpAlgoContext) -> Result<Box<dyn OpAlgo>> + Send + Sync>;

/// `Name:<op>/Device:<device>`
pub fn op_algo_key(op: &str, device: &str) -> String {
    format!("Name:{op}/Device:{device}")
}

/// `Name:<op>/Device:<device>(<accelerator>)`
pub fn op_algo_key_with_accel(op: &str, device: &str, accelerator: &str) -> String {
    format!("Name:{op}/Device:{device}({accelerator})")
}

// ===== SCHEMA =====

/// Immutable description of a registered kernel
#[derive(Clone)]
pub struct OpAlgoSchema {
    name: String,
    op_name: String,
    inputs: Vec<(String, DType)>,
    outputs: Vec<(String, DType)>,
    device: String,
    creator: OpAlgoCreator,
}

impl OpAlgoSchema {
    pub fn builder(op_name: impl Into<String>) -> OpAlgoSchemaBuilder {
        OpAlgoSchemaBuilder {
            op_name: op_name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            device: Device::Any.name().to_string(),
            creator: None,
        }
    }

    /// Full registry key
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op_name(&self) -> &str {
        &self.op_name
    }

    pub fn input(&self, name: &str) -> Option<DType> {
        lookup(&self.inputs, name)
    }

    pub fn output(&self, name: &str) -> Option<DType> {
        lookup(&self.outputs, name)
    }

    pub fn inputs(&self) -> &[(String, DType)] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[(String, DType)] {
        &self.outputs
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn creator(&self) -> &OpAlgoCreator {
        &self.creator
    }
}

fn lookup(entries: &[(String, DType)], name: &str) -> Option<DType> {
    entries
        .iter()
        .find(|(n, _)| n == name)
        .map(|&(_, dtype)| dtype)
}

impl fmt::Debug for OpAlgoSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpAlgoSchema")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("device", &self.device)
            .finish()
    }
}

pub struct OpAlgoSchemaBuilder {
    op_name: String,
    inputs: Vec<(String, DType)>,
    outputs: Vec<(String, DType)>,
    device: String,
    creator: Option<OpAlgoCreator>,
}

impl OpAlgoSchemaBuilder {
    /// Declare an input. Redeclaring a name replaces its type.
    pub fn input(mut self, name: &str, dtype: DType) -> Self {
        upsert(&mut self.inputs, name, dtype);
        self
    }

    pub fn output(mut self, name: &str, dtype: DType) -> Self {
        upsert(&mut self.outputs, name, dtype);
        self
    }

    /// Target device, either a plain device (`"CPU"`) or an
    /// accelerator-qualified one (`"CPU(SIMD)"`). Defaults to `"Any"`.
    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn creator<F>(mut self, f: F) -> Self
    where
        F: Fn(&OpAlgoContext) -> Result<Box<dyn OpAlgo>> + Send + Sync + 'static,
    {
        self.creator = Some(Arc::new(f));
        self
    }

    /// # Panics
    /// A schema without a creator is a registration bug.
    pub fn finish(self) -> OpAlgoSchema {
        let Some(creator) = self.creator else {
            panic!("OpAlgoSchema for {} finished without a creator", self.op_name);
        };
        OpAlgoSchema {
            name: op_algo_key(&self.op_name, &self.device),
            op_name: self.op_name,
            inputs: self.inputs,
            outputs: self.outputs,
            device: self.device,
            creator,
        }
    }
}

fn upsert(entries: &mut Vec<(String, DType)>, name: &str, dtype: DType) {
    match entries.iter_mut().find(|(n, _)| n == name) {
        Some(entry) => entry.1 = dtype,
        None => entries.push((name.to_string(), dtype)),
    }
}

// ===== CONTEXT =====

/// Per-binding record handed to a kernel constructor
///
/// Outputs are kept as weak handles: the context is stored inside the
/// tensor it produced, and must not keep that tensor alive. By convention
/// the tensor being bound is the last output; builders may add auxiliary
/// outputs (a dropout mask) before binding.
#[derive(Clone)]
pub struct OpAlgoContext {
    op_name: String,
    inputs: Vec<Tensor>,
    outputs: Vec<WeakTensor>,
    attrs: Attributes,
}

impl OpAlgoContext {
    pub fn new(op_name: impl Into<String>) -> Self {
        Self {
            op_name: op_name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: Attributes::new(),
        }
    }

    pub fn op_name(&self) -> &str {
        &self.op_name
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn input(&self, idx: usize) -> Result<Tensor> {
        self.inputs
            .get(idx)
            .cloned()
            .ok_or(GraphError::IndexOutOfBounds {
                what: "OpAlgoContext::input",
                index: idx,
                len: self.inputs.len(),
            })
    }

    pub fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }

    pub fn output(&self, idx: usize) -> Result<Tensor> {
        let weak = self.outputs.get(idx).ok_or(GraphError::IndexOutOfBounds {
            what: "OpAlgoContext::output",
            index: idx,
            len: self.outputs.len(),
        })?;
        weak.upgrade().ok_or_else(|| {
            GraphError::InvalidParameter(format!(
                "{}: output {idx} was dropped before use",
                self.op_name
            ))
        })
    }

    /// The tensor this context was bound to
    pub fn bound_output(&self) -> Result<Tensor> {
        match self.outputs.len() {
            0 => Err(GraphError::IndexOutOfBounds {
                what: "OpAlgoContext::bound_output",
                index: 0,
                len: 0,
            }),
            n => self.output(n - 1),
        }
    }

    pub fn add_input(&mut self, input: &Tensor) {
        self.inputs.push(input.clone());
    }

    pub fn add_output(&mut self, output: &Tensor) {
        self.outputs.push(output.downgrade());
    }

    pub fn add_attr(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) {
        self.attrs.set(name, value);
    }

    pub fn attr<T: FromAttr>(&self, name: &str) -> Result<T> {
        self.attrs.get(name)
    }

    pub fn attrs(&self) -> &Attributes {
        &self.attrs
    }
}

impl fmt::Debug for OpAlgoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpAlgoContext")
            .field("op_name", &self.op_name)
            .field("num_inputs", &self.inputs.len())
            .field("num_outputs", &self.outputs.len())
            .field("attrs", &self.attrs)
            .finish()
    }
}

// ===== REGISTRY =====

/// Map from full key to kernel schema
///
/// The process-wide instance is built once by [`crate::registry`]; local
/// instances are handy for tests and tooling.
#[derive(Default)]
pub struct OpAlgoRegistry {
    registry: HashMap<String, OpAlgoSchema>,
}

impl OpAlgoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The finalized process-wide registry
    pub fn global() -> &'static OpAlgoRegistry {
        &crate::registry::registries().op_algos
    }

    /// # Panics
    /// Registering a key twice is a configuration error and aborts.
    pub fn register(&mut self, schema: OpAlgoSchema) {
        let key = schema.name().to_string();
        if self.registry.contains_key(&key) {
            log::error!("OpAlgoRegistry::register - key already registered: {key}");
            panic!("OpAlgoRegistry::register - key already registered: {key}");
        }
        self.registry.insert(key, schema);
    }

    pub fn has(&self, key: &str) -> bool {
        self.registry.contains_key(key)
    }

    pub fn schema(&self, key: &str) -> Option<&OpAlgoSchema> {
        self.registry.get(key)
    }

    /// Instantiate the kernel registered under `key`
    pub fn get_op_algo(&self, key: &str, ctx: &OpAlgoContext) -> Result<Box<dyn OpAlgo>> {
        let schema = self
            .registry
            .get(key)
            .ok_or_else(|| GraphError::OpAlgoNotFound(key.to_string()))?;
        (schema.creator())(ctx)
    }

    /// All registered keys, sorted
    pub fn all_op_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

impl fmt::Debug for OpAlgoRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpAlgoRegistry")
            .field("num_schemas", &self.registry.len())
            .finish()
    }
}

/// Pick the key `op` dispatches to on `device`.
///
/// Priority: accelerator-qualified device, plain device, then `Any`.
pub fn resolve_op_key(
    registry: &OpAlgoRegistry,
    op: &str,
    device: &EnabledDevice,
) -> Option<String> {
    [
        op_algo_key_with_accel(op, device.device_name(), device.accelerator_name()),
        op_algo_key(op, device.device_name()),
        op_algo_key(op, Device::Any.name()),
    ]
    .into_iter()
    .find(|key| registry.has(key))
}
