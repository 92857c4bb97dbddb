use crate::error::{GraphError, Result};
use crate::op_algo::OpAlgoContext;
use crate::tensor::Tensor;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

// ===== GRADIENT HELPER TRAIT =====

/// Builds the backward graph for one op.
///
/// Given a forward output `y` and the summed incoming gradient `dy`,
/// returns one gradient tensor per child of `y`, in child order. Helpers
/// do not compute anything themselves: they build new graph nodes through
/// the functional builders, which `backprop` evaluates afterwards.
pub trait GradientHelper {
    fn compute_gradient(&self, y: &Tensor, dy: &Tensor) -> Result<Vec<Tensor>>;
}

pub type GradientHelperCreator =
    Arc<dyn Fn(&OpAlgoContext) -> Box<dyn GradientHelper> + Send + Sync>;

// ===== REGISTRY =====

/// Map from op name to gradient helper creator
#[derive(Default)]
pub struct GradientHelperRegistry {
    registry: HashMap<String, GradientHelperCreator>,
}

impl GradientHelperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The finalized process-wide registry
    pub fn global() -> &'static GradientHelperRegistry {
        &crate::registry::registries().gradient_helpers
    }

    /// # Panics
    /// Registering an op name twice is a configuration error and aborts.
    pub fn register<F>(&mut self, op_name: &str, creator: F)
    where
        F: Fn(&OpAlgoContext) -> Box<dyn GradientHelper> + Send + Sync + 'static,
    {
        if self.registry.contains_key(op_name) {
            log::error!("GradientHelperRegistry::register - op already registered: {op_name}");
            panic!("GradientHelperRegistry::register - op already registered: {op_name}");
        }
        self.registry.insert(op_name.to_string(), Arc::new(creator));
    }

    pub fn has(&self, op_name: &str) -> bool {
        self.registry.contains_key(op_name)
    }

    pub fn get_helper(&self, op_name: &str, ctx: &OpAlgoContext) -> Result<Box<dyn GradientHelper>> {
        let creator = self
            .registry
            .get(op_name)
            .ok_or_else(|| GraphError::MissingGradientHelper {
                op: op_name.to_string(),
            })?;
        Ok(creator(ctx))
    }

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

impl fmt::Debug for GradientHelperRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GradientHelperRegistry")
            .field("ops", &self.all_op_names())
            .finish()
    }
}
