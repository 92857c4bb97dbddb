//! Process-wide kernel and gradient helper tables
//!
//! Both tables are built exactly once, on first use (or an explicit
//! [`finalize`]), and are read-only afterwards. The build order is fixed:
//! built-in kernels, built-in gradient helpers, then every closure queued
//! through [`extend`] in submission order.
//!
//! ```ignore
//! volta_graph::registry::extend(|algos, helpers| {
//!     algos.register(my_relu_schema());
//!     helpers.register("Relu", |_ctx| Box::new(ReluGradient));
//! })?;
//! ```
//!
//! Extension closures run while the tables are being built and must not
//! touch [`OpAlgoRegistry::global`] or build graphs themselves.

use crate::error::{GraphError, Result};
use crate::gradient::GradientHelperRegistry;
use crate::kernels;
use crate::op_algo::OpAlgoRegistry;
use std::sync::{Mutex, OnceLock, PoisonError};

pub struct Registries {
    pub op_algos: OpAlgoRegistry,
    pub gradient_helpers: GradientHelperRegistry,
}

type Extension = Box<dyn FnOnce(&mut OpAlgoRegistry, &mut GradientHelperRegistry) + Send>;

struct Pending {
    sealed: bool,
    queue: Vec<Extension>,
}

static PENDING: Mutex<Pending> = Mutex::new(Pending {
    sealed: false,
    queue: Vec::new(),
});

static REGISTRIES: OnceLock<Registries> = OnceLock::new();

/// Queue a registration closure to run when the tables are built.
///
/// Returns [`GraphError::RegistryFinalized`] once the tables exist.
pub fn extend<F>(f: F) -> Result<()>
where
    F: FnOnce(&mut OpAlgoRegistry, &mut GradientHelperRegistry) + Send + 'static,
{
    let mut pending = PENDING.lock().unwrap_or_else(PoisonError::into_inner);
    if pending.sealed {
        return Err(GraphError::RegistryFinalized);
    }
    pending.queue.push(Box::new(f));
    Ok(())
}

/// Build the tables now if they are not built yet
pub fn finalize() -> &'static Registries {
    registries()
}

pub fn is_finalized() -> bool {
    REGISTRIES.get().is_some()
}

pub(crate) fn registries() -> &'static Registries {
    REGISTRIES.get_or_init(build)
}

fn build() -> Registries {
    let extensions = {
        let mut pending = PENDING.lock().unwrap_or_else(PoisonError::into_inner);
        pending.sealed = true;
        std::mem::take(&mut pending.queue)
    };

    let mut op_algos = OpAlgoRegistry::new();
    let mut gradient_helpers = GradientHelperRegistry::new();
    kernels::register_builtin_algos(&mut op_algos);
    kernels::register_builtin_helpers(&mut gradient_helpers);

    let num_extensions = extensions.len();
    for extension in extensions {
        extension(&mut op_algos, &mut gradient_helpers);
    }

    log::debug!(
        "registries finalized: {} kernels, {} gradient helpers, {} extensions",
        op_algos.len(),
        gradient_helpers.len(),
        num_extensions
    );

    Registries {
        op_algos,
        gradient_helpers,
    }
}
