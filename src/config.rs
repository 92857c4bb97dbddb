//! Engine configuration
//!
//! Settings are read once from the environment:
//!
//! ```bash
//! VOLTA_DEVICE=CPU VOLTA_ACCELERATOR=SIMD VOLTA_SEED=42 cargo test
//! ```
//!
//! The enabled device is per-thread state, seeded from the config and
//! overridable with [`set_enabled_device`]. Graphs are single-threaded, so a
//! thread always builds against one device at a time.

use crate::device::{DEFAULT_ACCELERATOR, Device, EnabledDevice};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::cell::RefCell;
use std::sync::OnceLock;

const DEVICE_VAR: &str = "VOLTA_DEVICE";
const ACCELERATOR_VAR: &str = "VOLTA_ACCELERATOR";
const SEED_VAR: &str = "VOLTA_SEED";

/// Process-wide settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub device: Device,
    pub accelerator: String,
    /// Seed for initializers and dropout masks; `None` means entropy-seeded
    pub seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: Device::CPU,
            accelerator: DEFAULT_ACCELERATOR.to_string(),
            seed: None,
        }
    }
}

impl EngineConfig {
    /// Build a config from a variable lookup. Unparsable values fall back to
    /// the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(DEVICE_VAR) {
            match raw.parse::<Device>() {
                Ok(device) => config.device = device,
                Err(e) => log::warn!("ignoring {DEVICE_VAR}={raw}: {e}"),
            }
        }
        if let Some(raw) = lookup(ACCELERATOR_VAR) {
            let raw = raw.trim();
            if !raw.is_empty() {
                config.accelerator = raw.to_string();
            }
        }
        if let Some(raw) = lookup(SEED_VAR) {
            match raw.trim().parse::<u64>() {
                Ok(seed) => config.seed = Some(seed),
                Err(e) => log::warn!("ignoring {SEED_VAR}={raw}: {e}"),
            }
        }
        config
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn enabled_device(&self) -> EnabledDevice {
        EnabledDevice::new(self.device, self.accelerator.clone())
    }
}

static CONFIG: OnceLock<EngineConfig> = OnceLock::new();

/// The process config, read from the environment on first access
pub fn engine_config() -> &'static EngineConfig {
    CONFIG.get_or_init(EngineConfig::from_env)
}

thread_local! {
    static ENABLED_DEVICE: RefCell<EnabledDevice> = RefCell::new(engine_config().enabled_device());
    static RNG: RefCell<StdRng> = RefCell::new(match engine_config().seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    });
}

/// Device the current thread dispatches kernels for
pub fn enabled_device() -> EnabledDevice {
    ENABLED_DEVICE.with(|d| d.borrow().clone())
}

/// Override the device for the current thread, returning the previous one
pub fn set_enabled_device(device: impl Into<EnabledDevice>) -> EnabledDevice {
    ENABLED_DEVICE.with(|d| std::mem::replace(&mut *d.borrow_mut(), device.into()))
}

/// Run `f` with the current thread's random generator
pub fn with_rng<R>(f: impl FnOnce(&mut StdRng) -> R) -> R {
    RNG.with(|rng| f(&mut rng.borrow_mut()))
}

/// Reseed the current thread's random generator
pub fn manual_seed(seed: u64) {
    RNG.with(|rng| *rng.borrow_mut() = StdRng::seed_from_u64(seed));
}
