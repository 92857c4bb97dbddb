// ===== DEVICE ENUM =====

use std::fmt;
use std::str::FromStr;

use crate::error::GraphError;

/// Device tag used to qualify kernel registrations
///
/// Only host (CPU) kernels ship with the crate. Other devices exist so
/// that backends can register device-specific kernels under their own key;
/// `Any` marks a device-agnostic default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Device {
    #[default]
    CPU,
    GPU,
    Metal,
    Any,
}

impl Device {
    /// Name used in registry keys
    pub fn name(&self) -> &'static str {
        match self {
            Device::CPU => "CPU",
            Device::GPU => "GPU",
            Device::Metal => "Metal",
            Device::Any => "Any",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Device {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::CPU),
            "gpu" | "cuda" => Ok(Device::GPU),
            "metal" => Ok(Device::Metal),
            "any" => Ok(Device::Any),
            other => Err(GraphError::Config(format!("unknown device `{other}`"))),
        }
    }
}

/// Accelerator name used when nothing more specific is configured
pub const DEFAULT_ACCELERATOR: &str = "Default";

/// The device graphs are currently being built for
///
/// Kernel dispatch looks up `device(accelerator)` first, then `device`, then `Any`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnabledDevice {
    pub device: Device,
    pub accelerator: String,
}

impl EnabledDevice {
    pub fn new(device: Device, accelerator: impl Into<String>) -> Self {
        Self {
            device,
            accelerator: accelerator.into(),
        }
    }

    pub fn device_name(&self) -> &'static str {
        self.device.name()
    }

    pub fn accelerator_name(&self) -> &str {
        &self.accelerator
    }

    /// `CPU(SIMD)` style qualifier
    pub fn qualified_name(&self) -> String {
        format!("{}({})", self.device.name(), self.accelerator)
    }
}

impl Default for EnabledDevice {
    fn default() -> Self {
        Self::new(Device::CPU, DEFAULT_ACCELERATOR)
    }
}

impl From<Device> for EnabledDevice {
    fn from(device: Device) -> Self {
        Self::new(device, DEFAULT_ACCELERATOR)
    }
}
