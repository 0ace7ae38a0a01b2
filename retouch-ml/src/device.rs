use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use candle_core::utils::metal_is_available;
use serde::{Deserialize, Serialize};

/// Logical compute target a model can live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl Device {
    /// Picks the first available accelerator, falling back to the CPU.
    pub fn detect() -> Self {
        if cuda_is_available() {
            Device::Cuda(0)
        } else if metal_is_available() {
            Device::Metal(0)
        } else {
            Device::Cpu
        }
    }

    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Device::Metal(ordinal) => write!(f, "metal:{ordinal}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown device `{0}`, expected cpu, cuda[:N] or metal[:N]")]
pub struct ParseDeviceError(String);

impl FromStr for Device {
    type Err = ParseDeviceError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match normalized.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|_| ParseDeviceError(s.to_string()))?;
                (kind, ordinal)
            }
            None => (normalized.as_str(), 0),
        };

        match kind {
            "cpu" if ordinal == 0 => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(ordinal)),
            "metal" | "mps" => Ok(Device::Metal(ordinal)),
            _ => Err(ParseDeviceError(s.to_string())),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = ParseDeviceError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(value: Device) -> Self {
        value.to_string()
    }
}

/// A logical device paired with the execution context created for it.
///
/// Fields are public so a caller can pair any backend with a label, e.g. to
/// exercise device moves on machines without an accelerator.
#[derive(Debug, Clone)]
pub struct Placement {
    pub device: Device,
    pub backend: candle_core::Device,
}

impl Placement {
    pub fn resolve(device: Device) -> Result<Self> {
        let backend = match device {
            Device::Cpu => candle_core::Device::Cpu,
            Device::Cuda(ordinal) => candle_core::Device::new_cuda(ordinal)?,
            Device::Metal(ordinal) => candle_core::Device::new_metal(ordinal)?,
        };
        Ok(Self { device, backend })
    }

    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            backend: candle_core::Device::Cpu,
        }
    }

    /// Waits for queued kernels and drops the context so the allocator can
    /// hand its memory back to the driver.
    pub(crate) fn release(self) -> Result<()> {
        self.backend.synchronize()?;
        drop(self.backend);
        Ok(())
    }
}

pub fn cuda_is_available() -> bool {
    cfg!(feature = "cuda")
        && unsafe {
            libloading::Library::new(if cfg!(target_os = "windows") {
                "nvcuda.dll"
            } else {
                "libcuda.so"
            })
            .is_ok()
        }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_names() {
        assert_eq!("cpu".parse::<Device>(), Ok(Device::Cpu));
        assert_eq!("CUDA".parse::<Device>(), Ok(Device::Cuda(0)));
        assert_eq!("cuda:1".parse::<Device>(), Ok(Device::Cuda(1)));
        assert_eq!("mps".parse::<Device>(), Ok(Device::Metal(0)));
        assert_eq!("metal:2".parse::<Device>(), Ok(Device::Metal(2)));
        assert!("tpu".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
        assert!("cpu:1".parse::<Device>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for device in [Device::Cpu, Device::Cuda(3), Device::Metal(0)] {
            assert_eq!(device.to_string().parse::<Device>(), Ok(device));
        }
    }

    #[test]
    fn only_cpu_is_not_an_accelerator() {
        assert!(!Device::Cpu.is_accelerator());
        assert!(Device::Cuda(0).is_accelerator());
        assert!(Device::Metal(0).is_accelerator());
    }

    #[test]
    fn cpu_placement_resolves() -> Result<()> {
        let placement = Placement::resolve(Device::Cpu)?;
        assert!(placement.backend.is_cpu());
        placement.release()
    }
}
