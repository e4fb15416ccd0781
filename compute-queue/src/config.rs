//! Device selection policy and file-based configuration.
//!
//! ## Usage
//!
//! Use [`DeviceOptions::from_env`] for process-level overrides or
//! [`ComputeConfig::from_toml_str`] to read a caller-owned configuration file.
//! Unknown keys are ignored so older builds accept newer files.

use std::{fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    library::CompileOptions,
};

/// Environment variable selecting the power preference.
pub const ENV_POWER_PREFERENCE: &str = "COMPUTE_QUEUE_POWER_PREFERENCE";
/// Environment variable listing backends, comma separated.
pub const ENV_BACKENDS: &str = "COMPUTE_QUEUE_BACKENDS";
/// Environment variable forcing the software fallback adapter.
pub const ENV_FORCE_FALLBACK: &str = "COMPUTE_QUEUE_FORCE_FALLBACK";

/// Which adapter class to prefer when several are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerPreference {
    /// Let the platform decide.
    #[default]
    None,
    /// Prefer integrated, power-efficient adapters.
    LowPower,
    /// Prefer discrete, high-performance adapters.
    HighPerformance,
}

impl PowerPreference {
    pub(crate) fn to_wgpu(self) -> wgpu::PowerPreference {
        match self {
            Self::None => wgpu::PowerPreference::None,
            Self::LowPower => wgpu::PowerPreference::LowPower,
            Self::HighPerformance => wgpu::PowerPreference::HighPerformance,
        }
    }
}

impl FromStr for PowerPreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "default" => Ok(Self::None),
            "low" | "low-power" | "lowpower" => Ok(Self::LowPower),
            "high" | "high-performance" | "highperformance" => Ok(Self::HighPerformance),
            other => Err(Error::Config {
                message: format!("unknown power preference {other:?}"),
            }),
        }
    }
}

/// A native graphics API the device layer may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// Vulkan.
    Vulkan,
    /// Apple Metal.
    Metal,
    /// Direct3D 12.
    Dx12,
    /// OpenGL / GLES.
    Gl,
    /// WebGPU in a browser.
    BrowserWebgpu,
}

impl Backend {
    fn to_wgpu(self) -> wgpu::Backends {
        match self {
            Self::Vulkan => wgpu::Backends::VULKAN,
            Self::Metal => wgpu::Backends::METAL,
            Self::Dx12 => wgpu::Backends::DX12,
            Self::Gl => wgpu::Backends::GL,
            Self::BrowserWebgpu => wgpu::Backends::BROWSER_WEBGPU,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Vulkan => "vulkan",
            Self::Metal => "metal",
            Self::Dx12 => "dx12",
            Self::Gl => "gl",
            Self::BrowserWebgpu => "browser-webgpu",
        };
        f.write_str(name)
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vulkan" | "vk" => Ok(Self::Vulkan),
            "metal" | "mtl" => Ok(Self::Metal),
            "dx12" | "d3d12" => Ok(Self::Dx12),
            "gl" | "gles" | "opengl" => Ok(Self::Gl),
            "webgpu" | "browser-webgpu" => Ok(Self::BrowserWebgpu),
            other => Err(Error::Config {
                message: format!("unknown backend {other:?}"),
            }),
        }
    }
}

/// Adapter selection policy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    /// Preferred adapter class.
    pub power_preference: PowerPreference,
    /// Allowed backends. Empty means the platform's primary backends.
    pub backends: Vec<Backend>,
    /// Select the software fallback adapter instead of hardware.
    pub force_fallback_adapter: bool,
    /// Debug label attached to the native device.
    pub label: Option<String>,
}

impl DeviceOptions {
    /// Reads overrides from the process environment on top of the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut options = Self::default();
        if let Some(value) = lookup(ENV_POWER_PREFERENCE) {
            options.power_preference = value.parse()?;
        }
        if let Some(value) = lookup(ENV_BACKENDS) {
            options.backends = value
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .map(str::parse)
                .collect::<Result<_>>()?;
        }
        if let Some(value) = lookup(ENV_FORCE_FALLBACK) {
            options.force_fallback_adapter = matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        Ok(options)
    }

    pub(crate) fn wgpu_backends(&self) -> wgpu::Backends {
        if self.backends.is_empty() {
            return wgpu::Backends::PRIMARY;
        }
        self.backends
            .iter()
            .fold(wgpu::Backends::empty(), |acc, backend| {
                acc | backend.to_wgpu()
            })
    }
}

/// Top-level configuration file.
///
/// ```toml
/// [device]
/// power_preference = "high-performance"
/// backends = ["vulkan", "metal"]
///
/// [compile]
/// language_version = 65536
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Adapter selection.
    pub device: DeviceOptions,
    /// Defaults for library compilation.
    pub compile: CompileOptions,
}

impl ComputeConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|err| Error::Config {
            message: err.to_string(),
        })
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|err| Error::Config {
            message: format!("{}: {err}", path.display()),
        })?;
        Self::from_toml_str(&source)
    }
}
