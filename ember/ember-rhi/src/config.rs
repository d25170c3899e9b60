//! Renderer configuration: backend choice, frame versions, validation policy.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RhiError};

/// Which native API to drive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendChoice {
    /// Vulkan when a loader and device are present, wgpu otherwise.
    #[default]
    Auto,
    Wgpu,
    Vulkan,
}

/// When contract checks (transfer window, descriptor shape, pass grouping, ...) run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPolicy {
    /// Checked in debug builds, skipped in release.
    #[default]
    DebugOnly,
    Always,
    Off,
}

impl ValidationPolicy {
    pub fn enabled(self) -> bool {
        match self {
            ValidationPolicy::DebugOnly => cfg!(debug_assertions),
            ValidationPolicy::Always => true,
            ValidationPolicy::Off => false,
        }
    }
}

/// Renderer configuration. Every field has a default, so a partial TOML file is fine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RhiConfig {
    pub backend: BackendChoice,
    /// Adapter / physical device index; `None` picks the first suitable one.
    pub gpu_index: Option<usize>,
    /// Frames in flight (1..=3).
    pub frame_versions: u32,
    pub validation: ValidationPolicy,
    /// Vulkan validation layers. `EMBER_VALIDATION=1` also turns them on.
    pub validation_layers: bool,
    pub vsync: bool,
    /// Descriptor sets per pool in the Vulkan pool chain.
    pub descriptor_pool_sets: u32,
    /// Initial size in bytes of each transfer staging block.
    pub staging_buffer_size: u64,
}

pub const MAX_FRAME_VERSIONS: u32 = 3;

impl Default for RhiConfig {
    fn default() -> Self {
        Self {
            backend: BackendChoice::Auto,
            gpu_index: None,
            frame_versions: 2,
            validation: ValidationPolicy::DebugOnly,
            validation_layers: cfg!(feature = "validation"),
            vsync: true,
            descriptor_pool_sets: 256,
            staging_buffer_size: 4 << 20,
        }
    }
}

impl RhiConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: RhiConfig = toml::from_str(text).map_err(|e| RhiError::Config(e.to_string()))?;
        config.validated()
    }

    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| RhiError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RhiError::Config(e.to_string()))
    }

    pub fn validation_enabled(&self) -> bool {
        self.validation.enabled()
    }

    pub fn wants_validation_layers(&self) -> bool {
        self.validation_layers
            || cfg!(feature = "validation")
            || std::env::var("EMBER_VALIDATION").map(|v| v == "1").unwrap_or(false)
    }

    fn validated(self) -> Result<Self> {
        if self.frame_versions == 0 || self.frame_versions > MAX_FRAME_VERSIONS {
            return Err(RhiError::Config(format!(
                "frame_versions must be in 1..={MAX_FRAME_VERSIONS}, got {}",
                self.frame_versions
            )));
        }
        if self.descriptor_pool_sets == 0 {
            return Err(RhiError::Config("descriptor_pool_sets must be non-zero".into()));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = RhiConfig::from_toml_str("backend = \"wgpu\"\nframe_versions = 3\n").unwrap();
        assert_eq!(config.backend, BackendChoice::Wgpu);
        assert_eq!(config.frame_versions, 3);
        assert_eq!(config.validation, ValidationPolicy::DebugOnly);
        assert_eq!(config.descriptor_pool_sets, 256);
    }

    #[test]
    fn frame_versions_out_of_range_is_rejected() {
        let err = RhiConfig::from_toml_str("frame_versions = 4").unwrap_err();
        assert!(matches!(err, RhiError::Config(_)));
        assert!(RhiConfig::from_toml_str("frame_versions = 0").is_err());
    }

    #[test]
    fn validation_policy_resolution() {
        assert!(ValidationPolicy::Always.enabled());
        assert!(!ValidationPolicy::Off.enabled());
        assert_eq!(ValidationPolicy::DebugOnly.enabled(), cfg!(debug_assertions));
    }

    #[test]
    fn toml_output_parses_back() {
        let mut config = RhiConfig::default();
        config.gpu_index = Some(1);
        config.validation = ValidationPolicy::Always;
        let text = config.to_toml_string().unwrap();
        let parsed = RhiConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.gpu_index, Some(1));
        assert_eq!(parsed.validation, ValidationPolicy::Always);
    }
}
