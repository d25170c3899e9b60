//! Error taxonomy shared by every backend.

use thiserror::Error;

/// Errors returned by renderer operations.
#[derive(Debug, Error)]
pub enum RhiError {
    /// The active backend or driver cannot do what was asked (format, stage, topology, usage).
    /// Fatal to the call that requested it; never retried.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The caller broke the usage contract. Only produced while validation is enabled.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// A handle that is stale, destroyed, or belongs to another renderer.
    #[error("invalid {0} handle")]
    InvalidHandle(&'static str),

    /// The device was lost. Not recovered; every GPU object must be recreated.
    #[error("device lost")]
    DeviceLost,

    /// Any other native API error.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RhiError>;

impl RhiError {
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn contract(msg: impl Into<String>) -> Self {
        Self::ContractViolation(msg.into())
    }

    pub fn backend(msg: impl std::fmt::Display) -> Self {
        Self::Backend(msg.to_string())
    }
}

#[cfg(feature = "vulkan")]
impl From<ash::vk::Result> for RhiError {
    fn from(e: ash::vk::Result) -> Self {
        match e {
            ash::vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            ash::vk::Result::ERROR_FORMAT_NOT_SUPPORTED
            | ash::vk::Result::ERROR_FEATURE_NOT_PRESENT
            | ash::vk::Result::ERROR_EXTENSION_NOT_PRESENT
            | ash::vk::Result::ERROR_LAYER_NOT_PRESENT => Self::Unsupported(format!("{e:?}")),
            other => Self::Backend(format!("{other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure_class() {
        assert_eq!(
            RhiError::unsupported("storage format Bc1").to_string(),
            "unsupported: storage format Bc1"
        );
        assert_eq!(RhiError::InvalidHandle("buffer").to_string(), "invalid buffer handle");
    }

    #[cfg(feature = "vulkan")]
    #[test]
    fn vulkan_device_lost_maps_to_device_lost() {
        let e: RhiError = ash::vk::Result::ERROR_DEVICE_LOST.into();
        assert!(matches!(e, RhiError::DeviceLost));
        let e: RhiError = ash::vk::Result::ERROR_FORMAT_NOT_SUPPORTED.into();
        assert!(matches!(e, RhiError::Unsupported(_)));
    }
}
