//! Error types for the tunnel module.

use std::sync::Arc;
use thiserror::Error;

/// Result type for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors reported by a [`TunnelAdapter`](crate::tunnel::TunnelAdapter).
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// The tunnel interface could not be brought up
    #[error("Failed to start tunnel: {0}")]
    Start(String),

    /// Live reconfiguration was rejected
    #[error("Failed to update tunnel: {0}")]
    Update(String),

    /// Teardown failed
    #[error("Failed to stop tunnel: {0}")]
    Stop(String),

    /// `update` was called before the tunnel was started
    #[error("Tunnel is not running")]
    NotRunning,
}

/// Errors reported by a [`RelaySelector`](crate::tunnel::RelaySelector).
#[derive(Debug, Clone, Error)]
pub enum SelectorError {
    /// No relay satisfies the constraints
    #[error("No relay matches the given constraints")]
    NoMatchingRelay,

    /// Relay list could not be read
    #[error("Relay cache error: {0}")]
    Cache(String),
}

/// Errors reported by a [`SettingsStore`](crate::tunnel::SettingsStore).
#[derive(Debug, Clone, Error)]
pub enum SettingsError {
    /// Tunnel settings could not be read
    #[error("Failed to read tunnel settings: {0}")]
    ReadSettings(String),

    /// Device state could not be read
    #[error("Failed to read device state: {0}")]
    ReadDeviceState(String),

    /// The device has no usable identity
    #[error("Device is not logged in")]
    DeviceNotLoggedIn,

    /// The device was revoked by the backend
    #[error("Device has been revoked")]
    DeviceRevoked,
}

/// Error types that can occur in controller operations.
#[derive(Debug, Clone, Error)]
pub enum ControllerError {
    /// Background task observed cancellation
    #[error("Operation cancelled")]
    Cancelled,

    /// Tunnel adapter failure
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Relay selection failure
    #[error("Relay selection error: {0}")]
    Selector(#[from] SelectorError),

    /// Settings or device state failure
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    /// Tunnel start failed; the controller is in the error state
    #[error("Failed to start the tunnel: {0}")]
    StartFailed(Arc<ControllerError>),

    /// Background task panicked or was aborted
    #[error("Background task terminated abnormally: {0}")]
    TaskPanicked(String),
}

impl ControllerError {
    /// Returns true if this error only reports cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ControllerError::Cancelled)
    }

    /// Returns the failure that caused `start` to fail, if any.
    pub fn start_failure(&self) -> Option<&ControllerError> {
        match self {
            ControllerError::StartFailed(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}
