//! Packet tunnel lifecycle management.
//!
//! This module provides the controller that owns the tunnel state and drives
//! it through start, reconnect and stop, together with the contracts of the
//! collaborators it orchestrates: the tunnel adapter, the relay selector, the
//! connectivity monitor and the settings store.

mod configuration;
mod controller;
mod error;
mod interfaces;
mod options;
mod state;
mod task;
pub mod types;

pub use configuration::{PeerConfiguration, ResolvedConfiguration, TunnelConfiguration};
pub use controller::{ControllerPolicy, ControllerSnapshot, TunnelController, TunnelControllerBuilder};
pub use error::{AdapterError, ControllerError, ControllerResult, SelectorError, SettingsError};
pub use interfaces::{
    FailureHook, MonitorEventSink, NoopFailureHook, RelaySelector, SettingsStore, TunnelAdapter,
    TunnelMonitor,
};
pub use options::{IS_ON_DEMAND_KEY, RawStartOptions, SELECTOR_RESULT_KEY, StartOptions};
pub use state::{ErrorContext, StateChange, TunnelState};
pub use types::{
    DeviceData, DeviceState, LaunchSource, MonitorEvent, NextRelay, Relay, RelayConstraints,
    RelayEndpoint, SelectorResult, TunnelSettings,
};
