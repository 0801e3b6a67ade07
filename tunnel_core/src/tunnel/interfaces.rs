//! Collaborators driven by the tunnel controller.
//!
//! The controller is the only caller of the mutating operations below while it
//! is active. Implementations are injected by the surrounding application.

use async_trait::async_trait;
use std::net::Ipv4Addr;
use tokio::sync::mpsc;

use crate::tunnel::configuration::TunnelConfiguration;
use crate::tunnel::error::{AdapterError, SelectorError, SettingsError};
use crate::tunnel::types::{
    DeviceState, MonitorEvent, RelayConstraints, SelectorResult, TunnelSettings,
};

/// Brings the encrypted tunnel interface up, reconfigures it, and tears it down.
#[async_trait]
pub trait TunnelAdapter: Send + Sync {
    /// Starts the tunnel with the given configuration.
    async fn start(&self, configuration: &TunnelConfiguration) -> Result<(), AdapterError>;

    /// Reconfigures a running tunnel in place.
    async fn update(&self, configuration: &TunnelConfiguration) -> Result<(), AdapterError>;

    /// Stops the tunnel.
    async fn stop(&self) -> Result<(), AdapterError>;
}

/// Picks a relay for the given constraints.
pub trait RelaySelector: Send + Sync {
    /// `failed_attempts` lets repeated failures bias the pick away from
    /// relays that just failed. Must not block indefinitely.
    fn select(
        &self,
        constraints: &RelayConstraints,
        failed_attempts: u32,
    ) -> Result<SelectorResult, SelectorError>;
}

/// Reads persisted settings and device state.
pub trait SettingsStore: Send + Sync {
    fn read_settings(&self) -> Result<TunnelSettings, SettingsError>;

    fn read_device_state(&self) -> Result<DeviceState, SettingsError>;
}

/// Probes tunnel liveness and reports connectivity events.
///
/// `start` and `stop` are idempotent. `start` may be called again with a new
/// probe target after a relay change. The controller calls both while holding
/// its state lock, so neither may block or call back into the controller.
pub trait TunnelMonitor: Send + Sync {
    fn start(&self, probe_address: Ipv4Addr);

    fn stop(&self);

    /// Registers where events are delivered. Called once by the controller.
    fn set_event_sink(&self, sink: MonitorEventSink);
}

/// Sending half of the controller's monitor event queue.
#[derive(Debug, Clone)]
pub struct MonitorEventSink {
    tx: mpsc::UnboundedSender<MonitorEvent>,
}

impl MonitorEventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<MonitorEvent>) -> Self {
        MonitorEventSink { tx }
    }

    /// Queue an event. Returns false once the controller stopped listening.
    pub fn send(&self, event: MonitorEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Policy hook invoked every Nth consecutive connection loss.
pub trait FailureHook: Send + Sync {
    fn on_failure_milestone(&self, failed_attempts: u32);
}

/// Hook that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFailureHook;

impl FailureHook for NoopFailureHook {
    fn on_failure_milestone(&self, _failed_attempts: u32) {}
}
