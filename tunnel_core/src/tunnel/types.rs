//! Type definitions for the tunnel module.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// A VPN server that traffic can be relayed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    /// Relay hostname, e.g. `se-got-wg-001`
    pub hostname: String,
    /// Location code the relay belongs to, e.g. `se-got`
    pub location: String,
}

/// Connection parameters for a selected relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEndpoint {
    /// Address the tunnel sends encrypted traffic to
    pub socket_address: SocketAddr,
    /// Gateway inside the tunnel, used as the probe target
    pub ipv4_gateway: Ipv4Addr,
    /// IPv6 gateway inside the tunnel
    #[serde(default)]
    pub ipv6_gateway: Option<Ipv6Addr>,
    /// Relay public key
    pub public_key: String,
}

/// Relay selector output identifying a relay and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorResult {
    pub relay: Relay,
    pub endpoint: RelayEndpoint,
}

impl fmt::Display for SelectorResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.relay.hostname, self.endpoint.socket_address)
    }
}

/// Constraints the relay selector evaluates relays against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConstraints {
    /// Location code; `None` matches any location
    #[serde(default)]
    pub location: Option<String>,
    /// Endpoint port; `None` matches any port
    #[serde(default)]
    pub port: Option<u16>,
}

/// Persisted tunnel settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSettings {
    #[serde(default)]
    pub relay_constraints: RelayConstraints,
    /// DNS servers pushed into the tunnel; empty means use the relay gateway
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
}

/// Identity of a logged-in device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceData {
    pub device_id: String,
    /// Interface private key, base64 encoded
    pub private_key: String,
    pub ipv4_address: Ipv4Addr,
    #[serde(default)]
    pub ipv6_address: Option<Ipv6Addr>,
}

/// Persisted device state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    LoggedIn(DeviceData),
    LoggedOut,
    Revoked,
}

/// The trigger that initiated tunnel start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchSource {
    /// Started from the application by the user
    App,
    /// Started by an on-demand rule
    OnDemand,
    /// Started by the system (e.g. "always on" or system settings)
    System,
}

impl fmt::Display for LaunchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchSource::App => write!(f, "app"),
            LaunchSource::OnDemand => write!(f, "on-demand rule"),
            LaunchSource::System => write!(f, "system"),
        }
    }
}

/// Which relay the next configuration should use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextRelay {
    /// Ask the relay selector for a fresh pick
    Automatic,
    /// Reuse a previously computed pick
    Fixed(SelectorResult),
}

/// Connectivity events emitted by a [`TunnelMonitor`](crate::tunnel::TunnelMonitor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    ConnectionEstablished,
    ConnectionLost,
    ReachabilityChanged(bool),
}
