//! Dry-run scenario files.
//!
//! A scenario lists the relays the simulated selector can pick from, the
//! device identity, how the tunnel is launched and a script of monitor events
//! and commands replayed against the controller.

use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tunnel_core::tunnel::{
    DeviceData, RawStartOptions, Relay, RelayConstraints, RelayEndpoint,
    SelectorResult, StartOptions, TunnelSettings,
};

/// Error type for scenario loading.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("Failed to read scenario {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse scenario: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Scenario lists no relays")]
    NoRelays,

    #[error("Unknown relay in scenario: {0}")]
    UnknownRelay(String),

    #[error("Failed to encode launch options: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A relay as written in a scenario file.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySpec {
    pub hostname: String,
    pub location: String,
    pub endpoint: SocketAddr,
    pub ipv4_gateway: Ipv4Addr,
    #[serde(default)]
    pub ipv6_gateway: Option<Ipv6Addr>,
    pub public_key: String,
}

impl RelaySpec {
    pub fn selector_result(&self) -> SelectorResult {
        SelectorResult {
            relay: Relay {
                hostname: self.hostname.clone(),
                location: self.location.clone(),
            },
            endpoint: RelayEndpoint {
                socket_address: self.endpoint,
                ipv4_gateway: self.ipv4_gateway,
                ipv6_gateway: self.ipv6_gateway,
                public_key: self.public_key.clone(),
            },
        }
    }
}

/// Simulated device identity.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSpec {
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default = "default_private_key")]
    pub private_key: String,
    #[serde(default = "default_ipv4_address")]
    pub ipv4_address: Ipv4Addr,
    #[serde(default)]
    pub ipv6_address: Option<Ipv6Addr>,
    /// Simulate a logged out device
    #[serde(default)]
    pub logged_out: bool,
}

fn default_device_id() -> String {
    "simulated-device".to_string()
}

fn default_private_key() -> String {
    "c2ltdWxhdGVkLWRldmljZS1wcml2YXRlLWtleQ==".to_string()
}

fn default_ipv4_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 139, 0, 2)
}

impl Default for DeviceSpec {
    fn default() -> Self {
        DeviceSpec {
            device_id: default_device_id(),
            private_key: default_private_key(),
            ipv4_address: default_ipv4_address(),
            ipv6_address: None,
            logged_out: false,
        }
    }
}

impl DeviceSpec {
    pub fn device_data(&self) -> DeviceData {
        DeviceData {
            device_id: self.device_id.clone(),
            private_key: self.private_key.clone(),
            ipv4_address: self.ipv4_address,
            ipv6_address: self.ipv6_address,
        }
    }
}

/// How the simulated tunnel is launched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LaunchSpec {
    /// Launched by an on-demand rule
    #[serde(default)]
    pub on_demand: bool,
    /// Hostname of a relay preselected by the app
    #[serde(default)]
    pub relay: Option<String>,
}

/// Failures injected into the simulated adapter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FaultSpec {
    #[serde(default)]
    pub fail_start: bool,
    #[serde(default)]
    pub fail_update: bool,
    #[serde(default)]
    pub fail_stop: bool,
    /// Latency of every adapter call, in milliseconds
    #[serde(default)]
    pub adapter_latency_ms: u64,
}

/// One scripted step.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Monitor reports the tunnel is passing traffic
    Established,
    /// Monitor reports the tunnel stopped passing traffic
    Lost,
    /// Monitor reports a network reachability change
    Reachability { reachable: bool },
    /// Explicit reconnect, optionally to a named relay
    Reconnect {
        #[serde(default)]
        relay: Option<String>,
    },
    /// Toggle adapter update failures
    FailUpdates { fail: bool },
    /// Let the controller catch up
    Wait { ms: u64 },
    Stop,
}

/// A complete dry-run scenario.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub relays: Vec<RelaySpec>,
    #[serde(default)]
    pub device: DeviceSpec,
    #[serde(default)]
    pub launch: LaunchSpec,
    #[serde(default)]
    pub faults: FaultSpec,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let content = fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ScenarioError> {
        let scenario: Scenario = toml::from_str(content)?;
        if scenario.relays.is_empty() {
            return Err(ScenarioError::NoRelays);
        }
        if let Some(hostname) = &scenario.launch.relay {
            scenario.find_relay(hostname)?;
        }
        for step in &scenario.steps {
            if let Step::Reconnect {
                relay: Some(hostname),
            } = step
            {
                scenario.find_relay(hostname)?;
            }
        }
        Ok(scenario)
    }

    pub fn find_relay(&self, hostname: &str) -> Result<SelectorResult, ScenarioError> {
        self.relays
            .iter()
            .find(|relay| relay.hostname == hostname)
            .map(RelaySpec::selector_result)
            .ok_or_else(|| ScenarioError::UnknownRelay(hostname.to_string()))
    }

    pub fn tunnel_settings(&self) -> TunnelSettings {
        TunnelSettings {
            relay_constraints: RelayConstraints {
                location: self.location.clone(),
                port: None,
            },
            dns_servers: self.dns_servers.clone(),
        }
    }

    /// Launch options as the host framework would deliver them.
    pub fn raw_start_options(&self) -> Result<RawStartOptions, ScenarioError> {
        let raw = RawStartOptions::new().with_on_demand(self.launch.on_demand);
        match &self.launch.relay {
            Some(hostname) => Ok(raw.with_selector_result(&self.find_relay(hostname)?)?),
            None => Ok(raw),
        }
    }

    pub fn start_options(&self) -> Result<StartOptions, ScenarioError> {
        Ok(StartOptions::parse(&self.raw_start_options()?))
    }
}
