//! Configuration resolved for one start or reconnect attempt.

use std::net::{IpAddr, SocketAddr};

use crate::tunnel::error::SettingsError;
use crate::tunnel::types::{DeviceState, SelectorResult, TunnelSettings};

/// Everything needed to configure the tunnel for one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfiguration {
    pub device_state: DeviceState,
    pub tunnel_settings: TunnelSettings,
    pub selector_result: SelectorResult,
}

impl ResolvedConfiguration {
    /// Build the adapter configuration.
    pub fn tunnel_configuration(&self) -> Result<TunnelConfiguration, SettingsError> {
        let device = match &self.device_state {
            DeviceState::LoggedIn(device) => device,
            DeviceState::LoggedOut => return Err(SettingsError::DeviceNotLoggedIn),
            DeviceState::Revoked => return Err(SettingsError::DeviceRevoked),
        };

        let endpoint = &self.selector_result.endpoint;

        let mut addresses = vec![IpAddr::V4(device.ipv4_address)];
        if let Some(v6) = device.ipv6_address {
            addresses.push(IpAddr::V6(v6));
        }

        // Fall back to the relay's gateway when no custom DNS is configured
        let dns_servers = if self.tunnel_settings.dns_servers.is_empty() {
            let mut gateways = vec![IpAddr::V4(endpoint.ipv4_gateway)];
            if let Some(v6) = endpoint.ipv6_gateway {
                gateways.push(IpAddr::V6(v6));
            }
            gateways
        } else {
            self.tunnel_settings.dns_servers.clone()
        };

        Ok(TunnelConfiguration {
            private_key: Some(device.private_key.clone()),
            addresses,
            dns_servers,
            peer: Some(PeerConfiguration {
                public_key: endpoint.public_key.clone(),
                endpoint: endpoint.socket_address,
                allowed_ips: vec!["0.0.0.0/0".to_string(), "::/0".to_string()],
            }),
        })
    }
}

/// Remote peer of the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfiguration {
    pub public_key: String,
    pub endpoint: SocketAddr,
    pub allowed_ips: Vec<String>,
}

/// Configuration handed to the [`TunnelAdapter`](crate::tunnel::TunnelAdapter).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelConfiguration {
    /// `None` lets the adapter use an ephemeral key
    pub private_key: Option<String>,
    pub addresses: Vec<IpAddr>,
    pub dns_servers: Vec<IpAddr>,
    pub peer: Option<PeerConfiguration>,
}

impl TunnelConfiguration {
    /// A configuration without peers. Keeps the interface up while dropping
    /// all traffic.
    pub fn empty() -> Self {
        TunnelConfiguration::default()
    }

    /// True if this configuration cannot route any traffic.
    pub fn is_empty(&self) -> bool {
        self.peer.is_none()
    }

    /// Endpoint of the peer, if any.
    pub fn peer_endpoint(&self) -> Option<SocketAddr> {
        self.peer.as_ref().map(|peer| peer.endpoint)
    }
}
