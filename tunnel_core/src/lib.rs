//! Packet tunnel lifecycle controller.
//!
//! This crate owns the lifecycle of a VPN packet tunnel: it starts the tunnel
//! against a selected relay, reacts to connectivity events by reconnecting to
//! another relay, and stops cleanly. When startup fails it falls back to an
//! empty tunnel that blocks all traffic.

pub mod config;
pub mod logging;
pub mod tunnel;

// Re-export commonly used items for convenience
pub use config::{Config, ConfigManager};
pub use tunnel::{ControllerError, ControllerPolicy, TunnelController, TunnelState};
