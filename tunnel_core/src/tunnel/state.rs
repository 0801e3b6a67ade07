//! Tunnel lifecycle states and the transition guard.

use std::fmt;
use std::sync::Arc;

use crate::tunnel::error::ControllerError;

/// State of the packet tunnel.
#[derive(Debug, Clone)]
pub enum TunnelState {
    /// Nothing has been attempted yet
    Initial,
    /// Configuration is being resolved and the tunnel brought up
    Starting,
    /// Tunnel is up and the monitor has confirmed connectivity
    Started,
    /// Tunnel is being re-pointed to another relay
    Reconnecting,
    /// Tunnel is being torn down
    Stopping,
    /// Tunnel is torn down; terminal
    Stopped,
    /// Start or recovery failed; an empty tunnel blocks traffic
    Error(ErrorContext),
}

/// What broke and in which state.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub previous_state: Box<TunnelState>,
    pub error: Arc<ControllerError>,
}

impl ErrorContext {
    pub fn new(previous_state: TunnelState, error: Arc<ControllerError>) -> Self {
        ErrorContext {
            previous_state: Box::new(previous_state),
            error,
        }
    }
}

impl TunnelState {
    /// Returns true if the state machine allows moving to `next`.
    ///
    /// `Error` cannot be re-entered from `Error`, so the first failure context
    /// is kept until the controller leaves the error state.
    pub fn can_transition(&self, next: &TunnelState) -> bool {
        use TunnelState::*;

        matches!(
            (self, next),
            (Initial, Starting)
                | (Starting, Started)
                | (Starting, Stopping)
                | (Starting, Error(_))
                | (Started, Stopping)
                | (Started, Error(_))
                | (Started, Reconnecting)
                | (Reconnecting, Started)
                | (Reconnecting, Stopping)
                | (Reconnecting, Error(_))
                | (Error(_), Starting)
                | (Error(_), Stopping)
                | (Error(_), Reconnecting)
                | (Stopping, Stopped)
        )
    }

    pub fn is_reconnecting(&self) -> bool {
        matches!(self, TunnelState::Reconnecting)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, TunnelState::Error(_))
    }

    /// True for `Stopping` and `Stopped`.
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, TunnelState::Stopping | TunnelState::Stopped)
    }

    /// Error context, if the tunnel is in the error state.
    pub fn error_context(&self) -> Option<&ErrorContext> {
        match self {
            TunnelState::Error(context) => Some(context),
            _ => None,
        }
    }

    /// Short name used in logs and CLI output.
    pub fn name(&self) -> &'static str {
        match self {
            TunnelState::Initial => "initial",
            TunnelState::Starting => "starting",
            TunnelState::Started => "started",
            TunnelState::Reconnecting => "reconnecting",
            TunnelState::Stopping => "stopping",
            TunnelState::Stopped => "stopped",
            TunnelState::Error(_) => "error",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Error(context) => write!(
                f,
                "error (while {}: {})",
                context.previous_state.name(),
                context.error
            ),
            other => f.write_str(other.name()),
        }
    }
}

/// An accepted state transition.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub from: TunnelState,
    pub to: TunnelState,
}
