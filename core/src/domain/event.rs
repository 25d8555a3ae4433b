//! Events published on the registry's event bus.

use serde::{Deserialize, Serialize};

use super::tunnel::ForwardId;

/// A tunnel state transition, tagged with the tunnel it belongs to.
///
/// Events for one `forward_id` arrive in the order they were emitted.
/// Events of different tunnels carry no relative ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PortForwardEvent {
    Started {
        forward_id: ForwardId,
        local_port: u16,
    },
    Connected {
        forward_id: ForwardId,
    },
    Reconnecting {
        forward_id: ForwardId,
        reason: String,
    },
    Reconnected {
        forward_id: ForwardId,
        new_pod: String,
    },
    PodDied {
        forward_id: ForwardId,
        pod_name: String,
    },
    Disconnected {
        forward_id: ForwardId,
    },
    Error {
        forward_id: ForwardId,
        message: String,
    },
    Stopped {
        forward_id: ForwardId,
    },
}

impl PortForwardEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Connected { .. } => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Reconnected { .. } => "reconnected",
            Self::PodDied { .. } => "pod_died",
            Self::Disconnected { .. } => "disconnected",
            Self::Error { .. } => "error",
            Self::Stopped { .. } => "stopped",
        }
    }

    pub fn forward_id(&self) -> ForwardId {
        match self {
            Self::Started { forward_id, .. }
            | Self::Connected { forward_id }
            | Self::Reconnecting { forward_id, .. }
            | Self::Reconnected { forward_id, .. }
            | Self::PodDied { forward_id, .. }
            | Self::Disconnected { forward_id }
            | Self::Error { forward_id, .. }
            | Self::Stopped { forward_id } => *forward_id,
        }
    }

    /// Whether this is the last event a tunnel will ever produce.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped { .. })
    }
}
