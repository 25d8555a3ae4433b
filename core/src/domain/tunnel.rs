//! Tunnel domain model: the long-lived entity the registry owns.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::target::{TargetType, TunnelTarget};

/// Stable identifier of a tunnel. Never reused.
pub type ForwardId = Uuid;

/// Lifecycle status of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    #[default]
    Connecting,
    Connected,
    Reconnecting,
    /// Retry budget exhausted after losing the backing pod. Port still held.
    Disconnected,
    /// Unrecoverable failure. Port still held until retried or stopped.
    Error,
}

impl TunnelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }

    /// Whether the tunnel is parked waiting for a manual retry or stop.
    pub fn is_parked(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The concrete pod instance a tunnel relays traffic to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackingPod {
    pub pod_name: String,
    pub pod_uid: String,
}

impl BackingPod {
    pub fn new(pod_name: impl Into<String>, pod_uid: impl Into<String>) -> Self {
        Self {
            pod_name: pod_name.into(),
            pod_uid: pod_uid.into(),
        }
    }
}

/// Relay counters for a tunnel's local listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TunnelStats {
    pub active_connections: u64,
    pub total_connections: u64,
    /// Bytes copied from local clients to the pod.
    pub bytes_sent: u64,
    /// Bytes copied from the pod back to local clients.
    pub bytes_received: u64,
}

/// Snapshot of a managed tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    pub forward_id: ForwardId,
    pub namespace: String,
    pub name: String,
    pub target_type: TargetType,
    pub target_port: u16,
    pub local_port: u16,
    pub status: TunnelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_uid: Option<String>,
    /// Container port actually dialled on the backing pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub reconnect_count: u32,
    #[serde(default)]
    pub stats: TunnelStats,
}

impl Tunnel {
    /// Creates a tunnel in the `connecting` state with no backing pod.
    pub fn new(forward_id: ForwardId, target: &TunnelTarget, local_port: u16) -> Self {
        Self {
            forward_id,
            namespace: target.namespace.clone(),
            name: target.name.clone(),
            target_type: target.target_type,
            target_port: target.target_port,
            local_port,
            status: TunnelStatus::Connecting,
            pod_name: None,
            pod_uid: None,
            pod_port: None,
            last_error: None,
            reconnect_count: 0,
            stats: TunnelStats::default(),
        }
    }

    /// The target this tunnel was created for, with its assigned local port.
    pub fn target(&self) -> TunnelTarget {
        TunnelTarget {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            target_type: self.target_type,
            target_port: self.target_port,
            local_port: Some(self.local_port),
        }
    }

    pub fn backing_pod(&self) -> Option<BackingPod> {
        match (&self.pod_name, &self.pod_uid) {
            (Some(name), Some(uid)) => Some(BackingPod::new(name.clone(), uid.clone())),
            _ => None,
        }
    }

    pub fn set_backing_pod(&mut self, pod: Option<&BackingPod>, pod_port: Option<u16>) {
        self.pod_name = pod.map(|p| p.pod_name.clone());
        self.pod_uid = pod.map(|p| p.pod_uid.clone());
        self.pod_port = pod_port;
    }
}
