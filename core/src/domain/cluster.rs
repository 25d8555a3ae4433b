//! Cluster-side views of pods and services, as seen through the transport.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::tunnel::BackingPod;

/// Pod phase as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

impl PodPhase {
    /// Parses a phase string; anything unrecognized becomes `Unknown`.
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// A pod in a terminal phase never serves traffic again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// A port declared by one of a pod's containers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerPort {
    pub name: Option<String>,
    pub container_port: u16,
    pub protocol: Option<String>,
}

impl ContainerPort {
    pub fn new(name: Option<&str>, container_port: u16) -> Self {
        Self {
            name: name.map(str::to_string),
            container_port,
            protocol: None,
        }
    }
}

/// A pod instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    pub phase: PodPhase,
    /// The `Ready` condition is `True`.
    pub ready: bool,
    /// A deletion timestamp is set.
    pub terminating: bool,
    pub ports: Vec<ContainerPort>,
}

impl PodInfo {
    pub fn backing_pod(&self) -> BackingPod {
        BackingPod::new(self.name.clone(), self.uid.clone())
    }

    /// Running, ready and not on its way out.
    pub fn is_serving(&self) -> bool {
        self.phase == PodPhase::Running && self.ready && !self.terminating
    }

    /// Whether `port` can be dialled on this pod.
    ///
    /// Pods that declare no container ports accept any port.
    pub fn exposes(&self, port: u16) -> bool {
        self.ports.is_empty() || self.ports.iter().any(|p| p.container_port == port)
    }

    /// Looks up a named container port.
    pub fn named_port(&self, name: &str) -> Option<u16> {
        self.ports
            .iter()
            .find(|p| p.name.as_deref() == Some(name))
            .map(|p| p.container_port)
    }

    pub fn matches_selector(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(key, value)| self.labels.get(key) == Some(value))
    }
}

/// A service `targetPort`: either a number or the name of a container port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetPortRef {
    Number(u16),
    Name(String),
}

/// One entry of a service's `ports` list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServicePortSpec {
    pub name: Option<String>,
    pub port: u16,
    /// Defaults to `port` when unset.
    pub target_port: Option<TargetPortRef>,
    pub protocol: Option<String>,
}

impl ServicePortSpec {
    pub fn is_tcp(&self) -> bool {
        self.protocol
            .as_deref()
            .map(|p| p.eq_ignore_ascii_case("TCP"))
            .unwrap_or(true)
    }

    /// Maps this service port onto a concrete container port of `pod`.
    pub fn container_port_on(&self, pod: &PodInfo) -> Option<u16> {
        match &self.target_port {
            None => Some(self.port).filter(|p| pod.exposes(*p)),
            Some(TargetPortRef::Number(port)) => Some(*port).filter(|p| pod.exposes(*p)),
            Some(TargetPortRef::Name(name)) => pod.named_port(name),
        }
    }
}

/// A service definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub namespace: String,
    /// Empty for services whose endpoints are managed manually.
    pub selector: BTreeMap<String, String>,
    pub ports: Vec<ServicePortSpec>,
}

/// Push notification about a pod's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodLifecycleEvent {
    Deleted { uid: String },
    Terminating { uid: String },
    PhaseChanged { uid: String, phase: PodPhase },
}

impl PodLifecycleEvent {
    pub fn uid(&self) -> &str {
        match self {
            Self::Deleted { uid } | Self::Terminating { uid } | Self::PhaseChanged { uid, .. } => {
                uid
            }
        }
    }
}
