//! kubectl JSON response parsing.
//!
//! Only the fields the tunnel manager reads are modelled; everything else
//! in the API objects is ignored.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::domain::{
    ContainerPort, PodInfo, PodPhase, ServiceInfo, ServicePortSpec, TargetPortRef,
};

/// Response structure for `kubectl get pods -o json`.
#[derive(Debug, Deserialize)]
pub struct PodListResponse {
    pub items: Vec<PodItem>,
}

impl PodListResponse {
    /// Converts the kubectl response to a list of PodInfo.
    pub fn into_pods(self) -> Vec<PodInfo> {
        self.items.into_iter().map(PodItem::into_pod).collect()
    }
}

/// Response structure for `kubectl get pod NAME -o json`.
#[derive(Debug, Deserialize)]
pub struct PodItem {
    pub metadata: ObjectMetadata,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub deletion_timestamp: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
}

#[derive(Debug, Deserialize)]
pub struct ContainerSpec {
    #[serde(default)]
    pub ports: Vec<ContainerPortSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPortSpec {
    pub name: Option<String>,
    pub container_port: u16,
    pub protocol: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PodStatus {
    pub phase: Option<String>,
    #[serde(default)]
    pub conditions: Vec<PodCondition>,
}

#[derive(Debug, Deserialize)]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
}

impl PodItem {
    pub fn into_pod(self) -> PodInfo {
        let ready = self
            .status
            .conditions
            .iter()
            .any(|c| c.condition_type == "Ready" && c.status == "True");

        PodInfo {
            name: self.metadata.name,
            namespace: self.metadata.namespace,
            uid: self.metadata.uid,
            labels: self.metadata.labels,
            phase: self
                .status
                .phase
                .as_deref()
                .map(PodPhase::parse)
                .unwrap_or_default(),
            ready,
            terminating: self.metadata.deletion_timestamp.is_some(),
            ports: self
                .spec
                .containers
                .into_iter()
                .flat_map(|c| c.ports)
                .map(|p| ContainerPort {
                    name: p.name,
                    container_port: p.container_port,
                    protocol: p.protocol,
                })
                .collect(),
        }
    }
}

/// Response structure for `kubectl get service NAME -o json`.
#[derive(Debug, Deserialize)]
pub struct ServiceItem {
    pub metadata: ObjectMetadata,
    #[serde(default)]
    pub spec: ServiceSpec,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<ServicePortItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePortItem {
    pub name: Option<String>,
    pub port: u16,
    /// Kubernetes targetPort can be either an integer or a string (named port).
    pub target_port: Option<TargetPortRef>,
    pub protocol: Option<String>,
}

impl ServiceItem {
    pub fn into_service(self) -> ServiceInfo {
        ServiceInfo {
            name: self.metadata.name,
            namespace: self.metadata.namespace,
            selector: self.spec.selector,
            ports: self
                .spec
                .ports
                .into_iter()
                .map(|p| ServicePortSpec {
                    name: p.name,
                    port: p.port,
                    target_port: p.target_port,
                    protocol: p.protocol,
                })
                .collect(),
        }
    }
}
