//! kubectl-based cluster transport.
//!
//! Queries use `kubectl get ... -o json`; each pod connection is a
//! `kubectl port-forward` child process. Pod liveness is polled.

mod client;
mod models;
mod port_forward;

use std::collections::BTreeMap;

pub use client::KubectlClient;
pub use port_forward::KubectlPortForward;

use crate::domain::{BackingPod, PodInfo, ServiceInfo};
use crate::ports::{ClusterTransport, TransportError, TransportResult};

/// [`ClusterTransport`] implementation driving the kubectl CLI.
#[derive(Debug, Clone, Default)]
pub struct KubectlTransport {
    client: KubectlClient,
}

impl KubectlTransport {
    pub fn new(client: KubectlClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &KubectlClient {
        &self.client
    }
}

impl ClusterTransport for KubectlTransport {
    type Connection = KubectlPortForward;

    async fn get_pod(&self, namespace: &str, name: &str) -> TransportResult<Option<PodInfo>> {
        self.client.get_pod(namespace, name).await
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> TransportResult<Option<ServiceInfo>> {
        self.client.get_service(namespace, name).await
    }

    async fn list_pods_by_selector(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> TransportResult<Vec<PodInfo>> {
        self.client.list_pods(namespace, selector).await
    }

    async fn connect(
        &self,
        namespace: &str,
        pod: &BackingPod,
        pod_port: u16,
    ) -> TransportResult<KubectlPortForward> {
        let kubectl_path = self
            .client
            .kubectl_path()
            .ok_or(TransportError::KubectlNotFound)?;

        KubectlPortForward::spawn(
            kubectl_path,
            &self.client.context_args(),
            namespace,
            pod,
            pod_port,
        )
        .await
    }
}
