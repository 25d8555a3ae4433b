//! Backing-pod resolution.
//!
//! Turns a [`TunnelTarget`] into the concrete pod instance and container
//! port to dial. For services, the candidate pods are the ready pods
//! matching the selector; the one with the lowest UID wins so repeated
//! resolutions stay reproducible.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::domain::{
    BackingPod, PodInfo, PodPhase, ServiceInfo, ServicePortSpec, TargetType, TunnelTarget,
};
use crate::ports::{ClusterTransport, TransportError};

/// Outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub pod: BackingPod,
    /// Container port on `pod`.
    pub pod_port: u16,
}

/// Why a target could not be resolved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("pod {namespace}/{name} not found")]
    PodNotFound { namespace: String, name: String },

    #[error("pod {namespace}/{name} is terminating")]
    PodTerminating { namespace: String, name: String },

    #[error("pod {namespace}/{name} is not running (phase {phase:?})")]
    PodNotReady {
        namespace: String,
        name: String,
        phase: PodPhase,
    },

    #[error("service {namespace}/{name} not found")]
    ServiceNotFound { namespace: String, name: String },

    #[error("service {namespace}/{name} has no pod selector")]
    NoSelector { namespace: String, name: String },

    #[error("{name} does not expose port {port}")]
    PortNotExposed { name: String, port: u16 },

    #[error("service {service} declares port {port} more than once")]
    AmbiguousPort { service: String, port: u16 },

    #[error("no ready pod backs service {namespace}/{service}")]
    NoReadyPods { namespace: String, service: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ResolveError {
    /// Retrying cannot fix this; the target itself is wrong or access is denied.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::PortNotExposed { .. } | Self::AmbiguousPort { .. } | Self::NoSelector { .. } => {
                true
            }
            Self::Transport(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Message for tunnel events. Transport failures are reduced to their summary.
    pub fn summary(&self) -> String {
        match self {
            Self::Transport(e) => e.summary().to_string(),
            other => other.to_string(),
        }
    }

    /// Whether `start` should refuse the target instead of retrying in the background.
    ///
    /// A missing pod or service at creation time is treated as a user
    /// error; once a tunnel exists the same conditions are retried.
    pub fn rejects_start(&self) -> bool {
        self.is_fatal()
            || matches!(
                self,
                Self::PodNotFound { .. } | Self::PodTerminating { .. } | Self::ServiceNotFound { .. }
            )
    }
}

/// Resolves tunnel targets against the cluster.
pub struct PodResolver<T> {
    transport: Arc<T>,
}

impl<T> Clone for PodResolver<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<T: ClusterTransport> PodResolver<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    pub async fn resolve(&self, target: &TunnelTarget) -> Result<Resolution, ResolveError> {
        let resolution = match target.target_type {
            TargetType::Pod => self.resolve_pod(target).await?,
            TargetType::Service => self.resolve_service(target).await?,
        };

        debug!(
            target = %target,
            pod = %resolution.pod.pod_name,
            pod_uid = %resolution.pod.pod_uid,
            pod_port = resolution.pod_port,
            "Resolved backing pod"
        );
        Ok(resolution)
    }

    async fn resolve_pod(&self, target: &TunnelTarget) -> Result<Resolution, ResolveError> {
        let pod = self
            .transport
            .get_pod(&target.namespace, &target.name)
            .await?
            .ok_or_else(|| ResolveError::PodNotFound {
                namespace: target.namespace.clone(),
                name: target.name.clone(),
            })?;

        check_pod(&pod, target.target_port)?;

        Ok(Resolution {
            pod: pod.backing_pod(),
            pod_port: target.target_port,
        })
    }

    async fn resolve_service(&self, target: &TunnelTarget) -> Result<Resolution, ResolveError> {
        let service = self
            .transport
            .get_service(&target.namespace, &target.name)
            .await?
            .ok_or_else(|| ResolveError::ServiceNotFound {
                namespace: target.namespace.clone(),
                name: target.name.clone(),
            })?;

        let service_port = find_service_port(&service, target.target_port)?;

        if service.selector.is_empty() {
            return Err(ResolveError::NoSelector {
                namespace: service.namespace.clone(),
                name: service.name.clone(),
            });
        }

        let pods = self
            .transport
            .list_pods_by_selector(&target.namespace, &service.selector)
            .await?;

        select_backing_pod(service_port, &pods).ok_or_else(|| ResolveError::NoReadyPods {
            namespace: service.namespace.clone(),
            service: service.name.clone(),
        })
    }
}

/// Validates a pod target.
fn check_pod(pod: &PodInfo, port: u16) -> Result<(), ResolveError> {
    if pod.terminating {
        return Err(ResolveError::PodTerminating {
            namespace: pod.namespace.clone(),
            name: pod.name.clone(),
        });
    }
    if !pod.exposes(port) {
        return Err(ResolveError::PortNotExposed {
            name: format!("pod {}/{}", pod.namespace, pod.name),
            port,
        });
    }
    if pod.phase != PodPhase::Running {
        return Err(ResolveError::PodNotReady {
            namespace: pod.namespace.clone(),
            name: pod.name.clone(),
            phase: pod.phase,
        });
    }
    Ok(())
}

/// Finds the TCP service port entry matching `port`.
pub(crate) fn find_service_port(
    service: &ServiceInfo,
    port: u16,
) -> Result<&ServicePortSpec, ResolveError> {
    let mut matches = service
        .ports
        .iter()
        .filter(|p| p.port == port && p.is_tcp());

    let found = matches.next().ok_or_else(|| ResolveError::PortNotExposed {
        name: format!("service {}/{}", service.namespace, service.name),
        port,
    })?;

    if matches.next().is_some() {
        return Err(ResolveError::AmbiguousPort {
            service: format!("{}/{}", service.namespace, service.name),
            port,
        });
    }

    Ok(found)
}

/// Picks the serving pod with the lowest UID that can take `service_port`.
pub(crate) fn select_backing_pod(
    service_port: &ServicePortSpec,
    pods: &[PodInfo],
) -> Option<Resolution> {
    let mut candidates: Vec<&PodInfo> = pods.iter().filter(|p| p.is_serving()).collect();
    candidates.sort_by(|a, b| a.uid.cmp(&b.uid));

    candidates.into_iter().find_map(|pod| {
        service_port
            .container_port_on(pod)
            .map(|pod_port| Resolution {
                pod: pod.backing_pod(),
                pod_port,
            })
    })
}
