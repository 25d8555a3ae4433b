//! Cluster transport port (interface).

use std::collections::BTreeMap;
use std::future::Future;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::domain::{BackingPod, PodInfo, PodLifecycleEvent, ServiceInfo};

/// Result type alias for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors reported by a cluster transport.
///
/// Messages are kept as strings so the error can be cloned and handed to
/// every party waiting on a failed connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The cluster API could not be reached.
    #[error("Cluster unreachable: {0}")]
    Unreachable(String),

    /// Credentials were rejected or revoked.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The pod being dialled no longer exists.
    #[error("Pod not found: {0}")]
    PodNotFound(String),

    /// A single logical stream failed.
    #[error("Stream error: {0}")]
    Stream(String),

    /// kubectl binary not found.
    #[error("kubectl not found. Please install kubectl.")]
    KubectlNotFound,

    /// Operation timed out.
    #[error("Operation timed out")]
    Timeout,

    /// The cluster answered with something we could not understand.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Classifies kubectl stderr output.
    pub fn from_kubectl_error(stderr: &str) -> Self {
        let message = stderr.trim().to_string();
        let lower = message.to_lowercase();

        if lower.contains("unauthorized")
            || lower.contains("forbidden")
            || lower.contains("you must be logged in")
        {
            Self::Unauthorized(message)
        } else if lower.contains("notfound") || lower.contains("not found") {
            Self::PodNotFound(message)
        } else if lower.contains("connection refused")
            || lower.contains("no configuration has been provided")
            || lower.contains("dial tcp")
            || lower.contains("unable to connect to the server")
            || lower.contains("i/o timeout")
        {
            Self::Unreachable(message)
        } else if lower.contains("lost connection") || lower.contains("an error occurred forwarding")
        {
            Self::Stream(message)
        } else {
            Self::Other(message)
        }
    }

    /// Retrying cannot fix this without user action.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::KubectlNotFound)
    }

    /// The error concerns one relayed stream only, not the pod connection.
    pub fn is_stream_local(&self) -> bool {
        matches!(self, Self::Stream(_) | Self::Timeout)
    }

    pub fn is_cluster_not_connected(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }

    /// Short description safe to show to users. Never includes kubectl or OS output.
    pub fn summary(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => "cluster unreachable",
            Self::Unauthorized(_) => "access denied",
            Self::PodNotFound(_) => "pod not found",
            Self::Stream(_) => "pod connection lost",
            Self::KubectlNotFound => "kubectl not found",
            Self::Timeout => "cluster request timed out",
            Self::InvalidResponse(_) => "unexpected response from cluster",
            Self::Other(_) => "cluster request failed",
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Stream(err.to_string())
    }
}

/// A connection to one port of one pod instance.
///
/// The connection itself is the control path; every local client gets its
/// own logical stream through [`PodConnection::dial`].
pub trait PodConnection: Send + Sync + 'static {
    /// Bidirectional byte stream to the pod port.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Opens a new logical stream.
    fn dial(&self) -> impl Future<Output = TransportResult<Self::Stream>> + Send;

    /// Resolves once the connection as a whole has failed.
    fn closed(&self) -> impl Future<Output = TransportError> + Send;

    /// Tears the connection down and resolves once the transport has let go of it.
    fn close(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Everything the tunnel manager needs from the cluster.
///
/// This trait defines the interface towards the cluster API. The manager
/// does not pool connections itself; implementations are expected to
/// support many concurrent streams.
pub trait ClusterTransport: Send + Sync + 'static {
    type Connection: PodConnection;

    /// Fetches a pod by name. `Ok(None)` when it does not exist.
    fn get_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = TransportResult<Option<PodInfo>>> + Send;

    /// Fetches a service by name. `Ok(None)` when it does not exist.
    fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = TransportResult<Option<ServiceInfo>>> + Send;

    /// Lists pods in `namespace` whose labels match every selector entry.
    fn list_pods_by_selector(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> impl Future<Output = TransportResult<Vec<PodInfo>>> + Send;

    /// Opens a connection to `pod_port` on the given pod instance.
    fn connect(
        &self,
        namespace: &str,
        pod: &BackingPod,
        pod_port: u16,
    ) -> impl Future<Output = TransportResult<Self::Connection>> + Send;

    /// Subscribes to lifecycle events of one pod instance.
    ///
    /// `Ok(None)` means no push channel is available and callers should poll.
    fn watch_pod(
        &self,
        _namespace: &str,
        _pod: &BackingPod,
    ) -> impl Future<Output = TransportResult<Option<mpsc::Receiver<PodLifecycleEvent>>>> + Send
    {
        async { Ok(None) }
    }
}
