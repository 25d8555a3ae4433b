//! Error types for the podtunnel-core library.

use thiserror::Error;

use crate::domain::ForwardId;
use crate::ports::TransportError;
use crate::tunnel::ResolveError;

/// Result type alias for tunnel manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can cross the registry boundary.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested local port is held by another tunnel or cannot be bound.
    #[error("Local port {port} is unavailable: {reason}")]
    PortUnavailable { port: u16, reason: String },

    /// No pod can back the tunnel.
    #[error("No backing pod: {0}")]
    NoBackingPod(String),

    /// The service declares the requested port more than once.
    #[error("Service {service} declares port {port} more than once")]
    AmbiguousPort { service: String, port: u16 },

    /// Target failed validation.
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Target could not be resolved for a reason retrying will not fix.
    #[error("Cannot resolve target: {0}")]
    Resolve(ResolveError),

    /// No tunnel with this id is registered.
    #[error("Tunnel not found: {0}")]
    TunnelNotFound(ForwardId),

    /// `stop_all` ran while the tunnel was still starting.
    #[error("Tunnel start cancelled: all tunnels are stopping")]
    StartCancelled,

    /// Cluster transport error.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<ResolveError> for Error {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::PodNotFound { .. }
            | ResolveError::PodTerminating { .. }
            | ResolveError::PodNotReady { .. }
            | ResolveError::NoReadyPods { .. } => Error::NoBackingPod(err.to_string()),
            ResolveError::AmbiguousPort { service, port } => Error::AmbiguousPort { service, port },
            ResolveError::Transport(e) => Error::Transport(e),
            other => Error::Resolve(other),
        }
    }
}
