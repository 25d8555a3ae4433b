//! PodTunnel Core Library
//!
//! Keeps local TCP ports forwarded to Kubernetes pods and services.
//! Provides functionality to:
//! - Allocate local ports without racing other tunnels
//! - Resolve a pod or service to one concrete backing pod
//! - Relay local connections over the cluster transport
//! - Reconnect to a replacement pod when the backing pod dies
//!
//! # Architecture
//! This library follows hexagonal architecture (ports & adapters):
//! - `domain`: Pure data models
//! - `ports`: Trait definitions (interfaces)
//! - `adapters`: External system implementations (kubectl)
//! - `tunnel`: Tunnel lifecycle and the registry supervising it

// Hexagonal architecture layers
pub mod adapters;
pub mod domain;
pub mod ports;
pub mod tunnel;

pub mod config;
pub mod error;

// Re-export domain types (primary API)
pub use domain::{
    BackingPod, ForwardId, PortForwardEvent, TargetType, Tunnel, TunnelStats, TunnelStatus,
    TunnelTarget,
};

// Re-export other commonly used types
pub use adapters::{KubectlClient, KubectlTransport};
pub use config::{ConfigStore, RetryPolicy, TunnelConfig};
pub use error::{Error, Result};
pub use ports::{ClusterTransport, PodConnection, TransportError};
pub use tunnel::TunnelRegistry;
