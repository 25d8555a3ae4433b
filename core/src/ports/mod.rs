//! Ports layer - Trait definitions (interfaces).
//!
//! This module defines the interfaces the tunnel manager uses to talk to
//! the cluster. Implementations live in `adapters`.

mod transport;

pub use transport::{ClusterTransport, PodConnection, TransportError, TransportResult};
