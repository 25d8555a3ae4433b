//! Domain layer - Tunnel data models.
//!
//! These types have no I/O dependencies and can be tested in isolation.

mod cluster;
mod event;
mod target;
mod tunnel;

// Re-export all domain types
pub use cluster::{
    ContainerPort, PodInfo, PodLifecycleEvent, PodPhase, ServiceInfo, ServicePortSpec,
    TargetPortRef,
};
pub use event::PortForwardEvent;
pub use target::{TargetType, TunnelTarget};
pub use tunnel::{BackingPod, ForwardId, Tunnel, TunnelStats, TunnelStatus};
