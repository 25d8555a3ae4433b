//! Tunnel lifecycle: port allocation, pod resolution, relaying, liveness
//! and the reconnection state machine, supervised by [`TunnelRegistry`].

mod allocator;
mod backoff;
mod controller;
mod liveness;
mod registry;
mod resolver;
mod worker;

pub use allocator::{PortAllocator, PortLease};
pub use backoff::Backoff;
pub use liveness::{LivenessWatch, PodGone};
pub use registry::TunnelRegistry;
pub use resolver::{PodResolver, Resolution, ResolveError};
pub use worker::{LocalListener, RelayStats, TunnelWorker, WorkerExit, WorkerHandle};
