//! Per-tunnel reconnection state machine.
//!
//! Each tunnel runs one controller task that alternates between
//! establishing a worker, supervising it, and parking after the retry
//! budget is spent. The local listener stays bound the whole time.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::domain::{ForwardId, PortForwardEvent, Tunnel, TunnelStatus, TunnelTarget};
use crate::ports::{ClusterTransport, TransportError};

use super::backoff::Backoff;
use super::liveness::LivenessWatch;
use super::resolver::{PodResolver, Resolution, ResolveError};
use super::worker::{LocalListener, TunnelWorker, WorkerExit, WorkerHandle};

/// A tunnel's public state, shared between its controller and the registry.
pub(crate) type SharedTunnel = Arc<Mutex<Tunnel>>;

/// Commands the registry can send to a running controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TunnelCommand {
    /// Start a fresh attempt sequence from `disconnected`/`error`.
    Retry,
}

/// Dependencies shared by every tunnel of a registry.
pub(crate) struct TunnelContext<T> {
    pub transport: Arc<T>,
    pub resolver: PodResolver<T>,
    pub config: Arc<TunnelConfig>,
    pub events: mpsc::UnboundedSender<PortForwardEvent>,
}

impl<T> Clone for TunnelContext<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            resolver: self.resolver.clone(),
            config: Arc::clone(&self.config),
            events: self.events.clone(),
        }
    }
}

/// A live worker and the watch on the pod it serves.
struct Active<T: ClusterTransport> {
    worker: WorkerHandle,
    liveness: LivenessWatch<T>,
    resolution: Resolution,
}

enum Established<T: ClusterTransport> {
    Up(Active<T>),
    Parked,
    Cancelled,
}

/// A failed connect attempt.
struct Failure {
    message: String,
    fatal: bool,
}

impl Failure {
    fn transport(context: &str, err: TransportError) -> Self {
        debug!(context, error = %err, "Transport failure");
        Self {
            fatal: err.is_fatal(),
            message: format!("{}: {}", context, err.summary()),
        }
    }

    fn resolve(err: ResolveError) -> Self {
        debug!(error = %err, "Resolve failure");
        Self {
            fatal: err.is_fatal(),
            message: err.summary(),
        }
    }
}

pub(crate) struct TunnelController<T: ClusterTransport> {
    ctx: TunnelContext<T>,
    forward_id: ForwardId,
    target: TunnelTarget,
    tunnel: SharedTunnel,
    listener: LocalListener<T::Connection>,
    cancel: CancellationToken,
    commands: mpsc::UnboundedReceiver<TunnelCommand>,
}

impl<T: ClusterTransport> TunnelController<T> {
    pub fn new(
        ctx: TunnelContext<T>,
        forward_id: ForwardId,
        target: TunnelTarget,
        tunnel: SharedTunnel,
        listener: LocalListener<T::Connection>,
        cancel: CancellationToken,
        commands: mpsc::UnboundedReceiver<TunnelCommand>,
    ) -> Self {
        Self {
            ctx,
            forward_id,
            target,
            tunnel,
            listener,
            cancel,
            commands,
        }
    }

    /// Drives the tunnel until it is cancelled, then closes its listener.
    ///
    /// `initial` is the resolution `start` already performed, if any.
    pub async fn run(mut self, initial: Option<Resolution>) {
        let mut pending = initial;
        let mut reconnecting = false;

        loop {
            match self.establish(pending.take(), reconnecting).await {
                Established::Cancelled => break,
                Established::Parked => {
                    if !self.park().await {
                        break;
                    }
                    reconnecting = false;
                }
                Established::Up(active) => match self.supervise(active).await {
                    Some(reason) => {
                        self.mark_lost(reason);
                        reconnecting = true;
                    }
                    None => break,
                },
            }
        }

        self.listener.close().await;
        debug!(forward_id = %self.forward_id, "Tunnel controller finished");
    }

    /// Attempts to bring up a worker within the retry budget.
    async fn establish(
        &mut self,
        mut pending: Option<Resolution>,
        reconnecting: bool,
    ) -> Established<T> {
        let mut backoff = Backoff::new(&self.ctx.config.retry);

        loop {
            if self.cancel.is_cancelled() {
                return Established::Cancelled;
            }

            let attempt = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Established::Cancelled,
                attempt = self.attempt(pending.take()) => attempt,
            };

            let failure = match attempt {
                Ok(active) if self.cancel.is_cancelled() => {
                    active.worker.shutdown().await;
                    return Established::Cancelled;
                }
                Ok(active) => {
                    self.mark_connected(&active.resolution, reconnecting);
                    return Established::Up(active);
                }
                Err(failure) => failure,
            };

            if failure.fatal {
                warn!(forward_id = %self.forward_id, error = %failure.message, "Tunnel failed");
                self.mark_failed(TunnelStatus::Error, failure.message);
                return Established::Parked;
            }

            let Some(delay) = backoff.next_delay() else {
                warn!(
                    forward_id = %self.forward_id,
                    attempts = backoff.attempts(),
                    error = %failure.message,
                    "Giving up on tunnel"
                );
                let status = if reconnecting {
                    TunnelStatus::Disconnected
                } else {
                    TunnelStatus::Error
                };
                self.mark_failed(status, failure.message);
                return Established::Parked;
            };

            debug!(
                forward_id = %self.forward_id,
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %failure.message,
                "Tunnel attempt failed, retrying"
            );
            self.tunnel.lock().last_error = Some(failure.message.clone());
            self.emit(PortForwardEvent::Reconnecting {
                forward_id: self.forward_id,
                reason: failure.message,
            });

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Established::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One resolve + connect attempt.
    async fn attempt(&self, pending: Option<Resolution>) -> Result<Active<T>, Failure> {
        let resolution = match pending {
            Some(resolution) => resolution,
            None => {
                let resolved = tokio::time::timeout(
                    self.ctx.config.resolve_timeout(),
                    self.ctx.resolver.resolve(&self.target),
                )
                .await
                .map_err(|_| Failure::transport("resolve", TransportError::Timeout))?;

                resolved.map_err(Failure::resolve)?
            }
        };

        let connection = self
            .ctx
            .transport
            .connect(&self.target.namespace, &resolution.pod, resolution.pod_port)
            .await
            .map_err(|e| {
                Failure::transport(&format!("connect to pod {}", resolution.pod.pod_name), e)
            })?;

        let worker = TunnelWorker::start(&self.listener, connection, resolution.pod.clone());
        let liveness = LivenessWatch::new(
            Arc::clone(&self.ctx.transport),
            self.target.namespace.clone(),
            resolution.pod.clone(),
            self.ctx.config.liveness_poll_interval(),
        );

        Ok(Active {
            worker,
            liveness,
            resolution,
        })
    }

    /// Watches a live worker. Returns the loss reason, or `None` when cancelled.
    async fn supervise(&mut self, active: Active<T>) -> Option<String> {
        let Active {
            mut worker,
            mut liveness,
            resolution,
        } = active;
        let pod_name = resolution.pod.pod_name.clone();

        let reason = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    worker.shutdown().await;
                    return None;
                }
                gone = liveness.gone() => {
                    self.emit(PortForwardEvent::PodDied {
                        forward_id: self.forward_id,
                        pod_name: pod_name.clone(),
                    });
                    break gone.reason;
                }
                exit = worker.wait() => match exit {
                    WorkerExit::PodGone => {
                        self.emit(PortForwardEvent::PodDied {
                            forward_id: self.forward_id,
                            pod_name: pod_name.clone(),
                        });
                        break format!("pod {} is gone", pod_name);
                    }
                    WorkerExit::StreamError(message) => break message,
                    WorkerExit::Closed => break "worker closed".to_string(),
                },
                Some(command) = self.commands.recv() => {
                    debug!(forward_id = %self.forward_id, command = ?command, "Ignoring command, tunnel is connected");
                }
            }
        };

        // The old worker is fully gone before any replacement starts.
        worker.shutdown().await;
        info!(forward_id = %self.forward_id, pod = %pod_name, reason = %reason, "Lost backing pod");
        Some(reason)
    }

    /// Waits in `disconnected`/`error` for a retry. `false` when cancelled.
    async fn park(&mut self) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            command = self.commands.recv() => match command {
                Some(TunnelCommand::Retry) => {
                    self.tunnel.lock().status = TunnelStatus::Connecting;
                    info!(forward_id = %self.forward_id, "Retrying tunnel");
                    self.emit(PortForwardEvent::Reconnecting {
                        forward_id: self.forward_id,
                        reason: "retry requested".to_string(),
                    });
                    true
                }
                None => {
                    self.cancel.cancelled().await;
                    false
                }
            },
        }
    }

    fn mark_connected(&self, resolution: &Resolution, reconnecting: bool) {
        {
            let mut tunnel = self.tunnel.lock();
            tunnel.status = TunnelStatus::Connected;
            tunnel.set_backing_pod(Some(&resolution.pod), Some(resolution.pod_port));
            tunnel.last_error = None;
        }

        info!(
            forward_id = %self.forward_id,
            local_port = self.listener.local_port(),
            pod = %resolution.pod.pod_name,
            pod_port = resolution.pod_port,
            "Tunnel connected"
        );

        if reconnecting {
            self.emit(PortForwardEvent::Reconnected {
                forward_id: self.forward_id,
                new_pod: resolution.pod.pod_name.clone(),
            });
        }
        self.emit(PortForwardEvent::Connected {
            forward_id: self.forward_id,
        });
    }

    fn mark_lost(&self, reason: String) {
        {
            let mut tunnel = self.tunnel.lock();
            tunnel.status = TunnelStatus::Reconnecting;
            tunnel.set_backing_pod(None, None);
            tunnel.last_error = Some(reason.clone());
            tunnel.reconnect_count += 1;
        }

        self.emit(PortForwardEvent::Reconnecting {
            forward_id: self.forward_id,
            reason,
        });
    }

    fn mark_failed(&self, status: TunnelStatus, message: String) {
        {
            let mut tunnel = self.tunnel.lock();
            tunnel.status = status;
            tunnel.set_backing_pod(None, None);
            tunnel.last_error = Some(message.clone());
        }

        self.emit(PortForwardEvent::Error {
            forward_id: self.forward_id,
            message,
        });
        if status == TunnelStatus::Disconnected {
            self.emit(PortForwardEvent::Disconnected {
                forward_id: self.forward_id,
            });
        }
    }

    fn emit(&self, event: PortForwardEvent) {
        // Only fails once the registry is gone.
        let _ = self.ctx.events.send(event);
    }
}
