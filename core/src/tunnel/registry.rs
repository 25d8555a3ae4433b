//! Tunnel registry and event bus.
//!
//! The registry owns every tunnel keyed by `forward_id` together with the
//! port allocator. Tunnel tasks publish their transitions through one mpsc
//! channel; a republisher task fans them out to broadcast subscribers, so
//! each tunnel's events reach every subscriber in emission order.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::TunnelConfig;
use crate::domain::{ForwardId, PortForwardEvent, Tunnel, TunnelStatus, TunnelTarget};
use crate::error::{Error, Result};
use crate::ports::ClusterTransport;

use super::allocator::PortAllocator;
use super::controller::{SharedTunnel, TunnelCommand, TunnelContext, TunnelController};
use super::resolver::PodResolver;
use super::worker::{LocalListener, RelayStats};

struct TunnelEntry {
    tunnel: SharedTunnel,
    /// Creation order, for stable listing.
    seq: u64,
    cancel: CancellationToken,
    commands: mpsc::UnboundedSender<TunnelCommand>,
    task: JoinHandle<()>,
    stats: Arc<RelayStats>,
}

impl TunnelEntry {
    fn snapshot(&self) -> Tunnel {
        let mut tunnel = self.tunnel.lock().clone();
        tunnel.stats = self.stats.snapshot();
        tunnel
    }
}

/// Starts that hold a port but are not registered yet.
///
/// Every start keeps a sender clone; `settled` resolves once all of them are gone.
struct PendingStarts {
    cancel: CancellationToken,
    done_tx: mpsc::Sender<()>,
    done_rx: mpsc::Receiver<()>,
}

impl PendingStarts {
    fn new() -> Self {
        let (done_tx, done_rx) = mpsc::channel(1);
        Self {
            cancel: CancellationToken::new(),
            done_tx,
            done_rx,
        }
    }

    /// Cancels every pending start and waits for each to give up its port.
    async fn settled(self) {
        let Self {
            cancel,
            done_tx,
            mut done_rx,
        } = self;
        cancel.cancel();
        drop(done_tx);
        let _ = done_rx.recv().await;
    }
}

struct RegistryState {
    tunnels: HashMap<ForwardId, TunnelEntry>,
    allocator: PortAllocator,
    next_seq: u64,
    pending: PendingStarts,
}

/// Releases a reserved port unless the tunnel was registered.
struct Reservation<'a> {
    state: &'a Mutex<RegistryState>,
    port: Option<u16>,
    _pending: mpsc::Sender<()>,
}

impl Reservation<'_> {
    fn commit(mut self) {
        self.port = None;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(port) = self.port.take() {
            self.state.lock().allocator.release(port);
        }
    }
}

/// Supervisor of all tunnels of one cluster transport.
pub struct TunnelRegistry<T: ClusterTransport> {
    ctx: TunnelContext<T>,
    state: Mutex<RegistryState>,
    broadcast: broadcast::Sender<PortForwardEvent>,
    root: CancellationToken,
}

impl<T: ClusterTransport> TunnelRegistry<T> {
    /// Creates an empty registry.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: Arc<T>, config: TunnelConfig) -> Self {
        let config = Arc::new(config);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<PortForwardEvent>();
        let (broadcast_tx, _) = broadcast::channel(config.event_buffer.max(1));

        let publisher = broadcast_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                trace!(
                    event = event.event_type(),
                    forward_id = %event.forward_id(),
                    "Publishing tunnel event"
                );
                // No subscribers is fine.
                let _ = publisher.send(event);
            }
        });

        Self {
            state: Mutex::new(RegistryState {
                tunnels: HashMap::new(),
                allocator: PortAllocator::new(config.bind_address),
                next_seq: 0,
                pending: PendingStarts::new(),
            }),
            ctx: TunnelContext {
                resolver: PodResolver::new(Arc::clone(&transport)),
                transport,
                config,
                events: events_tx,
            },
            broadcast: broadcast_tx,
            root: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.ctx.config
    }

    /// Starts a tunnel and returns its id.
    ///
    /// Fails without registering anything when the local port is taken or
    /// the target cannot work at all. Transient resolve failures register
    /// the tunnel and keep retrying in the background. A concurrent
    /// `stop_all` makes it fail with [`Error::StartCancelled`].
    pub async fn start(&self, target: TunnelTarget) -> Result<ForwardId> {
        target.validate()?;

        let (lease, cancelled, pending) = {
            let mut state = self.state.lock();
            let lease = state.allocator.reserve(target.local_port)?;
            (
                lease,
                state.pending.cancel.clone(),
                state.pending.done_tx.clone(),
            )
        };
        let local_port = lease.port();
        let reservation = Reservation {
            state: &self.state,
            port: Some(local_port),
            _pending: pending,
        };

        let resolved = tokio::select! {
            biased;
            _ = cancelled.cancelled() => {
                debug!(target = %target, "Tunnel start cancelled during resolve");
                drop(lease);
                return Err(Error::StartCancelled);
            }
            resolved = tokio::time::timeout(
                self.ctx.config.resolve_timeout(),
                self.ctx.resolver.resolve(&target),
            ) => resolved,
        };

        let initial = match resolved {
            Ok(Ok(resolution)) => Some(resolution),
            Ok(Err(e)) if e.rejects_start() => {
                debug!(target = %target, error = %e, "Rejecting tunnel target");
                drop(lease);
                return Err(e.into());
            }
            Ok(Err(e)) => {
                debug!(target = %target, error = %e, "Initial resolve failed, retrying in background");
                None
            }
            Err(_) => {
                debug!(target = %target, "Initial resolve timed out, retrying in background");
                None
            }
        };

        let forward_id = Uuid::new_v4();
        let stats = Arc::new(RelayStats::default());
        let cancel = self.root.child_token();
        let listener = LocalListener::spawn(
            lease.into_listener(),
            self.ctx.config.connection_wait_timeout(),
            Arc::clone(&stats),
            &cancel,
        )?;
        let tunnel: SharedTunnel =
            Arc::new(Mutex::new(Tunnel::new(forward_id, &target, local_port)));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let controller = TunnelController::new(
            self.ctx.clone(),
            forward_id,
            target.clone(),
            Arc::clone(&tunnel),
            listener,
            cancel.clone(),
            commands_rx,
        );

        {
            let mut state = self.state.lock();
            if cancelled.is_cancelled() {
                drop(state);
                drop(controller);
                debug!(target = %target, "Tunnel start cancelled before registration");
                return Err(Error::StartCancelled);
            }

            let seq = state.next_seq;
            state.next_seq += 1;

            // Sent before the controller exists, so it precedes all of its events.
            let _ = self.ctx.events.send(PortForwardEvent::Started {
                forward_id,
                local_port,
            });
            let task = tokio::spawn(controller.run(initial));

            state.tunnels.insert(
                forward_id,
                TunnelEntry {
                    tunnel,
                    seq,
                    cancel,
                    commands: commands_tx,
                    task,
                    stats,
                },
            );
            reservation.commit();
        }

        info!(forward_id = %forward_id, target = %target, local_port, "Tunnel started");
        Ok(forward_id)
    }

    /// Stops a tunnel. Returns `false` if no such tunnel is registered.
    pub async fn stop(&self, forward_id: ForwardId) -> bool {
        let Some(entry) = self.state.lock().tunnels.remove(&forward_id) else {
            return false;
        };

        let deadline = Instant::now() + self.ctx.config.shutdown_timeout();
        self.finish(forward_id, entry, deadline).await;
        true
    }

    /// Stops every tunnel. Returns how many were stopped.
    ///
    /// Starts still in flight are cancelled and awaited first. Tunnels that
    /// do not confirm teardown within the shutdown timeout are aborted;
    /// their ports are released either way.
    pub async fn stop_all(&self) -> usize {
        let (mut entries, pending): (Vec<(ForwardId, TunnelEntry)>, _) = {
            let mut state = self.state.lock();
            let pending = std::mem::replace(&mut state.pending, PendingStarts::new());
            (state.tunnels.drain().collect(), pending)
        };
        entries.sort_by_key(|(_, entry)| entry.seq);

        for (_, entry) in &entries {
            entry.cancel.cancel();
        }

        let deadline = Instant::now() + self.ctx.config.shutdown_timeout();
        if tokio::time::timeout_at(deadline, pending.settled())
            .await
            .is_err()
        {
            warn!("Pending tunnel starts did not give up their ports in time");
        }

        let count = entries.len();
        for (forward_id, entry) in entries {
            self.finish(forward_id, entry, deadline).await;
        }

        if count > 0 {
            info!(count, "Stopped all tunnels");
        }
        count
    }

    /// Asks a `disconnected`/`error` tunnel to start over with a fresh retry budget.
    ///
    /// Returns `Ok(false)` when the tunnel is not parked.
    pub fn retry(&self, forward_id: ForwardId) -> Result<bool> {
        let state = self.state.lock();
        let entry = state
            .tunnels
            .get(&forward_id)
            .ok_or(Error::TunnelNotFound(forward_id))?;

        let mut tunnel = entry.tunnel.lock();
        if !tunnel.status.is_parked() {
            return Ok(false);
        }

        // Flip the status here so a second call cannot queue another retry.
        tunnel.status = TunnelStatus::Connecting;
        let _ = entry.commands.send(TunnelCommand::Retry);
        Ok(true)
    }

    /// Snapshot of all tunnels in creation order.
    pub fn list(&self) -> Vec<Tunnel> {
        let state = self.state.lock();
        let mut entries: Vec<&TunnelEntry> = state.tunnels.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(TunnelEntry::snapshot).collect()
    }

    pub fn get(&self, forward_id: ForwardId) -> Option<Tunnel> {
        self.state
            .lock()
            .tunnels
            .get(&forward_id)
            .map(TunnelEntry::snapshot)
    }

    /// Subscribes to the events of all tunnels.
    ///
    /// Subscribers that fall more than `event_buffer` events behind observe
    /// `RecvError::Lagged`.
    pub fn events(&self) -> broadcast::Receiver<PortForwardEvent> {
        self.broadcast.subscribe()
    }

    /// Local ports currently held, ascending.
    pub fn held_ports(&self) -> Vec<u16> {
        self.state.lock().allocator.reserved_ports()
    }

    pub fn len(&self) -> usize {
        self.state.lock().tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().tunnels.is_empty()
    }

    /// Waits for a removed tunnel's task, then releases its port and emits `Stopped`.
    async fn finish(&self, forward_id: ForwardId, entry: TunnelEntry, deadline: Instant) {
        let TunnelEntry {
            tunnel,
            cancel,
            mut task,
            ..
        } = entry;

        cancel.cancel();
        if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
            warn!(forward_id = %forward_id, "Tunnel did not stop in time, aborting");
            task.abort();
            let _ = task.await;
        }

        let local_port = tunnel.lock().local_port;
        self.state.lock().allocator.release(local_port);

        let _ = self
            .ctx
            .events
            .send(PortForwardEvent::Stopped { forward_id });
        info!(forward_id = %forward_id, local_port, "Tunnel stopped");
    }
}

impl<T: ClusterTransport> Drop for TunnelRegistry<T> {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
