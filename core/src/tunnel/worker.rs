//! Tunnel worker and the local listener it serves.
//!
//! The [`LocalListener`] is bound once per tunnel and outlives individual
//! workers: while a tunnel reconnects, new local connections wait (up to a
//! timeout) for the next worker instead of being refused. A
//! [`TunnelWorker`] publishes one pod connection to the listener and
//! watches it until it fails or is cancelled.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::domain::{BackingPod, TunnelStats};
use crate::ports::{PodConnection, TransportError};

/// Pause after a failed `accept()` (e.g. file descriptor exhaustion).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Why a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Cancelled by its owner.
    Closed,
    /// The pod connection failed.
    StreamError(String),
    /// The transport reported the pod as gone.
    PodGone,
}

impl WorkerExit {
    fn from_transport(err: TransportError) -> Self {
        debug!(error = %err, "Pod connection failed");
        match err {
            TransportError::PodNotFound(_) => Self::PodGone,
            other => Self::StreamError(other.summary().to_string()),
        }
    }
}

/// Relay counters shared between a listener and the registry.
#[derive(Debug, Default)]
pub struct RelayStats {
    active: AtomicU64,
    total: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl RelayStats {
    pub fn snapshot(&self) -> TunnelStats {
        TunnelStats {
            active_connections: self.active.load(Ordering::Relaxed),
            total_connections: self.total.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    fn opened(&self) -> ActiveRelay<'_> {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        ActiveRelay(self)
    }
}

/// Counts a relay as active until dropped, including when its task is aborted.
struct ActiveRelay<'a>(&'a RelayStats);

impl Drop for ActiveRelay<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Adds every byte read through the stream to `counter` as it happens.
struct Metered<'a, S> {
    inner: S,
    counter: &'a AtomicU64,
}

impl<S: AsyncRead + Unpin> AsyncRead for Metered<'_, S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let polled = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = polled {
            let read = (buf.filled().len() - before) as u64;
            self.counter.fetch_add(read, Ordering::Relaxed);
        }
        polled
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Metered<'_, S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Where new local connections are currently sent.
struct Route<C> {
    connection: Arc<C>,
    faults: mpsc::UnboundedSender<TransportError>,
}

impl<C> Clone for Route<C> {
    fn clone(&self) -> Self {
        Self {
            connection: Arc::clone(&self.connection),
            faults: self.faults.clone(),
        }
    }
}

type RouteSlot<C> = watch::Sender<Option<Route<C>>>;

/// The tunnel's local TCP listener, reused across reconnects.
pub struct LocalListener<C: PodConnection> {
    local_port: u16,
    route: Arc<RouteSlot<C>>,
    stop: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl<C: PodConnection> LocalListener<C> {
    /// Starts accepting on an already bound, non-blocking listener.
    ///
    /// Must be called from within a Tokio runtime. Cancelling `cancel`
    /// closes the listener and every relayed connection.
    pub fn spawn(
        listener: std::net::TcpListener,
        wait_timeout: Duration,
        stats: Arc<RelayStats>,
        cancel: &CancellationToken,
    ) -> std::io::Result<Self> {
        let local_port = listener.local_addr()?.port();
        let listener = TcpListener::from_std(listener)?;

        let (route, route_rx) = watch::channel(None);
        let route = Arc::new(route);
        let stop = cancel.child_token();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            route_rx,
            wait_timeout,
            stats,
            stop.clone(),
        ));

        Ok(Self {
            local_port,
            route,
            stop,
            accept_task: Some(accept_task),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Whether a worker is currently serving connections.
    pub fn has_route(&self) -> bool {
        self.route.borrow().is_some()
    }

    /// Stops accepting, closes all relayed connections and waits for that to finish.
    pub async fn close(mut self) {
        self.stop.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        debug!(local_port = self.local_port, "Local listener closed");
    }
}

impl<C: PodConnection> Drop for LocalListener<C> {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

async fn accept_loop<C: PodConnection>(
    listener: TcpListener,
    route: watch::Receiver<Option<Route<C>>>,
    wait_timeout: Duration,
    stats: Arc<RelayStats>,
    stop: CancellationToken,
) {
    let mut relays = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            Some(_) = relays.join_next(), if !relays.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    trace!(peer = %peer, "Accepted local connection");
                    relays.spawn(relay(
                        stream,
                        peer,
                        route.clone(),
                        wait_timeout,
                        Arc::clone(&stats),
                        stop.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept local connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    relays.shutdown().await;
}

/// Waits until a worker publishes a route. `None` if the listener is gone.
async fn next_route<C>(route: &mut watch::Receiver<Option<Route<C>>>) -> Option<Route<C>> {
    match route.wait_for(Option::is_some).await {
        Ok(current) => current.clone(),
        Err(_) => None,
    }
}

async fn relay<C: PodConnection>(
    local: TcpStream,
    peer: SocketAddr,
    mut route_rx: watch::Receiver<Option<Route<C>>>,
    wait_timeout: Duration,
    stats: Arc<RelayStats>,
    stop: CancellationToken,
) {
    let route = tokio::select! {
        _ = stop.cancelled() => return,
        waited = tokio::time::timeout(wait_timeout, next_route(&mut route_rx)) => match waited {
            Ok(Some(route)) => route,
            Ok(None) => return,
            Err(_) => {
                debug!(peer = %peer, "No backing pod became available, closing local connection");
                return;
            }
        }
    };

    let remote = tokio::select! {
        _ = stop.cancelled() => return,
        dialed = route.connection.dial() => match dialed {
            Ok(stream) => stream,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Failed to open stream to pod");
                if !e.is_stream_local() {
                    let _ = route.faults.send(e);
                }
                return;
            }
        }
    };

    let _active = stats.opened();
    let mut local = Metered {
        inner: local,
        counter: &stats.bytes_sent,
    };
    let mut remote = Metered {
        inner: remote,
        counter: &stats.bytes_received,
    };

    tokio::select! {
        _ = stop.cancelled() => trace!(peer = %peer, "Relayed connection closed by shutdown"),
        copied = copy_bidirectional(&mut local, &mut remote) => match copied {
            Ok((sent, received)) => {
                trace!(peer = %peer, sent, received, "Relayed connection closed");
            }
            Err(e) => debug!(peer = %peer, error = %e, "Relayed connection failed"),
        },
    }
}

/// Handle to a running worker.
pub struct WorkerHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<WorkerExit>>,
}

impl WorkerHandle {
    /// Waits for the worker to end on its own. Cancel safe.
    pub async fn wait(&mut self) -> WorkerExit {
        let Some(task) = self.task.as_mut() else {
            return std::future::pending().await;
        };

        let exit = task.await.unwrap_or_else(|e| {
            warn!(error = %e, "Tunnel worker task failed");
            WorkerExit::StreamError("tunnel worker failed".to_string())
        });
        self.task = None;
        exit
    }

    /// Cancels the worker and returns once its teardown is complete.
    pub async fn shutdown(mut self) -> WorkerExit {
        self.cancel.cancel();
        match self.task.take() {
            Some(task) => task.await.unwrap_or(WorkerExit::Closed),
            None => WorkerExit::Closed,
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Serves one pod connection on a tunnel's listener.
pub struct TunnelWorker;

impl TunnelWorker {
    /// Routes new local connections to `connection` until it fails or the handle is shut down.
    pub fn start<C: PodConnection>(
        listener: &LocalListener<C>,
        connection: C,
        pod: BackingPod,
    ) -> WorkerHandle {
        let connection = Arc::new(connection);
        let (faults_tx, mut faults_rx) = mpsc::unbounded_channel();
        let route = Arc::clone(&listener.route);
        let local_port = listener.local_port;

        route.send_replace(Some(Route {
            connection: Arc::clone(&connection),
            faults: faults_tx,
        }));

        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            debug!(local_port, pod = %pod.pod_name, "Tunnel worker started");

            let exit = tokio::select! {
                biased;
                _ = token.cancelled() => WorkerExit::Closed,
                err = connection.closed() => WorkerExit::from_transport(err),
                Some(err) = faults_rx.recv() => WorkerExit::from_transport(err),
            };

            // Stop routing new connections here; relays already running keep their stream.
            route.send_if_modified(|current| {
                let ours = current
                    .as_ref()
                    .is_some_and(|r| Arc::ptr_eq(&r.connection, &connection));
                if ours {
                    *current = None;
                }
                ours
            });
            connection.close().await;

            debug!(local_port, pod = %pod.pod_name, exit = ?exit, "Tunnel worker stopped");
            exit
        });

        WorkerHandle {
            cancel,
            task: Some(task),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio_test::assert_pending;

    struct EchoConnection {
        closed: watch::Receiver<Option<TransportError>>,
        released: Arc<std::sync::atomic::AtomicBool>,
    }

    impl PodConnection for EchoConnection {
        type Stream = DuplexStream;

        async fn dial(&self) -> Result<DuplexStream, TransportError> {
            let (local, remote) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                let (mut rd, mut wr) = tokio::io::split(remote);
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
            Ok(local)
        }

        async fn closed(&self) -> TransportError {
            let mut closed = self.closed.clone();
            let err = closed
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|err| err.clone());
            match err {
                Some(err) => err,
                None => std::future::pending().await,
            }
        }

        async fn close(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn echo_connection() -> (EchoConnection, watch::Sender<Option<TransportError>>) {
        let (tx, rx) = watch::channel(None);
        let connection = EchoConnection {
            closed: rx,
            released: Arc::default(),
        };
        (connection, tx)
    }

    fn listener(wait_timeout: Duration) -> (LocalListener<EchoConnection>, Arc<RelayStats>) {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let stats = Arc::new(RelayStats::default());
        let listener = LocalListener::spawn(
            std_listener,
            wait_timeout,
            Arc::clone(&stats),
            &CancellationToken::new(),
        )
        .unwrap();
        (listener, stats)
    }

    fn pod() -> BackingPod {
        BackingPod::new("api-0", "uid-1")
    }

    async fn ping(port: u16) -> String {
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_relays_through_worker() {
        let (listener, stats) = listener(Duration::from_secs(5));
        let (connection, _closed) = echo_connection();
        let worker = TunnelWorker::start(&listener, connection, pod());
        assert!(listener.has_route());

        assert_eq!(ping(listener.local_port()).await, "ping");
        assert_eq!(stats.snapshot().total_connections, 1);

        assert_eq!(worker.shutdown().await, WorkerExit::Closed);
        assert!(!listener.has_route());
        listener.close().await;
    }

    #[tokio::test]
    async fn test_bytes_counted_on_open_connections() {
        let (listener, stats) = listener(Duration::from_secs(5));
        let (connection, _closed) = echo_connection();
        let _worker = TunnelWorker::start(&listener, connection, pod());

        let mut client = TcpStream::connect(("127.0.0.1", listener.local_port()))
            .await
            .unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();

        let open = stats.snapshot();
        assert_eq!(open.active_connections, 1);
        assert_eq!(open.bytes_sent, 5);
        assert_eq!(open.bytes_received, 5);

        // Closing the listener cuts the relay; what was copied stays counted.
        listener.close().await;
        let closed = stats.snapshot();
        assert_eq!(closed.active_connections, 0);
        assert_eq!(closed.bytes_sent, 5);
        assert_eq!(closed.bytes_received, 5);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connection() {
        let (listener, _stats) = listener(Duration::from_secs(5));
        let (connection, _closed) = echo_connection();
        let released = Arc::clone(&connection.released);
        let worker = TunnelWorker::start(&listener, connection, pod());
        assert!(!released.load(Ordering::SeqCst));

        worker.shutdown().await;
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_connection_waits_for_route() {
        let (listener, _stats) = listener(Duration::from_secs(5));
        let port = listener.local_port();

        let pending = tokio::spawn(ping(port));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        let (connection, _closed) = echo_connection();
        let _worker = TunnelWorker::start(&listener, connection, pod());
        assert_eq!(pending.await.unwrap(), "ping");
    }

    #[tokio::test]
    async fn test_connection_dropped_after_wait_timeout() {
        let (listener, stats) = listener(Duration::from_millis(50));
        let mut client = TcpStream::connect(("127.0.0.1", listener.local_port()))
            .await
            .unwrap();

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(stats.snapshot().total_connections, 0);
    }

    #[tokio::test]
    async fn test_worker_exits_when_pod_gone() {
        let (listener, _stats) = listener(Duration::from_secs(5));
        let (connection, closed) = echo_connection();
        let mut worker = TunnelWorker::start(&listener, connection, pod());

        closed
            .send(Some(TransportError::PodNotFound("api-0".to_string())))
            .unwrap();
        assert_eq!(worker.wait().await, WorkerExit::PodGone);
        assert!(!listener.has_route());

        // Once consumed, waiting again never resolves.
        let mut again = tokio_test::task::spawn(worker.wait());
        assert_pending!(again.poll());
    }

    #[tokio::test]
    async fn test_stream_error_exit() {
        let (listener, _stats) = listener(Duration::from_secs(5));
        let (connection, closed) = echo_connection();
        let mut worker = TunnelWorker::start(&listener, connection, pod());

        closed
            .send(Some(TransportError::Stream("reset".to_string())))
            .unwrap();
        assert_eq!(
            worker.wait().await,
            WorkerExit::StreamError("pod connection lost".to_string())
        );
    }
}
