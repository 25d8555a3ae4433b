//! In-memory cluster used by the integration tests.
//!
//! Every pod runs a tiny echo server: a stream first receives the pod name
//! followed by a newline, then gets its own bytes echoed back.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use podtunnel_core::domain::{
    BackingPod, ContainerPort, PodInfo, PodLifecycleEvent, PodPhase, ServiceInfo, ServicePortSpec,
    TargetPortRef,
};
use podtunnel_core::ports::{ClusterTransport, PodConnection, TransportError, TransportResult};
use podtunnel_core::{
    ForwardId, PortForwardEvent, RetryPolicy, Tunnel, TunnelConfig, TunnelRegistry, TunnelStatus,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};

pub const NAMESPACE: &str = "default";

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct ClusterState {
    pods: BTreeMap<String, PodInfo>,
    services: BTreeMap<String, ServiceInfo>,
    watchers: Vec<(String, mpsc::Sender<PodLifecycleEvent>)>,
    links: Vec<(String, watch::Sender<Option<TransportError>>)>,
    fail_connects: usize,
    connects: usize,
    next_uid: u64,
    lookup_delay: Duration,
    hang_on_close: bool,
}

/// Fake [`ClusterTransport`] with test controls.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
    push: bool,
}

impl FakeCluster {
    /// A cluster without push notifications; liveness falls back to polling.
    pub fn new() -> Self {
        Self::default()
    }

    /// A cluster that pushes pod lifecycle events.
    pub fn with_push() -> Self {
        Self {
            push: true,
            ..Self::default()
        }
    }

    /// Adds a ready pod with an `http` port on 8080. Returns its UID.
    pub fn add_pod(&self, name: &str, labels: &[(&str, &str)]) -> String {
        let uid = {
            let mut state = self.state.lock();
            state.next_uid += 1;
            format!("uid-{:04}", state.next_uid)
        };
        self.add_pod_with_uid(name, &uid, labels);
        uid
    }

    pub fn add_pod_with_uid(&self, name: &str, uid: &str, labels: &[(&str, &str)]) {
        let pod = PodInfo {
            name: name.to_string(),
            namespace: NAMESPACE.to_string(),
            uid: uid.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            phase: PodPhase::Running,
            ready: true,
            terminating: false,
            ports: vec![ContainerPort::new(Some("http"), 8080)],
        };
        self.state.lock().pods.insert(name.to_string(), pod);
    }

    pub fn set_ready(&self, name: &str, ready: bool) {
        if let Some(pod) = self.state.lock().pods.get_mut(name) {
            pod.ready = ready;
        }
    }

    /// Deletes a pod, notifying watchers and failing its connections.
    pub fn delete_pod(&self, name: &str) {
        let mut state = self.state.lock();
        let Some(pod) = state.pods.remove(name) else {
            return;
        };

        for (uid, watcher) in &state.watchers {
            if *uid == pod.uid {
                let _ = watcher.try_send(PodLifecycleEvent::Deleted {
                    uid: pod.uid.clone(),
                });
            }
        }
        for (uid, link) in &state.links {
            if *uid == pod.uid {
                link.send_replace(Some(TransportError::PodNotFound(pod.name.clone())));
            }
        }
    }

    /// Swaps the pod for a new instance with the same name, without any notification.
    pub fn replace_pod(&self, name: &str) -> Option<String> {
        let mut state = self.state.lock();
        state.next_uid += 1;
        let uid = format!("uid-{:04}", state.next_uid);
        let pod = state.pods.get_mut(name)?;
        pod.uid = uid.clone();
        Some(uid)
    }

    /// Fails the control stream of every connection to the pod's current instance.
    pub fn break_connections(&self, name: &str) {
        let state = self.state.lock();
        let Some(pod) = state.pods.get(name) else {
            return;
        };
        for (uid, link) in &state.links {
            if *uid == pod.uid {
                link.send_replace(Some(TransportError::Stream(
                    "control stream reset".to_string(),
                )));
            }
        }
    }

    pub fn add_service(&self, name: &str, selector: &[(&str, &str)]) {
        let service = ServiceInfo {
            name: name.to_string(),
            namespace: NAMESPACE.to_string(),
            selector: selector
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ports: vec![ServicePortSpec {
                name: Some("http".to_string()),
                port: 80,
                target_port: Some(TargetPortRef::Name("http".to_string())),
                protocol: Some("TCP".to_string()),
            }],
        };
        self.state.lock().services.insert(name.to_string(), service);
    }

    /// Makes the next `n` calls to `connect` fail with a transient error.
    pub fn fail_next_connects(&self, n: usize) {
        self.state.lock().fail_connects = n;
    }

    /// Sends `event` to every open pod watch, whatever UID it was opened for.
    pub fn push_event(&self, event: PodLifecycleEvent) {
        for (_, watcher) in &self.state.lock().watchers {
            let _ = watcher.try_send(event.clone());
        }
    }

    /// Delays every pod and service lookup by `delay`.
    pub fn set_lookup_delay(&self, delay: Duration) {
        self.state.lock().lookup_delay = delay;
    }

    /// Makes `PodConnection::close` never resolve.
    pub fn hang_connection_close(&self) {
        self.state.lock().hang_on_close = true;
    }

    async fn lookup_delay(&self) {
        let delay = self.state.lock().lookup_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn uid_of(&self, name: &str) -> Option<String> {
        self.state.lock().pods.get(name).map(|p| p.uid.clone())
    }
}

impl ClusterTransport for FakeCluster {
    type Connection = FakeConnection;

    async fn get_pod(&self, namespace: &str, name: &str) -> TransportResult<Option<PodInfo>> {
        self.lookup_delay().await;
        let state = self.state.lock();
        Ok(state
            .pods
            .get(name)
            .filter(|p| p.namespace == namespace)
            .cloned())
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> TransportResult<Option<ServiceInfo>> {
        self.lookup_delay().await;
        let state = self.state.lock();
        Ok(state
            .services
            .get(name)
            .filter(|s| s.namespace == namespace)
            .cloned())
    }

    async fn list_pods_by_selector(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> TransportResult<Vec<PodInfo>> {
        self.lookup_delay().await;
        let state = self.state.lock();
        Ok(state
            .pods
            .values()
            .filter(|p| p.namespace == namespace && p.matches_selector(selector))
            .cloned()
            .collect())
    }

    async fn connect(
        &self,
        _namespace: &str,
        pod: &BackingPod,
        _pod_port: u16,
    ) -> TransportResult<FakeConnection> {
        let mut state = self.state.lock();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(TransportError::Unreachable("injected failure".to_string()));
        }

        let alive = state
            .pods
            .get(&pod.pod_name)
            .is_some_and(|p| p.uid == pod.pod_uid);
        if !alive {
            return Err(TransportError::PodNotFound(pod.pod_name.clone()));
        }

        let (link, closed) = watch::channel(None);
        state.links.push((pod.pod_uid.clone(), link));
        state.connects += 1;

        Ok(FakeConnection {
            state: Arc::clone(&self.state),
            pod: pod.clone(),
            closed,
        })
    }

    async fn watch_pod(
        &self,
        _namespace: &str,
        pod: &BackingPod,
    ) -> TransportResult<Option<mpsc::Receiver<PodLifecycleEvent>>> {
        if !self.push {
            return Ok(None);
        }
        let (tx, rx) = mpsc::channel(16);
        self.state.lock().watchers.push((pod.pod_uid.clone(), tx));
        Ok(Some(rx))
    }
}

pub struct FakeConnection {
    state: Arc<Mutex<ClusterState>>,
    pod: BackingPod,
    closed: watch::Receiver<Option<TransportError>>,
}

impl PodConnection for FakeConnection {
    type Stream = DuplexStream;

    async fn dial(&self) -> TransportResult<DuplexStream> {
        let alive = self
            .state
            .lock()
            .pods
            .get(&self.pod.pod_name)
            .is_some_and(|p| p.uid == self.pod.pod_uid);
        if !alive {
            return Err(TransportError::PodNotFound(self.pod.pod_name.clone()));
        }

        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let banner = format!("{}\n", self.pod.pod_name);
        tokio::spawn(async move {
            if server.write_all(banner.as_bytes()).await.is_err() {
                return;
            }
            let mut buf = [0u8; 1024];
            loop {
                match server.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if server.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(client)
    }

    async fn closed(&self) -> TransportError {
        let mut closed = self.closed.clone();
        closed
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|current| current.clone())
            .unwrap_or_else(|| TransportError::Stream("fake link dropped".to_string()))
    }

    async fn close(&self) {
        let hang = self.state.lock().hang_on_close;
        if hang {
            std::future::pending::<()>().await;
        }
    }
}

/// Retry and liveness timings scaled down for tests.
pub fn test_config() -> TunnelConfig {
    TunnelConfig {
        retry: RetryPolicy {
            base_delay_ms: 20,
            max_delay_ms: 100,
            max_attempts: 0,
            jitter: false,
        },
        liveness_poll_interval_ms: 25,
        connection_wait_timeout_ms: 3_000,
        resolve_timeout_ms: 2_000,
        shutdown_timeout_ms: 2_000,
        ..TunnelConfig::default()
    }
}

pub fn registry(cluster: &FakeCluster, config: TunnelConfig) -> TunnelRegistry<FakeCluster> {
    TunnelRegistry::new(Arc::new(cluster.clone()), config)
}

/// Next event belonging to `forward_id`.
pub async fn next_event(
    events: &mut broadcast::Receiver<PortForwardEvent>,
    forward_id: ForwardId,
) -> PortForwardEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if event.forward_id() == forward_id => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for tunnel event")
}

/// Next event of `forward_id` that is not a retry notification.
pub async fn next_non_retry_event(
    events: &mut broadcast::Receiver<PortForwardEvent>,
    forward_id: ForwardId,
) -> PortForwardEvent {
    loop {
        let event = next_event(events, forward_id).await;
        if !matches!(event, PortForwardEvent::Reconnecting { .. }) {
            return event;
        }
    }
}

/// Polls the registry until the tunnel reaches `status`.
pub async fn wait_for_status(
    registry: &TunnelRegistry<FakeCluster>,
    forward_id: ForwardId,
    status: TunnelStatus,
) -> Tunnel {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(tunnel) = registry.get(forward_id) {
                if tunnel.status == status {
                    return tunnel;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("tunnel never reached {}", status))
}

/// Opens a local connection and returns the banner (the serving pod's name).
pub async fn connect_local(port: u16) -> (String, BufReader<TcpStream>) {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("local listener refused connection");
    let mut reader = BufReader::new(stream);

    let mut banner = String::new();
    tokio::time::timeout(WAIT, reader.read_line(&mut banner))
        .await
        .expect("timed out waiting for banner")
        .expect("failed to read banner");

    (banner.trim_end().to_string(), reader)
}

/// Sends `payload` and checks it comes back unchanged.
pub async fn assert_echo(reader: &mut BufReader<TcpStream>, payload: &[u8]) {
    reader.get_mut().write_all(payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    tokio::time::timeout(WAIT, reader.read_exact(&mut echoed))
        .await
        .expect("timed out waiting for echo")
        .unwrap();
    assert_eq!(echoed, payload);
}
