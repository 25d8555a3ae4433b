//! Pod connections backed by `kubectl port-forward` processes.
//!
//! Each connection is one kubectl child forwarding an ephemeral loopback
//! port to the pod. Streams are plain TCP connections to that port; the
//! child exiting is the connection failing.

use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::domain::BackingPod;
use crate::ports::{PodConnection, TransportError, TransportResult};

/// How long kubectl gets to announce its listening port.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Grace period before force-killing a process.
const KILL_GRACE_PERIOD: Duration = Duration::from_millis(300);

static FORWARDING_FROM: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"Forwarding from 127\.0\.0\.1:(\d+)").ok());

/// A running `kubectl port-forward` to one pod port.
pub struct KubectlPortForward {
    pod_name: String,
    local_port: u16,
    closed: watch::Receiver<Option<TransportError>>,
    shutdown: CancellationToken,
    /// Cancelled once the child has been reaped.
    exited: CancellationToken,
}

impl KubectlPortForward {
    /// Starts kubectl and waits until it reports the forwarded port.
    pub(crate) async fn spawn(
        kubectl_path: &Path,
        context_args: &[String],
        namespace: &str,
        pod: &BackingPod,
        pod_port: u16,
    ) -> TransportResult<Self> {
        let mut child = Command::new(kubectl_path)
            .args(context_args)
            .args([
                "port-forward",
                "-n",
                namespace,
                &format!("pod/{}", pod.pod_name),
                &format!(":{}", pod_port),
                "--address=127.0.0.1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Other(format!("Failed to start kubectl: {}", e)))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(TransportError::Other(
                "kubectl output is not captured".to_string(),
            ));
        };

        let last_error = Arc::new(Mutex::new(None));
        let stderr_task = tokio::spawn(read_stderr(
            stderr,
            pod.pod_name.clone(),
            Arc::clone(&last_error),
        ));

        let mut stdout = BufReader::new(stdout).lines();
        let announced = timeout(STARTUP_TIMEOUT, async {
            while let Some(line) = stdout.next_line().await? {
                trace!(pod = %pod.pod_name, line = %line, "kubectl port-forward");
                if let Some(port) = parse_forwarding_port(&line) {
                    return Ok(Some(port));
                }
            }
            Ok::<_, std::io::Error>(None)
        })
        .await;

        let local_port = match announced {
            Ok(Ok(Some(port))) => port,
            Ok(_) => {
                // kubectl exited before forwarding; its stderr says why.
                let _ = child.wait().await;
                let _ = stderr_task.await;
                let error = last_error.lock().take();
                return Err(match error {
                    Some(line) => TransportError::from_kubectl_error(&line),
                    None => TransportError::Other("kubectl port-forward exited".to_string()),
                });
            }
            Err(_) => {
                terminate(&mut child).await;
                return Err(TransportError::Timeout);
            }
        };

        debug!(
            pod = %pod.pod_name,
            pod_port,
            local_port,
            "kubectl port-forward ready"
        );

        let (closed_tx, closed_rx) = watch::channel(None);
        let shutdown = CancellationToken::new();
        let exited = CancellationToken::new();
        tokio::spawn(supervise(
            child,
            stdout,
            stderr_task,
            last_error,
            closed_tx,
            shutdown.clone(),
            exited.clone(),
            pod.pod_name.clone(),
        ));

        Ok(Self {
            pod_name: pod.pod_name.clone(),
            local_port,
            closed: closed_rx,
            shutdown,
            exited,
        })
    }
}

impl PodConnection for KubectlPortForward {
    type Stream = TcpStream;

    async fn dial(&self) -> TransportResult<TcpStream> {
        if let Some(error) = self.closed.borrow().clone() {
            return Err(error);
        }
        Ok(TcpStream::connect((Ipv4Addr::LOCALHOST, self.local_port)).await?)
    }

    async fn closed(&self) -> TransportError {
        let mut closed = self.closed.clone();
        let error = closed
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|current| current.clone());

        error.unwrap_or_else(|| {
            TransportError::Stream(format!("port-forward to {} ended", self.pod_name))
        })
    }

    async fn close(&self) {
        self.shutdown.cancel();
        self.exited.cancelled().await;
    }
}

impl Drop for KubectlPortForward {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Owns the kubectl child until it exits or the connection is dropped.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    mut child: Child,
    mut stdout: Lines<BufReader<ChildStdout>>,
    stderr_task: JoinHandle<()>,
    last_error: Arc<Mutex<Option<String>>>,
    closed: watch::Sender<Option<TransportError>>,
    shutdown: CancellationToken,
    exited: CancellationToken,
    pod_name: String,
) {
    let _exited = exited.drop_guard();
    let mut stdout_open = true;

    let status = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                terminate(&mut child).await;
                debug!(pod = %pod_name, "kubectl port-forward stopped");
                return;
            }
            status = child.wait() => break status,
            // Keep draining so kubectl never blocks on a full pipe.
            line = stdout.next_line(), if stdout_open => match line {
                Ok(Some(line)) => trace!(pod = %pod_name, line = %line, "kubectl port-forward"),
                _ => stdout_open = false,
            },
        }
    };

    let _ = stderr_task.await;
    let error = match last_error.lock().take() {
        Some(line) => TransportError::from_kubectl_error(&line),
        None => TransportError::Stream(match status {
            Ok(status) => format!("kubectl port-forward exited with {}", status),
            Err(e) => format!("kubectl port-forward failed: {}", e),
        }),
    };

    warn!(pod = %pod_name, error = %error, "kubectl port-forward exited");
    closed.send_replace(Some(error));
}

/// Logs kubectl's stderr and remembers the last error line.
async fn read_stderr(stderr: ChildStderr, pod_name: String, last_error: Arc<Mutex<Option<String>>>) {
    let mut lines = BufReader::new(stderr).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if is_error_line(&line) {
            debug!(pod = %pod_name, line = %line, "kubectl port-forward error output");
            *last_error.lock() = Some(line);
        } else {
            trace!(pod = %pod_name, line = %line, "kubectl port-forward");
        }
    }
}

/// SIGTERM first, SIGKILL after a grace period.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if timeout(KILL_GRACE_PERIOD, child.wait()).await.is_ok() {
                return;
            }
        }
    }

    let _ = child.kill().await;
}

/// Extracts the local port from a `Forwarding from 127.0.0.1:PORT -> N` line.
fn parse_forwarding_port(line: &str) -> Option<u16> {
    FORWARDING_FROM
        .as_ref()?
        .captures(line)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// Checks if a line indicates an error.
fn is_error_line(line: &str) -> bool {
    let line_lower = line.to_lowercase();
    line_lower.contains("error")
        || line_lower.contains("failed")
        || line_lower.contains("unable to")
        || line_lower.contains("connection refused")
        || line_lower.contains("lost connection")
        || line_lower.contains("not found")
        || line_lower.contains("forbidden")
}
