//! Cluster queries using kubectl commands.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::trace;

use super::models::{PodItem, PodListResponse, ServiceItem};
use crate::domain::{PodInfo, ServiceInfo};
use crate::ports::{TransportError, TransportResult};

/// Default paths to search for kubectl.
const KUBECTL_PATHS: &[&str] = &[
    "/opt/homebrew/bin/kubectl", // Apple Silicon
    "/usr/local/bin/kubectl",    // Intel Mac / Homebrew
    "/usr/bin/kubectl",          // System
];

/// Timeout for kubectl query commands.
const KUBECTL_TIMEOUT: Duration = Duration::from_secs(15);

/// Runs kubectl queries against one cluster context.
#[derive(Debug, Clone)]
pub struct KubectlClient {
    kubectl_path: Option<PathBuf>,
    context: Option<String>,
}

impl KubectlClient {
    /// Creates a client using the first kubectl found on the system.
    pub fn new() -> Self {
        Self {
            kubectl_path: find_kubectl(),
            context: None,
        }
    }

    /// Creates a client with a custom kubectl path.
    pub fn with_path(kubectl_path: Option<PathBuf>) -> Self {
        Self {
            kubectl_path,
            context: None,
        }
    }

    /// Targets a specific kubeconfig context instead of the current one.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn kubectl_path(&self) -> Option<&PathBuf> {
        self.kubectl_path.as_ref()
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn is_kubectl_available(&self) -> bool {
        self.kubectl_path.is_some()
    }

    /// Fetches a pod. `Ok(None)` if it does not exist.
    pub async fn get_pod(&self, namespace: &str, name: &str) -> TransportResult<Option<PodInfo>> {
        let output = self
            .execute_kubectl(&["get", "pod", name, "-n", namespace, "-o", "json"])
            .await;

        match output {
            Ok(json) => {
                let item: PodItem = serde_json::from_str(&json)
                    .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
                Ok(Some(item.into_pod()))
            }
            Err(TransportError::PodNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetches a service. `Ok(None)` if it does not exist.
    pub async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> TransportResult<Option<ServiceInfo>> {
        let output = self
            .execute_kubectl(&["get", "service", name, "-n", namespace, "-o", "json"])
            .await;

        match output {
            Ok(json) => {
                let item: ServiceItem = serde_json::from_str(&json)
                    .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
                Ok(Some(item.into_service()))
            }
            // kubectl reports any missing object as NotFound.
            Err(TransportError::PodNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Lists pods matching every `key=value` pair of `selector`.
    pub async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> TransportResult<Vec<PodInfo>> {
        let selector = format_selector(selector);
        let output = self
            .execute_kubectl(&["get", "pods", "-n", namespace, "-l", &selector, "-o", "json"])
            .await?;

        let response: PodListResponse = serde_json::from_str(&output)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        let mut pods = response.into_pods();
        pods.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pods)
    }

    /// Arguments that select the configured context, if any.
    pub(crate) fn context_args(&self) -> Vec<String> {
        match &self.context {
            Some(context) => vec!["--context".to_string(), context.clone()],
            None => Vec::new(),
        }
    }

    /// Executes a kubectl command and returns the output.
    async fn execute_kubectl(&self, args: &[&str]) -> TransportResult<String> {
        let kubectl_path = self
            .kubectl_path
            .as_ref()
            .ok_or(TransportError::KubectlNotFound)?;

        trace!(args = ?args, "Running kubectl");

        let result = timeout(KUBECTL_TIMEOUT, async {
            let output = Command::new(kubectl_path)
                .args(self.context_args())
                .args(args)
                .arg("--request-timeout=10s")
                .output()
                .await?;

            Ok::<_, std::io::Error>((output.status, output.stdout, output.stderr))
        })
        .await;

        match result {
            Ok(Ok((status, stdout, stderr))) => {
                if status.success() {
                    String::from_utf8(stdout)
                        .map_err(|e| TransportError::InvalidResponse(e.to_string()))
                } else {
                    let stderr_str = String::from_utf8_lossy(&stderr);
                    Err(TransportError::from_kubectl_error(&stderr_str))
                }
            }
            Ok(Err(e)) => Err(TransportError::Other(format!("Failed to run kubectl: {}", e))),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

impl Default for KubectlClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Finds kubectl in the well-known locations, then on `PATH`.
fn find_kubectl() -> Option<PathBuf> {
    find_executable(KUBECTL_PATHS).or_else(|| {
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join("kubectl"))
            .find(|candidate| candidate.is_file())
    })
}

/// Finds an executable in the given paths.
fn find_executable(paths: &[&str]) -> Option<PathBuf> {
    paths
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

/// Renders a label selector as `k1=v1,k2=v2`.
fn format_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}
