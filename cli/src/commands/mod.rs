//! CLI command implementations.

pub mod config;
pub mod forward;
pub mod resolve;

use std::path::Path;

use anyhow::Result;
use podtunnel_core::{ConfigStore, KubectlClient, KubectlTransport};

pub fn config_store(path: Option<&Path>) -> Result<ConfigStore> {
    Ok(match path {
        Some(path) => ConfigStore::with_path(path.to_path_buf()),
        None => ConfigStore::new()?,
    })
}

/// Builds the kubectl transport, failing early when kubectl is missing.
pub fn kubectl_transport(context: Option<String>) -> Result<KubectlTransport> {
    let mut client = KubectlClient::new();
    if !client.is_kubectl_available() {
        anyhow::bail!("kubectl not found. Please install kubectl.");
    }
    if let Some(context) = context {
        client = client.with_context(context);
    }
    Ok(KubectlTransport::new(client))
}
