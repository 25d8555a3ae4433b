//! Forward command - keep port forwards alive until interrupted.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use podtunnel_core::{
    ConfigStore, ForwardId, PortForwardEvent, Tunnel, TunnelRegistry, TunnelTarget,
};
use tokio::sync::broadcast::error::RecvError;

pub struct ForwardOptions {
    pub namespace: String,
    pub context: Option<String>,
    pub target: String,
    pub ports: Vec<String>,
    pub json: bool,
}

/// A parsed `LOCAL:REMOTE` argument. `local` of `None` picks a free port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub local: Option<u16>,
    pub remote: u16,
}

/// Parses a port mapping the way `kubectl port-forward` does.
///
/// `8080:80` forwards local 8080, `80` forwards local 80 and `:80` picks
/// any free local port.
pub fn parse_port_mapping(spec: &str) -> Result<PortMapping> {
    let parse = |s: &str| -> Result<u16> {
        s.trim()
            .parse::<u16>()
            .with_context(|| format!("invalid port '{}' in '{}'", s, spec))
    };

    let (local, remote) = match spec.split_once(':') {
        Some(("", remote)) => (None, parse(remote)?),
        Some((local, remote)) => (Some(parse(local)?), parse(remote)?),
        None => {
            let port = parse(spec)?;
            (Some(port), port)
        }
    };

    if remote == 0 {
        anyhow::bail!("remote port must be non-zero in '{}'", spec);
    }

    Ok(PortMapping {
        local: local.filter(|p| *p != 0),
        remote,
    })
}

pub async fn run(store: &ConfigStore, options: ForwardOptions) -> Result<()> {
    let mappings = options
        .ports
        .iter()
        .map(|p| parse_port_mapping(p))
        .collect::<Result<Vec<_>>>()?;

    let config = store.load().await?;
    let transport = super::kubectl_transport(options.context)?;
    let registry = TunnelRegistry::new(Arc::new(transport), config);
    let mut events = registry.events();
    let json = options.json || !atty::is(atty::Stream::Stdout);
    let bind_address = registry.config().bind_address;

    let mut labels = HashMap::new();
    for mapping in &mappings {
        let target =
            TunnelTarget::parse_resource(&options.namespace, &options.target, mapping.remote)?
                .with_local_port(mapping.local.unwrap_or(0));

        match registry.start(target).await {
            Ok(forward_id) => {
                labels.insert(forward_id, format!("{}:{}", options.target, mapping.remote));
            }
            Err(e) => {
                registry.stop_all().await;
                return Err(e).with_context(|| {
                    format!("failed to forward {}:{}", options.target, mapping.remote)
                });
            }
        }
    }

    if !json {
        print_table(&registry.list());
        println!("\nPress Ctrl+C to stop.\n");
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event, &labels, bind_address, json)?,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let stopped = registry.stop_all().await;
    tracing::info!(stopped, "stopped all tunnels");

    // Drain the final `stopped` events that are already queued.
    while let Ok(event) = events.try_recv() {
        print_event(&event, &labels, bind_address, json)?;
    }

    Ok(())
}

fn print_table(tunnels: &[Tunnel]) {
    println!(
        "{:<10} {:<8} {:<8} {:<28} {:<12} POD",
        "ID", "LOCAL", "REMOTE", "TARGET", "STATUS"
    );
    println!("{}", "-".repeat(90));

    for tunnel in tunnels {
        let target = format!("{}/{}", tunnel.target_type.resource_prefix(), tunnel.name);
        println!(
            "{:<10} {:<8} {:<8} {:<28} {:<12} {}",
            short_id(tunnel.forward_id),
            tunnel.local_port,
            tunnel.target_port,
            truncate(&target, 28),
            tunnel.status,
            tunnel.pod_name.as_deref().unwrap_or("-"),
        );
    }
}

fn print_event(
    event: &PortForwardEvent,
    labels: &HashMap<ForwardId, String>,
    bind_address: IpAddr,
    json: bool,
) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    let id = event.forward_id();
    let label = labels
        .get(&id)
        .cloned()
        .unwrap_or_else(|| short_id(id));
    let detail = match event {
        PortForwardEvent::Started { local_port, .. } => {
            format!("listening on {}:{}", bind_address, local_port)
        }
        PortForwardEvent::Connected { .. } => "connected".to_string(),
        PortForwardEvent::Reconnecting { reason, .. } => format!("reconnecting: {}", reason),
        PortForwardEvent::Reconnected { new_pod, .. } => format!("reconnected to {}", new_pod),
        PortForwardEvent::PodDied { pod_name, .. } => format!("pod {} died", pod_name),
        PortForwardEvent::Disconnected { .. } => {
            "disconnected, giving up until retried".to_string()
        }
        PortForwardEvent::Error { message, .. } => format!("error: {}", message),
        PortForwardEvent::Stopped { .. } => "stopped".to_string(),
    };

    println!("{} {:<24} {}", Local::now().format("%H:%M:%S"), label, detail);
    Ok(())
}

fn short_id(id: ForwardId) -> String {
    id.to_string().chars().take(8).collect()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max - 1).collect();
        format!("{}…", head)
    }
}
