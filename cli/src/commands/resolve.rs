//! Resolve command - show the pod a target would be forwarded to.

use std::sync::Arc;

use anyhow::Result;
use podtunnel_core::tunnel::PodResolver;
use podtunnel_core::TunnelTarget;

pub async fn run(
    namespace: &str,
    context: Option<String>,
    resource: &str,
    port: u16,
    json: bool,
) -> Result<()> {
    let target = TunnelTarget::parse_resource(namespace, resource, port)?;
    let resolver = PodResolver::new(Arc::new(super::kubectl_transport(context)?));
    let resolution = resolver.resolve(&target).await?;

    if json {
        let value = serde_json::json!({
            "namespace": target.namespace,
            "target": format!("{}/{}", target.target_type.resource_prefix(), target.name),
            "targetPort": target.target_port,
            "podName": resolution.pod.pod_name,
            "podUid": resolution.pod.pod_uid,
            "podPort": resolution.pod_port,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!(
        "{}/{}:{} -> pod/{}:{} (uid {})",
        target.target_type.resource_prefix(),
        target.name,
        target.target_port,
        resolution.pod.pod_name,
        resolution.pod_port,
        resolution.pod.pod_uid
    );
    Ok(())
}
