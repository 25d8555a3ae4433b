//! Tunnel target domain model.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kind of cluster resource a tunnel points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    /// A single, named pod.
    Pod,
    /// A service; one of its ready pods is picked as the backing pod.
    Service,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pod => "pod",
            Self::Service => "service",
        }
    }

    /// Short resource prefix as used by kubectl (`pod/name`, `svc/name`).
    pub fn resource_prefix(&self) -> &'static str {
        match self {
            Self::Pod => "pod",
            Self::Service => "svc",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pod" | "pods" | "po" => Ok(Self::Pod),
            "service" | "services" | "svc" => Ok(Self::Service),
            other => Err(Error::InvalidTarget(format!(
                "unknown target type '{}', expected pod or service",
                other
            ))),
        }
    }
}

/// What a tunnel forwards to. Immutable once the tunnel is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelTarget {
    pub namespace: String,
    pub name: String,
    pub target_type: TargetType,
    /// Remote port. For services this is the service port, not the container port.
    pub target_port: u16,
    /// Requested local port. `None` lets the allocator pick one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
}

impl TunnelTarget {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        target_type: TargetType,
        target_port: u16,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            target_type,
            target_port,
            local_port: None,
        }
    }

    /// Target a single pod.
    pub fn pod(namespace: impl Into<String>, name: impl Into<String>, target_port: u16) -> Self {
        Self::new(namespace, name, TargetType::Pod, target_port)
    }

    /// Target a service.
    pub fn service(
        namespace: impl Into<String>,
        name: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self::new(namespace, name, TargetType::Service, target_port)
    }

    /// Request a specific local port.
    pub fn with_local_port(mut self, local_port: u16) -> Self {
        self.local_port = Some(local_port).filter(|p| *p != 0);
        self
    }

    /// Parses a kubectl-style resource reference (`svc/web`, `pod/api-0`, or a bare pod name).
    pub fn parse_resource(namespace: &str, resource: &str, target_port: u16) -> Result<Self> {
        let (target_type, name) = match resource.split_once('/') {
            Some((kind, name)) => (kind.parse::<TargetType>()?, name),
            None => (TargetType::Pod, resource),
        };

        let target = Self::new(namespace, name, target_type, target_port);
        target.validate()?;
        Ok(target)
    }

    /// Checks the target is well formed before any cluster call is made.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(Error::InvalidTarget("namespace must not be empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(Error::InvalidTarget("name must not be empty".to_string()));
        }
        if self.target_port == 0 {
            return Err(Error::InvalidTarget("target port must be non-zero".to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.namespace,
            self.target_type.resource_prefix(),
            self.name,
            self.target_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resource() {
        let svc = TunnelTarget::parse_resource("default", "svc/web", 80).unwrap();
        assert_eq!(svc.target_type, TargetType::Service);
        assert_eq!(svc.name, "web");

        let pod = TunnelTarget::parse_resource("apps", "api-0", 8080).unwrap();
        assert_eq!(pod.target_type, TargetType::Pod);
        assert_eq!(pod.namespace, "apps");

        assert!(TunnelTarget::parse_resource("default", "deploy/web", 80).is_err());
        assert!(TunnelTarget::parse_resource("default", "svc/", 80).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(TunnelTarget::pod("default", "api", 80).validate().is_ok());
        assert!(TunnelTarget::pod("", "api", 80).validate().is_err());
        assert!(TunnelTarget::pod("default", "api", 0).validate().is_err());
    }

    #[test]
    fn test_zero_local_port_means_any() {
        let target = TunnelTarget::service("default", "web", 80).with_local_port(0);
        assert_eq!(target.local_port, None);
    }

    #[test]
    fn test_serialization_shape() {
        let target = TunnelTarget::service("default", "web", 80).with_local_port(8080);
        let json = serde_json::to_value(&target).unwrap();
        assert_eq!(json["target_type"], "service");
        assert_eq!(json["local_port"], 8080);
        assert_eq!(target.to_string(), "default/svc/web:80");
    }
}
