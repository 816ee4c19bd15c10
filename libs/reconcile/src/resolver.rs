//! Route resolution: which host and published port a service is reached on.

use expose_cluster::{ExposeLabels, LabelError, PortSelector, PublishedPort, Service};
use thiserror::Error;
use tracing::warn;

use crate::topology::TopologySnapshot;

/// Why a service could not be resolved to a route.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The orchestrator reports no endpoint ports at all.
    #[error("no endpoint ports present")]
    NoEndpointPorts,

    /// The endpoint port list is empty.
    #[error("service does not publish any port")]
    NoPublishedPorts,

    /// `expose.port` names a target port the service does not publish.
    #[error("service does not publish target port {selector}")]
    UnmatchedPortSelector { selector: u16 },

    /// `expose.port` is not a port number.
    #[error("invalid port selector {value:?}")]
    InvalidPortSelector { value: String },
}

impl From<LabelError> for ResolveError {
    fn from(e: LabelError) -> Self {
        match e {
            LabelError::InvalidPort { value } => Self::InvalidPortSelector { value },
        }
    }
}

/// Externally visible host and port of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub host: String,
    pub port: u16,
}

/// Everything one pass needs to write a service's routing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub service: String,
    pub host: String,
    pub port: u16,

    /// Backend node addresses, in snapshot order.
    pub backends: Vec<String>,
}

impl RoutingDecision {
    pub fn new(service: &str, target: RouteTarget, snapshot: &TopologySnapshot) -> Self {
        Self {
            service: service.to_string(),
            host: target.host,
            port: target.port,
            backends: snapshot.addresses().to_vec(),
        }
    }
}

/// Derives [`RouteTarget`]s from service configuration.
#[derive(Debug, Clone)]
pub struct RouteResolver {
    default_domain: String,
}

impl RouteResolver {
    pub fn new(default_domain: impl Into<String>) -> Self {
        Self {
            default_domain: default_domain.into(),
        }
    }

    /// Host to match: the `expose.host` override or `<name>.<default domain>`.
    pub fn host_for(&self, service: &Service, labels: &ExposeLabels) -> String {
        match &labels.host {
            Some(host) => host.clone(),
            None => format!("{}.{}", service.name, self.default_domain),
        }
    }

    /// Resolve the route of a service whose labels were already parsed.
    ///
    /// Does not look at `labels.enabled`; gating on it is the caller's job.
    /// Every failure is logged with the service name and cause.
    pub fn resolve(
        &self,
        service: &Service,
        labels: &ExposeLabels,
    ) -> Result<RouteTarget, ResolveError> {
        let result = select_port(service.ports.as_deref(), labels.port.as_ref());

        match result {
            Ok(port) => Ok(RouteTarget {
                host: self.host_for(service, labels),
                port,
            }),
            Err(e) => {
                warn!(service = %service.name, reason = %e, "cannot resolve route");
                Err(e)
            }
        }
    }
}

/// Pick the published port to route to.
///
/// 1. A single published port wins regardless of any selector.
/// 2. Without a selector the first published port is used.
/// 3. Otherwise the first entry whose target port equals the selector.
fn select_port(
    ports: Option<&[PublishedPort]>,
    selector: Option<&PortSelector>,
) -> Result<u16, ResolveError> {
    let ports = ports.ok_or(ResolveError::NoEndpointPorts)?;

    match (ports, selector) {
        ([], _) => Err(ResolveError::NoPublishedPorts),
        ([only], _) => Ok(only.published_port),
        ([first, ..], None) => Ok(first.published_port),
        (ports, Some(selector)) => {
            let selector = selector.port()?;
            ports
                .iter()
                .find(|p| p.target_port == selector)
                .map(|p| p.published_port)
                .ok_or(ResolveError::UnmatchedPortSelector { selector })
        }
    }
}
