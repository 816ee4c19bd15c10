//! Services and nodes as reported by the orchestrator.

use std::collections::BTreeMap;

use crate::labels::ExposeLabels;

/// Readiness of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Eligible to receive traffic.
    Ready,
    /// Down, disconnected or in any other state.
    NotReady,
}

/// A worker node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Orchestrator-assigned node ID.
    pub id: String,

    /// Address other nodes and the proxy reach this node on.
    pub address: String,

    pub state: NodeState,
}

impl Node {
    pub fn new(id: impl Into<String>, address: impl Into<String>, state: NodeState) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            state,
        }
    }

    /// A ready node whose ID equals its address.
    pub fn ready(address: impl Into<String>) -> Self {
        let address = address.into();
        Self::new(address.clone(), address, NodeState::Ready)
    }

    pub fn is_ready(&self) -> bool {
        self.state == NodeState::Ready
    }
}

/// One published endpoint port of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedPort {
    /// Port the service's tasks listen on.
    pub target_port: u16,

    /// Port published on every node of the cluster.
    pub published_port: u16,
}

/// A declaratively specified workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Orchestrator-assigned service ID.
    pub id: String,

    /// Stable service name, also used as the routing identifier.
    pub name: String,

    pub labels: BTreeMap<String, String>,

    /// Published endpoint ports in orchestrator order.
    ///
    /// `None` when the orchestrator reports no endpoint ports at all, as
    /// opposed to an empty list.
    pub ports: Option<Vec<PublishedPort>>,
}

impl Service {
    /// A service without labels or ports whose ID equals its name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            labels: BTreeMap::new(),
            ports: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Append a published port (target port, published port).
    pub fn with_port(mut self, target_port: u16, published_port: u16) -> Self {
        self.ports.get_or_insert_with(Vec::new).push(PublishedPort {
            target_port,
            published_port,
        });
        self
    }

    /// Mark the service as having an empty published-port list.
    pub fn with_no_ports(mut self) -> Self {
        self.ports = Some(Vec::new());
        self
    }

    /// Parse the `expose.*` labels of this service.
    pub fn expose_labels(&self) -> ExposeLabels {
        ExposeLabels::parse(&self.labels)
    }
}
