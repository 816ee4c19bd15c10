//! Test doubles for the routing synchronizer.
//!
//! [`MemoryCluster`] implements [`ClusterApi`] over a mutable in-memory
//! list of nodes and services, so engine and control-loop tests can change
//! topology between passes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use expose_cluster::{ClusterApi, ClusterError, Node, NodeState, Service};

#[derive(Debug, Default)]
struct ClusterState {
    nodes: Vec<Node>,
    services: Vec<Service>,
    unavailable: bool,
}

/// In-memory orchestrator.
#[derive(Debug, Default)]
pub struct MemoryCluster {
    state: Mutex<ClusterState>,
    service_fetches: AtomicUsize,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes<I>(nodes: I) -> Self
    where
        I: IntoIterator<Item = Node>,
    {
        let cluster = Self::new();
        cluster.state.lock().unwrap().nodes.extend(nodes);
        cluster
    }

    /// Add a node, or replace the node with the same ID.
    pub fn add_node(&self, node: Node) {
        let mut state = self.state.lock().unwrap();
        match state.nodes.iter_mut().find(|n| n.id == node.id) {
            Some(existing) => *existing = node,
            None => state.nodes.push(node),
        }
    }

    pub fn remove_node(&self, id: &str) {
        self.state.lock().unwrap().nodes.retain(|n| n.id != id);
    }

    pub fn set_node_state(&self, id: &str, node_state: NodeState) {
        let mut state = self.state.lock().unwrap();
        if let Some(node) = state.nodes.iter_mut().find(|n| n.id == id) {
            node.state = node_state;
        }
    }

    /// Add a service, or replace the service with the same ID.
    pub fn upsert_service(&self, service: Service) {
        let mut state = self.state.lock().unwrap();
        match state.services.iter_mut().find(|s| s.id == service.id) {
            Some(existing) => *existing = service,
            None => state.services.push(service),
        }
    }

    pub fn remove_service(&self, id: &str) -> Option<Service> {
        let mut state = self.state.lock().unwrap();
        let index = state.services.iter().position(|s| s.id == id)?;
        Some(state.services.remove(index))
    }

    /// Make every call fail with a transport error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    /// Number of `get_service` calls so far.
    pub fn service_fetches(&self) -> usize {
        self.service_fetches.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), ClusterError> {
        if self.state.lock().unwrap().unavailable {
            return Err(ClusterError::Transport("memory cluster unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn ping(&self) -> Result<(), ClusterError> {
        self.check()
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        self.check()?;
        Ok(self.state.lock().unwrap().nodes.clone())
    }

    async fn list_services(&self) -> Result<Vec<Service>, ClusterError> {
        self.check()?;
        Ok(self.state.lock().unwrap().services.clone())
    }

    async fn get_service(&self, id: &str) -> Result<Service, ClusterError> {
        self.check()?;
        self.service_fetches.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .unwrap()
            .services
            .iter()
            .find(|s| s.id == id || s.name == id)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("service {id}")))
    }
}
