//! Orchestrator client contract.

use async_trait::async_trait;

use crate::error::ClusterError;
use crate::model::{Node, Service};

/// Read access to the orchestrator's control plane.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Check that the control plane is reachable.
    async fn ping(&self) -> Result<(), ClusterError>;

    /// List every node, ready or not.
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError>;

    /// List every service with its labels and published ports.
    async fn list_services(&self) -> Result<Vec<Service>, ClusterError>;

    /// Fetch one service by ID (or name).
    async fn get_service(&self, id: &str) -> Result<Service, ClusterError>;
}
