//! # expose-cluster
//!
//! Cluster-side vocabulary for the routing synchronizer.
//!
//! ## Contents
//!
//! - Services, nodes and published ports as reported by the orchestrator
//! - The typed `expose.*` label set a service opts into routing with
//! - Cluster events (entity kind, action, actor) consumed by the control loop
//! - The [`ClusterApi`] contract implemented by orchestrator clients
//!
//! Nothing in this crate performs I/O. Concrete clients live in the service
//! binaries; tests use the in-memory fake from `expose-testing`.

mod api;
mod error;
mod event;
mod labels;
mod model;

pub use api::ClusterApi;
pub use error::{ClusterError, LabelError};
pub use event::{ClusterEvent, EventAction, EventKind};
pub use labels::{
    parse_flag, ExposeLabel, ExposeLabels, PortSelector, EXPOSE_HOST_LABEL, EXPOSE_LABEL,
    EXPOSE_PORT_LABEL,
};
pub use model::{Node, NodeState, PublishedPort, Service};
