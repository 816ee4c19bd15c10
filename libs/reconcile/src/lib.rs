//! Routing reconciliation primitives.
//!
//! This library keeps a reverse proxy's key-value routing table in line with
//! the services and ready nodes of a cluster. Key concepts:
//!
//! - **Topology snapshot**: the ready-node addresses captured for one pass.
//! - **Route resolution**: host and published port derived from a service's
//!   labels and endpoint ports.
//! - **Routing entry**: the rule, binding and server keys persisted for one
//!   exposed service.
//!
//! # Invariants
//!
//! - Every store mutation for one service in one pass is a single atomic batch
//! - Reconciling an unchanged service against an unchanged topology writes
//!   the same keys and values
//! - Withdrawing a service removes every key it owns, including server keys
//!   for nodes that have since left

mod engine;
mod error;
mod keys;
mod resolver;
mod store;
mod topology;

pub use engine::{FleetReport, ReconcileOutcome, ReconciliationEngine};
pub use error::ReconcileError;
pub use keys::{server_url, RoutingKeyBuilder, ServerKeyScheme, DEFAULT_KEY_PREFIX};
pub use resolver::{ResolveError, RouteResolver, RouteTarget, RoutingDecision};
pub use store::{Batch, BatchOp, KvStore, MemoryStore, StoreError};
pub use topology::TopologySnapshot;
