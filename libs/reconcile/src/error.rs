//! Reconciliation errors.

use expose_cluster::ClusterError;
use thiserror::Error;

use crate::store::StoreError;

/// I/O failures during a reconciliation pass.
///
/// Resolution failures are not errors; see
/// [`ReconcileOutcome::Unresolvable`](crate::ReconcileOutcome::Unresolvable).
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Reading services or nodes from the orchestrator failed.
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Writing the routing table failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
