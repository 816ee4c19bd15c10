//! Reconciliation engine.
//!
//! The engine turns a service definition plus a [`TopologySnapshot`] into
//! store batches:
//!
//! - `reconcile`: expose (additive write) or withdraw, depending on labels
//! - `withdraw`: delete every key the service owns
//! - `resync`: withdraw then reconcile, as one batch
//!
//! Fleet passes (`reconcile_all`, `resync_all`) capture one snapshot and one
//! listing of stored server keys, and reuse both for every service.
//! `resync_all` also withdraws entries of services that no longer exist.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use expose_cluster::{ClusterApi, ExposeLabels, Service};
use tracing::{debug, error, info};

use crate::error::ReconcileError;
use crate::keys::RoutingKeyBuilder;
use crate::resolver::{ResolveError, RouteResolver, RoutingDecision};
use crate::store::{Batch, KvStore};
use crate::topology::TopologySnapshot;

/// Stored server keys grouped by service name.
type StoredServers = BTreeMap<String, Vec<String>>;

/// Result of one reconciliation pass for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The routing entry was written.
    Exposed {
        decision: RoutingDecision,
        keys_written: usize,
        /// Stale keys deleted in the same batch (resync only).
        keys_removed: usize,
    },

    /// Every key of the service was deleted.
    Withdrawn { keys_removed: usize },

    /// Routing is enabled but the service has no usable port.
    ///
    /// A plain reconcile leaves any existing entry untouched in this case;
    /// a resync has already withdrawn it.
    Unresolvable(ResolveError),
}

/// Totals of a fleet-wide pass.
#[derive(Debug, Default)]
pub struct FleetReport {
    pub exposed: usize,
    pub withdrawn: usize,
    pub unresolvable: usize,

    /// Entries of services the orchestrator no longer lists that were
    /// withdrawn (resync only).
    pub orphans_removed: usize,

    /// Services whose pass failed, with the error.
    pub failed: Vec<(String, ReconcileError)>,
}

impl FleetReport {
    fn record(&mut self, service: &str, result: Result<ReconcileOutcome, ReconcileError>) {
        match result {
            Ok(ReconcileOutcome::Exposed { .. }) => self.exposed += 1,
            Ok(ReconcileOutcome::Withdrawn { .. }) => self.withdrawn += 1,
            Ok(ReconcileOutcome::Unresolvable(_)) => self.unresolvable += 1,
            Err(e) => self.fail(service, e),
        }
    }

    fn fail(&mut self, service: &str, e: ReconcileError) {
        error!(service = %service, error = %e, "reconciliation failed");
        self.failed.push((service.to_string(), e));
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Keeps routing entries in the store in line with services and topology.
pub struct ReconciliationEngine<C: ?Sized, S: ?Sized> {
    cluster: Arc<C>,
    store: Arc<S>,
    resolver: RouteResolver,
    keys: RoutingKeyBuilder,
}

impl<C, S> ReconciliationEngine<C, S>
where
    C: ClusterApi + ?Sized,
    S: KvStore + ?Sized,
{
    pub fn new(
        cluster: Arc<C>,
        store: Arc<S>,
        resolver: RouteResolver,
        keys: RoutingKeyBuilder,
    ) -> Self {
        Self {
            cluster,
            store,
            resolver,
            keys,
        }
    }

    pub fn cluster(&self) -> &Arc<C> {
        &self.cluster
    }

    /// Expose or withdraw `service` according to its labels.
    ///
    /// The write is additive: server keys for nodes missing from the current
    /// snapshot are not removed. Use [`resync_service`](Self::resync_service)
    /// after topology changes.
    pub async fn reconcile_service(
        &self,
        service: &Service,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let snapshot = self.snapshot().await?;
        self.reconcile_with(service, &snapshot, None).await
    }

    /// Delete every routing key of the service named `name`.
    pub async fn withdraw_service(&self, name: &str) -> Result<ReconcileOutcome, ReconcileError> {
        let snapshot = self.snapshot().await?;
        self.withdraw_with(name, &snapshot, None).await
    }

    /// Withdraw then reconcile `service` in a single batch.
    pub async fn resync_service(
        &self,
        service: &Service,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let snapshot = self.snapshot().await?;
        self.resync_with(service, &snapshot, None).await
    }

    /// Reconcile every known service against one snapshot.
    pub async fn reconcile_all(&self) -> Result<FleetReport, ReconcileError> {
        let services = self.cluster.list_services().await?;
        let snapshot = self.snapshot().await?;
        let stored = self.stored_servers().await?;
        debug!(services = services.len(), nodes = snapshot.len(), "reconciling all services");

        let mut report = FleetReport::default();
        for service in &services {
            let owned = stored_for(&stored, &service.name);
            let result = self.reconcile_with(service, &snapshot, Some(owned)).await;
            report.record(&service.name, result);
        }
        Ok(report)
    }

    /// Withdraw and reconcile every known service against one snapshot, then
    /// withdraw the entries of services that no longer exist.
    pub async fn resync_all(&self) -> Result<FleetReport, ReconcileError> {
        let services = self.cluster.list_services().await?;
        let snapshot = self.snapshot().await?;
        let stored = self.stored_servers().await?;
        debug!(services = services.len(), nodes = snapshot.len(), "resyncing all services");

        let mut report = FleetReport::default();
        for service in &services {
            let owned = stored_for(&stored, &service.name);
            let result = self.resync_with(service, &snapshot, Some(owned)).await;
            report.record(&service.name, result);
        }

        let known: BTreeSet<&str> = services.iter().map(|s| s.name.as_str()).collect();
        for name in self.orphaned_entries(&known).await? {
            info!(service = %name, "withdrawing entry of removed service");
            let owned = stored_for(&stored, &name);
            match self.withdraw_with(&name, &snapshot, Some(owned)).await {
                Ok(_) => report.orphans_removed += 1,
                Err(e) => report.fail(&name, e),
            }
        }
        Ok(report)
    }

    /// Capture the current ready nodes.
    async fn snapshot(&self) -> Result<TopologySnapshot, ReconcileError> {
        let nodes = self.cluster.list_nodes().await?;
        Ok(TopologySnapshot::from_nodes(&nodes))
    }

    /// `stored` holds the service's stored server keys when the caller has
    /// already listed them; `None` lists them now.
    async fn reconcile_with(
        &self,
        service: &Service,
        snapshot: &TopologySnapshot,
        stored: Option<&[String]>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let labels = service.expose_labels();
        if !labels.enabled {
            return self.withdraw_with(&service.name, snapshot, stored).await;
        }

        let decision = match self.decide(service, &labels, snapshot) {
            Ok(decision) => decision,
            Err(e) => return Ok(ReconcileOutcome::Unresolvable(e)),
        };

        let mut batch = Batch::new();
        for (key, value) in self.keys.entry(&decision) {
            batch.set(key, value);
        }
        let keys_written = batch.len();
        self.store.apply(batch).await?;

        log_exposed(&decision, 0);
        Ok(ReconcileOutcome::Exposed {
            decision,
            keys_written,
            keys_removed: 0,
        })
    }

    async fn withdraw_with(
        &self,
        name: &str,
        snapshot: &TopologySnapshot,
        stored: Option<&[String]>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let keys = self.owned_keys(name, snapshot, stored).await?;

        let mut batch = Batch::new();
        for key in &keys {
            batch.delete(key.as_str());
        }
        self.store.apply(batch).await?;

        info!(service = %name, keys_removed = keys.len(), "service withdrawn");
        Ok(ReconcileOutcome::Withdrawn {
            keys_removed: keys.len(),
        })
    }

    async fn resync_with(
        &self,
        service: &Service,
        snapshot: &TopologySnapshot,
        stored: Option<&[String]>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let labels = service.expose_labels();
        let decision = if labels.enabled {
            match self.decide(service, &labels, snapshot) {
                Ok(decision) => Some(decision),
                Err(e) => {
                    self.withdraw_with(&service.name, snapshot, stored).await?;
                    return Ok(ReconcileOutcome::Unresolvable(e));
                }
            }
        } else {
            None
        };

        let Some(decision) = decision else {
            return self.withdraw_with(&service.name, snapshot, stored).await;
        };

        let entry = self.keys.entry(&decision);
        let fresh: BTreeSet<&str> = entry.iter().map(|(k, _)| k.as_str()).collect();
        let stale: Vec<String> = self
            .owned_keys(&service.name, snapshot, stored)
            .await?
            .into_iter()
            .filter(|k| !fresh.contains(k.as_str()))
            .collect();

        let mut batch = Batch::new();
        for key in &stale {
            batch.delete(key.as_str());
        }
        for (key, value) in &entry {
            batch.set(key.as_str(), value.as_str());
        }
        self.store.apply(batch).await?;

        log_exposed(&decision, stale.len());
        Ok(ReconcileOutcome::Exposed {
            decision,
            keys_written: entry.len(),
            keys_removed: stale.len(),
        })
    }

    fn decide(
        &self,
        service: &Service,
        labels: &ExposeLabels,
        snapshot: &TopologySnapshot,
    ) -> Result<RoutingDecision, ResolveError> {
        let target = self.resolver.resolve(service, labels)?;
        Ok(RoutingDecision::new(&service.name, target, snapshot))
    }

    /// Keys a withdraw must delete: the entry for the current snapshot plus
    /// every server key the store holds for the service.
    async fn owned_keys(
        &self,
        name: &str,
        snapshot: &TopologySnapshot,
        stored: Option<&[String]>,
    ) -> Result<Vec<String>, ReconcileError> {
        let mut keys = self.keys.managed_keys(name, snapshot);
        let listed;
        let stored = match stored {
            Some(stored) => stored,
            None => {
                listed = self
                    .store
                    .keys_with_prefix(&self.keys.servers_prefix(name))
                    .await?;
                listed.as_slice()
            }
        };

        for key in stored {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        Ok(keys)
    }

    /// Every stored server key, grouped by the service it belongs to.
    async fn stored_servers(&self) -> Result<StoredServers, ReconcileError> {
        let mut grouped = StoredServers::new();
        for key in self.store.keys_with_prefix(&self.keys.services_root()).await? {
            if let Some(owner) = self.keys.server_owner(&key) {
                let owner = owner.to_string();
                grouped.entry(owner).or_default().push(key);
            }
        }
        Ok(grouped)
    }

    /// Names of stored routing entries that belong to no service in `known`.
    ///
    /// Only routers bound to a load-balancer service of their own name are
    /// considered, since that is the only shape of entry this engine writes.
    async fn orphaned_entries(
        &self,
        known: &BTreeSet<&str>,
    ) -> Result<Vec<String>, ReconcileError> {
        let mut orphans = Vec::new();
        for key in self.store.keys_with_prefix(&self.keys.routers_root()).await? {
            let Some(name) = self.keys.binding_owner(&key) else {
                continue;
            };
            if known.contains(name) {
                continue;
            }
            if self.store.get(&key).await?.as_deref() == Some(name) {
                orphans.push(name.to_string());
            } else {
                debug!(router = %name, "leaving foreign router untouched");
            }
        }
        Ok(orphans)
    }
}

fn stored_for<'a>(stored: &'a StoredServers, name: &str) -> &'a [String] {
    stored.get(name).map(Vec::as_slice).unwrap_or_default()
}

fn log_exposed(decision: &RoutingDecision, keys_removed: usize) {
    info!(
        service = %decision.service,
        host = %decision.host,
        port = decision.port,
        backends = decision.backends.len(),
        keys_removed,
        "service exposed"
    );
}
