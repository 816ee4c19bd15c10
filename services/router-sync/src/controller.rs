//! Event-driven control loop.
//!
//! Events are handled strictly one at a time, in arrival order:
//!
//! | event                   | action                             |
//! |-------------------------|------------------------------------|
//! | service create / update | fetch the service, reconcile it    |
//! | service remove          | withdraw it by the event's name    |
//! | node create             | reconcile every service            |
//! | node update / remove    | resync every service               |
//! | anything else           | ignored                            |
//!
//! A failed event is logged and the loop moves on; only the end of the
//! event stream stops it.

use anyhow::{bail, Result};
use expose_cluster::{ClusterApi, ClusterError, ClusterEvent, EventAction, EventKind};
use expose_reconcile::{FleetReport, KvStore, ReconcileError, ReconcileOutcome, ReconciliationEngine};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What handling one event did.
#[derive(Debug)]
pub enum Dispatch {
    Service(ReconcileOutcome),
    Fleet(FleetReport),
    Ignored,
}

pub struct Controller<C: ?Sized, S: ?Sized> {
    engine: ReconciliationEngine<C, S>,
}

impl<C, S> Controller<C, S>
where
    C: ClusterApi + ?Sized,
    S: KvStore + ?Sized,
{
    pub fn new(engine: ReconciliationEngine<C, S>) -> Self {
        Self { engine }
    }

    /// Baseline pass: resync every known service regardless of what the
    /// store currently holds.
    pub async fn startup(&self) -> Result<FleetReport> {
        let report = self.engine.resync_all().await?;
        if let Some((service, e)) = report.failed.first() {
            bail!(
                "baseline resync failed for {} service(s), first: {service}: {e}",
                report.failed.len()
            );
        }

        info!(
            exposed = report.exposed,
            withdrawn = report.withdrawn,
            unresolvable = report.unresolvable,
            orphans_removed = report.orphans_removed,
            "baseline resync complete"
        );
        Ok(report)
    }

    /// Handle one cluster event.
    pub async fn handle(&self, event: &ClusterEvent) -> Result<Dispatch, ReconcileError> {
        match (&event.kind, &event.action) {
            (EventKind::Service, EventAction::Create | EventAction::Update) => {
                let service = match self.engine.cluster().get_service(&event.actor_id).await {
                    Ok(service) => service,
                    Err(ClusterError::NotFound(_)) => {
                        warn!(service_id = %event.actor_id, "service vanished before it could be read");
                        return Ok(Dispatch::Ignored);
                    }
                    Err(e) => return Err(e.into()),
                };
                let outcome = self.engine.reconcile_service(&service).await?;
                Ok(Dispatch::Service(outcome))
            }
            (EventKind::Service, EventAction::Remove) => {
                let Some(name) = event.actor_name.as_deref() else {
                    warn!(service_id = %event.actor_id, "service remove event carries no name");
                    return Ok(Dispatch::Ignored);
                };
                let outcome = self.engine.withdraw_service(name).await?;
                Ok(Dispatch::Service(outcome))
            }
            (EventKind::Node, EventAction::Create) => {
                Ok(Dispatch::Fleet(self.engine.reconcile_all().await?))
            }
            (EventKind::Node, EventAction::Update | EventAction::Remove) => {
                Ok(Dispatch::Fleet(self.engine.resync_all().await?))
            }
            _ => Ok(Dispatch::Ignored),
        }
    }

    /// Consume events until the channel closes.
    ///
    /// Always returns an error: a closed stream means the process must be
    /// restarted to get a fresh baseline.
    pub async fn run(&self, mut events: mpsc::Receiver<ClusterEvent>) -> Result<()> {
        info!("control loop started");

        while let Some(event) = events.recv().await {
            debug!(event = %event, "handling event");
            match self.handle(&event).await {
                Ok(Dispatch::Fleet(report)) if !report.is_success() => {
                    error!(
                        event = %event,
                        failed = report.failed.len(),
                        "fleet pass finished with failures"
                    );
                }
                Ok(Dispatch::Ignored) => debug!(event = %event, "event ignored"),
                Ok(_) => {}
                Err(e) => error!(event = %event, error = %e, "failed to handle event"),
            }
        }

        bail!("cluster event stream ended")
    }
}
