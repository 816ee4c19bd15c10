//! Control loop tests against in-memory cluster and store fakes.

use std::sync::Arc;

use async_trait::async_trait;
use expose_cluster::{
    ClusterApi, ClusterError, ClusterEvent, EventAction, EventKind, Node, NodeState, Service,
};
use expose_reconcile::{
    MemoryStore, ReconcileOutcome, ReconciliationEngine, RouteResolver, RoutingKeyBuilder,
    ServerKeyScheme,
};
use expose_router_sync::{Controller, Dispatch};
use expose_testing::MemoryCluster;
use rstest::rstest;
use tokio::sync::mpsc;

const API_SERVERS: &str = "traefik/http/services/api/loadbalancer/servers/";
const API_RULE: &str = "traefik/http/routers/api/rule";
const API_BINDING: &str = "traefik/http/routers/api/service";

fn exposed(name: &str) -> Service {
    Service::new(name)
        .with_label("expose", "true")
        .with_port(80, 30001)
}

fn controller(
    cluster: &Arc<MemoryCluster>,
    store: &Arc<MemoryStore>,
    scheme: ServerKeyScheme,
) -> Controller<MemoryCluster, MemoryStore> {
    Controller::new(ReconciliationEngine::new(
        Arc::clone(cluster),
        Arc::clone(store),
        RouteResolver::new("example.com"),
        RoutingKeyBuilder::new("traefik", scheme),
    ))
}

fn cluster(addresses: &[&str]) -> Arc<MemoryCluster> {
    Arc::new(MemoryCluster::with_nodes(
        addresses.iter().map(|a| Node::ready(*a)),
    ))
}

/// Feed `events` through a closed channel and run the loop to completion.
async fn run_events<C, S>(controller: &Controller<C, S>, events: Vec<ClusterEvent>)
where
    C: ClusterApi + ?Sized,
    S: expose_reconcile::KvStore + ?Sized,
{
    let (tx, rx) = mpsc::channel(events.len().max(1));
    for event in events {
        tx.send(event).await.unwrap();
    }
    drop(tx);

    let err = controller.run(rx).await.unwrap_err();
    assert_eq!(err.to_string(), "cluster event stream ended");
}

#[tokio::test]
async fn test_startup_establishes_baseline_over_stale_store() {
    let cluster = cluster(&["10.0.0.1", "10.0.0.2"]);
    cluster.upsert_service(exposed("api"));
    cluster.upsert_service(Service::new("worker").with_port(9000, 31000));

    let store = Arc::new(MemoryStore::with_entries([
        (format!("{API_SERVERS}10.0.0.9/url"), "http://10.0.0.9:30001".to_string()),
        (
            "traefik/http/routers/worker/rule".to_string(),
            "Host(`worker.example.com`)".to_string(),
        ),
    ]));
    let controller = controller(&cluster, &store, ServerKeyScheme::Address);

    let report = controller.startup().await.unwrap();
    assert_eq!(report.exposed, 1);
    assert_eq!(report.withdrawn, 1);

    let servers = store.entries_with_prefix(API_SERVERS);
    assert_eq!(servers.len(), 2);
    assert!(!servers.contains_key(&format!("{API_SERVERS}10.0.0.9/url")));
    assert_eq!(store.get("traefik/http/routers/worker/rule"), None);
    assert_eq!(store.len(), 4);
}

#[tokio::test]
async fn test_startup_fails_when_store_rejects_writes() {
    let cluster = cluster(&["10.0.0.1"]);
    cluster.upsert_service(exposed("api"));
    let store = Arc::new(MemoryStore::failing());

    let err = controller(&cluster, &store, ServerKeyScheme::Address)
        .startup()
        .await
        .unwrap_err();
    assert!(err.to_string().contains("api"));
}

#[tokio::test]
async fn test_startup_fails_when_cluster_unreachable() {
    let cluster = cluster(&["10.0.0.1"]);
    cluster.set_unavailable(true);
    let store = Arc::new(MemoryStore::new());

    assert!(controller(&cluster, &store, ServerKeyScheme::Address)
        .startup()
        .await
        .is_err());
}

#[tokio::test]
async fn test_service_create_fetches_and_exposes() {
    let cluster = cluster(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    cluster.upsert_service(exposed("api").with_id("svc-api"));
    let store = Arc::new(MemoryStore::new());
    let controller = controller(&cluster, &store, ServerKeyScheme::Ordinal);

    let dispatch = controller
        .handle(&ClusterEvent::service(EventAction::Create, "svc-api", "api"))
        .await
        .unwrap();

    assert!(matches!(
        dispatch,
        Dispatch::Service(ReconcileOutcome::Exposed { keys_written: 5, .. })
    ));
    assert_eq!(cluster.service_fetches(), 1);
    assert_eq!(store.get(API_RULE).as_deref(), Some("Host(`api.example.com`)"));
    assert_eq!(store.get(API_BINDING).as_deref(), Some("api"));
    for (ordinal, address) in ["10.0.0.1", "10.0.0.2", "10.0.0.3"].iter().enumerate() {
        assert_eq!(
            store.get(&format!("{API_SERVERS}{ordinal}/url")),
            Some(format!("http://{address}:30001"))
        );
    }
}

#[tokio::test]
async fn test_service_update_disabling_expose_withdraws() {
    let cluster = cluster(&["10.0.0.1", "10.0.0.2"]);
    cluster.upsert_service(exposed("api"));
    let store = Arc::new(MemoryStore::new());
    let controller = controller(&cluster, &store, ServerKeyScheme::Address);
    controller.startup().await.unwrap();
    assert_eq!(store.len(), 4);

    cluster.upsert_service(exposed("api").with_label("expose", "false"));
    let dispatch = controller
        .handle(&ClusterEvent::service(EventAction::Update, "api", "api"))
        .await
        .unwrap();

    assert!(matches!(
        dispatch,
        Dispatch::Service(ReconcileOutcome::Withdrawn { keys_removed: 4 })
    ));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_service_update_with_unmatched_selector_keeps_entry() {
    let cluster = cluster(&["10.0.0.1"]);
    cluster.upsert_service(exposed("api").with_port(443, 30002));
    let store = Arc::new(MemoryStore::new());
    let controller = controller(&cluster, &store, ServerKeyScheme::Address);
    controller.startup().await.unwrap();
    let before = store.entries();

    cluster.upsert_service(
        exposed("api")
            .with_port(443, 30002)
            .with_label("expose.port", "8080"),
    );
    let dispatch = controller
        .handle(&ClusterEvent::service(EventAction::Update, "api", "api"))
        .await
        .unwrap();

    assert!(matches!(
        dispatch,
        Dispatch::Service(ReconcileOutcome::Unresolvable(_))
    ));
    assert_eq!(store.entries(), before);
}

#[tokio::test]
async fn test_service_update_for_vanished_service_is_ignored() {
    let cluster = cluster(&["10.0.0.1"]);
    let store = Arc::new(MemoryStore::new());
    let controller = controller(&cluster, &store, ServerKeyScheme::Address);

    let dispatch = controller
        .handle(&ClusterEvent::service(EventAction::Update, "gone", "gone"))
        .await
        .unwrap();

    assert!(matches!(dispatch, Dispatch::Ignored));
    assert_eq!(store.batches_applied(), 0);
}

#[tokio::test]
async fn test_service_remove_withdraws_by_event_name() {
    let cluster = cluster(&["10.0.0.1", "10.0.0.2"]);
    cluster.upsert_service(exposed("api").with_id("svc-api"));
    let store = Arc::new(MemoryStore::new());
    let controller = controller(&cluster, &store, ServerKeyScheme::Address);
    controller.startup().await.unwrap();

    cluster.remove_service("svc-api");
    let dispatch = controller
        .handle(&ClusterEvent::service(EventAction::Remove, "svc-api", "api"))
        .await
        .unwrap();

    assert!(matches!(
        dispatch,
        Dispatch::Service(ReconcileOutcome::Withdrawn { keys_removed: 4 })
    ));
    assert!(store.is_empty());
    assert_eq!(cluster.service_fetches(), 0);
}

#[tokio::test]
async fn test_service_remove_without_name_is_ignored() {
    let cluster = cluster(&["10.0.0.1"]);
    cluster.upsert_service(exposed("api"));
    let store = Arc::new(MemoryStore::new());
    let controller = controller(&cluster, &store, ServerKeyScheme::Address);
    controller.startup().await.unwrap();
    let before = store.entries();

    let event = ClusterEvent {
        kind: EventKind::Service,
        action: EventAction::Remove,
        actor_id: "api".to_string(),
        actor_name: None,
    };
    assert!(matches!(controller.handle(&event).await.unwrap(), Dispatch::Ignored));
    assert_eq!(store.entries(), before);
}

#[tokio::test]
async fn test_node_join_reconciles_every_service() {
    let cluster = cluster(&["10.0.0.1"]);
    cluster.upsert_service(exposed("api"));
    cluster.upsert_service(exposed("shop").with_label("expose.host", "shop.example.org"));
    let store = Arc::new(MemoryStore::new());
    let controller = controller(&cluster, &store, ServerKeyScheme::Ordinal);
    controller.startup().await.unwrap();

    cluster.add_node(Node::ready("10.0.0.2"));
    let dispatch = controller
        .handle(&ClusterEvent::node(EventAction::Create, "10.0.0.2"))
        .await
        .unwrap();

    let Dispatch::Fleet(report) = dispatch else {
        panic!("expected a fleet pass");
    };
    assert_eq!(report.exposed, 2);
    assert!(report.is_success());
    assert_eq!(store.entries_with_prefix(API_SERVERS).len(), 2);
    assert_eq!(
        store.get("traefik/http/services/shop/loadbalancer/servers/1/url").as_deref(),
        Some("http://10.0.0.2:30001")
    );
    assert_eq!(
        store.get("traefik/http/routers/shop/rule").as_deref(),
        Some("Host(`shop.example.org`)")
    );
}

#[rstest]
#[case::ordinal(ServerKeyScheme::Ordinal)]
#[case::address(ServerKeyScheme::Address)]
#[tokio::test]
async fn test_node_loss_leaves_no_orphaned_server_keys(#[case] scheme: ServerKeyScheme) {
    let cluster = cluster(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    cluster.upsert_service(exposed("api"));
    let store = Arc::new(MemoryStore::new());
    let controller = controller(&cluster, &store, scheme);
    controller.startup().await.unwrap();
    assert_eq!(store.entries_with_prefix(API_SERVERS).len(), 3);

    cluster.set_node_state("10.0.0.1", NodeState::NotReady);
    controller
        .handle(&ClusterEvent::node(EventAction::Update, "10.0.0.1"))
        .await
        .unwrap();

    let servers = store.entries_with_prefix(API_SERVERS);
    assert_eq!(servers.len(), 2);
    let mut urls: Vec<&str> = servers.values().map(String::as_str).collect();
    urls.sort_unstable();
    assert_eq!(urls, vec!["http://10.0.0.2:30001", "http://10.0.0.3:30001"]);

    cluster.remove_node("10.0.0.2");
    controller
        .handle(&ClusterEvent::node(EventAction::Remove, "10.0.0.2"))
        .await
        .unwrap();

    let servers = store.entries_with_prefix(API_SERVERS);
    assert_eq!(servers.len(), 1);
    assert_eq!(
        servers.values().next().map(String::as_str),
        Some("http://10.0.0.3:30001")
    );
    assert_eq!(store.len(), 3);
}

#[rstest]
#[case::container(EventKind::Other("container".into()), EventAction::Create)]
#[case::network(EventKind::Other("network".into()), EventAction::Remove)]
#[case::service_other(EventKind::Service, EventAction::Other("rollback".into()))]
#[case::node_other(EventKind::Node, EventAction::Other("promote".into()))]
#[tokio::test]
async fn test_unrecognized_events_are_ignored(
    #[case] kind: EventKind,
    #[case] action: EventAction,
) {
    let cluster = cluster(&["10.0.0.1"]);
    cluster.upsert_service(exposed("api"));
    let store = Arc::new(MemoryStore::new());
    let controller = controller(&cluster, &store, ServerKeyScheme::Address);

    let event = ClusterEvent {
        kind,
        action,
        actor_id: "x".to_string(),
        actor_name: Some("api".to_string()),
    };
    assert!(matches!(controller.handle(&event).await.unwrap(), Dispatch::Ignored));
    assert_eq!(store.batches_applied(), 0);
    assert_eq!(cluster.service_fetches(), 0);
}

#[tokio::test]
async fn test_run_processes_events_in_order() {
    let cluster = cluster(&["10.0.0.1"]);
    cluster.upsert_service(exposed("api"));
    let store = Arc::new(MemoryStore::new());
    let controller = controller(&cluster, &store, ServerKeyScheme::Address);

    // Create then remove: the final state must reflect the removal.
    run_events(
        &controller,
        vec![
            ClusterEvent::service(EventAction::Create, "api", "api"),
            ClusterEvent::service(EventAction::Remove, "api", "api"),
        ],
    )
    .await;
    assert!(store.is_empty());
    assert_eq!(store.batches_applied(), 2);

    run_events(
        &controller,
        vec![
            ClusterEvent::service(EventAction::Remove, "api", "api"),
            ClusterEvent::service(EventAction::Create, "api", "api"),
        ],
    )
    .await;
    assert_eq!(store.len(), 3);
}

/// Cluster whose service lookups fail for one identifier.
struct FlakyCluster {
    inner: MemoryCluster,
    broken_id: String,
}

#[async_trait]
impl ClusterApi for FlakyCluster {
    async fn ping(&self) -> Result<(), ClusterError> {
        self.inner.ping().await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        self.inner.list_nodes().await
    }

    async fn list_services(&self) -> Result<Vec<Service>, ClusterError> {
        self.inner.list_services().await
    }

    async fn get_service(&self, id: &str) -> Result<Service, ClusterError> {
        if id == self.broken_id {
            return Err(ClusterError::Transport("connection reset by peer".into()));
        }
        self.inner.get_service(id).await
    }
}

#[tokio::test]
async fn test_run_continues_after_failed_event() {
    let inner = MemoryCluster::with_nodes([Node::ready("10.0.0.1")]);
    inner.upsert_service(exposed("broken"));
    inner.upsert_service(exposed("api"));
    let cluster = Arc::new(FlakyCluster {
        inner,
        broken_id: "broken".to_string(),
    });
    let store = Arc::new(MemoryStore::new());
    let controller = Controller::new(ReconciliationEngine::new(
        Arc::clone(&cluster),
        Arc::clone(&store),
        RouteResolver::new("example.com"),
        RoutingKeyBuilder::new("traefik", ServerKeyScheme::Address),
    ));

    assert!(controller
        .handle(&ClusterEvent::service(EventAction::Update, "broken", "broken"))
        .await
        .is_err());

    run_events(
        &controller,
        vec![
            ClusterEvent::service(EventAction::Update, "broken", "broken"),
            ClusterEvent::service(EventAction::Update, "api", "api"),
        ],
    )
    .await;

    assert_eq!(store.get(API_BINDING).as_deref(), Some("api"));
    assert_eq!(store.get("traefik/http/routers/broken/rule"), None);
}

#[tokio::test]
async fn test_repeated_events_are_idempotent() {
    let cluster = cluster(&["10.0.0.1", "10.0.0.2"]);
    cluster.upsert_service(exposed("api"));
    let store = Arc::new(MemoryStore::new());
    let controller = controller(&cluster, &store, ServerKeyScheme::Address);

    let update = ClusterEvent::service(EventAction::Update, "api", "api");
    controller.handle(&update).await.unwrap();
    let first = store.entries();
    controller.handle(&update).await.unwrap();
    controller
        .handle(&ClusterEvent::node(EventAction::Update, "10.0.0.1"))
        .await
        .unwrap();

    assert_eq!(store.entries(), first);
}

#[tokio::test]
async fn test_restart_withdraws_service_removed_while_down() {
    let cluster = cluster(&["10.0.0.1"]);
    cluster.upsert_service(exposed("api"));
    cluster.upsert_service(exposed("web"));
    let store = Arc::new(MemoryStore::new());
    controller(&cluster, &store, ServerKeyScheme::Address)
        .startup()
        .await
        .unwrap();
    assert_eq!(store.len(), 6);

    // The remove event is never delivered; a new process starts afterwards.
    cluster.remove_service("web");
    let report = controller(&cluster, &store, ServerKeyScheme::Address)
        .startup()
        .await
        .unwrap();

    assert_eq!(report.orphans_removed, 1);
    let keys: Vec<String> = store.entries().into_keys().collect();
    assert_eq!(
        keys,
        vec![
            API_RULE.to_string(),
            API_BINDING.to_string(),
            format!("{API_SERVERS}10.0.0.1/url"),
        ]
    );
}

#[tokio::test]
async fn test_ready_node_without_address_gets_no_server_key() {
    let cluster = cluster(&["10.0.0.1"]);
    cluster.add_node(Node::new("mgr", "", NodeState::Ready));
    cluster.add_node(Node::new("wrk", "0.0.0.0", NodeState::Ready));
    cluster.upsert_service(exposed("api"));
    let store = Arc::new(MemoryStore::new());

    controller(&cluster, &store, ServerKeyScheme::Address)
        .startup()
        .await
        .unwrap();

    let servers = store.entries_with_prefix(API_SERVERS);
    assert_eq!(servers.len(), 1);
    assert_eq!(
        servers.get(&format!("{API_SERVERS}10.0.0.1/url")).map(String::as_str),
        Some("http://10.0.0.1:30001")
    );
}
