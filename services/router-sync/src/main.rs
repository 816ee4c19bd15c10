use std::sync::Arc;

use anyhow::{Context, Result};
use expose_cluster::ClusterApi;
use expose_reconcile::{ReconciliationEngine, RouteResolver, RoutingKeyBuilder};
use expose_router_sync::{
    spawn_event_pump, Config, Controller, DockerClient, RedisStore, EVENT_CHANNEL_CAPACITY,
};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting router sync");
    info!(
        default_domain = %config.default_domain,
        store_url = %config.store_url,
        docker_socket = %config.docker_socket,
        key_prefix = %config.key_prefix,
        server_key_scheme = %config.server_key_scheme,
        "Configuration loaded"
    );

    let docker = Arc::new(DockerClient::new(&config.docker_socket));
    docker
        .ping()
        .await
        .with_context(|| format!("Docker Engine unreachable at {}", docker.socket_path()))?;

    let store = Arc::new(
        RedisStore::connect(config.store_url.clone())
            .await
            .with_context(|| format!("Redis unreachable at {}", config.store_url))?,
    );
    info!(
        docker_socket = %docker.socket_path(),
        store_url = %store.url(),
        "Connected to Docker and Redis"
    );

    // Subscribe before the baseline so nothing between the two is missed.
    let stream = docker.events().await.context("Failed to subscribe to swarm events")?;
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let pump = spawn_event_pump(stream, tx);

    let engine = ReconciliationEngine::new(
        docker,
        store,
        RouteResolver::new(config.default_domain.clone()),
        RoutingKeyBuilder::new(config.key_prefix.clone(), config.server_key_scheme),
    );
    let controller = Controller::new(engine);
    controller.startup().await.context("Baseline resync failed")?;

    let result = controller.run(rx).await;
    match pump.await {
        Ok(Err(e)) => error!(error = %e, "Event stream failed"),
        Err(e) => error!(error = %e, "Event pump panicked"),
        Ok(Ok(())) => {}
    }
    result
}
