//! Router sync
//!
//! Keeps a reverse proxy's key-value routing table in line with the services
//! and ready nodes of a Docker swarm.
//!
//! This service:
//! - Reads services, nodes and swarm events from the Docker Engine API
//! - Resolves each labelled service to a host and published port
//! - Writes one routing entry per exposed service to Redis, atomically
//! - Withdraws entries when services are removed or stop being exposed

pub mod config;
pub mod controller;
pub mod docker;
pub mod events;
pub mod redis;

pub use config::Config;
pub use controller::{Controller, Dispatch};
pub use docker::{DockerClient, DockerEventStream};
pub use events::{spawn_event_pump, EventSource, EVENT_CHANNEL_CAPACITY};
pub use redis::{RedisStore, RedisUrl};
