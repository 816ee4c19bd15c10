//! Router sync configuration.
//!
//! Everything comes from the environment; see [`Config::from_env`].

use anyhow::{bail, Context, Result};
use expose_reconcile::{ServerKeyScheme, DEFAULT_KEY_PREFIX};

use crate::docker::DEFAULT_SOCKET;
use crate::redis::RedisUrl;

const DEFAULT_STORE_URL: &str = "redis://redis:6379";

/// Router sync configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Suffix for hosts synthesized from service names (example: example.com).
    pub default_domain: String,

    /// Redis holding the proxy's routing table.
    pub store_url: RedisUrl,

    /// Docker Engine Unix socket.
    pub docker_socket: String,

    /// Root of every routing key.
    pub key_prefix: String,

    /// How server entries are keyed.
    pub server_key_scheme: ServerKeyScheme,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value
    /// if it is set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default_domain = lookup("DEFAULT_DOMAIN")
            .map(|v| v.trim().trim_matches('.').to_string())
            .filter(|v| !v.is_empty())
            .context("Missing default domain. Set DEFAULT_DOMAIN (example: example.com).")?;

        let store_url = lookup("STORE_URL")
            .or_else(|| lookup("REDIS_URL"))
            .unwrap_or_else(|| DEFAULT_STORE_URL.to_string());
        let store_url: RedisUrl = store_url
            .parse()
            .map_err(anyhow::Error::msg)
            .context("STORE_URL must look like redis://[[user]:password@]host[:port][/db].")?;

        let docker_socket = match lookup("DOCKER_HOST") {
            Some(host) => docker_socket_path(&host)?,
            None => DEFAULT_SOCKET.to_string(),
        };

        let key_prefix = lookup("KEY_PREFIX")
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());

        let server_key_scheme = lookup("SERVER_KEY_SCHEME")
            .map(|v| v.parse::<ServerKeyScheme>())
            .transpose()
            .map_err(anyhow::Error::msg)
            .context("SERVER_KEY_SCHEME must be `address` or `ordinal`.")?
            .unwrap_or_default();

        let log_level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            default_domain,
            store_url,
            docker_socket,
            key_prefix,
            server_key_scheme,
            log_level,
        })
    }
}

fn docker_socket_path(host: &str) -> Result<String> {
    let host = host.trim();
    if host.is_empty() {
        return Ok(DEFAULT_SOCKET.to_string());
    }

    match host.strip_prefix("unix://") {
        Some(path) if !path.is_empty() => Ok(path.to_string()),
        _ => bail!("DOCKER_HOST must be a unix:// socket (got {host:?})."),
    }
}
