//! Routing key layout.
//!
//! With the default prefix a routing entry for service `api` looks like:
//!
//! ```text
//! traefik/http/routers/api/rule                                  Host(`api.example.com`)
//! traefik/http/routers/api/service                               api
//! traefik/http/services/api/loadbalancer/servers/<id>/url        http://10.0.0.1:30001
//! ```
//!
//! `<id>` is the node address or the snapshot ordinal, see [`ServerKeyScheme`].

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use crate::resolver::RoutingDecision;
use crate::topology::TopologySnapshot;

/// Default root of every routing key.
pub const DEFAULT_KEY_PREFIX: &str = "traefik";

/// How server keys are indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerKeyScheme {
    /// Index by node address, stable across topology changes.
    #[default]
    Address,
    /// Index by position in the topology snapshot.
    Ordinal,
}

impl ServerKeyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Address => "address",
            Self::Ordinal => "ordinal",
        }
    }
}

impl fmt::Display for ServerKeyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerKeyScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "address" => Ok(Self::Address),
            "ordinal" => Ok(Self::Ordinal),
            other => Err(format!(
                "unknown server key scheme {other:?} (expected \"address\" or \"ordinal\")"
            )),
        }
    }
}

/// Builds the exact keys and values a routing entry consists of.
#[derive(Debug, Clone)]
pub struct RoutingKeyBuilder {
    prefix: String,
    scheme: ServerKeyScheme,
}

impl Default for RoutingKeyBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX, ServerKeyScheme::default())
    }
}

impl RoutingKeyBuilder {
    pub fn new(prefix: impl Into<String>, scheme: ServerKeyScheme) -> Self {
        let prefix = prefix.into().trim_end_matches('/').to_string();
        Self { prefix, scheme }
    }

    pub fn rule_key(&self, service: &str) -> String {
        format!("{}/http/routers/{service}/rule", self.prefix)
    }

    pub fn binding_key(&self, service: &str) -> String {
        format!("{}/http/routers/{service}/service", self.prefix)
    }

    /// Common prefix of every router key.
    pub fn routers_root(&self) -> String {
        format!("{}/http/routers/", self.prefix)
    }

    /// Common prefix of every load-balancer service key.
    pub fn services_root(&self) -> String {
        format!("{}/http/services/", self.prefix)
    }

    /// Service named by a binding key, if `key` is one.
    pub fn binding_owner<'k>(&self, key: &'k str) -> Option<&'k str> {
        let (name, rest) = key.strip_prefix(&self.routers_root())?.split_once('/')?;
        (!name.is_empty() && rest == "service").then_some(name)
    }

    /// Service owning a server key, if `key` is one.
    pub fn server_owner<'k>(&self, key: &'k str) -> Option<&'k str> {
        let (name, rest) = key.strip_prefix(&self.services_root())?.split_once('/')?;
        (!name.is_empty() && rest.starts_with("loadbalancer/servers/")).then_some(name)
    }

    /// Common prefix of every server key of `service`, slash-terminated.
    pub fn servers_prefix(&self, service: &str) -> String {
        format!("{}/http/services/{service}/loadbalancer/servers/", self.prefix)
    }

    /// Key of the server entry for the node at `ordinal` with `address`.
    pub fn server_key(&self, service: &str, ordinal: usize, address: &str) -> String {
        let prefix = self.servers_prefix(service);
        match self.scheme {
            ServerKeyScheme::Address => format!("{prefix}{address}/url"),
            ServerKeyScheme::Ordinal => format!("{prefix}{ordinal}/url"),
        }
    }

    /// Host-match expression stored under the rule key.
    pub fn rule_value(host: &str) -> String {
        format!("Host(`{host}`)")
    }

    /// Every key/value pair of the routing entry for `decision`.
    ///
    /// Order: server keys in snapshot order, then binding, then rule.
    pub fn entry(&self, decision: &RoutingDecision) -> Vec<(String, String)> {
        let name = decision.service.as_str();
        let mut pairs: Vec<(String, String)> = decision
            .backends
            .iter()
            .enumerate()
            .map(|(ordinal, address)| {
                (
                    self.server_key(name, ordinal, address),
                    server_url(address, decision.port),
                )
            })
            .collect();

        pairs.push((self.binding_key(name), name.to_string()));
        pairs.push((self.rule_key(name), Self::rule_value(&decision.host)));
        pairs
    }

    /// Keys a routing entry for `service` would have against `snapshot`.
    pub fn managed_keys(&self, service: &str, snapshot: &TopologySnapshot) -> Vec<String> {
        let mut keys: Vec<String> = snapshot
            .enumerate()
            .map(|(ordinal, address)| self.server_key(service, ordinal, address))
            .collect();
        keys.push(self.binding_key(service));
        keys.push(self.rule_key(service));
        keys
    }
}

/// Backend URL for a node address and published port.
///
/// IPv6 addresses are bracketed.
pub fn server_url(address: &str, port: u16) -> String {
    if address.parse::<Ipv6Addr>().is_ok() {
        format!("http://[{address}]:{port}")
    } else {
        format!("http://{address}:{port}")
    }
}
