//! Point-in-time view of the ready nodes.

use std::net::IpAddr;

use expose_cluster::Node;
use tracing::warn;

/// Ready-node addresses captured for a single reconciliation pass.
///
/// Ordinals are positions in this snapshot and carry no identity across
/// snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySnapshot {
    addresses: Vec<String>,
}

impl TopologySnapshot {
    /// Build a snapshot from addresses in orchestrator order.
    ///
    /// Duplicate addresses are kept once, at their first position. Empty and
    /// unspecified (`0.0.0.0`, `::`) addresses are dropped.
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for address in addresses {
            let address = address.into();
            if is_routable(&address) && !unique.contains(&address) {
                unique.push(address);
            }
        }
        Self { addresses: unique }
    }

    /// Snapshot of the ready nodes in `nodes` that report a usable address.
    pub fn from_nodes(nodes: &[Node]) -> Self {
        Self::new(nodes.iter().filter(|n| n.is_ready()).filter_map(|n| {
            if is_routable(&n.address) {
                Some(n.address.as_str())
            } else {
                warn!(
                    node_id = %n.id,
                    address = %n.address,
                    "ready node has no usable address, skipping"
                );
                None
            }
        }))
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// `(ordinal, address)` pairs.
    pub fn enumerate(&self) -> impl Iterator<Item = (usize, &str)> {
        self.addresses.iter().map(String::as_str).enumerate()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

fn is_routable(address: &str) -> bool {
    match address.parse::<IpAddr>() {
        Ok(ip) => !ip.is_unspecified(),
        Err(_) => !address.trim().is_empty(),
    }
}
