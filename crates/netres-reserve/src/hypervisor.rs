//! Hypervisor connection seam.
//!
//! The reservation engine only needs two read-only queries from the
//! hypervisor: which virtual networks exist, and which DHCP leases each one
//! currently holds.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ipnet::IpNet;

use crate::error::{ReserveError, Result};

/// One active DHCP lease on a virtual network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    /// Interface (bridge) the lease was handed out on.
    pub iface: String,
    /// Leased address with the network's prefix length.
    pub addr: IpNet,
}

/// Read-only view of a hypervisor's virtual networks.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Names of every defined virtual network, active or not.
    async fn list_networks(&self) -> Result<Vec<String>>;

    /// Active leases on one network. May fail if the network disappears
    /// between listing and querying.
    async fn dhcp_leases(&self, network: &str) -> Result<Vec<DhcpLease>>;
}

/// In-memory hypervisor.
///
/// Stands in when there is no hypervisor to query, and lets callers replay a
/// known network state.
#[derive(Debug, Clone, Default)]
pub struct StaticHypervisor {
    networks: BTreeMap<String, Option<Vec<DhcpLease>>>,
}

impl StaticHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a network with the given leases.
    pub fn with_network(mut self, name: &str, leases: Vec<DhcpLease>) -> Self {
        self.networks.insert(name.to_string(), Some(leases));
        self
    }

    /// Add a network whose lease query fails, as if destroyed mid-scan.
    pub fn with_vanishing_network(mut self, name: &str) -> Self {
        self.networks.insert(name.to_string(), None);
        self
    }
}

#[async_trait]
impl Hypervisor for StaticHypervisor {
    async fn list_networks(&self) -> Result<Vec<String>> {
        Ok(self.networks.keys().cloned().collect())
    }

    async fn dhcp_leases(&self, network: &str) -> Result<Vec<DhcpLease>> {
        match self.networks.get(network) {
            Some(Some(leases)) => Ok(leases.clone()),
            Some(None) | None => Err(ReserveError::Hypervisor(format!(
                "network not found: {network}"
            ))),
        }
    }
}
