//! Read-only probes of current network usage.
//!
//! Two independent sources feed the in-use view alongside the ledger: the
//! local machine's interfaces and the hypervisor's DHCP leases. Neither
//! scanner mutates anything.

use std::net::IpAddr;

use netres_core::InUseSet;

use crate::error::Result;
use crate::hypervisor::Hypervisor;

/// Addresses and name of one local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInterface {
    pub name: String,
    pub addresses: Vec<IpAddr>,
}

/// Scans the local machine's network interfaces.
///
/// Disabled when the hypervisor is remote: local interfaces say nothing
/// about what a remote host is using.
#[derive(Debug, Clone, Copy)]
pub struct HostInterfaceScanner {
    enabled: bool,
}

impl HostInterfaceScanner {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn scan(&self) -> InUseSet {
        if !self.enabled {
            tracing::debug!("Hypervisor is remote, skipping host interface scan");
            return InUseSet::new();
        }

        let interfaces: Vec<HostInterface> = pnet::datalink::interfaces()
            .into_iter()
            .map(|iface| HostInterface {
                addresses: iface.ips.iter().map(|net| net.ip()).collect(),
                name: iface.name,
            })
            .collect();

        let in_use = fold_interfaces(interfaces);
        tracing::debug!(
            addresses = in_use.address_count(),
            names = in_use.name_count(),
            "Host interface scan complete"
        );
        in_use
    }
}

/// Every interface name and assigned address, as an in-use view.
///
/// Only the addresses are recorded, not the networks they sit in.
pub fn fold_interfaces(interfaces: impl IntoIterator<Item = HostInterface>) -> InUseSet {
    let mut in_use = InUseSet::new();
    for iface in interfaces {
        for addr in iface.addresses {
            in_use.insert_address(addr);
        }
        in_use.insert_name(iface.name);
    }
    in_use
}

/// Scans the hypervisor's virtual networks for active leases.
#[derive(Debug, Clone, Copy, Default)]
pub struct HypervisorNetworkScanner;

impl HypervisorNetworkScanner {
    /// Collect every lease's interface and address.
    ///
    /// Failing to list networks aborts the scan. A network whose leases
    /// cannot be read (typically destroyed concurrently by another run) is
    /// skipped.
    pub async fn scan(&self, hypervisor: &dyn Hypervisor) -> Result<InUseSet> {
        let mut in_use = InUseSet::new();
        let networks = hypervisor.list_networks().await?;

        for network in &networks {
            let leases = match hypervisor.dhcp_leases(network).await {
                Ok(leases) => leases,
                Err(e) => {
                    tracing::warn!(
                        network = %network,
                        error = %e,
                        "Failed to read DHCP leases, skipping network"
                    );
                    continue;
                }
            };

            for lease in leases {
                in_use.insert_address(lease.addr.addr());
                in_use.insert_name(lease.iface);
            }
        }

        tracing::debug!(
            networks_scanned = networks.len(),
            in_use_addresses = in_use.address_count(),
            in_use_names = in_use.name_count(),
            "Hypervisor network scan complete"
        );

        Ok(in_use)
    }
}
