//! virsh process wrapper.
//!
//! Executes `virsh` as a child process via `tokio::process::Command` and
//! parses its tabular output into leases.

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::process::Command;

use crate::error::{ReserveError, Result};
use crate::hypervisor::{DhcpLease, Hypervisor};

/// Hypervisor connection backed by the virsh binary.
pub struct VirshHypervisor {
    virsh_path: String,
    uri: String,
}

impl VirshHypervisor {
    pub fn new(virsh_path: &str, uri: &str) -> Self {
        Self {
            virsh_path: virsh_path.to_string(),
            uri: uri.to_string(),
        }
    }

    /// Verify virsh is installed and accessible.
    pub async fn verify_installation(&self) -> Result<String> {
        let output = Command::new(&self.virsh_path)
            .arg("--version")
            .output()
            .await
            .map_err(|_| ReserveError::VirshNotFound {
                path: self.virsh_path.clone(),
            })?;

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.virsh_path)
            .arg("--quiet")
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .output()
            .await
            .map_err(|e| ReserveError::VirshNotFound {
                path: format!("{}: {e}", self.virsh_path),
            })?;

        if !output.status.success() {
            return Err(ReserveError::VirshFailed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn list_networks(&self) -> Result<Vec<String>> {
        let stdout = self.run(&["net-list", "--all", "--name"]).await?;
        Ok(parse_network_names(&stdout))
    }

    async fn dhcp_leases(&self, network: &str) -> Result<Vec<DhcpLease>> {
        let info = self.run(&["net-info", network]).await?;
        let bridge = parse_bridge_name(&info).unwrap_or_else(|| network.to_string());

        let table = self.run(&["net-dhcp-leases", network]).await?;
        Ok(parse_lease_addrs(&table)
            .into_iter()
            .map(|addr| DhcpLease {
                iface: bridge.clone(),
                addr,
            })
            .collect())
    }
}

/// One name per line, as printed by `net-list --name`.
pub fn parse_network_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// The `Bridge:` row of `net-info`.
pub fn parse_bridge_name(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case("bridge") {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}

/// Leased addresses from the `net-dhcp-leases` table.
///
/// Rows look like
/// `2024-05-02 10:11:12  52:54:00:aa:bb:cc  ipv4  192.168.122.45/24  vm-1  -`;
/// the address is the first column that parses as a CIDR. The header and the
/// dashed separator never do.
pub fn parse_lease_addrs(stdout: &str) -> Vec<IpNet> {
    stdout
        .lines()
        .filter_map(|line| {
            line.split_whitespace()
                .find_map(|token| token.parse::<IpNet>().ok())
        })
        .collect()
}
