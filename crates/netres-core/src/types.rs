//! Core domain types for network-asset reservation.
//!
//! An asset is the set of subnets and bridge names handed to one test run.
//! Templates describe where the search for a free asset starts; the in-use
//! set is the merged view of everything that must not be handed out again.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NetresError;

/// Namespace UUID for deterministic asset identities.
const ASSET_NS: Uuid = Uuid::from_bytes([
    0x3f, 0x1c, 0x52, 0x8e, 0x6a, 0x04, 0x4d, 0x2b, 0x9e, 0x71, 0xc5, 0x0a, 0x88, 0x13, 0xd7, 0x46,
]);

/// Longest interface name the kernel accepts (IFNAMSIZ minus the NUL).
pub const MAX_IFNAME_LEN: usize = 15;

// ── Fields ────────────────────────────────────────────────────────

/// The six allocatable fields of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetField {
    MachineCidr,
    MachineCidr6,
    ProvisioningCidr,
    ProvisioningCidr6,
    NetworkIf,
    SecondaryNetworkIf,
}

impl AssetField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MachineCidr => "machine_cidr",
            Self::MachineCidr6 => "machine_cidr6",
            Self::ProvisioningCidr => "provisioning_cidr",
            Self::ProvisioningCidr6 => "provisioning_cidr6",
            Self::NetworkIf => "network_if",
            Self::SecondaryNetworkIf => "secondary_network_if",
        }
    }
}

impl fmt::Display for AssetField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Template ──────────────────────────────────────────────────────

/// Default network parameters, as read from configuration.
///
/// Every field is optional at parse time so that an incomplete `[template]`
/// section is reported by [`AssetTemplate::validate`] with the name of the
/// missing field. Omitting the section entirely yields [`Default`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetTemplate {
    #[serde(default)]
    pub machine_cidr: Option<Ipv4Net>,
    #[serde(default)]
    pub machine_cidr6: Option<Ipv6Net>,
    #[serde(default)]
    pub provisioning_cidr: Option<Ipv4Net>,
    #[serde(default)]
    pub provisioning_cidr6: Option<Ipv6Net>,
    #[serde(default)]
    pub network_if: Option<String>,
    #[serde(default)]
    pub secondary_network_if: Option<String>,
}

impl Default for AssetTemplate {
    fn default() -> Self {
        Self {
            machine_cidr: "192.168.127.0/24".parse().ok(),
            machine_cidr6: "1001:db8::/120".parse().ok(),
            provisioning_cidr: "192.168.145.0/24".parse().ok(),
            provisioning_cidr6: "3001:db8::/120".parse().ok(),
            network_if: Some("test".to_string()),
            secondary_network_if: Some("stest".to_string()),
        }
    }
}

impl AssetTemplate {
    /// Check that every field is present and usable.
    pub fn validate(&self) -> Result<ValidTemplate, NetresError> {
        Ok(ValidTemplate {
            machine_cidr: require(self.machine_cidr, AssetField::MachineCidr)?,
            machine_cidr6: require(self.machine_cidr6, AssetField::MachineCidr6)?,
            provisioning_cidr: require(self.provisioning_cidr, AssetField::ProvisioningCidr)?,
            provisioning_cidr6: require(self.provisioning_cidr6, AssetField::ProvisioningCidr6)?,
            network_if: bridge_prefix(self.network_if.as_deref(), AssetField::NetworkIf)?,
            secondary_network_if: bridge_prefix(
                self.secondary_network_if.as_deref(),
                AssetField::SecondaryNetworkIf,
            )?,
        })
    }
}

fn require<T>(value: Option<T>, field: AssetField) -> Result<T, NetresError> {
    value.ok_or(NetresError::MissingTemplateField(field))
}

fn bridge_prefix(value: Option<&str>, field: AssetField) -> Result<String, NetresError> {
    let prefix = value.ok_or(NetresError::MissingTemplateField(field))?;
    if prefix.is_empty() {
        return Err(NetresError::InvalidTemplateField {
            field,
            reason: "bridge prefix is empty".to_string(),
        });
    }
    // At least one digit of suffix must still fit.
    if prefix.len() >= MAX_IFNAME_LEN {
        return Err(NetresError::InvalidTemplateField {
            field,
            reason: format!("bridge prefix must be shorter than {MAX_IFNAME_LEN} characters"),
        });
    }
    if !prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(NetresError::InvalidTemplateField {
            field,
            reason: format!("bridge prefix {prefix:?} contains invalid characters"),
        });
    }
    Ok(prefix.to_string())
}

/// A template with every field present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidTemplate {
    pub machine_cidr: Ipv4Net,
    pub machine_cidr6: Ipv6Net,
    pub provisioning_cidr: Ipv4Net,
    pub provisioning_cidr6: Ipv6Net,
    pub network_if: String,
    pub secondary_network_if: String,
}

// ── Assets ────────────────────────────────────────────────────────

/// Stable identity of an allocated asset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(pub Uuid);

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The concrete network parameters handed to one test run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllocatedAsset {
    pub machine_cidr: Ipv4Net,
    pub machine_cidr6: Ipv6Net,
    pub provisioning_cidr: Ipv4Net,
    pub provisioning_cidr6: Ipv6Net,
    pub network_if: String,
    pub secondary_network_if: String,
    /// When the entry was written to the ledger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_at: Option<DateTime<Utc>>,
    /// PID of the acquiring process, for spotting orphans.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_pid: Option<u32>,
}

impl AllocatedAsset {
    /// Deterministic identity over the subnets and bridge names.
    ///
    /// Bookkeeping fields (`allocated_at`, `owner_pid`) are excluded so that
    /// an entry keeps its identity when re-read from the ledger.
    pub fn id(&self) -> AssetId {
        AssetId(Uuid::new_v5(
            &ASSET_NS,
            format!(
                "{}|{}|{}|{}|{}|{}",
                self.machine_cidr,
                self.machine_cidr6,
                self.provisioning_cidr,
                self.provisioning_cidr6,
                self.network_if,
                self.secondary_network_if
            )
            .as_bytes(),
        ))
    }

    /// All four subnets, in field order.
    pub fn networks(&self) -> [(AssetField, IpNet); 4] {
        [
            (AssetField::MachineCidr, self.machine_cidr.into()),
            (AssetField::MachineCidr6, self.machine_cidr6.into()),
            (AssetField::ProvisioningCidr, self.provisioning_cidr.into()),
            (AssetField::ProvisioningCidr6, self.provisioning_cidr6.into()),
        ]
    }

    /// Both bridge names, primary first.
    pub fn bridge_names(&self) -> [&str; 2] {
        [&self.network_if, &self.secondary_network_if]
    }
}

// ── In-use view ───────────────────────────────────────────────────

/// Whether two networks share any address.
pub fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Ranges, addresses and interface names that must not be handed out.
///
/// Built fresh for every acquisition. Ledger entries and subnets already
/// chosen contribute whole ranges; host interfaces and DHCP leases
/// contribute single addresses, so a wide LAN prefix on the host does not
/// block every subnet inside it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InUseSet {
    networks: BTreeSet<IpNet>,
    addresses: BTreeSet<IpAddr>,
    names: BTreeSet<String>,
}

impl InUseSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_network(&mut self, net: IpNet) {
        self.networks.insert(net.trunc());
    }

    pub fn insert_address(&mut self, addr: IpAddr) {
        self.addresses.insert(addr);
    }

    pub fn insert_name(&mut self, name: impl Into<String>) {
        self.names.insert(name.into());
    }

    /// Record every subnet and bridge name of an asset.
    pub fn insert_asset(&mut self, asset: &AllocatedAsset) {
        for (_, net) in asset.networks() {
            self.insert_network(net);
        }
        for name in asset.bridge_names() {
            self.insert_name(name);
        }
    }

    /// Union another view into this one.
    pub fn extend(&mut self, other: InUseSet) {
        self.networks.extend(other.networks);
        self.addresses.extend(other.addresses);
        self.names.extend(other.names);
    }

    /// Whether the candidate overlaps an in-use range or holds an in-use
    /// address.
    pub fn conflicts(&self, candidate: &IpNet) -> bool {
        self.networks.iter().any(|used| overlaps(used, candidate))
            || self.addresses.iter().any(|addr| candidate.contains(addr))
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn network_count(&self) -> usize {
        self.networks.len()
    }

    pub fn address_count(&self) -> usize {
        self.addresses.len()
    }

    pub fn name_count(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty() && self.addresses.is_empty() && self.names.is_empty()
    }
}
