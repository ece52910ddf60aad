//! Subnet and bridge-name selection.
//!
//! Each field is searched independently, starting from the template and
//! stepping forward until the candidate conflicts with nothing in use. Every choice
//! is recorded in the in-use set before the next field is searched, so the
//! fields of one asset cannot collide with each other.
//!
//! Stepping rules:
//! - IPv4 advances by one full subnet width (`/24` → next `/24`).
//! - IPv6 adds 2^72 to the address, bumping the global routing prefix while
//!   leaving the subnet id and interface id bits untouched.

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use netres_core::types::MAX_IFNAME_LEN;
use netres_core::{AllocatedAsset, AssetField, InUseSet, ValidTemplate};

use crate::error::{ReserveError, Result};

/// Increment applied to an IPv6 address per step.
pub const IPV6_GRP_STEP: u128 = 1 << 72;

/// Picks a conflict-free asset for a template.
pub struct AllocationEngine<'a> {
    template: &'a ValidTemplate,
    max_attempts: u32,
}

impl<'a> AllocationEngine<'a> {
    pub fn new(template: &'a ValidTemplate, max_attempts: u32) -> Self {
        Self {
            template,
            max_attempts,
        }
    }

    /// Choose every field, recording each choice into `in_use`.
    pub fn allocate(&self, in_use: &mut InUseSet) -> Result<AllocatedAsset> {
        let t = self.template;

        let machine_cidr =
            self.pick_subnet(AssetField::MachineCidr, t.machine_cidr, next_ipv4, in_use)?;
        let machine_cidr6 =
            self.pick_subnet(AssetField::MachineCidr6, t.machine_cidr6, next_ipv6, in_use)?;
        let provisioning_cidr = self.pick_subnet(
            AssetField::ProvisioningCidr,
            t.provisioning_cidr,
            next_ipv4,
            in_use,
        )?;
        let provisioning_cidr6 = self.pick_subnet(
            AssetField::ProvisioningCidr6,
            t.provisioning_cidr6,
            next_ipv6,
            in_use,
        )?;
        let network_if = self.pick_bridge_name(AssetField::NetworkIf, &t.network_if, in_use)?;
        let secondary_network_if = self.pick_bridge_name(
            AssetField::SecondaryNetworkIf,
            &t.secondary_network_if,
            in_use,
        )?;

        Ok(AllocatedAsset {
            machine_cidr,
            machine_cidr6,
            provisioning_cidr,
            provisioning_cidr6,
            network_if,
            secondary_network_if,
            allocated_at: None,
            owner_pid: None,
        })
    }

    /// First candidate from `start` onwards that conflicts with nothing in use.
    pub fn pick_subnet<N>(
        &self,
        field: AssetField,
        start: N,
        step: fn(&N) -> Option<N>,
        in_use: &mut InUseSet,
    ) -> Result<N>
    where
        N: Copy + Into<IpNet>,
    {
        let mut candidate = start;

        for attempt in 1..=self.max_attempts {
            let net: IpNet = candidate.into();
            if !in_use.conflicts(&net) {
                in_use.insert_network(net);
                tracing::trace!(field = %field, subnet = %net, attempt, "Subnet chosen");
                return Ok(candidate);
            }
            candidate = step(&candidate).ok_or(ReserveError::PoolExhausted {
                field,
                attempts: attempt,
            })?;
        }

        Err(ReserveError::PoolExhausted {
            field,
            attempts: self.max_attempts,
        })
    }

    /// First `prefix{n}` not already in use.
    pub fn pick_bridge_name(
        &self,
        field: AssetField,
        prefix: &str,
        in_use: &mut InUseSet,
    ) -> Result<String> {
        for index in 0..self.max_attempts {
            let name = format!("{prefix}{index}");
            if name.len() > MAX_IFNAME_LEN {
                return Err(ReserveError::PoolExhausted {
                    field,
                    attempts: index,
                });
            }
            if !in_use.contains_name(&name) {
                in_use.insert_name(name.clone());
                return Ok(name);
            }
        }

        Err(ReserveError::PoolExhausted {
            field,
            attempts: self.max_attempts,
        })
    }
}

/// The next IPv4 subnet of the same width, or `None` past the end of the space.
pub fn next_ipv4(net: &Ipv4Net) -> Option<Ipv4Net> {
    let width = 1u64 << (32 - u32::from(net.prefix_len()));
    let next = u64::from(u32::from(net.network())) + width;
    let next = u32::try_from(next).ok()?;
    Ipv4Net::new(Ipv4Addr::from(next), net.prefix_len()).ok()
}

/// The address with its global routing prefix bumped by one, or `None` on overflow.
pub fn next_ipv6(net: &Ipv6Net) -> Option<Ipv6Net> {
    let next = u128::from(net.addr()).checked_add(IPV6_GRP_STEP)?;
    Ipv6Net::new(Ipv6Addr::from(next), net.prefix_len()).ok()
}
