//! IP reservations on manual networks.
//!
//! Every address an instance will hold is reserved exactly once per
//! network. Reserving an address already owned by someone else is a
//! director error. New addresses come from the subnet range, skipping the
//! gateway, reserved addresses, static addresses and anything already held.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use serde::Serialize;
use tracing::debug;

use stratus_core::SubnetSpec;

use crate::error::{PlanError, PlanResult};

#[derive(Debug, Clone, Default, Serialize)]
pub struct IpReservations {
    /// network → address → owner key.
    by_network: HashMap<String, BTreeMap<Ipv4Addr, String>>,
}

impl IpReservations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `ip` on `network` for `owner`. Re-reserving for the same
    /// owner is a no-op.
    pub fn reserve(&mut self, network: &str, ip: Ipv4Addr, owner: &str) -> PlanResult<()> {
        let held = self.by_network.entry(network.to_string()).or_default();
        match held.get(&ip) {
            Some(current) if current == owner => Ok(()),
            Some(current) => Err(PlanError::director(format!(
                "failed to reserve IP '{ip}' for '{owner}': already reserved by '{current}' on network '{network}'"
            ))),
            None => {
                held.insert(ip, owner.to_string());
                debug!(%network, %ip, %owner, "ip reserved");
                Ok(())
            }
        }
    }

    pub fn owner(&self, network: &str, ip: Ipv4Addr) -> Option<&str> {
        self.by_network
            .get(network)
            .and_then(|held| held.get(&ip))
            .map(String::as_str)
    }

    /// Address already held by `owner` on `network`, if any.
    pub fn held_by(&self, network: &str, owner: &str) -> Option<Ipv4Addr> {
        self.by_network
            .get(network)?
            .iter()
            .find(|(_, o)| o.as_str() == owner)
            .map(|(ip, _)| *ip)
    }

    /// Allocate the lowest free dynamic-pool address of `subnet` to `owner`.
    pub fn allocate(
        &mut self,
        network: &str,
        subnet: &SubnetSpec,
        owner: &str,
    ) -> PlanResult<Ipv4Addr> {
        let start = u32::from(subnet.range_start);
        let end = u32::from(subnet.range_end);
        let held = self.by_network.get(network);

        let free = (start..=end).map(Ipv4Addr::from).find(|ip| {
            Some(*ip) != subnet.gateway
                && !subnet.reserved.contains(ip)
                && !subnet.static_ips.contains(ip)
                && !held.is_some_and(|h| h.contains_key(ip))
        });

        match free {
            Some(ip) => {
                self.reserve(network, ip, owner)?;
                Ok(ip)
            }
            None => Err(PlanError::director(format!(
                "network '{network}' has no free addresses for '{owner}'"
            ))),
        }
    }

    pub fn count(&self, network: &str) -> usize {
        self.by_network.get(network).map_or(0, BTreeMap::len)
    }
}
