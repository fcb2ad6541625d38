//! Bridge subnet setup
//!
//! Derives the gateway from the bridge CIDR and seeds the address pool with
//! the host-reserved block.

use super::ip::AddressPool;
use crate::error::{Error, Result};
use ipnet::{IpNet, Ipv4Net};
use std::net::Ipv4Addr;
use tracing::debug;

/// Bridge CIDR used when none is configured
pub const DEFAULT_BRIDGE_CIDR: &str = "192.168.123.0/24";

/// Bridge interface name used when none is configured
pub const DEFAULT_BRIDGE_NAME: &str = "hyper0";

/// Offset of the gateway from the network base address
pub const GATEWAY_OFFSET: u32 = 2;

/// Number of leading addresses kept away from VMs
pub const RESERVED_BLOCK: usize = 15;

/// Subnet shared by every VM on the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetContext {
    /// Subnet anchored at the gateway (addr() is the gateway)
    cidr: Ipv4Net,
    gateway: Ipv4Addr,
}

impl SubnetContext {
    /// Parse a bridge CIDR and seed an address pool for it
    ///
    /// An empty string selects [`DEFAULT_BRIDGE_CIDR`]. The address part of
    /// the CIDR may be any address in the network.
    pub fn initialize(bridge_cidr: &str) -> Result<(Self, AddressPool)> {
        let bridge_cidr = match bridge_cidr.trim() {
            "" => DEFAULT_BRIDGE_CIDR,
            cidr => cidr,
        };

        let net: IpNet = bridge_cidr.parse().map_err(|e| {
            Error::InvalidConfig(format!("Invalid bridge CIDR '{}': {}", bridge_cidr, e))
        })?;
        let net = match net {
            IpNet::V4(net) => net.trunc(),
            IpNet::V6(_) => {
                return Err(Error::InvalidConfig(format!(
                    "Bridge CIDR '{}' is not IPv4",
                    bridge_cidr
                )));
            }
        };

        let gateway = u32::from(net.network())
            .checked_add(GATEWAY_OFFSET)
            .map(Ipv4Addr::from)
            .filter(|gw| net.contains(gw))
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "Bridge CIDR '{}' is too small to hold a gateway",
                    bridge_cidr
                ))
            })?;

        let cidr = Ipv4Net::new(gateway, net.prefix_len()).map_err(|e| {
            Error::InvalidConfig(format!("Invalid bridge prefix '{}': {}", bridge_cidr, e))
        })?;

        let pool = AddressPool::new(cidr.trunc());
        let marked = pool.reserve_block(net.network(), RESERVED_BLOCK)?;
        debug!(
            "Initialized bridge subnet {} (gateway {}, {} reserved)",
            net, gateway, marked
        );

        Ok((Self { cidr, gateway }, pool))
    }

    /// Gateway-anchored subnet
    pub fn cidr(&self) -> Ipv4Net {
        self.cidr
    }

    /// Network base address
    pub fn network(&self) -> Ipv4Addr {
        self.cidr.network()
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn prefix_len(&self) -> u8 {
        self.cidr.prefix_len()
    }

    /// Inclusive range of the host-reserved block
    pub fn reserved_range(&self) -> (Ipv4Addr, Ipv4Addr) {
        let start = u32::from(self.network());
        let end = start
            .saturating_add(RESERVED_BLOCK as u32 - 1)
            .min(u32::from(self.cidr.broadcast()));
        (Ipv4Addr::from(start), Ipv4Addr::from(end))
    }
}
