//! Host port bookkeeping for guest port forwards
//!
//! Each (protocol, host port) pair can be claimed by at most one guest
//! endpoint at a time. TCP and UDP are tracked independently.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Transport protocol of a port forward
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    /// Interpret a container port protocol string
    ///
    /// Anything that is not "udp" (case-insensitive) is TCP.
    pub fn from_name(s: &str) -> Self {
        if s.eq_ignore_ascii_case("udp") {
            Protocol::Udp
        } else {
            Protocol::Tcp
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Active host-to-guest port mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub protocol: Protocol,
    pub host_port: u16,
    pub guest_ip: Ipv4Addr,
    pub guest_port: u16,
    /// Owning VM
    pub vm_id: String,
}

/// Table of claimed host ports
#[derive(Debug, Default)]
pub struct PortMapTable {
    mappings: Mutex<BTreeMap<(Protocol, u16), PortMapping>>,
}

impl PortMapTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<(Protocol, u16), PortMapping>> {
        self.mappings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim a host port for a guest endpoint
    pub fn allocate_map(
        &self,
        protocol: Protocol,
        host_port: u16,
        guest_ip: Ipv4Addr,
        guest_port: u16,
        vm_id: &str,
    ) -> Result<()> {
        validate_port(host_port)?;
        validate_port(guest_port)?;

        let mut mappings = self.lock();
        if mappings.contains_key(&(protocol, host_port)) {
            return Err(Error::PortInUse {
                protocol,
                port: host_port,
            });
        }

        mappings.insert(
            (protocol, host_port),
            PortMapping {
                protocol,
                host_port,
                guest_ip,
                guest_port,
                vm_id: vm_id.to_string(),
            },
        );
        Ok(())
    }

    /// Drop a host port claim
    pub fn release_map(&self, protocol: Protocol, host_port: u16) -> Result<PortMapping> {
        self.lock()
            .remove(&(protocol, host_port))
            .ok_or(Error::PortNotAllocated {
                protocol,
                port: host_port,
            })
    }

    /// Look up the mapping for a host port
    pub fn get(&self, protocol: Protocol, host_port: u16) -> Option<PortMapping> {
        self.lock().get(&(protocol, host_port)).cloned()
    }

    /// All mappings, ordered by protocol then host port
    pub fn list(&self) -> Vec<PortMapping> {
        self.lock().values().cloned().collect()
    }

    /// Mappings owned by a VM
    pub fn mappings_for_vm(&self, vm_id: &str) -> Vec<PortMapping> {
        self.lock()
            .values()
            .filter(|m| m.vm_id == vm_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(Error::InvalidPort(port));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUEST1: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 20);
    const GUEST2: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 21);

    #[test]
    fn test_protocol_from_name() {
        assert_eq!(Protocol::from_name("udp"), Protocol::Udp);
        assert_eq!(Protocol::from_name("UDP"), Protocol::Udp);
        assert_eq!(Protocol::from_name("tcp"), Protocol::Tcp);
        assert_eq!(Protocol::from_name(""), Protocol::Tcp);
        assert_eq!(Protocol::from_name("sctp"), Protocol::Tcp);
    }

    #[test]
    fn test_host_port_conflict() {
        let table = PortMapTable::new();
        table
            .allocate_map(Protocol::Tcp, 8080, GUEST1, 80, "vm1")
            .unwrap();

        let result = table.allocate_map(Protocol::Tcp, 8080, GUEST2, 81, "vm2");
        assert!(matches!(
            result,
            Err(Error::PortInUse {
                protocol: Protocol::Tcp,
                port: 8080
            })
        ));

        // Protocol is part of the key
        table
            .allocate_map(Protocol::Udp, 8080, GUEST2, 81, "vm2")
            .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(Protocol::Tcp, 8080).unwrap().guest_ip, GUEST1);
    }

    #[test]
    fn test_release_map() {
        let table = PortMapTable::new();
        table
            .allocate_map(Protocol::Tcp, 2222, GUEST1, 22, "vm1")
            .unwrap();

        let released = table.release_map(Protocol::Tcp, 2222).unwrap();
        assert_eq!(released.guest_port, 22);
        assert!(table.is_empty());

        // Port can be claimed again
        table
            .allocate_map(Protocol::Tcp, 2222, GUEST2, 22, "vm2")
            .unwrap();
    }

    #[test]
    fn test_release_unmapped_port() {
        let table = PortMapTable::new();
        let err = table.release_map(Protocol::Udp, 53).unwrap_err();
        assert!(err.is_not_allocated());
    }

    #[test]
    fn test_zero_port_rejected() {
        let table = PortMapTable::new();
        assert!(matches!(
            table.allocate_map(Protocol::Tcp, 0, GUEST1, 80, "vm1"),
            Err(Error::InvalidPort(0))
        ));
        assert!(matches!(
            table.allocate_map(Protocol::Tcp, 80, GUEST1, 0, "vm1"),
            Err(Error::InvalidPort(0))
        ));
    }

    #[test]
    fn test_mappings_for_vm() {
        let table = PortMapTable::new();
        table.allocate_map(Protocol::Tcp, 80, GUEST1, 80, "vm1").unwrap();
        table.allocate_map(Protocol::Udp, 53, GUEST1, 53, "vm1").unwrap();
        table.allocate_map(Protocol::Tcp, 81, GUEST2, 80, "vm2").unwrap();

        let vm1 = table.mappings_for_vm("vm1");
        assert_eq!(vm1.len(), 2);
        assert!(vm1.iter().all(|m| m.guest_ip == GUEST1));
    }
}
