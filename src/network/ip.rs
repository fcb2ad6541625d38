//! Guest address management for the bridge subnet
//!
//! Provides:
//! - Lowest-free allocation from the gateway-anchored subnet
//! - Explicit reservation of a requested address
//! - A reserved block that is never handed to a VM

use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Addresses held by the pool
#[derive(Debug, Default)]
struct Allocations {
    /// Host-reserved addresses (gateway and the leading block)
    reserved: BTreeSet<Ipv4Addr>,
    /// Addresses owned by VMs
    leased: BTreeSet<Ipv4Addr>,
}

impl Allocations {
    fn contains(&self, addr: &Ipv4Addr) -> bool {
        self.reserved.contains(addr) || self.leased.contains(addr)
    }
}

/// Address pool for the bridge subnet
///
/// All decisions happen under a single lock, so concurrent callers never
/// receive the same address.
#[derive(Debug)]
pub struct AddressPool {
    /// Bridge subnet
    subnet: Ipv4Net,
    allocations: Mutex<Allocations>,
}

impl AddressPool {
    /// Create an empty pool over a subnet
    pub fn new(subnet: Ipv4Net) -> Self {
        Self {
            subnet,
            allocations: Mutex::new(Allocations::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Allocations> {
        self.allocations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark up to `count` addresses starting at `start` as host-reserved
    ///
    /// Stops early at the end of the subnet. Returns the number of addresses
    /// marked.
    pub fn reserve_block(&self, start: Ipv4Addr, count: usize) -> Result<usize> {
        let mut allocations = self.lock();
        let mut addr = start;
        let mut marked = 0;

        while marked < count && self.subnet.contains(&addr) {
            if allocations.contains(&addr) {
                return Err(Error::AllocationExhausted(format!(
                    "{} (reserved address {} already taken)",
                    self.subnet, addr
                )));
            }
            allocations.reserved.insert(addr);
            marked += 1;

            match next_addr(addr) {
                Some(next) => addr = next,
                None => break,
            }
        }

        Ok(marked)
    }

    /// Reserve an address for a VM
    ///
    /// With `requested`, reserves exactly that address. Otherwise picks the
    /// lowest free host address of the subnet.
    pub fn reserve(&self, requested: Option<Ipv4Addr>) -> Result<Ipv4Addr> {
        let mut allocations = self.lock();

        if let Some(addr) = requested {
            if !self.is_host(&addr) {
                return Err(Error::AddressOutOfRange {
                    addr,
                    subnet: self.subnet.to_string(),
                });
            }
            if allocations.contains(&addr) {
                return Err(Error::AddressInUse(addr));
            }
            allocations.leased.insert(addr);
            return Ok(addr);
        }

        let free = self.subnet.hosts().find(|addr| !allocations.contains(addr));
        match free {
            Some(addr) => {
                allocations.leased.insert(addr);
                Ok(addr)
            }
            None => Err(Error::AllocationExhausted(self.subnet.to_string())),
        }
    }

    /// Release an address owned by a VM
    ///
    /// Reserved addresses are never owned by a VM, so releasing one is
    /// reported as not allocated.
    pub fn release(&self, addr: Ipv4Addr) -> Result<()> {
        if self.lock().leased.remove(&addr) {
            Ok(())
        } else {
            Err(Error::AddressNotAllocated(addr))
        }
    }

    /// Check whether an address is reserved or leased
    pub fn is_allocated(&self, addr: &Ipv4Addr) -> bool {
        self.lock().contains(addr)
    }

    /// Number of addresses leased to VMs
    pub fn leased_count(&self) -> usize {
        self.lock().leased.len()
    }

    /// Number of host addresses still free
    pub fn available_count(&self) -> usize {
        let allocations = self.lock();
        self.subnet
            .hosts()
            .filter(|addr| !allocations.contains(addr))
            .count()
    }

    fn is_host(&self, addr: &Ipv4Addr) -> bool {
        // hosts() skips network and broadcast except on /31 and /32
        match (self.subnet.hosts().next(), self.subnet.hosts().last()) {
            (Some(first), Some(last)) => *addr >= first && *addr <= last,
            _ => false,
        }
    }
}

/// Address following `addr`, if any
pub fn next_addr(addr: Ipv4Addr) -> Option<Ipv4Addr> {
    u32::from(addr).checked_add(1).map(Ipv4Addr::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn pool(cidr: &str) -> AddressPool {
        AddressPool::new(cidr.parse().unwrap())
    }

    #[test]
    fn test_lowest_free_allocation() {
        let pool = pool("10.0.1.0/24");

        assert_eq!(pool.reserve(None).unwrap(), Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(pool.reserve(None).unwrap(), Ipv4Addr::new(10, 0, 1, 2));
        assert_eq!(pool.leased_count(), 2);
    }

    #[test]
    fn test_reserved_block_is_skipped() {
        let pool = pool("10.0.1.0/24");
        let marked = pool.reserve_block(Ipv4Addr::new(10, 0, 1, 0), 15).unwrap();
        assert_eq!(marked, 15);

        assert_eq!(pool.reserve(None).unwrap(), Ipv4Addr::new(10, 0, 1, 15));
        assert_eq!(pool.leased_count(), 1);
    }

    #[test]
    fn test_reserved_block_stops_at_subnet_end() {
        let pool = pool("10.0.1.0/30");
        let marked = pool.reserve_block(Ipv4Addr::new(10, 0, 1, 0), 15).unwrap();
        assert_eq!(marked, 4);

        assert!(matches!(
            pool.reserve(None),
            Err(Error::AllocationExhausted(_))
        ));
    }

    #[test]
    fn test_reserved_block_collision() {
        let pool = pool("10.0.1.0/24");
        pool.reserve(Some(Ipv4Addr::new(10, 0, 1, 3))).unwrap();

        let result = pool.reserve_block(Ipv4Addr::new(10, 0, 1, 0), 15);
        assert!(matches!(result, Err(Error::AllocationExhausted(_))));
    }

    #[test]
    fn test_release_and_reuse() {
        let pool = pool("10.0.1.0/24");

        let ip = pool.reserve(None).unwrap();
        pool.release(ip).unwrap();
        assert_eq!(pool.leased_count(), 0);

        let ip2 = pool.reserve(None).unwrap();
        assert_eq!(ip, ip2);
    }

    #[test]
    fn test_release_unowned_address() {
        let pool = pool("10.0.1.0/24");
        pool.reserve_block(Ipv4Addr::new(10, 0, 1, 0), 3).unwrap();

        let free = Ipv4Addr::new(10, 0, 1, 50);
        assert!(matches!(
            pool.release(free),
            Err(Error::AddressNotAllocated(ip)) if ip == free
        ));

        // Reserved addresses stay reserved
        let gateway = Ipv4Addr::new(10, 0, 1, 2);
        assert!(pool.release(gateway).unwrap_err().is_not_allocated());
        assert!(pool.is_allocated(&gateway));
    }

    #[test]
    fn test_specific_allocation() {
        let pool = pool("10.0.1.0/24");
        let specific = Ipv4Addr::new(10, 0, 1, 100);

        assert_eq!(pool.reserve(Some(specific)).unwrap(), specific);
        assert!(pool.is_allocated(&specific));
        assert!(matches!(
            pool.reserve(Some(specific)),
            Err(Error::AddressInUse(ip)) if ip == specific
        ));
    }

    #[test]
    fn test_specific_allocation_out_of_range() {
        let pool = pool("10.0.1.0/24");

        for addr in ["10.0.2.5", "10.0.1.0", "10.0.1.255"] {
            let result = pool.reserve(Some(addr.parse().unwrap()));
            assert!(
                matches!(result, Err(Error::AddressOutOfRange { .. })),
                "{} should be rejected",
                addr
            );
        }
    }

    #[test]
    fn test_exhaustion() {
        let pool = pool("10.0.1.0/29");
        for _ in 0..6 {
            pool.reserve(None).unwrap();
        }
        assert_eq!(pool.available_count(), 0);
        assert!(matches!(
            pool.reserve(None),
            Err(Error::AllocationExhausted(_))
        ));
    }

    #[test]
    fn test_concurrent_reserve_is_unique() {
        let pool = pool("10.0.0.0/22");
        pool.reserve_block(Ipv4Addr::new(10, 0, 0, 0), 15).unwrap();

        let addrs: Vec<Ipv4Addr> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        (0..50)
                            .map(|_| pool.reserve(None).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        let unique: HashSet<_> = addrs.iter().collect();
        assert_eq!(unique.len(), 400);
        assert_eq!(pool.leased_count(), 400);
    }

    #[test]
    fn test_next_addr() {
        assert_eq!(
            next_addr(Ipv4Addr::new(192, 168, 1, 255)),
            Some(Ipv4Addr::new(192, 168, 2, 0))
        );
        assert_eq!(next_addr(Ipv4Addr::BROADCAST), None);
    }
}
