//! Network resources for guest VMs
//!
//! Provides:
//! - Bridge subnet setup and the host-reserved block
//! - Guest address allocation
//! - Host port bookkeeping
//! - Hypervisor NAT port-forward rules

pub mod ip;
pub mod natpf;
pub mod ports;
pub mod subnet;

pub use ip::AddressPool;
pub use natpf::{DryRun, NatRule, PortForwarder, VBoxManage, validate_vm_id};
pub use ports::{PortMapTable, PortMapping, Protocol};
pub use subnet::SubnetContext;
