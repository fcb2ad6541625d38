//! guestnet - guest network identity for hypervisor-backed containers
//!
//! Carves a bridge subnet into guest addresses, hands one to each VM and
//! keeps the host-to-guest NAT port forwards for its exposed ports.

pub mod error;
pub mod logging;
pub mod manifest;
pub mod network;
pub mod provision;
pub mod state;

pub use error::{Error, Result};
pub use network::{NatRule, PortForwarder, Protocol, SubnetContext};
pub use provision::{ContainerPort, GuestNetwork, RollbackPolicy, VmNetworkSettings};
