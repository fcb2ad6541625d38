//! Unified error types for guestnet

use crate::network::ports::Protocol;
use crate::provision::ContainerPort;
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for guestnet operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Address pool errors
    #[error("No available addresses in {0}")]
    AllocationExhausted(String),

    #[error("Address {0} is already allocated")]
    AddressInUse(Ipv4Addr),

    #[error("Address {addr} is not a usable host address in {subnet}")]
    AddressOutOfRange { addr: Ipv4Addr, subnet: String },

    #[error("Address {0} is not allocated")]
    AddressNotAllocated(Ipv4Addr),

    // Port map errors
    #[error("Host port {port}/{protocol} is already mapped")]
    PortInUse { protocol: Protocol, port: u16 },

    #[error("Invalid port number: {0}")]
    InvalidPort(u16),

    #[error("Host port {port}/{protocol} is not mapped")]
    PortNotAllocated { protocol: Protocol, port: u16 },

    // Hypervisor errors
    #[error("NAT port-forward failed for VM '{vm}': {message}")]
    Forwarder { vm: String, message: String },

    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    // Provisioning errors
    #[error("Provisioning of VM '{vm}' stopped holding {ip}: {source}")]
    Incomplete {
        vm: String,
        ip: Ipv4Addr,
        /// Ports forwarded before the failure
        installed: Vec<ContainerPort>,
        #[source]
        source: Box<Error>,
    },

    // Lease state errors
    #[error("Failed to read state file '{path}': {source}")]
    StateRead { path: PathBuf, source: io::Error },

    #[error("Failed to lock state file '{path}': {source}")]
    StateLock {
        path: PathBuf,
        source: nix::errno::Errno,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No lease recorded for VM '{0}'")]
    LeaseNotFound(String),

    #[error("VM '{0}' already holds a lease")]
    LeaseExists(String),
}

impl Error {
    /// True for releases of something that was never held
    pub fn is_not_allocated(&self) -> bool {
        matches!(
            self,
            Error::AddressNotAllocated(_) | Error::PortNotAllocated { .. }
        )
    }
}

/// Result type alias for guestnet operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_allocated_grouping() {
        let addr = Error::AddressNotAllocated(Ipv4Addr::new(10, 0, 0, 20));
        let port = Error::PortNotAllocated {
            protocol: Protocol::Udp,
            port: 53,
        };
        let busy = Error::AddressInUse(Ipv4Addr::new(10, 0, 0, 20));

        assert!(addr.is_not_allocated());
        assert!(port.is_not_allocated());
        assert!(!busy.is_not_allocated());
    }

    #[test]
    fn test_port_error_message() {
        let err = Error::PortInUse {
            protocol: Protocol::Tcp,
            port: 8080,
        };
        assert_eq!(err.to_string(), "Host port 8080/tcp is already mapped");
    }

    #[test]
    fn test_incomplete_keeps_cause() {
        let err = Error::Incomplete {
            vm: "vm1".into(),
            ip: Ipv4Addr::new(10, 0, 0, 15),
            installed: vec![ContainerPort::new("tcp", 8080, 80)],
            source: Box::new(Error::InvalidPort(0)),
        };

        assert_eq!(
            err.to_string(),
            "Provisioning of VM 'vm1' stopped holding 10.0.0.15: Invalid port number: 0"
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
