//! Per-VM network provisioning
//!
//! Provides:
//! - Address reservation and NAT port-forward setup on VM create
//! - Address and port release on VM destroy
//! - Rebuilding pool state from recorded leases

use crate::error::{Error, Result};
use crate::manifest::GuestnetConfig;
use crate::network::{
    AddressPool, NatRule, PortForwarder, PortMapTable, Protocol, SubnetContext, validate_vm_id,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Container port exposed through the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPort {
    /// "tcp" or "udp"; anything but "udp" is treated as TCP
    pub protocol: String,
    pub host_port: u16,
    pub container_port: u16,
}

impl ContainerPort {
    pub fn new(protocol: &str, host_port: u16, container_port: u16) -> Self {
        Self {
            protocol: protocol.to_string(),
            host_port,
            container_port,
        }
    }

    /// Effective protocol of this port
    pub fn protocol(&self) -> Protocol {
        Protocol::from_name(&self.protocol)
    }
}

impl FromStr for ContainerPort {
    type Err = String;

    /// Parse `[proto:]host[:container]`, e.g. `udp:5353:53` or `8080:80`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts: Vec<&str> = s.split(':').collect();

        let protocol = match parts.first() {
            Some(p) if p.eq_ignore_ascii_case("tcp") || p.eq_ignore_ascii_case("udp") => {
                parts.remove(0).to_ascii_lowercase()
            }
            _ => "tcp".to_string(),
        };

        let parse = |p: &str| {
            p.parse::<u16>()
                .map_err(|e| format!("invalid port '{}' in '{}': {}", p, s, e))
        };

        let (host_port, container_port) = match parts.as_slice() {
            [host] => {
                let host = parse(host)?;
                (host, host)
            }
            [host, container] => (parse(host)?, parse(container)?),
            _ => return Err(format!("expected [proto:]host[:container], got '{}'", s)),
        };

        Ok(Self {
            protocol,
            host_port,
            container_port,
        })
    }
}

impl fmt::Display for ContainerPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.protocol(),
            self.host_port,
            self.container_port
        )
    }
}

/// Guest network identity handed back to the VM creator
///
/// `mac_address`, `bridge_name` and `device_name` are filled in by the
/// hypervisor layer and stay empty here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmNetworkSettings {
    pub ip_address: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub prefix_len: u8,
    pub mac_address: String,
    pub bridge_name: String,
    pub device_name: String,
}

/// Handling of partial allocations when provisioning fails midway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RollbackPolicy {
    /// Keep the reserved address and rules installed so far; a later
    /// reclaim or reconciliation pass owns the cleanup
    #[default]
    Leave,
    /// Remove rules and table entries installed by the failed call and
    /// release the address
    Unwind,
}

/// Rule installed during a provision call
struct Installed {
    rule: NatRule,
    /// Registered in the port map table as well
    mapped: bool,
}

impl Installed {
    fn container_port(&self) -> ContainerPort {
        ContainerPort::new(
            self.rule.protocol.as_str(),
            self.rule.host_port,
            self.rule.guest_port,
        )
    }
}

/// Network service for all VMs on the bridge
pub struct GuestNetwork {
    subnet: SubnetContext,
    addresses: AddressPool,
    ports: PortMapTable,
    forwarder: Arc<dyn PortForwarder>,
    /// NAT adapter rules are attached to
    rule_index: u8,
    host_ip: Option<Ipv4Addr>,
    on_failure: RollbackPolicy,
    remove_rules_on_reclaim: bool,
}

impl GuestNetwork {
    /// Initialize the bridge subnet and create the service
    ///
    /// An empty `bridge_cidr` selects the default bridge network.
    pub fn new(bridge_cidr: &str, forwarder: Arc<dyn PortForwarder>) -> Result<Self> {
        let (subnet, addresses) = SubnetContext::initialize(bridge_cidr)?;
        info!(
            "Bridge network {} ready (gateway {})",
            subnet.cidr().trunc(),
            subnet.gateway()
        );

        Ok(Self {
            subnet,
            addresses,
            ports: PortMapTable::new(),
            forwarder,
            rule_index: 1,
            host_ip: None,
            on_failure: RollbackPolicy::default(),
            remove_rules_on_reclaim: false,
        })
    }

    /// Create the service from configuration
    pub fn from_config(config: &GuestnetConfig) -> Result<Self> {
        Ok(Self::new(
            &config.network.bridge_cidr,
            config.forwarder.port_forwarder(),
        )?
        .rule_index(config.forwarder.nat_adapter)
        .host_ip(config.forwarder.host_ip)
        .on_failure(config.network.on_failure)
        .remove_rules_on_reclaim(config.network.remove_rules_on_reclaim))
    }

    /// Set the NAT adapter rules are attached to
    pub fn rule_index(mut self, index: u8) -> Self {
        self.rule_index = index;
        self
    }

    /// Bind rules to a specific host address
    pub fn host_ip(mut self, ip: Option<Ipv4Addr>) -> Self {
        self.host_ip = ip;
        self
    }

    /// Set the partial-failure policy
    pub fn on_failure(mut self, policy: RollbackPolicy) -> Self {
        self.on_failure = policy;
        self
    }

    /// Remove hypervisor rules on reclaim
    pub fn remove_rules_on_reclaim(mut self, remove: bool) -> Self {
        self.remove_rules_on_reclaim = remove;
        self
    }

    pub fn subnet(&self) -> &SubnetContext {
        &self.subnet
    }

    pub fn addresses(&self) -> &AddressPool {
        &self.addresses
    }

    pub fn ports(&self) -> &PortMapTable {
        &self.ports
    }

    /// Reserve an address for a VM and forward its container ports
    ///
    /// The first failing port aborts the call; remaining ports are not
    /// attempted. Under [`RollbackPolicy::Unwind`] the partial allocation is
    /// undone and the cause returned. Under [`RollbackPolicy::Leave`] the
    /// cause is wrapped in [`Error::Incomplete`], which names the address and
    /// ports still held so they can be recorded and reclaimed later.
    #[instrument(skip(self, ports), fields(ports = ports.len()))]
    pub fn provision(
        &self,
        vm_id: &str,
        requested_ip: Option<Ipv4Addr>,
        ports: &[ContainerPort],
    ) -> Result<VmNetworkSettings> {
        validate_vm_id(vm_id)?;
        let ip = self.addresses.reserve(requested_ip)?;
        info!("Reserved {} for VM {}", ip, vm_id);

        let mut installed = Vec::with_capacity(ports.len());
        for port in ports {
            if let Err(e) = self.setup_port_map(vm_id, ip, port, &mut installed) {
                error!("Setup port map failed for VM {}: {}", vm_id, e);
                if self.on_failure == RollbackPolicy::Unwind {
                    self.unwind(vm_id, ip, &installed);
                    return Err(e);
                }
                return Err(self.incomplete(vm_id, ip, &installed, e));
            }
        }

        Ok(VmNetworkSettings {
            ip_address: ip,
            gateway: self.subnet.gateway(),
            prefix_len: self.subnet.prefix_len(),
            mac_address: String::new(),
            bridge_name: String::new(),
            device_name: String::new(),
        })
    }

    fn setup_port_map(
        &self,
        vm_id: &str,
        ip: Ipv4Addr,
        port: &ContainerPort,
        installed: &mut Vec<Installed>,
    ) -> Result<()> {
        let protocol = port.protocol();
        let rule = NatRule::new(vm_id, protocol, port.host_port, ip, port.container_port)
            .with_host_ip(self.host_ip);

        self.forwarder
            .set_port_forward_rule(vm_id, self.rule_index, &rule)?;
        installed.push(Installed {
            rule,
            mapped: false,
        });

        self.ports
            .allocate_map(protocol, port.host_port, ip, port.container_port, vm_id)?;
        if let Some(last) = installed.last_mut() {
            last.mapped = true;
        }

        debug!(
            "Forwarding {}/{} -> {}:{}",
            port.host_port, protocol, ip, port.container_port
        );
        Ok(())
    }

    fn incomplete(&self, vm_id: &str, ip: Ipv4Addr, installed: &[Installed], e: Error) -> Error {
        for entry in installed.iter().filter(|entry| !entry.mapped) {
            warn!(
                "NAT rule {} installed without a port map; it is dropped with the VM",
                entry.rule.name
            );
        }

        Error::Incomplete {
            vm: vm_id.to_string(),
            ip,
            installed: installed
                .iter()
                .filter(|entry| entry.mapped)
                .map(Installed::container_port)
                .collect(),
            source: Box::new(e),
        }
    }

    fn unwind(&self, vm_id: &str, ip: Ipv4Addr, installed: &[Installed]) {
        for entry in installed.iter().rev() {
            if entry.mapped {
                let rule = &entry.rule;
                if let Err(e) = self.ports.release_map(rule.protocol, rule.host_port) {
                    warn!("Unwind of port map {} failed: {}", rule.name, e);
                }
            }
            if let Err(e) =
                self.forwarder
                    .remove_port_forward_rule(vm_id, self.rule_index, &entry.rule.name)
            {
                warn!("Unwind of NAT rule {} failed: {}", entry.rule.name, e);
            }
        }

        if let Err(e) = self.addresses.release(ip) {
            warn!("Unwind of address {} failed: {}", ip, e);
        } else {
            info!("Released {} after failed provisioning of VM {}", ip, vm_id);
        }
    }

    /// Release a VM's address and port claims
    ///
    /// The address release must succeed; its error is returned before any
    /// port is touched. Port releases are best-effort.
    #[instrument(skip(self, ports), fields(ports = ports.len()))]
    pub fn reclaim(&self, vm_id: &str, ip: Ipv4Addr, ports: &[ContainerPort]) -> Result<()> {
        validate_vm_id(vm_id)?;
        self.addresses.release(ip)?;
        info!("Released {} from VM {}", ip, vm_id);

        let released = self.release_port_maps(vm_id, ports);
        debug!("Released {} of {} port maps", released, ports.len());

        Ok(())
    }

    /// Release port claims, logging and skipping the ones not held
    fn release_port_maps(&self, vm_id: &str, ports: &[ContainerPort]) -> usize {
        let mut released = 0;

        for port in ports {
            let protocol = port.protocol();
            debug!("Release port map {}/{}", port.host_port, protocol);

            match self.ports.release_map(protocol, port.host_port) {
                Ok(_) => released += 1,
                Err(e) if e.is_not_allocated() => {
                    warn!("Port map for VM {} already gone: {}", vm_id, e);
                }
                Err(e) => {
                    warn!("Failed to release port map for VM {}: {}", vm_id, e);
                }
            }

            if self.remove_rules_on_reclaim {
                let name = NatRule::rule_name(vm_id, protocol, port.host_port);
                if let Err(e) =
                    self.forwarder
                        .remove_port_forward_rule(vm_id, self.rule_index, &name)
                {
                    warn!("Failed to remove NAT rule {}: {}", name, e);
                }
            }
        }

        released
    }

    /// Re-register a VM's existing claims without touching the hypervisor
    ///
    /// Used to rebuild state from recorded leases.
    pub fn restore(&self, vm_id: &str, ip: Ipv4Addr, ports: &[ContainerPort]) -> Result<()> {
        validate_vm_id(vm_id)?;
        self.addresses.reserve(Some(ip))?;

        for port in ports {
            self.ports.allocate_map(
                port.protocol(),
                port.host_port,
                ip,
                port.container_port,
                vm_id,
            )?;
        }

        debug!("Restored lease {} for VM {}", ip, vm_id);
        Ok(())
    }
}
