//! Hypervisor NAT port-forward rules
//!
//! The hypervisor owns the actual host-to-guest redirect. This module defines
//! the seam to it and a VirtualBox backend that drives `VBoxManage`.

use super::ports::Protocol;
use crate::error::{Error, Result};
use std::net::Ipv4Addr;
use std::process::Command;
use tracing::{debug, info};

/// Check that a VM id can be embedded in a rule name
///
/// `--natpf` arguments are comma-separated, so ids with commas or control
/// characters would shift the rule fields.
pub fn validate_vm_id(vm_id: &str) -> Result<()> {
    if vm_id.is_empty() || vm_id.chars().any(|c| c == ',' || c.is_control()) {
        return Err(Error::InvalidConfig(format!(
            "Invalid VM id '{}'",
            vm_id.escape_debug()
        )));
    }
    Ok(())
}

/// NAT port-forward rule as understood by the hypervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    /// Rule name, unique per VM and adapter
    pub name: String,
    pub protocol: Protocol,
    /// Bind to a specific host address (None = all interfaces)
    pub host_ip: Option<Ipv4Addr>,
    pub host_port: u16,
    pub guest_ip: Ipv4Addr,
    pub guest_port: u16,
}

impl NatRule {
    /// Create a rule named after the VM, protocol and host port
    pub fn new(
        vm_id: &str,
        protocol: Protocol,
        host_port: u16,
        guest_ip: Ipv4Addr,
        guest_port: u16,
    ) -> Self {
        Self {
            name: Self::rule_name(vm_id, protocol, host_port),
            protocol,
            host_ip: None,
            host_port,
            guest_ip,
            guest_port,
        }
    }

    /// Bind to a specific host address
    pub fn with_host_ip(mut self, ip: Option<Ipv4Addr>) -> Self {
        self.host_ip = ip;
        self
    }

    /// Name used for a VM's rule on a host port
    pub fn rule_name(vm_id: &str, protocol: Protocol, host_port: u16) -> String {
        format!("{}-{}-{}", vm_id, protocol, host_port)
    }

    /// Render as a VirtualBox `--natpf` argument
    ///
    /// Format: `name,proto,hostip,hostport,guestip,guestport`
    pub fn to_natpf_arg(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.name,
            self.protocol,
            self.host_ip.map(|ip| ip.to_string()).unwrap_or_default(),
            self.host_port,
            self.guest_ip,
            self.guest_port
        )
    }
}

/// Hypervisor NAT interface
///
/// Calls are synchronous and are not retried here.
pub trait PortForwarder: Send + Sync {
    /// Install a rule on NAT adapter `rule_index` of a VM
    fn set_port_forward_rule(&self, vm_id: &str, rule_index: u8, rule: &NatRule) -> Result<()>;

    /// Remove a named rule from NAT adapter `rule_index` of a VM
    fn remove_port_forward_rule(&self, vm_id: &str, rule_index: u8, name: &str) -> Result<()>;
}

/// VirtualBox backend driving the `VBoxManage` CLI
#[derive(Debug, Clone)]
pub struct VBoxManage {
    /// Path to the VBoxManage binary
    program: String,
}

impl VBoxManage {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn modifyvm(&self, vm_id: &str, args: &[String]) -> Result<()> {
        debug!("{} modifyvm {} {}", self.program, vm_id, args.join(" "));

        let output = Command::new(&self.program)
            .arg("modifyvm")
            .arg(vm_id)
            .args(args)
            .output()
            .map_err(|e| Error::CommandFailed {
                command: self.program.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Forwarder {
                vm: vm_id.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(())
    }
}

impl Default for VBoxManage {
    fn default() -> Self {
        Self::new("VBoxManage")
    }
}

impl PortForwarder for VBoxManage {
    fn set_port_forward_rule(&self, vm_id: &str, rule_index: u8, rule: &NatRule) -> Result<()> {
        self.modifyvm(
            vm_id,
            &[format!("--natpf{}", rule_index), rule.to_natpf_arg()],
        )
    }

    fn remove_port_forward_rule(&self, vm_id: &str, rule_index: u8, name: &str) -> Result<()> {
        self.modifyvm(
            vm_id,
            &[
                format!("--natpf{}", rule_index),
                "delete".to_string(),
                name.to_string(),
            ],
        )
    }
}

/// Backend that only logs the rules it would install
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRun;

impl PortForwarder for DryRun {
    fn set_port_forward_rule(&self, vm_id: &str, rule_index: u8, rule: &NatRule) -> Result<()> {
        info!(
            "[dry-run] {}: natpf{} {}",
            vm_id,
            rule_index,
            rule.to_natpf_arg()
        );
        Ok(())
    }

    fn remove_port_forward_rule(&self, vm_id: &str, rule_index: u8, name: &str) -> Result<()> {
        info!("[dry-run] {}: natpf{} delete {}", vm_id, rule_index, name);
        Ok(())
    }
}
