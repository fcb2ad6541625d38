//! Configuration file parsing for guestnet
//!
//! Parses `guestnet.toml` configuration files using serde

use crate::error::{Error, Result};
use crate::network::subnet::DEFAULT_BRIDGE_NAME;
use crate::network::{DryRun, PortForwarder, VBoxManage};
use crate::provision::RollbackPolicy;
use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Load configuration from a file
///
/// A missing file yields the defaults.
pub fn load(path: &Path) -> Result<GuestnetConfig> {
    if !path.exists() {
        debug!("Config {} not found, using defaults", path.display());
        let config = GuestnetConfig::default();
        config.validate()?;
        return Ok(config);
    }

    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: GuestnetConfig = toml::from_str(&content)?;
    config.validate()?;

    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuestnetConfig {
    /// Bridge network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Hypervisor NAT backend
    #[serde(default)]
    pub forwarder: ForwarderConfig,

    /// Lease state persistence
    #[serde(default)]
    pub state: StateConfig,
}

impl GuestnetConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(1..=8).contains(&self.forwarder.nat_adapter) {
            return Err(Error::InvalidConfig(format!(
                "nat_adapter must be between 1 and 8, got {}",
                self.forwarder.nat_adapter
            )));
        }

        if self.forwarder.vboxmanage.trim().is_empty() {
            return Err(Error::InvalidConfig("vboxmanage path is empty".into()));
        }

        if self.state.path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("state path is empty".into()));
        }

        Ok(())
    }
}

/// Bridge network settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Bridge CIDR (empty selects the built-in default)
    pub bridge_cidr: String,

    /// Bridge interface name (informational)
    pub bridge_name: String,

    /// What to do with partial allocations when provisioning fails
    pub on_failure: RollbackPolicy,

    /// Remove hypervisor rules on reclaim instead of leaving them to VM teardown
    pub remove_rules_on_reclaim: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge_cidr: String::new(),
            bridge_name: DEFAULT_BRIDGE_NAME.to_string(),
            on_failure: RollbackPolicy::default(),
            remove_rules_on_reclaim: false,
        }
    }
}

/// NAT backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// VirtualBox via VBoxManage
    #[default]
    Vboxmanage,
    /// Log rules without installing them
    DryRun,
}

/// Hypervisor NAT backend settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    pub backend: Backend,

    /// VBoxManage binary
    pub vboxmanage: String,

    /// NAT adapter the rules are attached to (1-8)
    pub nat_adapter: u8,

    /// Host address rules bind to (None = all interfaces)
    pub host_ip: Option<Ipv4Addr>,
}

impl ForwarderConfig {
    /// Build the configured backend
    pub fn port_forwarder(&self) -> Arc<dyn PortForwarder> {
        match self.backend {
            Backend::Vboxmanage => Arc::new(VBoxManage::new(self.vboxmanage.clone())),
            Backend::DryRun => Arc::new(DryRun),
        }
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            vboxmanage: "VBoxManage".to_string(),
            nat_adapter: 1,
            host_ip: None,
        }
    }
}

/// Lease state persistence settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// JSON file holding one lease per VM
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("guestnet-state.json"),
        }
    }
}
