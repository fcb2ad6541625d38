//! Command-line interface for guestnet
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use guestnet::ContainerPort;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// guestnet - VM address and NAT port-forward manager
#[derive(Parser)]
#[command(name = "guestnet")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "guestnet.toml")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Validate configuration and show the bridge subnet
    Check,

    /// Reserve an address for a VM and forward its ports
    Provision {
        /// VM name or ID
        vm: String,

        /// Guest address (auto-assigned if not specified)
        #[arg(long)]
        ip: Option<Ipv4Addr>,

        /// Port forward as [proto:]host[:container] (repeatable)
        #[arg(short, long = "port")]
        ports: Vec<ContainerPort>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Release a VM's address and port forwards
    Reclaim {
        /// VM name or ID
        vm: String,

        /// Guest address (defaults to the recorded lease)
        #[arg(long)]
        ip: Option<Ipv4Addr>,

        /// Port forward as [proto:]host[:container] (defaults to the recorded lease)
        #[arg(short, long = "port")]
        ports: Vec<ContainerPort>,
    },

    /// Show leases, address usage and port forwards
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "guestnet", &mut std::io::stdout());
    }
}
