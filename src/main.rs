//! guestnet - VM address and NAT port-forward manager
//!
//! Reserves bridge addresses for VMs and installs their host port
//! forwards through the hypervisor's NAT.

mod cli;

use cli::{Cli, Commands};
use guestnet::error::{Error, Result};
use guestnet::manifest::{self, GuestnetConfig};
use guestnet::network::subnet::RESERVED_BLOCK;
use guestnet::state::{Lease, LeaseBook, StateLock};
use guestnet::{logging, GuestNetwork};
use serde_json::json;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Lock the state file, build the network and replay recorded leases
///
/// The returned lock must outlive any later save.
fn open(config: &GuestnetConfig) -> Result<(StateLock, GuestNetwork, LeaseBook)> {
    let lock = StateLock::acquire(&config.state.path)?;
    let network = GuestNetwork::from_config(config)?;
    let book = LeaseBook::load(&config.state.path)?;
    book.restore_into(&network)?;
    Ok((lock, network, book))
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();
    logging::init(cli.verbose);

    match cli.command {
        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
        }

        Commands::Check => {
            let config = manifest::load(&cli.config)?;
            let network = GuestNetwork::from_config(&config)?;
            let subnet = network.subnet();
            let (first, last) = subnet.reserved_range();

            println!("Configuration is valid.");
            println!("  Bridge:   {}", config.network.bridge_name);
            println!("  Subnet:   {}", subnet.cidr().trunc());
            println!("  Gateway:  {}", subnet.gateway());
            println!("  Reserved: {} - {} ({} addresses)", first, last, RESERVED_BLOCK);
            println!("  Free:     {}", network.addresses().available_count());
            println!(
                "  Backend:  {:?} (natpf{})",
                config.forwarder.backend, config.forwarder.nat_adapter
            );
        }

        Commands::Provision { vm, ip, ports, json } => {
            let config = manifest::load(&cli.config)?;
            let (_lock, network, mut book) = open(&config)?;
            book.ensure_absent(&vm)?;

            let settings = match network.provision(&vm, ip, &ports) {
                Ok(settings) => settings,
                Err(e) => {
                    book.record_incomplete(&e)?;
                    book.save(&config.state.path)?;
                    return Err(e);
                }
            };
            book.insert(
                &vm,
                Lease {
                    ip: settings.ip_address,
                    ports: ports.clone(),
                },
            )?;
            book.save(&config.state.path)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&settings)?);
            } else {
                println!("Provisioned VM '{}':", vm);
                println!("  Address: {}/{}", settings.ip_address, settings.prefix_len);
                println!("  Gateway: {}", settings.gateway);
                for port in &ports {
                    println!(
                        "  Forward: {}/{} -> {}:{}",
                        port.host_port,
                        port.protocol(),
                        settings.ip_address,
                        port.container_port
                    );
                }
            }
        }

        Commands::Reclaim { vm, ip, ports } => {
            let config = manifest::load(&cli.config)?;
            let (_lock, network, mut book) = open(&config)?;
            let lease = book.get(&vm).cloned();

            let ip = ip
                .or(lease.as_ref().map(|l| l.ip))
                .ok_or_else(|| Error::LeaseNotFound(vm.clone()))?;
            let ports = match (ports.is_empty(), lease) {
                (true, Some(lease)) => lease.ports,
                (_, _) => ports,
            };

            network.reclaim(&vm, ip, &ports)?;
            book.remove(&vm);
            book.save(&config.state.path)?;

            println!("Reclaimed {} from VM '{}'", ip, vm);
        }

        Commands::Status { json } => {
            let config = manifest::load(&cli.config)?;
            let (_lock, network, book) = open(&config)?;
            let mappings = network.ports().list();

            if json {
                let mut leases = serde_json::Map::new();
                for (vm, lease) in book.iter() {
                    leases.insert(vm.clone(), serde_json::to_value(lease)?);
                }
                let status = json!({
                    "subnet": network.subnet().cidr().trunc().to_string(),
                    "gateway": network.subnet().gateway(),
                    "leased": network.addresses().leased_count(),
                    "available": network.addresses().available_count(),
                    "leases": leases,
                    "port_maps": mappings,
                });
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }

            println!(
                "Subnet {} (gateway {}): {} leased, {} free",
                network.subnet().cidr().trunc(),
                network.subnet().gateway(),
                network.addresses().leased_count(),
                network.addresses().available_count()
            );

            println!("\n{:<20} {:<16} {}", "VM", "ADDRESS", "PORTS");
            println!("{}", "-".repeat(60));
            if book.is_empty() {
                println!("No leases recorded.");
            }
            for (vm, lease) in book.iter() {
                let ports: Vec<String> = lease.ports.iter().map(|p| p.to_string()).collect();
                println!("{:<20} {:<16} {}", vm, lease.ip, ports.join(", "));
            }

            println!("\n{:<20} {:<8} {:<10} {}", "VM", "PROTO", "HOST", "GUEST");
            println!("{}", "-".repeat(60));
            if mappings.is_empty() {
                println!("No port forwards configured.");
            }
            for m in mappings {
                println!(
                    "{:<20} {:<8} {:<10} {}",
                    m.vm_id,
                    m.protocol,
                    m.host_port,
                    format!("{}:{}", m.guest_ip, m.guest_port)
                );
            }
        }
    }

    Ok(())
}
