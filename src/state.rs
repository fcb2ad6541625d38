//! Lease state for VMs provisioned by the CLI
//!
//! One lease per VM is kept in a JSON file so provision and reclaim can run
//! as separate invocations. Loading the file replays every lease into a
//! fresh [`GuestNetwork`].
//!
//! Invocations serialize on an exclusive flock of `<state>.lock`, held from
//! before the load until after the save.

use crate::error::{Error, Result};
use crate::provision::{ContainerPort, GuestNetwork};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process;
use tracing::debug;

/// Path next to the state file with a suffix appended
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Exclusive lock on a state file
///
/// Released when dropped or when the process exits.
pub struct StateLock {
    _lock: Flock<File>,
}

impl StateLock {
    /// Block until the state file is exclusively ours
    pub fn acquire(path: &Path) -> Result<Self> {
        let lock_path = sibling(path, ".lock");
        ensure_parent(&lock_path)?;

        let file = File::options()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| Error::StateRead {
                path: lock_path.clone(),
                source: e,
            })?;

        let lock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            Error::StateLock {
                path: lock_path.clone(),
                source: errno,
            }
        })?;
        debug!("Locked {}", lock_path.display());

        Ok(Self { _lock: lock })
    }
}

/// Address and ports held by one VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
}

/// Leases keyed by VM id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseBook {
    #[serde(default)]
    leases: BTreeMap<String, Lease>,
}

impl LeaseBook {
    /// Load leases from a file; a missing file is an empty book
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No state file at {}", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(Error::StateRead {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };

        Ok(serde_json::from_str(&content)?)
    }

    /// Write leases to a file, replacing it atomically
    ///
    /// Callers sharing the file hold a [`StateLock`] across load and save.
    pub fn save(&self, path: &Path) -> Result<()> {
        ensure_parent(path)?;

        let tmp = sibling(path, &format!(".{}.tmp", process::id()));
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Replay every lease into a network
    pub fn restore_into(&self, network: &GuestNetwork) -> Result<()> {
        for (vm_id, lease) in &self.leases {
            network.restore(vm_id, lease.ip, &lease.ports)?;
        }
        Ok(())
    }

    /// Record a new lease
    pub fn insert(&mut self, vm_id: &str, lease: Lease) -> Result<()> {
        if self.leases.contains_key(vm_id) {
            return Err(Error::LeaseExists(vm_id.to_string()));
        }
        self.leases.insert(vm_id.to_string(), lease);
        Ok(())
    }

    /// Record what a partially failed provision still holds
    ///
    /// Errors other than [`Error::Incomplete`] hold nothing and are ignored.
    pub fn record_incomplete(&mut self, err: &Error) -> Result<()> {
        if let Error::Incomplete {
            vm, ip, installed, ..
        } = err
        {
            self.insert(
                vm,
                Lease {
                    ip: *ip,
                    ports: installed.clone(),
                },
            )?;
        }
        Ok(())
    }

    /// Fail if a VM already holds a lease
    pub fn ensure_absent(&self, vm_id: &str) -> Result<()> {
        if self.leases.contains_key(vm_id) {
            return Err(Error::LeaseExists(vm_id.to_string()));
        }
        Ok(())
    }

    pub fn get(&self, vm_id: &str) -> Option<&Lease> {
        self.leases.get(vm_id)
    }

    pub fn remove(&mut self, vm_id: &str) -> Option<Lease> {
        self.leases.remove(vm_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Lease)> {
        self.leases.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{DryRun, Protocol};
    use std::sync::Arc;

    fn lease(last: u8, ports: Vec<ContainerPort>) -> Lease {
        Lease {
            ip: Ipv4Addr::new(10, 0, 0, last),
            ports,
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let book = LeaseBook::load(&dir.path().join("state.json")).unwrap();
        assert!(book.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut book = LeaseBook::default();
        book.insert("vm1", lease(20, vec![ContainerPort::new("tcp", 2222, 22)]))
            .unwrap();
        book.insert("vm2", lease(21, Vec::new())).unwrap();
        book.save(&path).unwrap();

        let loaded = LeaseBook::load(&path).unwrap();
        assert_eq!(loaded, book);
        assert_eq!(loaded.get("vm1").unwrap().ports[0].host_port, 2222);
    }

    #[test]
    fn test_duplicate_lease() {
        let mut book = LeaseBook::default();
        book.insert("vm1", lease(20, Vec::new())).unwrap();

        assert!(matches!(
            book.insert("vm1", lease(21, Vec::new())),
            Err(Error::LeaseExists(_))
        ));
        assert!(book.ensure_absent("vm1").is_err());
        assert!(book.ensure_absent("vm2").is_ok());
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut book = LeaseBook::default();
        book.insert("vm1", lease(20, Vec::new())).unwrap();
        book.save(&path).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["state.json".to_string()]);
    }

    #[test]
    fn test_lock_serializes_provisioning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        // Each thread plays one CLI invocation: lock, load, replay,
        // provision, record, save.
        let addrs: Vec<Ipv4Addr> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let path = &path;
                    s.spawn(move || {
                        let _lock = StateLock::acquire(path).unwrap();
                        let mut book = LeaseBook::load(path).unwrap();
                        let network =
                            GuestNetwork::new("10.0.0.0/24", Arc::new(DryRun)).unwrap();
                        book.restore_into(&network).unwrap();

                        let vm = format!("vm{}", i);
                        let settings = network.provision(&vm, None, &[]).unwrap();
                        book.insert(
                            &vm,
                            Lease {
                                ip: settings.ip_address,
                                ports: Vec::new(),
                            },
                        )
                        .unwrap();
                        book.save(path).unwrap();
                        settings.ip_address
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut unique = addrs.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 4, "duplicate addresses: {:?}", addrs);

        let book = LeaseBook::load(&path).unwrap();
        assert_eq!(book.iter().count(), 4);
    }

    #[test]
    fn test_incomplete_provision_recorded_and_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let ports = vec![
            ContainerPort::new("tcp", 8080, 80),
            ContainerPort::new("tcp", 0, 90),
        ];

        let network = GuestNetwork::new("10.0.0.0/24", Arc::new(DryRun)).unwrap();
        let mut book = LeaseBook::default();
        let err = network.provision("vm1", None, &ports).unwrap_err();
        book.record_incomplete(&err).unwrap();
        book.save(&path).unwrap();

        let lease = book.get("vm1").unwrap();
        assert_eq!(lease.ports, vec![ContainerPort::new("tcp", 8080, 80)]);

        let fresh = GuestNetwork::new("10.0.0.0/24", Arc::new(DryRun)).unwrap();
        let mut book = LeaseBook::load(&path).unwrap();
        book.restore_into(&fresh).unwrap();
        let lease = book.remove("vm1").unwrap();

        fresh.reclaim("vm1", lease.ip, &lease.ports).unwrap();
        assert!(fresh.ports().is_empty());
        assert_eq!(fresh.addresses().leased_count(), 0);
    }

    #[test]
    fn test_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();

        assert!(matches!(LeaseBook::load(&path), Err(Error::Json(_))));
    }

    #[test]
    fn test_restore_into_network() {
        let network = GuestNetwork::new("10.0.0.0/24", Arc::new(DryRun)).unwrap();
        let mut book = LeaseBook::default();
        book.insert("vm1", lease(15, vec![ContainerPort::new("udp", 5353, 53)]))
            .unwrap();
        book.restore_into(&network).unwrap();

        assert!(network.addresses().is_allocated(&Ipv4Addr::new(10, 0, 0, 15)));
        assert!(network.ports().get(Protocol::Udp, 5353).is_some());

        // Next provision skips the restored address
        let settings = network.provision("vm2", None, &[]).unwrap();
        assert_eq!(settings.ip_address, Ipv4Addr::new(10, 0, 0, 16));
    }

    #[test]
    fn test_restore_conflicting_leases() {
        let network = GuestNetwork::new("10.0.0.0/24", Arc::new(DryRun)).unwrap();
        let mut book = LeaseBook::default();
        book.insert("vm1", lease(20, Vec::new())).unwrap();
        book.insert("vm2", lease(20, Vec::new())).unwrap();

        assert!(matches!(
            book.restore_into(&network),
            Err(Error::AddressInUse(_))
        ));
    }
}
