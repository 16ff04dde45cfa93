//! Device-transfer protocol
//!
//! Moves PCI functions between the host driver and a guest. The sysfs
//! driver-override nodes are global mutable state, so every access goes
//! through a process-wide lock keyed by PCI address. Hot-attach retries
//! transient daemon refusals with backoff; detach timeouts park the address
//! in a persisted pending-release set that a later readiness sweep retries.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::domain::virsh::Virsh;
use crate::domain::xml;
use crate::error::{Error, Result};
use crate::hardware::PciAddress;

/// Stub driver that hands the device to userspace virtualization.
pub const STUB_DRIVER: &str = "vfio-pci";

/// Hot-attach retry policy: two retries on DeviceBusy, doubling delay.
const ATTACH_RETRIES: u32 = 2;
const ATTACH_BACKOFF: Duration = Duration::from_millis(250);
/// How long a detach may take before it is parked for deferred release.
pub const DETACH_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Per-address serialization of driver_override/bind/unbind traffic.
static ADDRESS_LOCKS: Lazy<Mutex<HashMap<String, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn address_lock(address: &str) -> Arc<Mutex<()>> {
    let mut map = ADDRESS_LOCKS.lock().expect("address lock map poisoned");
    map.entry(address.to_string()).or_default().clone()
}

/// Sysfs-level rebind operations for one host.
pub struct TransferProtocol {
    sysfs_root: PathBuf,
}

impl TransferProtocol {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self { sysfs_root: sysfs_root.into() }
    }

    pub fn system() -> Self {
        Self::new("/sys")
    }

    fn device_dir(&self, address: &str) -> PathBuf {
        self.sysfs_root.join("bus/pci/devices").join(address)
    }

    /// The driver currently bound to the function, if any.
    pub fn current_driver(&self, address: &str) -> Option<String> {
        fs::read_link(self.device_dir(address).join("driver"))
            .ok()
            .and_then(|t| t.file_name().map(|n| n.to_string_lossy().into_owned()))
    }

    pub fn device_exists(&self, address: &str) -> bool {
        self.device_dir(address).is_dir()
    }

    /// Make sure the function is bound to the stub. Already-bound functions
    /// are left alone; anything else is detached from its driver and probed
    /// with the override set.
    pub fn ensure_stub_bound(&self, address: &str) -> Result<()> {
        let lock = address_lock(address);
        let _guard = lock.lock().expect("address lock poisoned");

        if !self.device_exists(address) {
            return Err(Error::DeviceMissing(address.to_string()));
        }
        if self.current_driver(address).as_deref() == Some(STUB_DRIVER) {
            return Ok(());
        }

        log::info!("rebinding {} to {}", address, STUB_DRIVER);
        self.write_override(address, STUB_DRIVER)?;
        self.unbind_current(address)?;
        self.probe(address)?;

        match self.current_driver(address) {
            Some(driver) if driver == STUB_DRIVER => Ok(()),
            other => Err(Error::DeviceBusy(format!(
                "{} bound to {} after probe",
                address,
                other.as_deref().unwrap_or("nothing")
            ))),
        }
    }

    /// Return the function to kernel driver matching: clear the override,
    /// unbind the stub, reprobe.
    pub fn release_to_host(&self, address: &str) -> Result<()> {
        let lock = address_lock(address);
        let _guard = lock.lock().expect("address lock poisoned");

        if !self.device_exists(address) {
            return Err(Error::DeviceMissing(address.to_string()));
        }

        log::info!("releasing {} back to host drivers", address);
        self.write_override(address, "")?;
        self.unbind_current(address)?;
        self.probe(address)
    }

    fn write_override(&self, address: &str, driver: &str) -> Result<()> {
        let path = self.device_dir(address).join("driver_override");
        // An empty override must be written as a bare newline to clear it.
        let contents = if driver.is_empty() { "\n".to_string() } else { format!("{}\n", driver) };
        fs::write(&path, contents).map_err(|e| Error::io(&path, e))
    }

    fn unbind_current(&self, address: &str) -> Result<()> {
        let unbind = self.device_dir(address).join("driver/unbind");
        if !unbind.exists() {
            return Ok(());
        }
        fs::write(&unbind, address).map_err(|e| Error::io(&unbind, e))
    }

    fn probe(&self, address: &str) -> Result<()> {
        let probe = self.sysfs_root.join("bus/pci/drivers_probe");
        fs::write(&probe, address).map_err(|e| Error::io(&probe, e))
    }
}

/// Attach a function to a running domain, retrying transient refusals.
/// Success is confirmed against the daemon's device list, not assumed.
pub fn hot_attach(virsh: &Virsh, domain: &str, address: &PciAddress) -> Result<()> {
    let fragment = xml::render_hostdev(address)?;
    let mut delay = ATTACH_BACKOFF;

    for attempt in 0..=ATTACH_RETRIES {
        match virsh.attach_device_live(domain, &fragment) {
            Ok(()) => {
                return confirm_attached(virsh, domain, address, true);
            }
            Err(e) if e.is_transient() && attempt < ATTACH_RETRIES => {
                log::warn!(
                    "hot-attach of {} to {} refused ({}); retrying in {:?}",
                    address,
                    domain,
                    e,
                    delay
                );
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::Bug("attach retry loop exited without verdict".into()))
}

/// Detach a function from a running domain within [`DETACH_TIMEOUT`].
pub fn hot_detach(virsh: &Virsh, domain: &str, address: &PciAddress) -> Result<()> {
    let fragment = xml::render_hostdev(address)?;
    virsh.detach_device_live(domain, &fragment)?;
    confirm_attached(virsh, domain, address, false)
}

/// Poll the domain's device list until `address` is (or is no longer)
/// present.
fn confirm_attached(
    virsh: &Virsh,
    domain: &str,
    address: &PciAddress,
    want_present: bool,
) -> Result<()> {
    let wanted = address.to_string();
    let deadline = Instant::now() + DETACH_TIMEOUT;

    loop {
        let attached = xml::parse_attached_pci(&virsh.dumpxml(domain)?)?;
        if attached.contains(&wanted) == want_present {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::TimedOut {
                operation: format!(
                    "{} {} on {}",
                    if want_present { "attach" } else { "detach" },
                    wanted,
                    domain
                ),
                seconds: DETACH_TIMEOUT.as_secs(),
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Addresses whose release back to the host is still owed.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PendingReleases {
    addresses: Vec<String>,
}

impl PendingReleases {
    pub fn load(path: &Path) -> Self {
        fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::parse("pending releases", e.to_string()))?;
        fs::write(path, json + "\n").map_err(|e| Error::io(path, e))
    }

    pub fn add(&mut self, address: &str) {
        if !self.addresses.iter().any(|a| a == address) {
            self.addresses.push(address.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Retry every parked release; addresses that succeed leave the set.
    pub fn sweep(&mut self, transfer: &TransferProtocol) {
        self.addresses.retain(|address| match transfer.release_to_host(address) {
            Ok(()) => {
                log::info!("deferred release of {} completed", address);
                false
            }
            Err(Error::DeviceMissing(_)) => {
                // Gone from the bus; nothing left to release.
                false
            }
            Err(e) => {
                log::warn!("deferred release of {} still failing: {}", address, e);
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fake sysfs with writable override/unbind/probe nodes. The probe
    /// "binds" to the override target by rewriting the driver symlink.
    fn fake_sysfs(address: &str, driver: Option<&str>) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let dev = root.path().join("bus/pci/devices").join(address);
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("driver_override"), "\n").unwrap();
        fs::write(root.path().join("bus/pci/drivers_probe"), "").unwrap();
        if let Some(driver) = driver {
            let drv_dir = root.path().join("bus/pci/drivers").join(driver);
            fs::create_dir_all(&drv_dir).unwrap();
            std::os::unix::fs::symlink(&drv_dir, dev.join("driver")).unwrap();
            fs::write(dev.join("driver").join("unbind"), "").unwrap();
        }
        root
    }

    #[test]
    fn missing_device_is_device_missing() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("bus/pci/devices")).unwrap();
        let transfer = TransferProtocol::new(root.path());
        assert!(matches!(
            transfer.ensure_stub_bound("0000:01:00.0"),
            Err(Error::DeviceMissing(_))
        ));
    }

    #[test]
    fn already_stub_bound_is_a_no_op() {
        let root = fake_sysfs("0000:01:00.0", Some(STUB_DRIVER));
        let transfer = TransferProtocol::new(root.path());
        transfer.ensure_stub_bound("0000:01:00.0").unwrap();
        assert_eq!(transfer.current_driver("0000:01:00.0").as_deref(), Some(STUB_DRIVER));
    }

    #[test]
    fn override_written_before_unbind() {
        let root = fake_sysfs("0000:01:00.0", Some("nouveau"));
        let transfer = TransferProtocol::new(root.path());

        // The probe in this fake tree does not rebind, so the sequence ends
        // reporting the device unbound; the override file must still carry
        // the stub name.
        let result = transfer.ensure_stub_bound("0000:01:00.0");
        assert!(matches!(result, Err(Error::DeviceBusy(_))));

        let wrote = fs::read_to_string(
            root.path().join("bus/pci/devices/0000:01:00.0/driver_override"),
        )
        .unwrap();
        assert_eq!(wrote, "vfio-pci\n");
    }

    #[test]
    fn pending_releases_round_trip_and_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/pending-release.json");

        let mut pending = PendingReleases::default();
        pending.add("0000:01:00.0");
        pending.add("0000:01:00.0");
        pending.add("0000:01:00.1");
        assert_eq!(pending.addresses().len(), 2);

        pending.save(&path).unwrap();
        let loaded = PendingReleases::load(&path);
        assert_eq!(loaded.addresses(), pending.addresses());
    }

    #[test]
    fn sweep_drops_vanished_devices() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("bus/pci/devices")).unwrap();
        let transfer = TransferProtocol::new(root.path());

        let mut pending = PendingReleases::default();
        pending.add("0000:09:00.0");
        pending.sweep(&transfer);
        assert!(pending.is_empty());
    }
}
