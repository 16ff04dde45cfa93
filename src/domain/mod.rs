//! Domain lifecycle control
//!
//! CRUD over virtual domains through the virtualization daemon, plus the
//! start/stop orchestration that ties the shared display region, the
//! device-transfer protocol and the daemon together. All per-domain
//! operations are serialized by a controller-held mutex; operations on
//! different domains run in parallel.

pub mod qemu_img;
pub mod transfer;
pub mod virsh;
pub mod xml;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::{Config, ProfileStore, VmProfile};
use crate::display::SharedRegion;
use crate::error::{Error, Result};
use crate::hardware::PciAddress;
use transfer::{PendingReleases, TransferProtocol};
use virsh::Virsh;

/// Longest accepted domain or snapshot name.
pub const MAX_NAME_LEN: usize = 64;

/// Names reach argv vectors, filesystem paths and XML documents; anything
/// outside this alphabet is rejected before any of those are built.
pub fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}

/// Domain lifecycle states as reported by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    Off,
    Starting,
    Running,
    Paused,
    Stopping,
    Crashed,
}

impl DomainState {
    fn from_daemon(raw: &str) -> Option<Self> {
        match raw.trim() {
            "shut off" => Some(DomainState::Off),
            "running" | "idle" => Some(DomainState::Running),
            "paused" | "pmsuspended" => Some(DomainState::Paused),
            "in shutdown" => Some(DomainState::Stopping),
            "crashed" => Some(DomainState::Crashed),
            _ => None,
        }
    }

    /// Snapshots are only meaningful when the disk/RAM state is coherent.
    pub fn allows_snapshot(self) -> bool {
        matches!(self, DomainState::Off | DomainState::Running | DomainState::Paused)
    }
}

impl std::fmt::Display for DomainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DomainState::Off => "off",
            DomainState::Starting => "starting",
            DomainState::Running => "running",
            DomainState::Paused => "paused",
            DomainState::Stopping => "stopping",
            DomainState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// One domain as the controller sees it.
#[derive(Debug, Clone, Serialize)]
pub struct Domain {
    pub name: String,
    pub uuid: String,
    pub state: DomainState,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub has_passthrough: bool,
    pub attached_pci: Vec<String>,
}

/// How `start` should bring up the display client.
pub enum DisplayLaunch<'a> {
    /// Do not spawn anything (profile disabled it, or the caller manages it)
    None,
    /// Invoked after the daemon reports the domain started; receives the
    /// profile and the shared-region path.
    Spawn(&'a dyn Fn(&VmProfile, &Path) -> Result<()>),
}

pub struct DomainController {
    config: Config,
    store: ProfileStore,
    virsh: RwLock<Virsh>,
    transfer: TransferProtocol,
    domain_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    pending: Mutex<PendingReleases>,
}

impl DomainController {
    pub fn new(config: Config) -> Self {
        let store = ProfileStore::open_default();
        let virsh = Virsh::new(config.connect_uri.clone());
        Self::with_parts(config, store, virsh, TransferProtocol::system())
    }

    /// Fully injected constructor; tests point virsh at a stub and the
    /// transfer protocol at a fabricated sysfs.
    pub fn with_parts(
        config: Config,
        store: ProfileStore,
        virsh: Virsh,
        transfer: TransferProtocol,
    ) -> Self {
        let pending = PendingReleases::load(&config.state_dir.join("pending-release.json"));
        Self {
            config,
            store,
            virsh: RwLock::new(virsh),
            transfer,
            domain_locks: Mutex::new(HashMap::new()),
            pending: Mutex::new(pending),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    fn virsh(&self) -> Virsh {
        self.virsh.read().expect("daemon handle lock poisoned").clone()
    }

    fn domain_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.domain_locks.lock().expect("domain lock map poisoned");
        locks.entry(name.to_string()).or_default().clone()
    }

    fn pending_path(&self) -> PathBuf {
        self.config.state_dir.join("pending-release.json")
    }

    // -- queries -----------------------------------------------------------

    pub fn list(&self) -> Result<Vec<Domain>> {
        let virsh = self.virsh();
        let mut domains = Vec::new();
        for name in virsh.list_names()? {
            match self.fetch(&virsh, &name) {
                Ok(domain) => domains.push(domain),
                Err(e) => log::warn!("skipping domain {}: {}", name, e),
            }
        }
        Ok(domains)
    }

    /// None when the daemon has no such domain.
    pub fn get(&self, name: &str) -> Result<Option<Domain>> {
        validate_name(name)?;
        let virsh = self.virsh();
        match self.fetch(&virsh, name) {
            Ok(domain) => Ok(Some(domain)),
            Err(e) if virsh::is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn fetch(&self, virsh: &Virsh, name: &str) -> Result<Domain> {
        let info = virsh.dominfo(name)?;
        let state_raw = info.get("State").cloned().unwrap_or_default();
        let state = DomainState::from_daemon(&state_raw)
            .ok_or_else(|| Error::parse("dominfo state", state_raw.clone()))?;

        let memory_mib = info
            .get("Max memory")
            .and_then(|v| v.split_whitespace().next())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|kib| kib / 1024)
            .unwrap_or(0);
        let vcpus = info.get("CPU(s)").and_then(|v| v.parse().ok()).unwrap_or(0);
        let uuid = info.get("UUID").cloned().unwrap_or_default();

        let attached_pci = if state == DomainState::Off {
            Vec::new()
        } else {
            xml::parse_attached_pci(&virsh.dumpxml(name)?)?
        };

        Ok(Domain {
            name: name.to_string(),
            uuid,
            state,
            memory_mib,
            vcpus,
            has_passthrough: !attached_pci.is_empty(),
            attached_pci,
        })
    }

    fn require_state(&self, name: &str, wanted: &[DomainState], operation: &str) -> Result<Domain> {
        let domain = self.get(name)?.ok_or(Error::Daemon {
            code: virsh::NOT_FOUND,
            message: format!("domain {} is not defined", name),
        })?;
        if wanted.contains(&domain.state) {
            Ok(domain)
        } else {
            Err(Error::InvalidState {
                domain: name.to_string(),
                state: domain.state.to_string(),
                operation: operation.to_string(),
            })
        }
    }

    // -- lifecycle ---------------------------------------------------------

    /// Define (or redefine) a domain from its profile. Passthrough devices
    /// are not part of the definition; they are attached at start time.
    pub fn define(&self, profile: &VmProfile) -> Result<()> {
        validate_name(&profile.name)?;
        if !profile.install_method.needs_domain() {
            return Err(Error::InvalidState {
                domain: profile.name.clone(),
                state: "not VM-backed".to_string(),
                operation: "define".to_string(),
            });
        }
        let _guard = self.domain_lock(&profile.name);
        let _held = _guard.lock().expect("domain lock poisoned");

        self.store.save(profile)?;
        self.store.ensure_channel_key(&profile.name)?;

        let disk = profile.disk_path(&self.config);
        if !disk.exists() {
            if let Some(parent) = disk.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
            qemu_img::create_disk(&disk, profile.effective_disk_gib(&self.config))?;
        }

        let definition = xml::render_domain(profile, &self.config)?;
        self.virsh().define(&definition)?;
        log::info!("domain {} defined", profile.name);
        Ok(())
    }

    /// Bring the domain up. Fixed order: region create, definition render,
    /// daemon define, PCI rebind, daemon start, display client spawn. A
    /// failure reverses the completed steps in the opposite order. Returns
    /// operator-facing warnings (e.g. passthrough degraded).
    pub fn start(&self, name: &str, display: DisplayLaunch<'_>) -> Result<Vec<String>> {
        validate_name(name)?;
        let guard = self.domain_lock(name);
        let _held = guard.lock().expect("domain lock poisoned");

        let profile = self.store.load(name)?;
        if !profile.install_method.needs_domain() {
            return Err(Error::InvalidState {
                domain: name.to_string(),
                state: "not VM-backed".to_string(),
                operation: "start".to_string(),
            });
        }
        if let Some(existing) = self.get(name)? {
            if existing.state != DomainState::Off {
                return Err(Error::InvalidState {
                    domain: name.to_string(),
                    state: existing.state.to_string(),
                    operation: "start".to_string(),
                });
            }
        }

        let mut warnings = Vec::new();
        let virsh = self.virsh();

        // 1. Shared region, before the guest can map it
        let region = if profile.display.enabled {
            Some(SharedRegion::create(
                self.config.shared_region_path(name),
                profile.shared_region_mib,
            )?)
        } else {
            None
        };

        // 2+3. Definition render and daemon define
        let definition = xml::render_domain(&profile, &self.config)?;
        virsh.define(&definition)?;

        // 4. PCI rebind and config-attach; failure degrades to a warning
        let mut attached: Vec<PciAddress> = Vec::new();
        if let Some(request) = &profile.passthrough {
            match self.prepare_passthrough(&virsh, name, request) {
                Ok(addresses) => attached = addresses,
                Err(e) => {
                    log::warn!("starting {} without passthrough: {}", name, e);
                    warnings.push(format!("started without passthrough device: {}", e));
                }
            }
        }

        // 5. Daemon start
        if let Err(e) = virsh.start(name) {
            self.reverse_attach(&virsh, name, &attached);
            drop(region);
            return Err(e);
        }

        // 6. Display client
        if let (Some(region), DisplayLaunch::Spawn(spawn)) = (&region, &display) {
            if let Err(e) = spawn(&profile, region.path()) {
                log::error!("display client launch failed for {}; reversing start: {}", name, e);
                let _ = virsh.destroy(name);
                self.reverse_attach(&virsh, name, &attached);
                drop(region);
                return Err(e);
            }
        }

        // The display process owns the region file from here on.
        if let Some(region) = region {
            region.leak();
        }

        log::info!("domain {} started", name);
        Ok(warnings)
    }

    fn prepare_passthrough(
        &self,
        virsh: &Virsh,
        name: &str,
        request: &crate::config::PassthroughRequest,
    ) -> Result<Vec<PciAddress>> {
        let mut addresses: Vec<PciAddress> = vec![request.gpu.parse()?];
        if let Some(audio) = &request.audio {
            addresses.push(audio.parse()?);
        }

        // One function, one guest: never let two running domains claim the
        // same address.
        self.assert_unassigned(name, &addresses)?;

        for address in &addresses {
            self.transfer.ensure_stub_bound(&address.to_string())?;
        }
        for address in &addresses {
            virsh.attach_device_config(name, &xml::render_hostdev(address)?)?;
        }
        Ok(addresses)
    }

    fn reverse_attach(&self, virsh: &Virsh, name: &str, addresses: &[PciAddress]) {
        for address in addresses.iter().rev() {
            match xml::render_hostdev(address) {
                Ok(fragment) => {
                    if let Err(e) = virsh.detach_device_config(name, &fragment) {
                        log::warn!("could not remove {} from {} definition: {}", address, name, e);
                    }
                }
                Err(e) => log::warn!("could not render hostdev for {}: {}", address, e),
            }
        }
    }

    fn assert_unassigned(&self, starting: &str, addresses: &[PciAddress]) -> Result<()> {
        let wanted: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
        for domain in self.list()? {
            if domain.name == starting || domain.state == DomainState::Off {
                continue;
            }
            for address in &wanted {
                if domain.attached_pci.contains(address) {
                    return Err(Error::DeviceBusy(format!(
                        "{} is attached to domain {}",
                        address, domain.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Graceful stop: ACPI shutdown, bounded wait, then device release.
    pub fn shutdown(&self, name: &str, wait: Duration) -> Result<()> {
        validate_name(name)?;
        let guard = self.domain_lock(name);
        let _held = guard.lock().expect("domain lock poisoned");

        let domain = self.require_state(name, &[DomainState::Running, DomainState::Paused], "shutdown")?;
        let virsh = self.virsh();
        virsh.shutdown(name)?;

        let deadline = Instant::now() + wait;
        loop {
            match self.get(name)? {
                Some(d) if d.state == DomainState::Off => break,
                None => break,
                Some(_) if Instant::now() >= deadline => {
                    return Err(Error::TimedOut {
                        operation: format!("shutdown of {}", name),
                        seconds: wait.as_secs(),
                    });
                }
                Some(_) => std::thread::sleep(Duration::from_millis(500)),
            }
        }

        self.release_addresses(&domain.attached_pci);
        self.remove_region(name);
        Ok(())
    }

    /// Hard stop; the guest gets no say.
    pub fn force_off(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let guard = self.domain_lock(name);
        let _held = guard.lock().expect("domain lock poisoned");

        let domain = self.require_state(
            name,
            &[DomainState::Running, DomainState::Paused, DomainState::Stopping, DomainState::Crashed],
            "force-off",
        )?;
        self.virsh().destroy(name)?;
        self.release_addresses(&domain.attached_pci);
        self.remove_region(name);
        Ok(())
    }

    /// The display supervisor unlinks the region once its client exits;
    /// this covers domains stopped with no supervisor alive. A present
    /// pidfile means the supervisor still owns the region.
    fn remove_region(&self, name: &str) {
        if self.config.state_dir.join(format!("display-{}.pid", name)).exists() {
            return;
        }
        let path = self.config.shared_region_path(name);
        match fs::remove_file(&path) {
            Ok(()) => log::debug!("removed shared region {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("could not remove shared region {}: {}", path.display(), e),
        }
    }

    /// Return passthrough functions to host drivers; failures are parked
    /// for the next readiness sweep.
    fn release_addresses(&self, addresses: &[String]) {
        if addresses.is_empty() {
            return;
        }
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        for address in addresses {
            if let Err(e) = self.transfer.release_to_host(address) {
                log::warn!("deferring release of {}: {}", address, e);
                pending.add(address);
            }
        }
        if let Err(e) = pending.save(&self.pending_path()) {
            log::warn!("could not persist pending releases: {}", e);
        }
    }

    /// Retry parked device releases. Called on controller startup.
    pub fn readiness_sweep(&self) {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        if pending.is_empty() {
            return;
        }
        pending.sweep(&self.transfer);
        if let Err(e) = pending.save(&self.pending_path()) {
            log::warn!("could not persist pending releases: {}", e);
        }
    }

    pub fn pause(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let guard = self.domain_lock(name);
        let _held = guard.lock().expect("domain lock poisoned");
        self.require_state(name, &[DomainState::Running], "pause")?;
        self.virsh().suspend(name)
    }

    pub fn resume(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let guard = self.domain_lock(name);
        let _held = guard.lock().expect("domain lock poisoned");
        self.require_state(name, &[DomainState::Paused], "resume")?;
        self.virsh().resume(name)
    }

    pub fn snapshot(&self, name: &str, tag: &str) -> Result<()> {
        validate_name(name)?;
        // Tags travel down the same argv path as names.
        validate_name(tag)?;
        let guard = self.domain_lock(name);
        let _held = guard.lock().expect("domain lock poisoned");

        let domain = self.get(name)?.ok_or(Error::Daemon {
            code: virsh::NOT_FOUND,
            message: format!("domain {} is not defined", name),
        })?;
        if !domain.state.allows_snapshot() {
            return Err(Error::InvalidState {
                domain: name.to_string(),
                state: domain.state.to_string(),
                operation: "snapshot".to_string(),
            });
        }
        self.virsh().snapshot_create(name, tag)
    }

    /// Undefine the domain; with `purge_storage` also delete its disk, but
    /// only when the disk lies inside the configured storage root. The
    /// containment check runs before anything is undefined.
    pub fn delete(&self, name: &str, purge_storage: bool) -> Result<()> {
        validate_name(name)?;
        let guard = self.domain_lock(name);
        let _held = guard.lock().expect("domain lock poisoned");

        let mut disk_to_remove: Option<PathBuf> = None;
        if purge_storage {
            let profile = self.store.load(name)?;
            let disk = profile.disk_path(&self.config);
            if !path_within_root(&disk, &self.config.storage_root) {
                return Err(Error::StorageOutsideRoot {
                    path: disk,
                    root: self.config.storage_root.clone(),
                });
            }
            disk_to_remove = Some(disk);
        }

        self.virsh().undefine(name)?;

        if let Some(disk) = disk_to_remove {
            match fs::remove_file(&disk) {
                Ok(()) => log::info!("removed disk {}", disk.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(&disk, e)),
            }
        }

        self.store.delete(name)?;
        log::info!("domain {} deleted", name);
        Ok(())
    }

    // -- runtime device transfer -------------------------------------------

    pub fn attach_pci(&self, name: &str, address: &str) -> Result<()> {
        validate_name(name)?;
        let address: PciAddress = address.parse()?;
        let guard = self.domain_lock(name);
        let _held = guard.lock().expect("domain lock poisoned");

        self.require_state(name, &[DomainState::Running], "attach-pci")?;
        self.assert_unassigned(name, std::slice::from_ref(&address))?;
        self.transfer.ensure_stub_bound(&address.to_string())?;
        transfer::hot_attach(&self.virsh(), name, &address)
    }

    pub fn detach_pci(&self, name: &str, address: &str) -> Result<()> {
        validate_name(name)?;
        let address: PciAddress = address.parse()?;
        let guard = self.domain_lock(name);
        let _held = guard.lock().expect("domain lock poisoned");

        self.require_state(name, &[DomainState::Running], "detach-pci")?;
        match transfer::hot_detach(&self.virsh(), name, &address) {
            Ok(()) => {
                self.release_addresses(&[address.to_string()]);
                Ok(())
            }
            Err(e @ Error::TimedOut { .. }) => {
                // The guest has not let go yet; park the address so the
                // next sweep finishes the release.
                let mut pending = self.pending.lock().expect("pending lock poisoned");
                pending.add(&address.to_string());
                if let Err(save_err) = pending.save(&self.pending_path()) {
                    log::warn!("could not persist pending releases: {}", save_err);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

/// Containment test that tolerates not-yet-existing leaves: the deepest
/// existing ancestor is canonicalized (resolving symlinks), the remainder
/// is appended lexically.
fn path_within_root(path: &Path, root: &Path) -> bool {
    let resolved_root = resolve_existing_prefix(root);
    let resolved_path = resolve_existing_prefix(path);
    resolved_path.starts_with(&resolved_root)
}

fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut remainder: Vec<std::ffi::OsString> = Vec::new();

    loop {
        match existing.canonicalize() {
            Ok(canonical) => {
                let mut out = canonical;
                for part in remainder.iter().rev() {
                    out.push(part);
                }
                return out;
            }
            Err(_) => match (existing.file_name(), existing.parent()) {
                (Some(name), Some(parent)) => {
                    remainder.push(name.to_os_string());
                    existing = parent.to_path_buf();
                }
                _ => return path.to_path_buf(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("win11").is_ok());
        assert!(validate_name("dev_box-2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a;rm -rf /").is_err());
        assert!(validate_name("nul\0byte").is_err());
        assert!(validate_name("spaced name").is_err());
        assert!(validate_name("path/../escape").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn state_parsing() {
        assert_eq!(DomainState::from_daemon("running"), Some(DomainState::Running));
        assert_eq!(DomainState::from_daemon("shut off"), Some(DomainState::Off));
        assert_eq!(DomainState::from_daemon("paused"), Some(DomainState::Paused));
        assert_eq!(DomainState::from_daemon("in shutdown"), Some(DomainState::Stopping));
        assert_eq!(DomainState::from_daemon("crashed"), Some(DomainState::Crashed));
        assert_eq!(DomainState::from_daemon("transcendent"), None);
    }

    #[test]
    fn snapshot_state_gate() {
        assert!(DomainState::Off.allows_snapshot());
        assert!(DomainState::Running.allows_snapshot());
        assert!(DomainState::Paused.allows_snapshot());
        assert!(!DomainState::Stopping.allows_snapshot());
        assert!(!DomainState::Crashed.allows_snapshot());
    }

    #[test]
    fn containment_check() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("images");
        fs::create_dir_all(&root).unwrap();

        assert!(path_within_root(&root.join("win11.qcow2"), &root));
        assert!(path_within_root(&root.join("sub/dir/disk.qcow2"), &root));
        assert!(!path_within_root(Path::new("/etc/passwd"), &root));
        assert!(!path_within_root(&root.join("../escape.qcow2"), &root));
    }

    #[test]
    fn containment_resolves_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("images");
        let outside = dir.path().join("outside");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        // A path that lexically sits under the root but resolves outside it
        assert!(!path_within_root(&root.join("link/disk.qcow2"), &root));
    }
}
