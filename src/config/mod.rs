//! Application configuration and the VM profile store
//!
//! The app config lives at `<config>/gpu-valet/config.toml`; profiles are
//! individual TOML documents under `<config>/gpu-valet/profiles/`. Profile
//! parsing is strict: unknown keys are rejected so a typo cannot silently
//! drop a setting. `XDG_CONFIG_HOME` is honored through the `dirs` crate.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Application-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root under which all VM disk images must live
    pub storage_root: PathBuf,
    /// Host-side product state (pending releases, breadcrumbs, pidfiles)
    pub state_dir: PathBuf,
    /// Directory for shared display regions
    pub shm_dir: PathBuf,
    /// Display client executable
    pub display_client: PathBuf,
    /// Virtualization daemon connection URI
    pub connect_uri: String,

    // Creation defaults applied when a profile omits the field
    pub default_memory_mib: u64,
    pub default_vcpus: u32,
    pub default_disk_gib: u32,

    // Guest channel limits
    pub channel_max_message_bytes: usize,
    pub channel_messages_per_second: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("/var/lib/gpu-valet/images"),
            state_dir: PathBuf::from("/var/lib/gpu-valet"),
            shm_dir: PathBuf::from("/dev/shm"),
            display_client: PathBuf::from("looking-glass-client"),
            connect_uri: "qemu:///system".to_string(),
            default_memory_mib: 8192,
            default_vcpus: 4,
            default_disk_gib: 64,
            channel_max_message_bytes: 64 * 1024,
            channel_messages_per_second: 32,
        }
    }
}

impl Config {
    pub fn config_dir() -> PathBuf {
        dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config")).join("gpu-valet")
    }

    pub fn config_file_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load from disk, falling back to defaults when no file exists.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        toml::from_str(&content)
            .map_err(|e| Error::parse(path.display().to_string(), e.to_string()))
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_file_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::parse("config", e.to_string()))?;
        fs::write(&path, content).map_err(|e| Error::io(&path, e))
    }

    /// Shared-region path for a domain, e.g. `/dev/shm/gpu-valet-win11`.
    pub fn shared_region_path(&self, domain: &str) -> PathBuf {
        self.shm_dir.join(format!("gpu-valet-{}", domain))
    }
}

/// How a catalog application is delivered to the user. Only the VM-backed
/// methods produce domains; the rest are carried so that every branch over
/// delivery stays exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallMethod {
    Native,
    CompatibilityLayer,
    #[default]
    VmPassthrough,
    VmMacos,
    Web,
}

impl InstallMethod {
    /// Whether this delivery method is backed by a virtual machine.
    pub fn needs_domain(self) -> bool {
        match self {
            InstallMethod::VmPassthrough | InstallMethod::VmMacos => true,
            InstallMethod::Native | InstallMethod::CompatibilityLayer | InstallMethod::Web => false,
        }
    }
}

/// Guest firmware flavor. UEFI is what modern guests (and the hidden-
/// hypervisor tricks) expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    #[default]
    Uefi,
    Bios,
}

/// Passthrough request inside a profile: the GPU function and optionally
/// its co-located audio function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PassthroughRequest {
    pub gpu: String,
    #[serde(default)]
    pub audio: Option<String>,
}

/// Display client behavior for a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DisplayOptions {
    pub enabled: bool,
    pub fullscreen: bool,
    /// Key that releases keyboard/pointer capture back to the host
    pub release_key: String,
    pub grab_pointer: bool,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            fullscreen: true,
            release_key: "KEY_RIGHTCTRL".to_string(),
            grab_pointer: true,
        }
    }
}

/// Disk image description.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DiskSpec {
    /// Image path; resolved against the storage root when omitted
    pub path: Option<PathBuf>,
    /// Image size; the app config default applies when omitted
    pub size_gib: Option<u32>,
}

/// Declarative template parameters for one domain. Sizing fields fall back
/// to the app config's creation defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VmProfile {
    pub name: String,
    #[serde(default)]
    pub install_method: InstallMethod,
    #[serde(default)]
    pub memory_mib: Option<u64>,
    #[serde(default)]
    pub vcpus: Option<u32>,
    /// vcpu index -> host cpu; empty means no pinning
    #[serde(default)]
    pub cpu_pinning: Vec<u32>,
    #[serde(default)]
    pub hugepages: bool,
    #[serde(default)]
    pub passthrough: Option<PassthroughRequest>,
    #[serde(default = "default_shared_region_mib")]
    pub shared_region_mib: u32,
    #[serde(default)]
    pub disk: DiskSpec,
    #[serde(default)]
    pub firmware: Firmware,
    #[serde(default)]
    pub tpm: bool,
    /// Shared-memory display client supervision
    #[serde(default)]
    pub display: DisplayOptions,
    /// Roots the in-guest launch command may start executables from
    #[serde(default)]
    pub launch_roots: Vec<PathBuf>,
}

fn default_shared_region_mib() -> u32 {
    64
}

impl VmProfile {
    /// Effective disk image location for this profile.
    pub fn disk_path(&self, config: &Config) -> PathBuf {
        match &self.disk.path {
            Some(path) => path.clone(),
            None => config.storage_root.join(format!("{}.qcow2", self.name)),
        }
    }

    pub fn effective_memory_mib(&self, config: &Config) -> u64 {
        self.memory_mib.unwrap_or(config.default_memory_mib)
    }

    pub fn effective_vcpus(&self, config: &Config) -> u32 {
        self.vcpus.unwrap_or(config.default_vcpus)
    }

    pub fn effective_disk_gib(&self, config: &Config) -> u32 {
        self.disk.size_gib.unwrap_or(config.default_disk_gib)
    }
}

/// On-disk store of profiles and their channel keys.
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn open_default() -> Self {
        Self::new(Config::config_dir().join("profiles"))
    }

    pub fn profile_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.toml", name))
    }

    fn key_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.key", name))
    }

    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("toml") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn load(&self, name: &str) -> Result<VmProfile> {
        crate::domain::validate_name(name)?;
        let path = self.profile_path(name);
        self.load_path(&path)
    }

    /// Parse a profile document from an arbitrary path (e.g. `vmctl define
    /// file.toml`). The embedded name is still validated.
    pub fn load_path(&self, path: &Path) -> Result<VmProfile> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let profile: VmProfile = toml::from_str(&content)
            .map_err(|e| Error::parse(path.display().to_string(), e.to_string()))?;
        crate::domain::validate_name(&profile.name)?;
        Ok(profile)
    }

    pub fn save(&self, profile: &VmProfile) -> Result<PathBuf> {
        crate::domain::validate_name(&profile.name)?;
        fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        let path = self.profile_path(&profile.name);
        let content = toml::to_string_pretty(profile)
            .map_err(|e| Error::parse("profile", e.to_string()))?;
        fs::write(&path, content).map_err(|e| Error::io(&path, e))?;
        Ok(path)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        crate::domain::validate_name(name)?;
        let path = self.profile_path(name);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
        }
        let key = self.key_path(name);
        if key.exists() {
            fs::remove_file(&key).map_err(|e| Error::io(&key, e))?;
        }
        Ok(())
    }

    /// Load the domain's channel key, generating and persisting one (0600)
    /// on first use.
    pub fn ensure_channel_key(&self, name: &str) -> Result<[u8; 32]> {
        crate::domain::validate_name(name)?;
        let path = self.key_path(name);
        if path.exists() {
            return self.load_channel_key(name);
        }

        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);

        fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(key);
        fs::write(&path, encoded + "\n").map_err(|e| Error::io(&path, e))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::io(&path, e))?;
        Ok(key)
    }

    pub fn load_channel_key(&self, name: &str) -> Result<[u8; 32]> {
        crate::domain::validate_name(name)?;
        let path = self.key_path(name);
        let raw = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(raw.trim())
            .map_err(|e| Error::parse(path.display().to_string(), e.to_string()))?;
        bytes
            .try_into()
            .map_err(|_| Error::parse(path.display().to_string(), "key is not 32 bytes"))
    }
}
