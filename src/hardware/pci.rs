//! PCI device enumeration from sysfs
//!
//! Walks the kernel's PCI device directory and produces an immutable
//! snapshot of every function: IDs, class, boot-display marker, IOMMU group
//! and the currently bound driver. The scanner takes the sysfs root as a
//! parameter so tests can point it at a fabricated tree.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::hardware::ids;

/// PCI class codes relevant to passthrough planning
pub mod class {
    /// VGA-compatible controller
    pub const DISPLAY_VGA: u32 = 0x030000;
    /// 3D controller (non-VGA)
    pub const DISPLAY_3D: u32 = 0x030200;
    /// Other display controller
    pub const DISPLAY_OTHER: u32 = 0x038000;
    /// HD Audio device
    pub const AUDIO_HDA: u32 = 0x040300;
    /// Host bridge
    pub const BRIDGE_HOST: u32 = 0x060000;
    /// PCI-to-PCI bridge
    pub const BRIDGE_PCI: u32 = 0x060400;
    /// SATA controller, AHCI mode
    pub const SATA_AHCI: u32 = 0x010601;
    /// NVMe controller
    pub const NVME: u32 = 0x010802;
    /// USB controller
    pub const USB: u32 = 0x0c0300;
    /// Ethernet controller
    pub const ETHERNET: u32 = 0x020000;
}

/// A parsed `domain:bus:device.function` address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl FromStr for PciAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = || -> Option<PciAddress> {
            let (rest, function) = s.rsplit_once('.')?;
            let mut parts = rest.split(':');
            let first = parts.next()?;
            let second = parts.next()?;
            // The domain prefix is optional in operator input.
            let (domain, bus, slot) = match parts.next() {
                Some(third) => (
                    u16::from_str_radix(first, 16).ok()?,
                    u8::from_str_radix(second, 16).ok()?,
                    u8::from_str_radix(third, 16).ok()?,
                ),
                None => (
                    0,
                    u8::from_str_radix(first, 16).ok()?,
                    u8::from_str_radix(second, 16).ok()?,
                ),
            };
            Some(PciAddress {
                domain,
                bus,
                slot,
                function: u8::from_str_radix(function, 16).ok()?,
            })
        };
        parse().ok_or_else(|| Error::parse("pci address", format!("{:?}", s)))
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

/// One PCI function, as read from sysfs. Immutable for the scan's lifetime.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PciDevice {
    /// Canonical address, e.g. "0000:01:00.0"
    pub address: String,
    pub vendor_id: u16,
    pub device_id: u16,
    /// 24-bit class code, e.g. 0x030000
    pub class_code: u32,
    pub vendor_name: String,
    pub device_name: String,
    /// Firmware rendered the boot console on this function
    pub is_boot_display: bool,
    pub iommu_group: Option<u32>,
    /// Basename of the bound driver, if any
    pub driver: Option<String>,
}

impl PciDevice {
    /// Class prefix check: any display controller subclass.
    pub fn is_display(&self) -> bool {
        self.class_code >> 16 == 0x03
    }

    pub fn is_audio(&self) -> bool {
        self.class_code & 0xffff00 == class::AUDIO_HDA
    }

    pub fn is_bridge(&self) -> bool {
        self.class_code >> 16 == 0x06
    }

    /// The "vendor:device" form used in vfio-pci ids= lists.
    pub fn vendor_device(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor_id, self.device_id)
    }

    pub fn is_vfio_bound(&self) -> bool {
        self.driver.as_deref() == Some("vfio-pci")
    }

    pub fn class_description(&self) -> &'static str {
        match self.class_code & 0xffff00 {
            0x030000 => "VGA controller",
            0x030200 => "3D controller",
            0x038000 => "Display controller",
            0x040300 => "Audio device",
            0x010600 => "SATA controller",
            0x010800 => "NVMe controller",
            0x0c0300 => "USB controller",
            0x020000 => "Ethernet controller",
            _ => match self.class_code >> 16 {
                0x01 => "Storage controller",
                0x02 => "Network controller",
                0x03 => "Display controller",
                0x04 => "Multimedia controller",
                0x06 => "Bridge",
                0x0c => "Serial bus controller",
                _ => "PCI device",
            },
        }
    }
}

/// Snapshot result of one enumeration pass.
#[derive(Debug, Default)]
pub struct PciScan {
    pub devices: Vec<PciDevice>,
    /// Per-function read problems; the affected functions are not listed.
    pub warnings: Vec<String>,
}

impl PciScan {
    pub fn device(&self, address: &str) -> Option<&PciDevice> {
        self.devices.iter().find(|d| d.address == address)
    }

    pub fn displays(&self) -> impl Iterator<Item = &PciDevice> {
        self.devices.iter().filter(|d| d.is_display())
    }
}

/// Enumerates PCI functions below a sysfs root.
pub struct PciScanner {
    sysfs_root: PathBuf,
}

impl PciScanner {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self { sysfs_root: sysfs_root.into() }
    }

    /// Scanner over the live kernel tree.
    pub fn system() -> Self {
        Self::new("/sys")
    }

    pub fn sysfs_root(&self) -> &Path {
        &self.sysfs_root
    }

    /// Enumerate every function. A missing device root is fatal; a read
    /// failure on an individual function drops that function and records a
    /// warning.
    pub fn scan(&self) -> Result<PciScan> {
        let devices_dir = self.sysfs_root.join("bus/pci/devices");
        let entries =
            fs::read_dir(&devices_dir).map_err(|e| Error::io(&devices_dir, e))?;

        let mut scan = PciScan::default();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&devices_dir, e))?;
            let address = entry.file_name().to_string_lossy().into_owned();
            match read_function(&entry.path(), &address) {
                Ok(device) => scan.devices.push(device),
                Err(e) => {
                    log::warn!("skipping PCI function {}: {}", address, e);
                    scan.warnings.push(format!("skipped {}: {}", address, e));
                }
            }
        }

        // Deterministic order for display and for candidate tie-breaks.
        scan.devices.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(scan)
    }
}

/// Read one function through an IOMMU-group `devices/` symlink. Same
/// attribute set as the scan path.
pub(crate) fn read_group_member(path: &Path, address: &str) -> Result<PciDevice> {
    read_function(path, address)
}

fn read_function(path: &Path, address: &str) -> Result<PciDevice> {
    let vendor_id = read_hex_u16(path, "vendor")?;
    let device_id = read_hex_u16(path, "device")?;
    let class_code = read_hex_u32(path, "class")?;

    Ok(PciDevice {
        address: address.to_string(),
        vendor_id,
        device_id,
        class_code,
        vendor_name: ids::vendor_name(vendor_id),
        device_name: ids::device_name(vendor_id, device_id),
        is_boot_display: read_flag(path, "boot_vga"),
        iommu_group: read_link_basename(path, "iommu_group")
            .and_then(|name| name.parse().ok()),
        driver: read_link_basename(path, "driver"),
    })
}

fn read_hex_u16(path: &Path, attr: &str) -> Result<u16> {
    let raw = read_attr(path, attr)?;
    u16::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|e| Error::parse(format!("{}/{}", path.display(), attr), e.to_string()))
}

fn read_hex_u32(path: &Path, attr: &str) -> Result<u32> {
    let raw = read_attr(path, attr)?;
    u32::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|e| Error::parse(format!("{}/{}", path.display(), attr), e.to_string()))
}

fn read_attr(path: &Path, attr: &str) -> Result<String> {
    let attr_path = path.join(attr);
    let raw = fs::read_to_string(&attr_path).map_err(|e| Error::io(&attr_path, e))?;
    Ok(raw.trim().to_string())
}

/// Sysfs boolean attribute; absent means false (not every function exposes
/// boot_vga).
fn read_flag(path: &Path, attr: &str) -> bool {
    fs::read_to_string(path.join(attr))
        .map(|v| v.trim() == "1")
        .unwrap_or(false)
}

fn read_link_basename(path: &Path, attr: &str) -> Option<String> {
    fs::read_link(path.join(attr))
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()))
}
