//! IOMMU topology analysis
//!
//! Reads `/sys/kernel/iommu_groups` directly rather than deriving groups
//! from the PCI scan; the kernel's group tree is the authoritative view of
//! what the IOMMU can actually isolate. Each group is classified as clean
//! (safe to hand to a guest wholesale) or contaminated.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::hardware::pci::PciDevice;

/// Set of PCI functions sharing one isolation domain.
#[derive(Debug, Clone)]
pub struct IommuGroup {
    pub id: u32,
    pub members: Vec<PciDevice>,
    /// True when every member is a display controller, audio device or
    /// bridge; anything else makes the group unsafe to split.
    pub is_clean: bool,
}

impl IommuGroup {
    pub fn contains(&self, address: &str) -> bool {
        self.members.iter().any(|m| m.address == address)
    }

    pub fn audio_peers<'a>(&'a self, gpu_address: &'a str) -> impl Iterator<Item = &'a PciDevice> {
        self.members
            .iter()
            .filter(move |m| m.address != gpu_address && m.is_audio())
    }
}

fn member_is_clean(device: &PciDevice) -> bool {
    device.is_display() || device.is_audio() || device.is_bridge()
}

/// All IOMMU groups visible under a sysfs root.
#[derive(Debug, Default)]
pub struct IommuTopology {
    groups: BTreeMap<u32, IommuGroup>,
}

impl IommuTopology {
    /// Read the group tree. An absent `kernel/iommu_groups` root means the
    /// IOMMU is off (or not exposed), reported as [`Error::IommuDisabled`]
    /// so the planner can downgrade it to a warning.
    pub fn read(sysfs_root: &Path) -> Result<Self> {
        let groups_dir = sysfs_root.join("kernel/iommu_groups");
        if !groups_dir.is_dir() {
            return Err(Error::IommuDisabled);
        }

        let mut groups = BTreeMap::new();
        let entries = fs::read_dir(&groups_dir).map_err(|e| Error::io(&groups_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&groups_dir, e))?;
            let name = entry.file_name();
            let Ok(id) = name.to_string_lossy().parse::<u32>() else {
                continue;
            };

            let members = read_members(&entry.path().join("devices"))?;
            let is_clean = members.iter().all(member_is_clean);
            groups.insert(id, IommuGroup { id, members, is_clean });
        }

        Ok(Self { groups })
    }

    pub fn group(&self, id: u32) -> Option<&IommuGroup> {
        self.groups.get(&id)
    }

    /// The group holding the given PCI address, if any.
    pub fn group_of(&self, address: &str) -> Option<&IommuGroup> {
        self.groups.values().find(|g| g.contains(address))
    }

    pub fn iter(&self) -> impl Iterator<Item = &IommuGroup> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

fn read_members(devices_dir: &Path) -> Result<Vec<PciDevice>> {
    let mut members = Vec::new();
    let entries = fs::read_dir(devices_dir).map_err(|e| Error::io(devices_dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(devices_dir, e))?;
        let address = entry.file_name().to_string_lossy().into_owned();
        // The entry is a symlink into the device tree; attributes are read
        // through it.
        match crate::hardware::pci::read_group_member(&entry.path(), &address) {
            Ok(device) => members.push(device),
            Err(e) => {
                log::warn!("unreadable IOMMU group member {}: {}", address, e);
            }
        }
    }
    members.sort_by(|a, b| a.address.cmp(&b.address));
    Ok(members)
}
