//! Passthrough planning
//!
//! Combines the PCI scan, the IOMMU topology and the CPU probe into one
//! self-contained [`PassthroughPlan`]: everything the boot-config mutator
//! needs to rebind a discrete GPU to vfio-pci at the next boot. The planner
//! only computes; it never touches the filesystem.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hardware::gpu;
use crate::hardware::iommu::IommuTopology;
use crate::hardware::pci::{PciDevice, PciScan};
use crate::hardware::{CpuVendor, Platform};

/// Host bootloader layout, as detected by the mutator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootloaderKind {
    /// Loader-entries layout: one options line per entry file
    SystemdBoot,
    /// Menu-style default file with a kernel args assignment
    Grub,
    Unknown,
}

/// Initramfs modules in load order. The stub must come first so it claims
/// the GPU before any display driver initializes.
pub const INITRAMFS_MODULES: &[&str] = &["vfio_pci", "vfio", "vfio_iommu_type1"];

const NVIDIA_DRIVERS: &[&str] = &["nouveau", "nvidia", "nvidia_drm", "nvidia_modeset", "nvidia_uvm"];
const AMD_DRIVERS: &[&str] = &["amdgpu", "radeon"];
const INTEL_DRIVERS: &[&str] = &["i915", "xe"];

/// Complete, serializable passthrough configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassthroughPlan {
    pub target_gpu: PciDevice,
    /// "vendor:device" list for the vfio-pci ids= option. The GPU comes
    /// first, then co-located audio functions from its IOMMU group.
    pub rebind_ids: Vec<String>,
    /// Host GPU drivers that must load after the stub (softdep ordering).
    pub driver_preempt_list: Vec<String>,
    pub initramfs_modules: Vec<String>,
    pub kernel_cmdline_fragment: String,
    pub bootloader: BootloaderKind,
    /// Best-effort runtime evidence; advisory only.
    pub iommu_runtime_active: Option<bool>,
    pub warnings: Vec<String>,
}

/// Compute the plan. `topology` is None when the IOMMU tree is absent; the
/// plan is still produced (with a warning) so that applying it and
/// rebooting can enable the IOMMU.
pub fn build_plan(
    scan: &PciScan,
    topology: Option<&IommuTopology>,
    platform: &Platform,
    bootloader: BootloaderKind,
    iommu_runtime_active: Option<bool>,
) -> Result<PassthroughPlan> {
    let candidate = gpu::select_candidate(scan)?;
    let mut warnings: Vec<String> = scan.warnings.clone();
    let mut rebind_ids = vec![candidate.vendor_device()];

    match topology {
        None => {
            warnings.push(
                "IOMMU tree is absent; apply the kernel parameters and reboot to enable it"
                    .to_string(),
            );
        }
        Some(topology) => match topology.group_of(&candidate.address) {
            None => {
                warnings.push(format!(
                    "GPU {} has no IOMMU group; passthrough will not work until isolation is available",
                    candidate.address
                ));
            }
            Some(group) => {
                for member in &group.members {
                    if member.address == candidate.address {
                        continue;
                    }
                    if member.is_audio() || member.device_name.contains("Audio") {
                        let id = member.vendor_device();
                        if !rebind_ids.contains(&id) {
                            rebind_ids.push(id);
                        }
                    } else if member.is_bridge() {
                        // Bridges stay host-owned; the kernel tolerates them
                        // in a passthrough group.
                    } else {
                        warnings.push(format!(
                            "IOMMU group {} is not clean ({} {} shares it); isolation patch may be required",
                            group.id,
                            member.address,
                            member.class_description(),
                        ));
                    }
                }
            }
        },
    }

    if platform.vendor == CpuVendor::Unknown {
        warnings.push("unrecognized CPU vendor; using the generic iommu=pt parameter".to_string());
    }
    if iommu_runtime_active == Some(false) {
        warnings.push("kernel ring buffer shows no IOMMU activity; a reboot may be required".to_string());
    }

    log::info!(
        "plan: candidate {} ({}), rebind ids [{}]",
        candidate.address,
        candidate.device_name,
        rebind_ids.join(", ")
    );

    Ok(PassthroughPlan {
        target_gpu: candidate.clone(),
        rebind_ids,
        driver_preempt_list: preempt_list_for(candidate),
        initramfs_modules: INITRAMFS_MODULES.iter().map(|m| m.to_string()).collect(),
        kernel_cmdline_fragment: platform.cmdline_fragment().to_string(),
        bootloader,
        iommu_runtime_active,
        warnings,
    })
}

/// Drivers that would claim the candidate if they loaded first.
fn preempt_list_for(candidate: &PciDevice) -> Vec<String> {
    let drivers: &[&str] = match candidate.vendor_id {
        0x10de => NVIDIA_DRIVERS,
        0x1002 => AMD_DRIVERS,
        0x8086 => INTEL_DRIVERS,
        _ => {
            // Unknown discrete vendor: preempt everything we know about.
            return NVIDIA_DRIVERS
                .iter()
                .chain(AMD_DRIVERS)
                .chain(INTEL_DRIVERS)
                .map(|d| d.to_string())
                .collect();
        }
    };
    drivers.iter().map(|d| d.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::pci::tests::write_function;
    use crate::hardware::{IommuTopology, PciScanner};

    fn intel_platform() -> Platform {
        Platform { vendor: CpuVendor::Intel, model_name: "Intel(R) Core(TM) i7".into() }
    }

    #[test]
    fn nvidia_on_intel_produces_clean_plan() {
        let root = tempfile::tempdir().unwrap();
        write_function(root.path(), "0000:00:02.0", 0x8086, 0x3e92, 0x030000, Some(true), Some(2), Some("i915"));
        write_function(root.path(), "0000:01:00.0", 0x10de, 0x1c03, 0x030000, Some(false), Some(12), Some("nouveau"));
        write_function(root.path(), "0000:01:00.1", 0x10de, 0x10f1, 0x040300, None, Some(12), Some("snd_hda_intel"));

        let scan = PciScanner::new(root.path()).scan().unwrap();
        let topology = IommuTopology::read(root.path()).unwrap();

        let plan = build_plan(&scan, Some(&topology), &intel_platform(), BootloaderKind::SystemdBoot, None)
            .unwrap();

        assert_eq!(plan.target_gpu.address, "0000:01:00.0");
        assert_eq!(plan.rebind_ids, vec!["10de:1c03", "10de:10f1"]);
        assert_eq!(plan.initramfs_modules, vec!["vfio_pci", "vfio", "vfio_iommu_type1"]);
        assert_eq!(plan.kernel_cmdline_fragment, "intel_iommu=on iommu=pt");
        assert!(plan.warnings.is_empty());
        assert!(plan.driver_preempt_list.contains(&"nouveau".to_string()));
    }

    #[test]
    fn contaminated_group_warns_but_still_plans() {
        let root = tempfile::tempdir().unwrap();
        write_function(root.path(), "0000:00:02.0", 0x1002, 0x164e, 0x030000, Some(true), Some(2), None);
        write_function(root.path(), "0000:03:00.0", 0x1002, 0x744c, 0x030000, Some(false), Some(20), None);
        write_function(root.path(), "0000:03:00.1", 0x1002, 0xab30, 0x040300, None, Some(20), None);
        write_function(root.path(), "0000:03:00.2", 0x8086, 0xa282, 0x010601, None, Some(20), None);

        let scan = PciScanner::new(root.path()).scan().unwrap();
        let topology = IommuTopology::read(root.path()).unwrap();
        let platform = Platform { vendor: CpuVendor::Amd, model_name: "AMD Ryzen".into() };

        let plan = build_plan(&scan, Some(&topology), &platform, BootloaderKind::Grub, None).unwrap();

        assert_eq!(plan.rebind_ids, vec!["1002:744c", "1002:ab30"]);
        assert_eq!(plan.kernel_cmdline_fragment, "amd_iommu=on iommu=pt");
        assert!(plan.warnings.iter().any(|w| w.contains("group 20") && w.contains("not clean")));
    }

    #[test]
    fn missing_iommu_tree_degrades_to_warning() {
        let root = tempfile::tempdir().unwrap();
        write_function(root.path(), "0000:00:02.0", 0x8086, 0x3e92, 0x030000, Some(true), None, None);
        write_function(root.path(), "0000:01:00.0", 0x10de, 0x2684, 0x030000, Some(false), None, None);

        let scan = PciScanner::new(root.path()).scan().unwrap();
        let plan =
            build_plan(&scan, None, &intel_platform(), BootloaderKind::Unknown, None).unwrap();

        assert_eq!(plan.rebind_ids, vec!["10de:2684"]);
        assert!(plan.warnings.iter().any(|w| w.contains("IOMMU tree is absent")));
    }

    #[test]
    fn no_candidate_is_a_hard_error() {
        let root = tempfile::tempdir().unwrap();
        write_function(root.path(), "0000:00:02.0", 0x8086, 0x3e92, 0x030000, Some(true), Some(2), None);

        let scan = PciScanner::new(root.path()).scan().unwrap();
        let topology = IommuTopology::read(root.path()).unwrap();
        assert!(build_plan(&scan, Some(&topology), &intel_platform(), BootloaderKind::SystemdBoot, None)
            .is_err());
    }

    #[test]
    fn plan_serialization_round_trips() {
        let root = tempfile::tempdir().unwrap();
        write_function(root.path(), "0000:01:00.0", 0x10de, 0x1c03, 0x030000, Some(false), Some(12), None);
        write_function(root.path(), "0000:00:02.0", 0x8086, 0x3e92, 0x030000, Some(true), Some(2), None);

        let scan = PciScanner::new(root.path()).scan().unwrap();
        let topology = IommuTopology::read(root.path()).unwrap();
        let plan = build_plan(&scan, Some(&topology), &intel_platform(), BootloaderKind::SystemdBoot, Some(true))
            .unwrap();

        let json = serde_json::to_string_pretty(&plan).unwrap();
        let back: PassthroughPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(plan, back);
    }
}
