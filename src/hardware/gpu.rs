//! GPU classification and passthrough candidate selection
//!
//! Splits the display controllers of a scan into integrated and discrete
//! adapters and picks the one discrete GPU that will be handed to guests.

use crate::error::{Error, Result};
use crate::hardware::pci::{PciDevice, PciScan};

/// Vendors that ship CPU-integrated graphics. A display controller from one
/// of these that is also the boot display is treated as the host's iGPU.
const IGPU_VENDORS: &[u16] = &[0x8086, 0x1002, 0x1022];

/// vendor:device pairs excluded from passthrough. Reserved for hardware with
/// known reset or isolation defects.
const DENY_LIST: &[(u16, u16)] = &[];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuKind {
    /// CPU-integrated adapter driving the host console
    Integrated,
    /// Discrete adapter, potential passthrough target
    Discrete,
}

#[derive(Debug, Clone)]
pub struct Gpu {
    pub device: PciDevice,
    pub kind: GpuKind,
}

fn is_integrated(device: &PciDevice) -> bool {
    IGPU_VENDORS.contains(&device.vendor_id) && device.is_boot_display
}

fn is_denied(device: &PciDevice) -> bool {
    DENY_LIST.contains(&(device.vendor_id, device.device_id))
}

/// Classify every display controller in the scan.
pub fn classify(scan: &PciScan) -> Vec<Gpu> {
    scan.displays()
        .map(|device| Gpu {
            device: device.clone(),
            kind: if is_integrated(device) { GpuKind::Integrated } else { GpuKind::Discrete },
        })
        .collect()
}

/// Pick the passthrough candidate: a display controller that is neither the
/// boot display nor deny-listed.
///
/// When several qualify the choice must be stable across scans: the device
/// with the lexically greatest device name wins (newer parts tend to sort
/// later in the ID database), ties broken by the lower PCI address.
pub fn select_candidate(scan: &PciScan) -> Result<&PciDevice> {
    scan.displays()
        .filter(|d| !d.is_boot_display && !is_denied(d))
        .max_by(|a, b| {
            a.device_name
                .cmp(&b.device_name)
                .then_with(|| b.address.cmp(&a.address))
        })
        .ok_or(Error::NoPassthroughCandidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::pci::PciScan;

    fn display(address: &str, vendor: u16, device: u16, name: &str, boot: bool) -> PciDevice {
        PciDevice {
            address: address.into(),
            vendor_id: vendor,
            device_id: device,
            class_code: 0x030000,
            vendor_name: String::new(),
            device_name: name.into(),
            is_boot_display: boot,
            iommu_group: None,
            driver: None,
        }
    }

    fn scan_of(devices: Vec<PciDevice>) -> PciScan {
        PciScan { devices, warnings: Vec::new() }
    }

    #[test]
    fn igpu_plus_discrete() {
        let scan = scan_of(vec![
            display("0000:00:02.0", 0x8086, 0x3e92, "UHD Graphics 630", true),
            display("0000:01:00.0", 0x10de, 0x1c03, "GP106", false),
        ]);

        let gpus = classify(&scan);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].kind, GpuKind::Integrated);
        assert_eq!(gpus[1].kind, GpuKind::Discrete);

        let candidate = select_candidate(&scan).unwrap();
        assert_eq!(candidate.address, "0000:01:00.0");
    }

    #[test]
    fn boot_display_is_never_a_candidate() {
        let scan = scan_of(vec![display("0000:01:00.0", 0x10de, 0x2684, "AD102", true)]);
        assert!(matches!(select_candidate(&scan), Err(Error::NoPassthroughCandidate)));
    }

    #[test]
    fn discrete_boot_display_is_not_integrated() {
        let scan = scan_of(vec![display("0000:01:00.0", 0x10de, 0x2684, "AD102", true)]);
        assert_eq!(classify(&scan)[0].kind, GpuKind::Discrete);
    }

    #[test]
    fn tie_break_prefers_greater_name_then_lower_address() {
        let scan = scan_of(vec![
            display("0000:00:02.0", 0x8086, 0x3e92, "UHD Graphics 630", true),
            display("0000:01:00.0", 0x10de, 0x1c03, "GP106", false),
            display("0000:02:00.0", 0x10de, 0x2684, "AD102", false),
        ]);
        // "GP106" > "AD102" lexically
        assert_eq!(select_candidate(&scan).unwrap().address, "0000:01:00.0");

        let scan = scan_of(vec![
            display("0000:02:00.0", 0x10de, 0x1c03, "GP106", false),
            display("0000:01:00.0", 0x10de, 0x1c03, "GP106", false),
        ]);
        assert_eq!(select_candidate(&scan).unwrap().address, "0000:01:00.0");
    }

    #[test]
    fn empty_scan_has_no_candidate() {
        let scan = scan_of(Vec::new());
        assert!(classify(&scan).is_empty());
        assert!(select_candidate(&scan).is_err());
    }
}
