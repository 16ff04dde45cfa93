//! Bundled PCI ID database
//!
//! An abridged `pci.ids`-format listing is compiled into the binary and
//! parsed once on first lookup. Unknown IDs fall back to a hex placeholder
//! so scan output never has empty name columns.

use std::collections::HashMap;

use once_cell::sync::Lazy;

const PCI_IDS: &str = include_str!("pci_ids.txt");

struct Vendor {
    name: &'static str,
    devices: HashMap<u16, &'static str>,
}

static DATABASE: Lazy<HashMap<u16, Vendor>> = Lazy::new(parse_database);

fn parse_database() -> HashMap<u16, Vendor> {
    let mut vendors: HashMap<u16, Vendor> = HashMap::new();
    let mut current: Option<u16> = None;

    for line in PCI_IDS.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(rest) = line.strip_prefix('\t') {
            // Device line, belongs to the vendor above it
            let Some(vendor_id) = current else { continue };
            if let Some((id, name)) = split_id_line(rest) {
                if let Some(vendor) = vendors.get_mut(&vendor_id) {
                    vendor.devices.insert(id, name);
                }
            }
        } else if let Some((id, name)) = split_id_line(line) {
            vendors.insert(id, Vendor { name, devices: HashMap::new() });
            current = Some(id);
        }
    }

    vendors
}

fn split_id_line(line: &'static str) -> Option<(u16, &'static str)> {
    let (hex, name) = line.split_once("  ")?;
    let id = u16::from_str_radix(hex.trim(), 16).ok()?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((id, name))
}

/// Resolve a vendor ID to its display name.
pub fn vendor_name(vendor_id: u16) -> String {
    match DATABASE.get(&vendor_id) {
        Some(vendor) => vendor.name.to_string(),
        None => format!("vendor {:04x}", vendor_id),
    }
}

/// Resolve a vendor/device pair to the device's display name.
pub fn device_name(vendor_id: u16, device_id: u16) -> String {
    DATABASE
        .get(&vendor_id)
        .and_then(|v| v.devices.get(&device_id))
        .map(|name| name.to_string())
        .unwrap_or_else(|| format!("device {:04x}", device_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vendor_and_device() {
        assert_eq!(vendor_name(0x10de), "NVIDIA Corporation");
        assert_eq!(device_name(0x10de, 0x1c03), "GP106 [GeForce GTX 1060 6GB]");
        assert_eq!(device_name(0x8086, 0x3e92), "CoffeeLake-S GT2 [UHD Graphics 630]");
    }

    #[test]
    fn unknown_ids_fall_back_to_hex() {
        assert_eq!(vendor_name(0xdead), "vendor dead");
        assert_eq!(device_name(0x10de, 0xbeef), "device beef");
    }

    #[test]
    fn database_is_not_empty() {
        assert!(DATABASE.len() >= 8);
        assert!(!DATABASE[&0x1002].devices.is_empty());
    }
}
