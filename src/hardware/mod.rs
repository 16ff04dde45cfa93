//! Hardware discovery: PCI topology, IOMMU groups, CPU platform

pub mod cpu;
pub mod gpu;
pub mod ids;
pub mod iommu;
pub mod pci;

pub use cpu::{CpuVendor, Platform, PlatformProbe};
pub use gpu::{Gpu, GpuKind};
pub use iommu::{IommuGroup, IommuTopology};
pub use pci::{PciAddress, PciDevice, PciScan, PciScanner};
