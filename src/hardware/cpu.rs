//! CPU vendor detection and IOMMU platform probing
//!
//! The kernel parameter that enables the IOMMU differs between Intel and
//! AMD, so the planner needs to know which silicon it is running on. A
//! second, best-effort probe looks for runtime evidence that the IOMMU is
//! already active; it only ever feeds advisory warnings.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Platform {
    pub vendor: CpuVendor,
    pub model_name: String,
}

impl Platform {
    /// Kernel cmdline fragment that turns the IOMMU on for this platform.
    /// `iommu=pt` keeps host-side DMA on the fast identity path either way.
    pub fn cmdline_fragment(&self) -> &'static str {
        match self.vendor {
            CpuVendor::Intel => "intel_iommu=on iommu=pt",
            CpuVendor::Amd => "amd_iommu=on iommu=pt",
            CpuVendor::Unknown => "iommu=pt",
        }
    }
}

/// Parses the kernel's CPU-info interface.
pub struct PlatformProbe {
    cpuinfo_path: PathBuf,
}

impl PlatformProbe {
    pub fn new(cpuinfo_path: impl Into<PathBuf>) -> Self {
        Self { cpuinfo_path: cpuinfo_path.into() }
    }

    pub fn system() -> Self {
        Self::new("/proc/cpuinfo")
    }

    pub fn detect(&self) -> Result<Platform> {
        let content = fs::read_to_string(&self.cpuinfo_path)
            .map_err(|e| Error::io(&self.cpuinfo_path, e))?;
        Ok(parse_cpuinfo(&content))
    }
}

fn parse_cpuinfo(content: &str) -> Platform {
    let mut vendor = CpuVendor::Unknown;
    let mut model_name = String::new();

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else { continue };
        match key.trim() {
            "vendor_id" if vendor == CpuVendor::Unknown => {
                vendor = match value.trim() {
                    "GenuineIntel" => CpuVendor::Intel,
                    "AuthenticAMD" => CpuVendor::Amd,
                    _ => CpuVendor::Unknown,
                };
            }
            "model name" if model_name.is_empty() => {
                model_name = value.trim().to_string();
            }
            _ => {}
        }
        if vendor != CpuVendor::Unknown && !model_name.is_empty() {
            break;
        }
    }

    Platform { vendor, model_name }
}

/// Look for IOMMU-enabled evidence in the kernel ring buffer. Returns None
/// when dmesg cannot be read (not root, not available); the caller treats
/// that as "unknown", never as an error.
pub fn iommu_runtime_active() -> Option<bool> {
    let output = Command::new("dmesg").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Some(ring_buffer_shows_iommu(&text))
}

fn ring_buffer_shows_iommu(text: &str) -> bool {
    text.lines().any(|line| {
        line.contains("DMAR: IOMMU enabled")
            || line.contains("DMAR-IR: Enabled IRQ remapping")
            || line.contains("AMD-Vi: Interrupt remapping enabled")
            || line.contains("AMD-Vi: AMD IOMMUv2")
            || line.contains("iommu: Default domain type:")
    })
}

/// Convenience for callers that fake /proc in tests.
pub fn detect_platform(proc_root: &Path) -> Result<Platform> {
    PlatformProbe::new(proc_root.join("cpuinfo")).detect()
}
