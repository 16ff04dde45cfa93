//! Disk image creation
//!
//! Wrapper around `qemu-img` used when a defined profile has no backing
//! image yet.

use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};

/// Create a qcow2 image of `size_gib` gibibytes at `path`.
pub fn create_disk(path: &Path, size_gib: u32) -> Result<()> {
    let path_str = path
        .to_str()
        .ok_or_else(|| Error::parse("disk path", format!("{:?} is not UTF-8", path)))?;

    let output = Command::new("qemu-img")
        .args(["create", "-f", "qcow2", path_str, &format!("{}G", size_gib)])
        .output()
        .map_err(|e| Error::io("qemu-img", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::io(
            path,
            std::io::Error::other(format!("qemu-img create failed: {}", stderr.trim())),
        ));
    }

    log::info!("created disk image {} ({} GiB)", path.display(), size_gib);
    Ok(())
}
