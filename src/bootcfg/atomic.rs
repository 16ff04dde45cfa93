//! Atomic file replacement
//!
//! Host boot configuration must never be observable half-written: a crash
//! between bytes of `/etc/modprobe.d/...` can leave the machine unbootable.
//! Every write therefore goes to a sibling temp file on the same
//! filesystem, is fsynced, renamed over the target, and the containing
//! directory is fsynced so the rename itself is durable.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::error::{Error, Result};

/// Replace `path` with `contents` without any partially-written
/// intermediate state. The original file is untouched on any failure before
/// the final rename.
pub fn replace_file(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Bug(format!("atomic write target {} has no parent", path.display())))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".gpu-valet.")
        .tempfile_in(dir)
        .map_err(|e| Error::io(dir, e))?;

    tmp.write_all(contents.as_bytes()).map_err(|e| Error::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| Error::io(tmp.path(), e))?;

    tmp.persist(path).map_err(|e| Error::io(path, e.error))?;

    // Durability of the rename requires the directory entry to hit disk.
    let dir_handle = File::open(dir).map_err(|e| Error::io(dir, e))?;
    dir_handle.sync_all().map_err(|e| Error::io(dir, e))?;

    Ok(())
}

/// `replace_file` preceded by `create_dir_all` on the parent.
pub fn replace_file_mkdirs(path: &Path, contents: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
    }
    replace_file(path, contents)
}
