//! Bootloader layout detection and kernel-cmdline edits
//!
//! Two layouts are supported: loader-style entry files (one `options` line
//! per entry under `boot/loader/entries/`) and the menu-style default file
//! (`etc/default/grub` with a kernel args assignment). Edits are idempotent:
//! applying the same fragment twice leaves the files byte-identical.

use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::bootcfg::atomic;
use crate::error::{Error, Result};
use crate::plan::BootloaderKind;

/// Matches the kernel args assignment in the grub default file.
static RE_GRUB_CMDLINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^(GRUB_CMDLINE_LINUX_DEFAULT=")([^"]*)(")"#)
        .expect("invalid regex: RE_GRUB_CMDLINE")
});

pub const LOADER_ENTRIES_DIR: &str = "boot/loader/entries";
pub const GRUB_DEFAULT_FILE: &str = "etc/default/grub";

/// Inspect a target root for a supported layout. Loader entries win when
/// both are present: on such hosts the entry files are what the firmware
/// actually boots.
pub fn detect(root: &Path) -> BootloaderKind {
    if root.join(LOADER_ENTRIES_DIR).is_dir() {
        BootloaderKind::SystemdBoot
    } else if root.join(GRUB_DEFAULT_FILE).is_file() {
        BootloaderKind::Grub
    } else {
        BootloaderKind::Unknown
    }
}

/// Append `fragment` to the `options` line of every loader entry that does
/// not already carry it. Returns the entry files that were rewritten.
pub fn apply_loader_entries(root: &Path, fragment: &str) -> Result<Vec<PathBuf>> {
    let entries_dir = root.join(LOADER_ENTRIES_DIR);
    let dir = fs::read_dir(&entries_dir).map_err(|e| Error::io(&entries_dir, e))?;

    let mut rewritten = Vec::new();
    for entry in dir {
        let entry = entry.map_err(|e| Error::io(&entries_dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("conf") {
            continue;
        }

        let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        if let Some(updated) = edit_entry(&content, fragment) {
            atomic::replace_file(&path, &updated)?;
            rewritten.push(path);
        }
    }
    Ok(rewritten)
}

/// Returns the edited entry content, or None when no change is needed.
fn edit_entry(content: &str, fragment: &str) -> Option<String> {
    let mut changed = false;
    let mut saw_options = false;
    let mut lines: Vec<String> = Vec::new();

    for line in content.lines() {
        if let Some(args) = line.strip_prefix("options") {
            saw_options = true;
            if cmdline_contains(args, fragment) {
                lines.push(line.to_string());
            } else {
                lines.push(format!("{} {}", line.trim_end(), fragment));
                changed = true;
            }
        } else {
            lines.push(line.to_string());
        }
    }

    if !saw_options {
        lines.push(format!("options {}", fragment));
        changed = true;
    }

    if !changed {
        return None;
    }
    let mut out = lines.join("\n");
    out.push('\n');
    Some(out)
}

/// Append `fragment` to the default-args assignment if absent.
pub fn apply_grub_default(root: &Path, fragment: &str) -> Result<bool> {
    let path = root.join(GRUB_DEFAULT_FILE);
    let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;

    let Some(caps) = RE_GRUB_CMDLINE.captures(&content) else {
        return Err(Error::parse(
            path.display().to_string(),
            "no GRUB_CMDLINE_LINUX_DEFAULT assignment found",
        ));
    };

    let args = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    if cmdline_contains(args, fragment) {
        return Ok(false);
    }

    let replacement = if args.is_empty() {
        format!("${{1}}{}${{3}}", fragment)
    } else {
        format!("${{1}}${{2}} {}${{3}}", fragment)
    };
    let updated = RE_GRUB_CMDLINE.replace(&content, replacement.as_str());
    atomic::replace_file(&path, &updated)?;
    Ok(true)
}

/// Token-wise containment: every word of the fragment already present.
fn cmdline_contains(args: &str, fragment: &str) -> bool {
    let words: Vec<&str> = args.split_whitespace().collect();
    fragment.split_whitespace().all(|w| words.contains(&w))
}
