//! Boot-config mutation
//!
//! Applies a [`PassthroughPlan`](crate::plan::PassthroughPlan) to a target
//! root — the live host or a mounted installation — in fixed, numbered
//! steps. Completed steps are each independently valid and are never rolled
//! back; a failure writes a breadcrumb recording how far the apply got so a
//! later run can resume.

pub mod atomic;
pub mod bootloader;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::plan::{BootloaderKind, PassthroughPlan};

pub use bootloader::detect as detect_bootloader;

/// Stub-driver rebind configuration, relative to the target root.
pub const MODPROBE_FILE: &str = "etc/modprobe.d/gpu-valet.conf";
/// Initramfs configuration whose MODULES token is rewritten.
pub const INITRAMFS_CONF: &str = "etc/mkinitcpio.conf";
/// Machine-readable record of a partial apply.
pub const BREADCRUMB_FILE: &str = "var/lib/gpu-valet/apply.state";

/// The numbered apply steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyStep {
    ModprobeConf,
    InitramfsConf,
    BootloaderEdit,
    InitramfsRegen,
    BootloaderRegen,
}

impl ApplyStep {
    pub fn index(self) -> u32 {
        match self {
            ApplyStep::ModprobeConf => 1,
            ApplyStep::InitramfsConf => 2,
            ApplyStep::BootloaderEdit => 3,
            ApplyStep::InitramfsRegen => 4,
            ApplyStep::BootloaderRegen => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ApplyStep::ModprobeConf => "modprobe conf",
            ApplyStep::InitramfsConf => "initramfs conf",
            ApplyStep::BootloaderEdit => "bootloader edit",
            ApplyStep::InitramfsRegen => "initramfs regen",
            ApplyStep::BootloaderRegen => "bootloader regen",
        }
    }
}

/// Why and where an apply stopped.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("no supported bootloader layout under {0}")]
    UnknownBootloader(PathBuf),
    #[error("apply failed at step {} ({}): {source}", .step.index(), .step.name())]
    Step {
        step: ApplyStep,
        #[source]
        source: Error,
    },
}

/// Breadcrumb written next to the product state on a failed apply.
#[derive(Debug, Serialize, Deserialize)]
pub struct Breadcrumb {
    /// Index of the last step that finished, 0 when none did.
    pub last_completed_step: u32,
    pub failed_step: u32,
    pub failed_step_name: String,
    pub rebind_ids: Vec<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Breadcrumb {
    pub fn load(target_root: &Path) -> Option<Self> {
        let path = target_root.join(BREADCRUMB_FILE);
        let raw = fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

/// Outcome of a successful apply.
#[derive(Debug)]
pub struct ApplyReport {
    pub bootloader: BootloaderKind,
    pub files_written: Vec<PathBuf>,
    pub steps_completed: Vec<ApplyStep>,
}

/// Applies plans to a root filesystem.
pub struct Mutator {
    target_root: PathBuf,
    initramfs_regen: Vec<String>,
    bootloader_regen: Vec<String>,
    chroot_regens: bool,
}

impl Mutator {
    pub fn new(target_root: impl Into<PathBuf>) -> Self {
        let target_root = target_root.into();
        let chroot_regens = target_root != Path::new("/");
        Self {
            target_root,
            initramfs_regen: vec!["mkinitcpio".into(), "-P".into()],
            bootloader_regen: vec![
                "grub-mkconfig".into(),
                "-o".into(),
                "/boot/grub/grub.cfg".into(),
            ],
            chroot_regens,
        }
    }

    /// Override the external regenerator invocations. `chroot` selects
    /// whether they are wrapped with `chroot <target_root>`.
    pub fn regen_commands(mut self, initramfs: &[&str], bootloader: &[&str], chroot: bool) -> Self {
        self.initramfs_regen = initramfs.iter().map(|s| s.to_string()).collect();
        self.bootloader_regen = bootloader.iter().map(|s| s.to_string()).collect();
        self.chroot_regens = chroot;
        self
    }

    pub fn target_root(&self) -> &Path {
        &self.target_root
    }

    pub fn detect(&self) -> BootloaderKind {
        bootloader::detect(&self.target_root)
    }

    /// Run every step against the target root. Prior steps stand on
    /// failure; the breadcrumb records the boundary.
    pub fn apply(&self, plan: &PassthroughPlan) -> std::result::Result<ApplyReport, ApplyError> {
        let kind = self.detect();
        if kind == BootloaderKind::Unknown {
            return Err(ApplyError::UnknownBootloader(self.target_root.clone()));
        }

        let mut report = ApplyReport {
            bootloader: kind,
            files_written: Vec::new(),
            steps_completed: Vec::new(),
        };

        let steps: &[ApplyStep] = if kind == BootloaderKind::Grub {
            &[
                ApplyStep::ModprobeConf,
                ApplyStep::InitramfsConf,
                ApplyStep::BootloaderEdit,
                ApplyStep::InitramfsRegen,
                ApplyStep::BootloaderRegen,
            ]
        } else {
            &[
                ApplyStep::ModprobeConf,
                ApplyStep::InitramfsConf,
                ApplyStep::BootloaderEdit,
                ApplyStep::InitramfsRegen,
            ]
        };

        for &step in steps {
            log::info!("apply step {} ({})", step.index(), step.name());
            if let Err(source) = self.run_step(step, kind, plan, &mut report) {
                self.write_breadcrumb(plan, &report, step);
                return Err(ApplyError::Step { step, source });
            }
            report.steps_completed.push(step);
        }

        // A completed apply supersedes any stale breadcrumb.
        let _ = fs::remove_file(self.target_root.join(BREADCRUMB_FILE));
        Ok(report)
    }

    fn run_step(
        &self,
        step: ApplyStep,
        kind: BootloaderKind,
        plan: &PassthroughPlan,
        report: &mut ApplyReport,
    ) -> Result<()> {
        match step {
            ApplyStep::ModprobeConf => {
                let path = self.target_root.join(MODPROBE_FILE);
                atomic::replace_file_mkdirs(&path, &modprobe_contents(plan))?;
                report.files_written.push(path);
            }
            ApplyStep::InitramfsConf => {
                let path = self.target_root.join(INITRAMFS_CONF);
                let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
                let updated = rewrite_modules_token(&content, &plan.initramfs_modules);
                if updated != content {
                    atomic::replace_file(&path, &updated)?;
                    report.files_written.push(path);
                }
            }
            ApplyStep::BootloaderEdit => match kind {
                BootloaderKind::SystemdBoot => {
                    let rewritten = bootloader::apply_loader_entries(
                        &self.target_root,
                        &plan.kernel_cmdline_fragment,
                    )?;
                    report.files_written.extend(rewritten);
                }
                BootloaderKind::Grub => {
                    if bootloader::apply_grub_default(
                        &self.target_root,
                        &plan.kernel_cmdline_fragment,
                    )? {
                        report.files_written.push(self.target_root.join(bootloader::GRUB_DEFAULT_FILE));
                    }
                }
                BootloaderKind::Unknown => {
                    return Err(Error::Bug("bootloader edit reached with unknown layout".into()));
                }
            },
            ApplyStep::InitramfsRegen => self.run_regen(&self.initramfs_regen)?,
            ApplyStep::BootloaderRegen => self.run_regen(&self.bootloader_regen)?,
        }
        Ok(())
    }

    fn run_regen(&self, argv: &[String]) -> Result<()> {
        let mut full: Vec<&str> = Vec::new();
        let root;
        if self.chroot_regens {
            root = self.target_root.display().to_string();
            full.push("chroot");
            full.push(&root);
        }
        full.extend(argv.iter().map(|s| s.as_str()));

        let (program, args) = full
            .split_first()
            .ok_or_else(|| Error::Bug("empty regenerator command".into()))?;

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::io(PathBuf::from(program), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::io(
                PathBuf::from(program),
                std::io::Error::other(format!(
                    "exited with {}: {}",
                    output.status,
                    stderr.trim()
                )),
            ));
        }
        Ok(())
    }

    fn write_breadcrumb(&self, plan: &PassthroughPlan, report: &ApplyReport, failed: ApplyStep) {
        let crumb = Breadcrumb {
            last_completed_step: report.steps_completed.last().map(|s| s.index()).unwrap_or(0),
            failed_step: failed.index(),
            failed_step_name: failed.name().to_string(),
            rebind_ids: plan.rebind_ids.clone(),
            timestamp: chrono::Utc::now(),
        };
        let path = self.target_root.join(BREADCRUMB_FILE);
        match serde_json::to_string_pretty(&crumb) {
            Ok(json) => {
                if let Err(e) = atomic::replace_file_mkdirs(&path, &(json + "\n")) {
                    log::warn!("could not write breadcrumb {}: {}", path.display(), e);
                } else {
                    log::warn!(
                        "apply stopped at step {} ({}); breadcrumb at {}",
                        failed.index(),
                        failed.name(),
                        path.display()
                    );
                }
            }
            Err(e) => log::warn!("could not serialize breadcrumb: {}", e),
        }
    }
}

/// Render the stub-driver rebind file: one options line with the comma-
/// joined IDs, then one softdep line per preempted driver.
fn modprobe_contents(plan: &PassthroughPlan) -> String {
    let mut out = String::from("# Generated by gpu-valet; do not edit. Re-run hwdetect apply instead.\n");
    out.push_str(&format!("options vfio-pci ids={}\n", plan.rebind_ids.join(",")));
    for driver in &plan.driver_preempt_list {
        out.push_str(&format!("softdep {} pre: vfio-pci\n", driver));
    }
    out
}

/// Replace the `MODULES=(...)` token, preserving every other line. The
/// token is appended when the file lacks one.
fn rewrite_modules_token(content: &str, modules: &[String]) -> String {
    let replacement = format!("MODULES=({})", modules.join(" "));
    let mut out = String::new();
    let mut replaced = false;

    for line in content.lines() {
        let trimmed = line.trim_start();
        if !replaced && trimmed.starts_with("MODULES=(") {
            out.push_str(&replacement);
            replaced = true;
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }

    if !replaced {
        out.push_str(&replacement);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::pci::PciDevice;

    fn sample_plan(kind: BootloaderKind) -> PassthroughPlan {
        PassthroughPlan {
            target_gpu: PciDevice {
                address: "0000:01:00.0".into(),
                vendor_id: 0x10de,
                device_id: 0x1c03,
                class_code: 0x030000,
                vendor_name: "NVIDIA Corporation".into(),
                device_name: "GP106".into(),
                is_boot_display: false,
                iommu_group: Some(12),
                driver: Some("nouveau".into()),
            },
            rebind_ids: vec!["10de:1c03".into(), "10de:10f1".into()],
            driver_preempt_list: vec!["nouveau".into(), "nvidia".into()],
            initramfs_modules: vec!["vfio_pci".into(), "vfio".into(), "vfio_iommu_type1".into()],
            kernel_cmdline_fragment: "intel_iommu=on iommu=pt".into(),
            bootloader: kind,
            iommu_runtime_active: None,
            warnings: Vec::new(),
        }
    }

    fn loader_root() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let entries = root.path().join(bootloader::LOADER_ENTRIES_DIR);
        fs::create_dir_all(&entries).unwrap();
        fs::write(entries.join("arch.conf"), "title Arch\nlinux /vmlinuz-linux\noptions root=UUID=abc rw\n").unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::write(
            root.path().join("etc/mkinitcpio.conf"),
            "# vim:set ft=sh\nMODULES=()\nBINARIES=()\nHOOKS=(base udev autodetect)\n",
        )
        .unwrap();
        root
    }

    #[test]
    fn modprobe_file_format() {
        let content = modprobe_contents(&sample_plan(BootloaderKind::SystemdBoot));
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines[0].starts_with('#'));
        assert_eq!(lines[1], "options vfio-pci ids=10de:1c03,10de:10f1");
        assert_eq!(lines[2], "softdep nouveau pre: vfio-pci");
        assert_eq!(lines[3], "softdep nvidia pre: vfio-pci");
        assert!(content.ends_with('\n'));
    }

    #[test]
    fn modules_token_rewrite_preserves_other_lines() {
        let conf = "# comment\nMODULES=(crc32c)\nBINARIES=()\nHOOKS=(base)\n";
        let modules: Vec<String> =
            ["vfio_pci", "vfio", "vfio_iommu_type1"].iter().map(|s| s.to_string()).collect();
        let updated = rewrite_modules_token(conf, &modules);
        assert!(updated.contains("MODULES=(vfio_pci vfio vfio_iommu_type1)\n"));
        assert!(updated.contains("# comment\n"));
        assert!(updated.contains("HOOKS=(base)\n"));
        assert!(!updated.contains("crc32c"));
    }

    #[test]
    fn apply_on_loader_entries_succeeds_and_is_idempotent() {
        let root = loader_root();
        let mutator = Mutator::new(root.path()).regen_commands(&["true"], &["true"], false);
        let plan = sample_plan(BootloaderKind::SystemdBoot);

        let report = mutator.apply(&plan).unwrap();
        assert_eq!(report.bootloader, BootloaderKind::SystemdBoot);
        assert_eq!(report.steps_completed.len(), 4);

        let modprobe = fs::read_to_string(root.path().join(MODPROBE_FILE)).unwrap();
        assert!(modprobe.contains("options vfio-pci ids=10de:1c03,10de:10f1"));

        let entry = fs::read_to_string(
            root.path().join(bootloader::LOADER_ENTRIES_DIR).join("arch.conf"),
        )
        .unwrap();
        assert_eq!(entry.matches("intel_iommu=on").count(), 1);

        // Second apply: byte-equal outputs
        mutator.apply(&plan).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join(MODPROBE_FILE)).unwrap(),
            modprobe
        );
        assert_eq!(
            fs::read_to_string(
                root.path().join(bootloader::LOADER_ENTRIES_DIR).join("arch.conf")
            )
            .unwrap(),
            entry
        );
    }

    #[test]
    fn failed_regen_leaves_prior_steps_and_breadcrumb() {
        let root = loader_root();
        let mutator = Mutator::new(root.path()).regen_commands(&["false"], &["true"], false);
        let plan = sample_plan(BootloaderKind::SystemdBoot);

        let err = mutator.apply(&plan).unwrap_err();
        match err {
            ApplyError::Step { step, .. } => assert_eq!(step, ApplyStep::InitramfsRegen),
            other => panic!("unexpected error: {}", other),
        }

        // Steps 1-3 stand in their intended post-state
        assert!(root.path().join(MODPROBE_FILE).is_file());
        let initramfs = fs::read_to_string(root.path().join(INITRAMFS_CONF)).unwrap();
        assert!(initramfs.contains("MODULES=(vfio_pci vfio vfio_iommu_type1)"));

        let crumb = Breadcrumb::load(root.path()).expect("breadcrumb written");
        assert_eq!(crumb.failed_step, ApplyStep::InitramfsRegen.index());
        assert_eq!(crumb.last_completed_step, ApplyStep::BootloaderEdit.index());
        assert_eq!(crumb.rebind_ids, plan.rebind_ids);
    }

    #[test]
    fn unknown_layout_refused_before_any_write() {
        let root = tempfile::tempdir().unwrap();
        let mutator = Mutator::new(root.path());
        let err = mutator.apply(&sample_plan(BootloaderKind::Unknown)).unwrap_err();
        assert!(matches!(err, ApplyError::UnknownBootloader(_)));
        assert!(!root.path().join(MODPROBE_FILE).exists());
    }
}
