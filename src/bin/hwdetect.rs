//! Hardware detection and passthrough configuration CLI
//!
//! `scan` prints the PCI snapshot, `plan` the computed passthrough plan,
//! `apply` writes the plan into a target root's boot configuration.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use gpu_valet::bootcfg::{ApplyError, Mutator};
use gpu_valet::error::Error;
use gpu_valet::hardware::{cpu, gpu, GpuKind, IommuTopology, PciScanner, PlatformProbe};
use gpu_valet::plan::{self, PassthroughPlan};

/// Exit codes, fixed interface for scripting callers.
const EXIT_OK: u8 = 0;
const EXIT_NO_CANDIDATE: u8 = 2;
const EXIT_IOMMU_DISABLED: u8 = 3;
const EXIT_UNKNOWN_BOOTLOADER: u8 = 4;
const EXIT_APPLY_PARTIAL: u8 = 5;
const EXIT_USAGE: u8 = 64;

#[derive(Parser)]
#[command(name = "hwdetect", version, about = "GPU passthrough hardware detection and planning")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Enumerate PCI devices and their IOMMU groups
    Scan {
        /// Emit the scan as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Compute and print the passthrough plan
    Plan,
    /// Apply the passthrough plan to a root filesystem
    Apply {
        /// Target root (a mounted installation, or / for the live host)
        #[arg(long, default_value = "/")]
        target: PathBuf,
    },
}

fn main() -> ExitCode {
    gpu_valet::init_logging();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let code = match cli.command {
        Cmd::Scan { json } => run_scan(json),
        Cmd::Plan => run_plan(),
        Cmd::Apply { target } => run_apply(&target),
    };
    ExitCode::from(code)
}

fn exit_code_for(error: &Error) -> u8 {
    match error {
        Error::NoPassthroughCandidate => EXIT_NO_CANDIDATE,
        Error::IommuDisabled => EXIT_IOMMU_DISABLED,
        Error::UnknownBootloader { .. } => EXIT_UNKNOWN_BOOTLOADER,
        _ => 1,
    }
}

fn run_scan(json: bool) -> u8 {
    let scan = match PciScanner::system().scan() {
        Ok(scan) => scan,
        Err(e) => {
            eprintln!("scan failed: {}", e);
            return 1;
        }
    };

    if json {
        match serde_json::to_string_pretty(&scan.devices) {
            Ok(out) => println!("{}", out),
            Err(e) => {
                eprintln!("could not serialize scan: {}", e);
                return 1;
            }
        }
    } else {
        println!(
            "{:<14} {:<20} {:<5} {:<6} {:<12} {}",
            "ADDRESS", "CLASS", "BOOT", "GROUP", "DRIVER", "DEVICE"
        );
        for device in &scan.devices {
            println!(
                "{:<14} {:<20} {:<5} {:<6} {:<12} {} {}",
                device.address,
                device.class_description(),
                if device.is_boot_display { "*" } else { "" },
                device.iommu_group.map(|g| g.to_string()).unwrap_or_else(|| "-".into()),
                device.driver.as_deref().unwrap_or("-"),
                device.vendor_name,
                device.device_name,
            );
        }

        let gpus = gpu::classify(&scan);
        if !gpus.is_empty() {
            println!();
            for gpu in gpus {
                println!(
                    "gpu {}: {} [{}]",
                    gpu.device.address,
                    gpu.device.device_name,
                    match gpu.kind {
                        GpuKind::Integrated => "integrated",
                        GpuKind::Discrete => "discrete",
                    }
                );
            }
        }
    }

    for warning in &scan.warnings {
        eprintln!("warning: {}", warning);
    }
    EXIT_OK
}

/// Hardware always comes from the live kernel; the bootloader flavor comes
/// from whichever root the plan will be applied to.
fn compute_plan(bootloader_root: &Path) -> Result<PassthroughPlan, Error> {
    let scanner = PciScanner::system();
    let scan = scanner.scan()?;

    let topology = match IommuTopology::read(scanner.sysfs_root()) {
        Ok(topology) => Some(topology),
        Err(Error::IommuDisabled) => None,
        Err(e) => return Err(e),
    };

    let platform = PlatformProbe::system().detect()?;
    let bootloader = Mutator::new(bootloader_root).detect();

    plan::build_plan(
        &scan,
        topology.as_ref(),
        &platform,
        bootloader,
        cpu::iommu_runtime_active(),
    )
}

fn run_plan() -> u8 {
    let plan = match compute_plan(Path::new("/")) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("planning failed: {}", e);
            return exit_code_for(&e);
        }
    };

    match serde_json::to_string_pretty(&plan) {
        Ok(out) => println!("{}", out),
        Err(e) => {
            eprintln!("could not serialize plan: {}", e);
            return 1;
        }
    }
    for warning in &plan.warnings {
        eprintln!("warning: {}", warning);
    }
    EXIT_OK
}

fn run_apply(target: &PathBuf) -> u8 {
    let plan = match compute_plan(target) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("planning failed: {}", e);
            return exit_code_for(&e);
        }
    };
    for warning in &plan.warnings {
        eprintln!("warning: {}", warning);
    }

    let mutator = Mutator::new(target);
    match mutator.apply(&plan) {
        Ok(report) => {
            println!(
                "applied {} steps; rewrote {} file(s)",
                report.steps_completed.len(),
                report.files_written.len()
            );
            for file in &report.files_written {
                println!("  {}", file.display());
            }
            EXIT_OK
        }
        Err(ApplyError::UnknownBootloader(root)) => {
            eprintln!("no supported bootloader layout under {}", root.display());
            EXIT_UNKNOWN_BOOTLOADER
        }
        Err(e @ ApplyError::Step { .. }) => {
            eprintln!("{}", e);
            eprintln!(
                "completed steps were left in place; see {} for the resume point",
                target.join(gpu_valet::bootcfg::BREADCRUMB_FILE).display()
            );
            EXIT_APPLY_PARTIAL
        }
    }
}
