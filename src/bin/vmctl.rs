//! Domain lifecycle CLI
//!
//! Thin shell over the domain controller: define from a profile file,
//! start/stop/snapshot/delete, and runtime PCI attach/detach.

use std::path::{Path, PathBuf};
use std::process::{Command as ProcessCommand, ExitCode, Stdio};
use std::time::Duration;

use clap::{Parser, Subcommand};

use gpu_valet::config::{Config, ProfileStore, VmProfile};
use gpu_valet::domain::{virsh, DisplayLaunch, DomainController};
use gpu_valet::error::Error;

const EXIT_OK: u8 = 0;
const EXIT_NOT_FOUND: u8 = 2;
const EXIT_INVALID_STATE: u8 = 3;
const EXIT_INVALID_NAME: u8 = 4;
const EXIT_DAEMON: u8 = 5;
const EXIT_PASSTHROUGH: u8 = 6;
const EXIT_USAGE: u8 = 64;

/// Grace given to a guest before `stop` reports a timeout.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(90);

#[derive(Parser)]
#[command(name = "vmctl", version, about = "Manage passthrough virtual machines")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List all defined domains
    List,
    /// Show one domain
    Show { name: String },
    /// Define (or redefine) a domain from a profile file
    Define { profile_file: PathBuf },
    /// Start a domain
    Start { name: String },
    /// Stop a domain (ACPI shutdown; --force pulls the plug)
    Stop {
        name: String,
        #[arg(long)]
        force: bool,
    },
    /// Pause a running domain
    Pause { name: String },
    /// Resume a paused domain
    Resume { name: String },
    /// Take a snapshot
    Snapshot { name: String, tag: String },
    /// Undefine a domain (--purge also deletes its disk)
    Delete {
        name: String,
        #[arg(long)]
        purge: bool,
    },
    /// Hot-attach a PCI function to a running domain
    AttachPci { name: String, addr: String },
    /// Hot-detach a PCI function from a running domain
    DetachPci { name: String, addr: String },
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

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("could not load configuration: {}", e);
            return ExitCode::from(1);
        }
    };

    let controller = DomainController::new(config);
    controller.readiness_sweep();

    ExitCode::from(run(&controller, cli.command))
}

fn exit_code_for(error: &Error) -> u8 {
    match error {
        Error::InvalidName(_) => EXIT_INVALID_NAME,
        Error::InvalidState { .. } => EXIT_INVALID_STATE,
        Error::StorageOutsideRoot { .. } => EXIT_INVALID_STATE,
        Error::DeviceBusy(_) | Error::DeviceMissing(_) => EXIT_PASSTHROUGH,
        Error::Daemon { .. } if error_is_not_found(error) => EXIT_NOT_FOUND,
        Error::Daemon { .. } | Error::TimedOut { .. } => EXIT_DAEMON,
        Error::Io { .. } if is_missing_profile(error) => EXIT_NOT_FOUND,
        _ => 1,
    }
}

fn error_is_not_found(error: &Error) -> bool {
    virsh::is_not_found(error)
}

fn is_missing_profile(error: &Error) -> bool {
    matches!(error, Error::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
}

fn fail(error: Error) -> u8 {
    eprintln!("error: {}", error);
    exit_code_for(&error)
}

fn run(controller: &DomainController, command: Cmd) -> u8 {
    match command {
        Cmd::List => match controller.list() {
            Ok(domains) => {
                println!("{:<20} {:<10} {:>8} {:>6} {:<4} {}", "NAME", "STATE", "MEM", "VCPU", "PCI", "ATTACHED");
                for d in domains {
                    println!(
                        "{:<20} {:<10} {:>7}M {:>6} {:<4} {}",
                        d.name,
                        d.state.to_string(),
                        d.memory_mib,
                        d.vcpus,
                        if d.has_passthrough { "yes" } else { "no" },
                        d.attached_pci.join(",")
                    );
                }
                EXIT_OK
            }
            Err(e) => fail(e),
        },
        Cmd::Show { name } => match controller.get(&name) {
            Ok(Some(domain)) => match serde_json::to_string_pretty(&domain) {
                Ok(out) => {
                    println!("{}", out);
                    EXIT_OK
                }
                Err(e) => {
                    eprintln!("could not serialize domain: {}", e);
                    1
                }
            },
            Ok(None) => {
                eprintln!("domain {} is not defined", name);
                EXIT_NOT_FOUND
            }
            Err(e) => fail(e),
        },
        Cmd::Define { profile_file } => {
            let store = ProfileStore::open_default();
            match store.load_path(&profile_file).and_then(|profile| {
                controller.define(&profile)?;
                Ok(profile)
            }) {
                Ok(profile) => {
                    println!("defined {}", profile.name);
                    EXIT_OK
                }
                Err(e) => fail(e),
            }
        }
        Cmd::Start { name } => {
            let spawner = |profile: &VmProfile, region: &Path| spawn_display(profile, region);
            match controller.start(&name, DisplayLaunch::Spawn(&spawner)) {
                Ok(warnings) => {
                    for warning in warnings {
                        eprintln!("warning: {}", warning);
                    }
                    println!("{} started", name);
                    EXIT_OK
                }
                Err(e) => fail(e),
            }
        }
        Cmd::Stop { name, force } => {
            let result = if force {
                controller.force_off(&name)
            } else {
                controller.shutdown(&name, SHUTDOWN_WAIT)
            };
            match result {
                Ok(()) => {
                    println!("{} stopped", name);
                    EXIT_OK
                }
                Err(e) => fail(e),
            }
        }
        Cmd::Pause { name } => match controller.pause(&name) {
            Ok(()) => EXIT_OK,
            Err(e) => fail(e),
        },
        Cmd::Resume { name } => match controller.resume(&name) {
            Ok(()) => EXIT_OK,
            Err(e) => fail(e),
        },
        Cmd::Snapshot { name, tag } => match controller.snapshot(&name, &tag) {
            Ok(()) => {
                println!("snapshot {} of {} created", tag, name);
                EXIT_OK
            }
            Err(e) => fail(e),
        },
        Cmd::Delete { name, purge } => match controller.delete(&name, purge) {
            Ok(()) => {
                println!("{} deleted", name);
                EXIT_OK
            }
            Err(e) => fail(e),
        },
        Cmd::AttachPci { name, addr } => match controller.attach_pci(&name, &addr) {
            Ok(()) => {
                println!("{} attached to {}", addr, name);
                EXIT_OK
            }
            Err(e) => fail(e),
        },
        Cmd::DetachPci { name, addr } => match controller.detach_pci(&name, &addr) {
            Ok(()) => {
                println!("{} detached from {}", addr, name);
                EXIT_OK
            }
            Err(e) => fail(e),
        },
    }
}

/// Launch the display supervisor as its own long-lived process; vmctl
/// itself exits right after the start sequence.
fn spawn_display(profile: &VmProfile, _region: &Path) -> gpu_valet::Result<()> {
    let display_bin = std::env::current_exe()
        .map(|p| p.with_file_name("display"))
        .unwrap_or_else(|_| PathBuf::from("display"));

    ProcessCommand::new(&display_bin)
        .arg("start")
        .arg(&profile.name)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(drop)
        .map_err(|e| Error::io(&display_bin, e))
}
