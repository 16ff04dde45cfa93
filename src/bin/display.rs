//! Display supervisor CLI
//!
//! `start` runs the supervisor in the foreground (vmctl spawns it detached
//! during domain start): it owns the shared region and the client process
//! until either exits or a termination signal arrives. `stop` signals a
//! running supervisor; `restart` cycles it.

use std::fs;
use std::path::PathBuf;
use std::process::{Command as ProcessCommand, ExitCode, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use gpu_valet::config::{Config, ProfileStore};
use gpu_valet::display::{ClientStatus, DisplaySupervisor};
use gpu_valet::domain::virsh::Virsh;
use gpu_valet::error::Error;

const EXIT_USAGE: u8 = 64;
const STOP_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "display", version, about = "Supervise the shared-memory display client")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the supervisor for a domain in the foreground
    Start { domain: String },
    /// Signal a running supervisor to shut down
    Stop { domain: String },
    /// Stop any running supervisor, then start a fresh one detached
    Restart { domain: String },
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

    let code = match cli.command {
        Cmd::Start { domain } => run_start(&config, &domain),
        Cmd::Stop { domain } => run_stop(&config, &domain),
        Cmd::Restart { domain } => run_restart(&config, &domain),
    };
    ExitCode::from(code)
}

fn pidfile(config: &Config, domain: &str) -> PathBuf {
    config.state_dir.join(format!("display-{}.pid", domain))
}

fn domain_is_running(config: &Config, domain: &str) -> bool {
    Virsh::new(config.connect_uri.clone())
        .domstate(domain)
        .map(|state| state == "running" || state == "paused")
        .unwrap_or(false)
}

fn run_start(config: &Config, domain: &str) -> u8 {
    if let Err(e) = gpu_valet::domain::validate_name(domain) {
        eprintln!("error: {}", e);
        return 1;
    }

    let store = ProfileStore::open_default();
    let profile = match store.load(domain) {
        Ok(profile) => profile,
        Err(e) => {
            eprintln!("could not load profile for {}: {}", domain, e);
            return 1;
        }
    };
    if !profile.display.enabled {
        eprintln!("display is disabled in the profile for {}", domain);
        return 1;
    }

    let pid_path = pidfile(config, domain);
    if let Some(parent) = pid_path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if let Err(e) = fs::write(&pid_path, format!("{}\n", std::process::id())) {
        eprintln!("could not write pidfile {}: {}", pid_path.display(), e);
        return 1;
    }

    // Termination must run the teardown path: SIGTERM/SIGINT set a flag the
    // loop below observes, so the guards drop normally.
    let terminate = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&terminate);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        eprintln!("could not install signal handler: {}", e);
        let _ = fs::remove_file(&pid_path);
        return 1;
    }

    let mut supervisor = match DisplaySupervisor::start(config, &profile) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            eprintln!("could not start display client: {}", e);
            let _ = fs::remove_file(&pid_path);
            return 1;
        }
    };

    while !terminate.load(Ordering::SeqCst) && supervisor.status() == ClientStatus::Running {
        std::thread::sleep(Duration::from_millis(500));
    }

    let status = supervisor.status();
    // While the domain is up the hypervisor still holds the region's inode;
    // a replacement client must map that same file, so it stays.
    if domain_is_running(config, domain) {
        supervisor.stop_keep_region();
    } else {
        supervisor.stop();
    }
    let _ = fs::remove_file(&pid_path);

    match status {
        ClientStatus::Failed(code) => {
            eprintln!("display client for {} failed with status {}", domain, code);
            1
        }
        _ => 0,
    }
}

fn run_stop(config: &Config, domain: &str) -> u8 {
    if let Err(e) = gpu_valet::domain::validate_name(domain) {
        eprintln!("error: {}", e);
        return 1;
    }

    let pid_path = pidfile(config, domain);
    let raw = match fs::read_to_string(&pid_path) {
        Ok(raw) => raw,
        Err(_) => {
            eprintln!("no display supervisor is running for {}", domain);
            return 1;
        }
    };
    let Some(pid) = raw.trim().parse::<i32>().ok().map(Pid::from_raw) else {
        eprintln!("malformed pidfile {}", pid_path.display());
        let _ = fs::remove_file(&pid_path);
        return 1;
    };

    if signal::kill(pid, Signal::SIGTERM).is_err() {
        // Stale pidfile from an unclean host shutdown
        let _ = fs::remove_file(&pid_path);
        if !domain_is_running(config, domain) {
            let _ = fs::remove_file(config.shared_region_path(domain));
        }
        return 0;
    }

    let deadline = Instant::now() + STOP_WAIT;
    while Instant::now() < deadline {
        if signal::kill(pid, None).is_err() {
            return 0;
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    eprintln!("supervisor for {} ignored SIGTERM; killing", domain);
    let _ = signal::kill(pid, Signal::SIGKILL);
    // The killed process could not run its cleanup; finish it here.
    let _ = fs::remove_file(&pid_path);
    if !domain_is_running(config, domain) {
        let _ = fs::remove_file(config.shared_region_path(domain));
    }
    0
}

fn run_restart(config: &Config, domain: &str) -> u8 {
    let pid_path = pidfile(config, domain);
    if pid_path.exists() {
        let code = run_stop(config, domain);
        if code != 0 {
            return code;
        }
    }

    let self_exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            eprintln!("{}", Error::io("display", e));
            return 1;
        }
    };

    match ProcessCommand::new(self_exe)
        .arg("start")
        .arg(domain)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(_) => {
            println!("display supervisor for {} restarted", domain);
            0
        }
        Err(e) => {
            eprintln!("could not respawn supervisor: {}", e);
            1
        }
    }
}
