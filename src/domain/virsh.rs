//! Virtualization daemon client
//!
//! A typed wrapper over the system-scope `virsh` CLI. Every invocation
//! carries a deadline: the child is polled and killed on expiry rather than
//! blocking the caller forever. stderr is classified into the error
//! taxonomy so callers can distinguish "no such domain" from "device busy"
//! from a daemon refusal.

use std::collections::HashMap;
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Default per-call deadline. Daemon RPCs normally answer in milliseconds;
/// anything past this is a wedged daemon or a guest ignoring ACPI.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Virsh {
    program: String,
    uri: String,
    deadline: Duration,
}

/// Output classification for one finished invocation.
#[derive(Debug)]
pub struct VirshOutput {
    pub stdout: String,
}

impl Virsh {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            program: "virsh".to_string(),
            uri: uri.into(),
            deadline: DEFAULT_DEADLINE,
        }
    }

    /// Point the wrapper at a different executable. Tests use this to run a
    /// recording stub instead of the real client.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Run one virsh subcommand, enforcing the deadline.
    pub fn run(&self, args: &[&str]) -> Result<VirshOutput> {
        let operation = args.first().copied().unwrap_or("virsh");
        log::debug!("virsh {} (uri {})", args.join(" "), self.uri);

        let mut child = Command::new(&self.program)
            .arg("--connect")
            .arg(&self.uri)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::io(&self.program, e))?;

        // Output is drained on threads while we poll: a child producing
        // more than a pipe buffer (dumpxml can) must not block forever.
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_thread = std::thread::spawn(move || drain(stdout_pipe));
        let stderr_thread = std::thread::spawn(move || drain(stderr_pipe));

        let deadline = Instant::now() + self.deadline;
        let status = loop {
            match child.try_wait().map_err(|e| Error::io(&self.program, e))? {
                Some(status) => break status,
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(Error::TimedOut {
                            operation: format!("virsh {}", operation),
                            seconds: self.deadline.as_secs(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
            }
        };

        let stdout = stdout_thread.join().unwrap_or_default();
        let stderr = stderr_thread.join().unwrap_or_default();

        if status.success() {
            return Ok(VirshOutput { stdout });
        }

        Err(classify_failure(
            status.code().unwrap_or(-1),
            stderr.trim(),
            operation,
        ))
    }

    // -- domain queries ----------------------------------------------------

    /// Names of all defined domains, running or not.
    pub fn list_names(&self) -> Result<Vec<String>> {
        let output = self.run(&["list", "--all", "--name"])?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn domain_exists(&self, name: &str) -> Result<bool> {
        match self.run(&["dominfo", name]) {
            Ok(_) => Ok(true),
            Err(Error::Daemon { code, .. }) if code == NOT_FOUND => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Key/value output of `dominfo`, e.g. map["UUID"], map["State"].
    pub fn dominfo(&self, name: &str) -> Result<HashMap<String, String>> {
        let output = self.run(&["dominfo", name])?;
        Ok(parse_keyed_output(&output.stdout))
    }

    pub fn domstate(&self, name: &str) -> Result<String> {
        let output = self.run(&["domstate", name])?;
        Ok(output.stdout.trim().to_string())
    }

    pub fn dumpxml(&self, name: &str) -> Result<String> {
        Ok(self.run(&["dumpxml", name])?.stdout)
    }

    // -- lifecycle ---------------------------------------------------------

    pub fn define(&self, xml: &str) -> Result<()> {
        let file = write_xml_arg(xml)?;
        self.run(&["define", &file.path_string()?]).map(drop)
    }

    pub fn start(&self, name: &str) -> Result<()> {
        self.run(&["start", name]).map(drop)
    }

    pub fn shutdown(&self, name: &str) -> Result<()> {
        self.run(&["shutdown", name]).map(drop)
    }

    pub fn destroy(&self, name: &str) -> Result<()> {
        self.run(&["destroy", name]).map(drop)
    }

    pub fn suspend(&self, name: &str) -> Result<()> {
        self.run(&["suspend", name]).map(drop)
    }

    pub fn resume(&self, name: &str) -> Result<()> {
        self.run(&["resume", name]).map(drop)
    }

    pub fn undefine(&self, name: &str) -> Result<()> {
        // NVRAM files accompany UEFI guests; undefine must reap them too.
        self.run(&["undefine", name, "--nvram"]).map(drop)
    }

    pub fn snapshot_create(&self, name: &str, tag: &str) -> Result<()> {
        self.run(&["snapshot-create-as", name, tag]).map(drop)
    }

    // -- devices -----------------------------------------------------------

    pub fn attach_device_live(&self, name: &str, device_xml: &str) -> Result<()> {
        let file = write_xml_arg(device_xml)?;
        self.run(&["attach-device", name, &file.path_string()?, "--live"])
            .map(drop)
    }

    pub fn attach_device_config(&self, name: &str, device_xml: &str) -> Result<()> {
        let file = write_xml_arg(device_xml)?;
        self.run(&["attach-device", name, &file.path_string()?, "--config"])
            .map(drop)
    }

    pub fn detach_device_live(&self, name: &str, device_xml: &str) -> Result<()> {
        let file = write_xml_arg(device_xml)?;
        self.run(&["detach-device", name, &file.path_string()?, "--live"])
            .map(drop)
    }

    pub fn detach_device_config(&self, name: &str, device_xml: &str) -> Result<()> {
        let file = write_xml_arg(device_xml)?;
        self.run(&["detach-device", name, &file.path_string()?, "--config"])
            .map(drop)
    }
}

fn drain<R: Read>(pipe: Option<R>) -> String {
    let mut out = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut out);
    }
    out
}

/// Daemon error code used for "no such domain".
pub const NOT_FOUND: i32 = -404;

fn classify_failure(exit_code: i32, stderr: &str, operation: &str) -> Error {
    let lower = stderr.to_lowercase();
    if lower.contains("domain not found")
        || lower.contains("no domain with matching name")
        || lower.contains("no domain with name")
    {
        return Error::Daemon { code: NOT_FOUND, message: stderr.to_string() };
    }
    if lower.contains("device or resource busy") || lower.contains("device busy") {
        return Error::DeviceBusy(operation.to_string());
    }
    Error::Daemon {
        code: exit_code,
        message: if stderr.is_empty() {
            format!("virsh {} failed", operation)
        } else {
            stderr.to_string()
        },
    }
}

pub fn is_not_found(error: &Error) -> bool {
    matches!(error, Error::Daemon { code, .. } if *code == NOT_FOUND)
}

/// XML handed to virsh goes through a temp file so it never appears in
/// process listings.
struct XmlArg {
    file: tempfile::NamedTempFile,
}

impl XmlArg {
    fn path_string(&self) -> Result<String> {
        self.file
            .path()
            .to_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Bug("temp path is not UTF-8".into()))
    }
}

fn write_xml_arg(xml: &str) -> Result<XmlArg> {
    use std::io::Write;
    let mut file = tempfile::Builder::new()
        .prefix("gpu-valet-")
        .suffix(".xml")
        .tempfile()
        .map_err(|e| Error::io("/tmp", e))?;
    file.write_all(xml.as_bytes()).map_err(|e| Error::io(file.path(), e))?;
    file.flush().map_err(|e| Error::io(file.path(), e))?;
    Ok(XmlArg { file })
}

/// Parse `Key: value` lines as emitted by dominfo and friends.
fn parse_keyed_output(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed_output_parse() {
        let text = "Id:             3\nName:           win11\nUUID:           8f7a\nState:          running\nCPU(s):         8\nMax memory:     16777216 KiB\n";
        let map = parse_keyed_output(text);
        assert_eq!(map["Name"], "win11");
        assert_eq!(map["State"], "running");
        assert_eq!(map["Max memory"], "16777216 KiB");
    }

    #[test]
    fn failure_classification() {
        assert!(is_not_found(&classify_failure(
            1,
            "error: failed to get domain 'x': Domain not found",
            "dominfo"
        )));
        assert!(matches!(
            classify_failure(1, "error: Device or resource busy", "attach-device"),
            Error::DeviceBusy(_)
        ));
        assert!(matches!(
            classify_failure(1, "error: internal error", "start"),
            Error::Daemon { code: 1, .. }
        ));
    }
}
