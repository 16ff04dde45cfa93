//! Domain controller scenarios against a scripted daemon client.
//!
//! The controller is pointed at a generated shell script instead of the
//! real virsh binary. The script appends every invocation to an audit log
//! and answers from canned per-domain state files, which lets these tests
//! assert not just return values but what never reached a subprocess.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gpu_valet::config::{
    Config, DiskSpec, DisplayOptions, Firmware, InstallMethod, PassthroughRequest, ProfileStore,
    VmProfile,
};
use gpu_valet::domain::virsh::Virsh;
use gpu_valet::domain::transfer::TransferProtocol;
use gpu_valet::domain::{DisplayLaunch, DomainController, DomainState};
use gpu_valet::error::Error;

struct Harness {
    _dir: tempfile::TempDir,
    controller: DomainController,
    audit_log: PathBuf,
    state_dir: PathBuf,
    names_file: PathBuf,
    config: Config,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let audit_log = root.join("virsh-audit.log");
        let state_dir = root.join("daemon-state");
        let names_file = state_dir.join("names");
        fs::create_dir_all(&state_dir).unwrap();
        fs::write(&names_file, "").unwrap();

        let script = root.join("fake-virsh.sh");
        fs::write(&script, fake_virsh_script(&audit_log, &state_dir, &names_file)).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let storage_root = root.join("images");
        fs::create_dir_all(&storage_root).unwrap();
        let shm_dir = root.join("shm");
        fs::create_dir_all(&shm_dir).unwrap();

        let config = Config {
            storage_root,
            state_dir: root.join("state"),
            shm_dir,
            ..Config::default()
        };

        let store = ProfileStore::new(root.join("profiles"));
        let virsh = Virsh::new("qemu:///system")
            .with_program(script.to_string_lossy().into_owned())
            .with_deadline(Duration::from_secs(5));

        // Fake sysfs so stub-bind attempts fail fast as DeviceMissing
        let sysfs = root.join("sys");
        fs::create_dir_all(sysfs.join("bus/pci/devices")).unwrap();
        let transfer = TransferProtocol::new(&sysfs);

        let controller = DomainController::with_parts(config.clone(), store, virsh, transfer);
        Harness { _dir: dir, controller, audit_log, state_dir, names_file, config }
    }

    fn add_domain(&self, name: &str, state: &str) {
        let mut names = fs::read_to_string(&self.names_file).unwrap();
        names.push_str(name);
        names.push('\n');
        fs::write(&self.names_file, names).unwrap();
        fs::write(self.state_dir.join(format!("{}.state", name)), format!("{}\n", state)).unwrap();
    }

    fn set_domain_xml(&self, name: &str, xml: &str) {
        fs::write(self.state_dir.join(format!("{}.xml", name)), xml).unwrap();
    }

    fn audit(&self) -> String {
        fs::read_to_string(&self.audit_log).unwrap_or_default()
    }

    fn profile(&self, name: &str) -> VmProfile {
        VmProfile {
            name: name.into(),
            install_method: InstallMethod::VmPassthrough,
            memory_mib: Some(4096),
            vcpus: Some(2),
            cpu_pinning: Vec::new(),
            hugepages: false,
            passthrough: None,
            shared_region_mib: 1,
            disk: DiskSpec { path: None, size_gib: Some(16) },
            firmware: Firmware::Uefi,
            tpm: false,
            display: DisplayOptions { enabled: false, ..DisplayOptions::default() },
            launch_roots: Vec::new(),
        }
    }
}

fn fake_virsh_script(audit: &Path, state_dir: &Path, names: &Path) -> String {
    format!(
        r#"#!/bin/sh
echo "$@" >> {audit}
# drop "--connect URI"
shift 2
cmd="$1"
name="$2"
case "$cmd" in
  list)
    cat {names}
    ;;
  dominfo)
    if grep -qx "$name" {names}; then
      state=$(cat {state_dir}/$name.state 2>/dev/null || echo "shut off")
      printf 'Name:           %s\nUUID:           2af1c1c2-8f67-4d1a-b9a1-93d2c7e6f9ab\nState:          %s\nCPU(s):         2\nMax memory:     4194304 KiB\n' "$name" "$state"
    else
      echo "error: failed to get domain '$name': Domain not found" >&2
      exit 1
    fi
    ;;
  domstate)
    cat {state_dir}/$name.state 2>/dev/null || echo "shut off"
    ;;
  dumpxml)
    if [ -f {state_dir}/$name.xml ]; then
      cat {state_dir}/$name.xml
    else
      printf '<domain type="kvm"><name>%s</name><uuid>2af1c1c2</uuid><devices/></domain>\n' "$name"
    fi
    ;;
  define)
    # $name is the XML file path; register the domain it names
    dn=$(sed -n 's|.*<name>\(.*\)</name>.*|\1|p' "$name" | head -1)
    if [ -n "$dn" ] && ! grep -qx "$dn" {names}; then
      echo "$dn" >> {names}
      echo "shut off" > {state_dir}/$dn.state
    fi
    ;;
  start)
    echo running > {state_dir}/$name.state
    ;;
  destroy|shutdown)
    echo "shut off" > {state_dir}/$name.state
    ;;
  undefine)
    grep -vx "$name" {names} > {names}.tmp || true
    mv {names}.tmp {names}
    ;;
  *)
    ;;
esac
exit 0
"#,
        audit = audit.display(),
        state_dir = state_dir.display(),
        names = names.display(),
    )
}

/// Name-safety defense: a hostile name is rejected before any subprocess,
/// path, or XML fragment is built with it.
#[test]
fn hostile_name_never_reaches_a_subprocess() {
    let h = Harness::new();
    let hostile = "a;rm -rf /";

    let err = h.controller.start(hostile, DisplayLaunch::None).unwrap_err();
    assert!(matches!(err, Error::InvalidName(_)));

    for op in [
        h.controller.get(hostile).map(drop),
        h.controller.shutdown(hostile, Duration::from_secs(1)),
        h.controller.force_off(hostile),
        h.controller.snapshot(hostile, "tag"),
        h.controller.snapshot("okname", hostile),
        h.controller.delete(hostile, true),
        h.controller.attach_pci(hostile, "0000:01:00.0"),
    ] {
        assert!(matches!(op.unwrap_err(), Error::InvalidName(_)));
    }

    assert!(!h.audit().contains("rm -rf"), "hostile name leaked into argv");
}

/// Storage-delete escape: a disk outside the storage root refuses the
/// purge and leaves the domain defined.
#[test]
fn purge_with_disk_outside_root_is_refused() {
    let h = Harness::new();
    h.add_domain("foo", "shut off");

    let mut profile = h.profile("foo");
    profile.disk = DiskSpec { path: Some(PathBuf::from("/etc/passwd")), size_gib: Some(1) };
    h.controller.store().save(&profile).unwrap();

    let err = h.controller.delete("foo", true).unwrap_err();
    assert!(matches!(err, Error::StorageOutsideRoot { .. }));

    // The domain was not undefined
    assert!(!h.audit().contains("undefine"));
    assert_eq!(h.controller.get("foo").unwrap().unwrap().state, DomainState::Off);
}

#[test]
fn purge_inside_root_removes_disk_and_domain() {
    let h = Harness::new();
    h.add_domain("bar", "shut off");

    let profile = h.profile("bar");
    let disk = profile.disk_path(&h.config);
    fs::write(&disk, "qcow2").unwrap();
    h.controller.store().save(&profile).unwrap();

    h.controller.delete("bar", true).unwrap();
    assert!(!disk.exists());
    assert!(h.audit().contains("undefine bar"));
    assert!(h.controller.get("bar").unwrap().is_none());
}

/// Pre-start passthrough failure degrades to a warning; the domain starts
/// without the device.
#[test]
fn start_degrades_when_device_is_missing() {
    let h = Harness::new();
    let mut profile = h.profile("quiet");
    profile.passthrough = Some(PassthroughRequest {
        gpu: "0000:01:00.0".into(),
        audio: None,
    });
    h.controller.store().save(&profile).unwrap();

    let warnings = h.controller.start("quiet", DisplayLaunch::None).unwrap();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("without passthrough"));

    assert!(h.audit().contains("start quiet"));
    assert!(!h.audit().contains("attach-device"));
    assert_eq!(h.controller.get("quiet").unwrap().unwrap().state, DomainState::Running);
}

/// Single-binding: a function attached to one running domain cannot be
/// hot-attached to another.
#[test]
fn attached_function_is_exclusive() {
    let h = Harness::new();
    h.add_domain("gamer", "running");
    h.set_domain_xml(
        "gamer",
        r#"<domain type="kvm"><name>gamer</name><uuid>2af1</uuid><devices>
  <hostdev mode="subsystem" type="pci" managed="yes">
    <source><address domain="0x0000" bus="0x01" slot="0x00" function="0x0"/></source>
  </hostdev>
</devices></domain>"#,
    );
    h.add_domain("rival", "running");

    let err = h.controller.attach_pci("rival", "0000:01:00.0").unwrap_err();
    assert!(matches!(err, Error::DeviceBusy(_)));
}

/// Lifecycle state gates: wrong-state operations are refused as such.
#[test]
fn state_gates() {
    let h = Harness::new();
    h.add_domain("idlehost", "shut off");
    h.controller.store().save(&h.profile("idlehost")).unwrap();

    assert!(matches!(
        h.controller.shutdown("idlehost", Duration::from_secs(1)).unwrap_err(),
        Error::InvalidState { .. }
    ));
    assert!(matches!(
        h.controller.pause("idlehost").unwrap_err(),
        Error::InvalidState { .. }
    ));
    assert!(matches!(
        h.controller.detach_pci("idlehost", "0000:01:00.0").unwrap_err(),
        Error::InvalidState { .. }
    ));

    // Start it, then starting again is invalid
    h.controller.start("idlehost", DisplayLaunch::None).unwrap();
    assert!(matches!(
        h.controller.start("idlehost", DisplayLaunch::None).unwrap_err(),
        Error::InvalidState { .. }
    ));
}

/// Snapshot gating by state, and tag validation.
#[test]
fn snapshot_rules() {
    let h = Harness::new();
    h.add_domain("snappy", "running");

    h.controller.snapshot("snappy", "pre-update").unwrap();
    assert!(h.audit().contains("snapshot-create-as snappy pre-update"));

    fs::write(h.state_dir.join("snappy.state"), "in shutdown\n").unwrap();
    assert!(matches!(
        h.controller.snapshot("snappy", "late").unwrap_err(),
        Error::InvalidState { .. }
    ));
}

/// Delivery methods that are not VM-backed never produce domains.
#[test]
fn non_vm_install_methods_are_refused() {
    let h = Harness::new();
    let mut profile = h.profile("browser-app");
    profile.install_method = InstallMethod::Web;

    assert!(matches!(
        h.controller.define(&profile).unwrap_err(),
        Error::InvalidState { .. }
    ));

    // A hand-placed profile cannot sneak past start either
    h.controller.store().save(&profile).unwrap();
    assert!(matches!(
        h.controller.start("browser-app", DisplayLaunch::None).unwrap_err(),
        Error::InvalidState { .. }
    ));
    assert!(!h.audit().contains("browser-app"));
}

/// Missing domains resolve to None, not an error.
#[test]
fn get_missing_domain_is_none() {
    let h = Harness::new();
    assert!(h.controller.get("nope").unwrap().is_none());
    assert!(h.controller.list().unwrap().is_empty());
}
