//! Domain definition rendering and daemon XML parsing
//!
//! Definitions are rendered from a [`VmProfile`] with quick-xml so every
//! value is escaped on the way out; the same crate parses daemon dumpxml
//! output coming back in. Passthrough hostdevs are deliberately absent from
//! the base definition: the transfer protocol adds them at start time so a
//! missing device degrades to a warning instead of a failed boot.

use std::io::Cursor;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::config::{Config, Firmware, InstallMethod, VmProfile};
use crate::error::{Error, Result};
use crate::hardware::PciAddress;

const UEFI_LOADER: &str = "/usr/share/edk2/x64/OVMF_CODE.4m.fd";
const EMULATOR: &str = "/usr/bin/qemu-system-x86_64";
/// virtio-serial channel the in-guest agent connects to.
pub const AGENT_CHANNEL_NAME: &str = "org.gpuvalet.agent.0";

struct Xml {
    writer: Writer<Cursor<Vec<u8>>>,
}

/// Thin sugar over the event writer; the libvirt schema nests deeply and
/// raw event calls drown the structure otherwise.
impl Xml {
    fn new() -> Self {
        Self { writer: Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2) }
    }

    fn open(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
        let mut el = BytesStart::new(name);
        for (k, v) in attrs {
            el.push_attribute((*k, *v));
        }
        self.writer
            .write_event(Event::Start(el))
            .map_err(|e| Error::parse("domain xml", e.to_string()))
    }

    fn close(&mut self, name: &str) -> Result<()> {
        self.writer
            .write_event(Event::End(BytesEnd::new(name)))
            .map_err(|e| Error::parse("domain xml", e.to_string()))
    }

    fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
        let mut el = BytesStart::new(name);
        for (k, v) in attrs {
            el.push_attribute((*k, *v));
        }
        self.writer
            .write_event(Event::Empty(el))
            .map_err(|e| Error::parse("domain xml", e.to_string()))
    }

    fn text_element(&mut self, name: &str, attrs: &[(&str, &str)], text: &str) -> Result<()> {
        self.open(name, attrs)?;
        self.writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(|e| Error::parse("domain xml", e.to_string()))?;
        self.close(name)
    }

    fn finish(self) -> Result<String> {
        let bytes = self.writer.into_inner().into_inner();
        String::from_utf8(bytes).map_err(|e| Error::parse("domain xml", e.to_string()))
    }
}

/// Render the full domain document for `profile`.
pub fn render_domain(profile: &VmProfile, config: &Config) -> Result<String> {
    let mut xml = Xml::new();

    let memory_mib = profile.effective_memory_mib(config);
    let vcpus = profile.effective_vcpus(config);

    xml.open("domain", &[("type", "kvm")])?;
    xml.text_element("name", &[], &profile.name)?;
    xml.text_element("memory", &[("unit", "MiB")], &memory_mib.to_string())?;
    xml.text_element("vcpu", &[("placement", "static")], &vcpus.to_string())?;

    if !profile.cpu_pinning.is_empty() {
        xml.open("cputune", &[])?;
        for (vcpu, host_cpu) in profile.cpu_pinning.iter().enumerate() {
            xml.empty(
                "vcpupin",
                &[("vcpu", vcpu.to_string().as_str()), ("cpuset", host_cpu.to_string().as_str())],
            )?;
        }
        xml.close("cputune")?;
    }

    if profile.hugepages {
        xml.open("memoryBacking", &[])?;
        xml.empty("hugepages", &[])?;
        xml.close("memoryBacking")?;
    }

    xml.open("os", &[])?;
    xml.text_element("type", &[("arch", "x86_64"), ("machine", "q35")], "hvm")?;
    if profile.firmware == Firmware::Uefi {
        xml.text_element("loader", &[("readonly", "yes"), ("type", "pflash")], UEFI_LOADER)?;
    }
    xml.empty("boot", &[("dev", "hd")])?;
    xml.close("os")?;

    xml.open("features", &[])?;
    xml.empty("acpi", &[])?;
    xml.empty("apic", &[])?;
    match profile.install_method {
        // Guest OSes that refuse to run under a hypervisor get a spoofed
        // vendor and a hidden KVM signature.
        InstallMethod::VmPassthrough => {
            xml.open("hyperv", &[("mode", "custom")])?;
            xml.empty("relaxed", &[("state", "on")])?;
            xml.empty("vapic", &[("state", "on")])?;
            xml.empty("spinlocks", &[("state", "on"), ("retries", "8191")])?;
            xml.empty("vendor_id", &[("state", "on"), ("value", "GenuineIntel")])?;
            xml.close("hyperv")?;
            xml.open("kvm", &[])?;
            xml.empty("hidden", &[("state", "on")])?;
            xml.close("kvm")?;
        }
        // macOS guests tolerate virtualization and choke on hyperv leaves
        InstallMethod::VmMacos => {}
        // Non-VM delivery never reaches the renderer (define refuses it)
        InstallMethod::Native | InstallMethod::CompatibilityLayer | InstallMethod::Web => {}
    }
    xml.close("features")?;

    xml.open("cpu", &[("mode", "host-passthrough"), ("check", "none")])?;
    xml.empty(
        "topology",
        &[
            ("sockets", "1"),
            ("cores", vcpus.to_string().as_str()),
            ("threads", "1"),
        ],
    )?;
    xml.close("cpu")?;

    xml.open("devices", &[])?;
    xml.text_element("emulator", &[], EMULATOR)?;

    let disk_path = profile.disk_path(config);
    xml.open("disk", &[("type", "file"), ("device", "disk")])?;
    xml.empty("driver", &[("name", "qemu"), ("type", "qcow2")])?;
    xml.empty("source", &[("file", disk_path.to_string_lossy().as_ref())])?;
    xml.empty("target", &[("dev", "vda"), ("bus", "virtio")])?;
    xml.close("disk")?;

    xml.open("interface", &[("type", "network")])?;
    xml.empty("source", &[("network", "default")])?;
    xml.empty("model", &[("type", "virtio")])?;
    xml.close("interface")?;

    if profile.tpm {
        xml.open("tpm", &[("model", "tpm-crb")])?;
        xml.empty("backend", &[("type", "emulator"), ("version", "2.0")])?;
        xml.close("tpm")?;
    }

    if profile.display.enabled {
        xml.open("shmem", &[("name", format!("gpu-valet-{}", profile.name).as_str())])?;
        xml.empty("model", &[("type", "ivshmem-plain")])?;
        xml.text_element("size", &[("unit", "M")], &profile.shared_region_mib.to_string())?;
        xml.close("shmem")?;
    }

    // Serial channel for the in-guest agent
    let channel_socket = config.state_dir.join("channels").join(format!("{}.sock", profile.name));
    xml.open("channel", &[("type", "unix")])?;
    xml.empty(
        "source",
        &[("mode", "bind"), ("path", channel_socket.to_string_lossy().as_ref())],
    )?;
    xml.empty("target", &[("type", "virtio"), ("name", AGENT_CHANNEL_NAME)])?;
    xml.close("channel")?;

    // With a passthrough GPU the guest drives a real display; emulated
    // video would only confuse its driver stack.
    let video_model = if profile.passthrough.is_some() { "none" } else { "virtio" };
    xml.open("video", &[])?;
    xml.empty("model", &[("type", video_model)])?;
    xml.close("video")?;

    xml.close("devices")?;
    xml.close("domain")?;

    xml.finish()
}

/// Render a managed hostdev fragment for hot-(de)tach and config edits.
pub fn render_hostdev(address: &PciAddress) -> Result<String> {
    let mut xml = Xml::new();
    xml.open("hostdev", &[("mode", "subsystem"), ("type", "pci"), ("managed", "yes")])?;
    xml.open("source", &[])?;
    xml.empty(
        "address",
        &[
            ("domain", format!("0x{:04x}", address.domain).as_str()),
            ("bus", format!("0x{:02x}", address.bus).as_str()),
            ("slot", format!("0x{:02x}", address.slot).as_str()),
            ("function", format!("0x{:x}", address.function).as_str()),
        ],
    )?;
    xml.close("source")?;
    xml.close("hostdev")?;
    xml.finish()
}

/// Extract the PCI addresses of all hostdev devices from daemon dumpxml
/// output.
pub fn parse_attached_pci(domain_xml: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(domain_xml);
    reader.config_mut().trim_text(true);

    let mut attached = Vec::new();
    let mut in_hostdev = false;
    let mut in_source = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref el)) | Ok(Event::Empty(ref el)) => {
                match el.name().as_ref() {
                    b"hostdev" => in_hostdev = true,
                    b"source" if in_hostdev => in_source = true,
                    b"address" if in_hostdev && in_source => {
                        if let Some(addr) = address_from_attrs(el) {
                            attached.push(addr.to_string());
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(ref el)) => match el.name().as_ref() {
                b"hostdev" => in_hostdev = false,
                b"source" => in_source = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::parse("domain xml", e.to_string())),
            _ => {}
        }
    }

    Ok(attached)
}

fn address_from_attrs(el: &BytesStart<'_>) -> Option<PciAddress> {
    let mut domain = 0u16;
    let mut bus = 0u8;
    let mut slot = 0u8;
    let mut function = 0u8;

    for attr in el.attributes().flatten() {
        let value = String::from_utf8_lossy(&attr.value).into_owned();
        let value = value.trim_start_matches("0x");
        match attr.key.as_ref() {
            b"domain" => domain = u16::from_str_radix(value, 16).ok()?,
            b"bus" => bus = u8::from_str_radix(value, 16).ok()?,
            b"slot" => slot = u8::from_str_radix(value, 16).ok()?,
            b"function" => function = u8::from_str_radix(value, 16).ok()?,
            _ => {}
        }
    }

    Some(PciAddress { domain, bus, slot, function })
}

/// The domain UUID from dumpxml output.
pub fn parse_domain_uuid(domain_xml: &str) -> Result<String> {
    let mut reader = Reader::from_str(domain_xml);
    reader.config_mut().trim_text(true);

    let mut in_uuid = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref el)) if el.name().as_ref() == b"uuid" => in_uuid = true,
            Ok(Event::Text(text)) if in_uuid => {
                return text
                    .unescape()
                    .map(|s| s.into_owned())
                    .map_err(|e| Error::parse("domain xml", e.to_string()));
            }
            Ok(Event::End(ref el)) if el.name().as_ref() == b"uuid" => in_uuid = false,
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::parse("domain xml", e.to_string())),
            _ => {}
        }
    }
    Err(Error::parse("domain xml", "no uuid element"))
}
