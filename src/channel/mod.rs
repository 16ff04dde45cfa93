//! Guest-channel transport
//!
//! Message-oriented, mutually-authenticated stream between the host and the
//! in-guest agent, carried over a virtualization serial channel. Frames are
//! length-prefixed ([`frame`]), every record is AEAD-sealed ([`crypto`]),
//! and the handshake binds the channel to the domain's UUID. One reader and
//! one writer; each side has its own mutex so sends and receives overlap.

pub mod crypto;
pub mod frame;

use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crypto::{ChannelCipher, Direction};

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Handshaking,
    Authenticated,
    Closing,
}

/// The closed command set the in-guest agent understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Ping,
    Launch,
    Close,
    Focus,
    Minimize,
    Maximize,
    ListWindows,
    GetInfo,
    SetResolution,
    GetResolution,
}

/// Host-to-guest message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
    pub ts: chrono::DateTime<chrono::Utc>,
}

impl Request {
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command, params: serde_json::Map::new(), ts: chrono::Utc::now() }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

/// Guest-to-host reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Handshake records (sequence 0 in each direction).
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    magic: String,
    domain_uuid: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HelloAck {
    domain_uuid: String,
}

const HELLO_MAGIC: &str = "gpu-valet/1";

/// Receive-side limits.
#[derive(Debug, Clone, Copy)]
pub struct ChannelLimits {
    pub max_message_bytes: usize,
    pub messages_per_second: u32,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self { max_message_bytes: 64 * 1024, messages_per_second: 32 }
    }
}

/// At most one authenticated channel per domain, process-wide.
static AUTHENTICATED_DOMAINS: Lazy<Mutex<HashSet<String>>> =
    Lazy::new(|| Mutex::new(HashSet::new()));

struct SendHalf<W> {
    stream: W,
    sequence: u64,
}

struct RecvHalf<R> {
    stream: R,
    /// Highest sequence observed; records must arrive strictly above it.
    last_sequence: Option<u64>,
    bucket: TokenBucket,
}

/// Host end of one domain's channel.
pub struct HostChannel<R: Read, W: Write> {
    domain: String,
    cipher: ChannelCipher,
    reader: Mutex<RecvHalf<R>>,
    writer: Mutex<SendHalf<W>>,
    state: Mutex<ChannelState>,
    limits: ChannelLimits,
    oversize_frames: AtomicU64,
    rate_limited_frames: AtomicU64,
}

impl<R: Read, W: Write> HostChannel<R, W> {
    /// Perform the handshake and return an authenticated channel. The
    /// guest must echo the domain UUID; a mismatch (or any record that
    /// fails to open) closes the channel before it ever authenticates.
    pub fn handshake(
        domain: &str,
        domain_uuid: &str,
        key: &[u8; 32],
        reader: R,
        writer: W,
        limits: ChannelLimits,
    ) -> Result<Self> {
        {
            let mut registry = AUTHENTICATED_DOMAINS.lock().expect("channel registry poisoned");
            if !registry.insert(domain.to_string()) {
                return Err(Error::AuthFailed(format!(
                    "domain {} already has an authenticated channel",
                    domain
                )));
            }
        }

        let channel = Self {
            domain: domain.to_string(),
            cipher: ChannelCipher::new(key),
            reader: Mutex::new(RecvHalf {
                stream: reader,
                last_sequence: None,
                bucket: TokenBucket::new(limits.messages_per_second),
            }),
            writer: Mutex::new(SendHalf { stream: writer, sequence: 0 }),
            state: Mutex::new(ChannelState::Handshaking),
            limits,
            oversize_frames: AtomicU64::new(0),
            rate_limited_frames: AtomicU64::new(0),
        };

        let result = channel.run_handshake(domain_uuid);
        match result {
            Ok(()) => {
                *channel.state.lock().expect("state lock poisoned") = ChannelState::Authenticated;
                log::info!("channel to {} authenticated", domain);
                Ok(channel)
            }
            Err(e) => {
                channel.unregister();
                Err(e)
            }
        }
    }

    fn run_handshake(&self, domain_uuid: &str) -> Result<()> {
        self.send_record(&Hello {
            magic: HELLO_MAGIC.to_string(),
            domain_uuid: domain_uuid.to_string(),
        })?;

        let ack: HelloAck = self.recv_record()?;
        if ack.domain_uuid != domain_uuid {
            return Err(Error::AuthFailed(format!(
                "peer claims domain {}, expected {}",
                ack.domain_uuid, domain_uuid
            )));
        }
        Ok(())
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn oversize_frames(&self) -> u64 {
        self.oversize_frames.load(Ordering::Relaxed)
    }

    pub fn rate_limited_frames(&self) -> u64 {
        self.rate_limited_frames.load(Ordering::Relaxed)
    }

    /// Cooperative close: blocked peers observe it at their next frame
    /// boundary.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state != ChannelState::Closed {
            *state = ChannelState::Closing;
        }
    }

    fn check_open(&self) -> Result<()> {
        match self.state() {
            ChannelState::Closing | ChannelState::Closed => Err(Error::ChannelClosed),
            _ => Ok(()),
        }
    }

    /// Frame payload layout: 8-byte big-endian sequence, then the sealed
    /// record. The sequence doubles as the AEAD nonce suffix, so a frame
    /// whose header disagrees with its ciphertext cannot open.
    fn send_record<T: Serialize>(&self, record: &T) -> Result<()> {
        self.check_open()?;
        let mut half: MutexGuard<'_, SendHalf<W>> =
            self.writer.lock().expect("send mutex poisoned");

        let plaintext = serde_json::to_vec(record)
            .map_err(|e| Error::parse("channel record", e.to_string()))?;
        if plaintext.len() > self.limits.max_message_bytes {
            return Err(Error::FrameTooLarge {
                declared: plaintext.len(),
                limit: self.limits.max_message_bytes,
            });
        }

        let sealed = self.cipher.seal(Direction::HostToGuest, half.sequence, &plaintext)?;
        let mut payload = Vec::with_capacity(8 + sealed.len());
        payload.extend_from_slice(&half.sequence.to_be_bytes());
        payload.extend_from_slice(&sealed);
        frame::write_frame(&mut half.stream, &payload)?;
        half.sequence += 1;
        Ok(())
    }

    fn recv_record<T: DeserializeOwned>(&self) -> Result<T> {
        let mut half: MutexGuard<'_, RecvHalf<R>> =
            self.reader.lock().expect("receive mutex poisoned");

        loop {
            self.check_open()?;
            // Sequence header plus AEAD tag ride on top of the payload
            // ceiling.
            let max_frame = self.limits.max_message_bytes + 64;
            let payload = match frame::read_frame(&mut half.stream, max_frame) {
                Ok(payload) => payload,
                Err(Error::FrameTooLarge { declared, limit }) => {
                    self.oversize_frames.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "{}: dropped {}-byte frame (limit {})",
                        self.domain,
                        declared,
                        limit
                    );
                    continue;
                }
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            };

            if payload.len() < 8 + 16 {
                self.close();
                return Err(Error::AuthFailed("runt record".into()));
            }
            let sequence = u64::from_be_bytes(payload[..8].try_into().expect("8-byte slice"));
            let sealed = &payload[8..];

            // Strictly monotonic per direction; gaps are fine (they are the
            // frames we dropped), going backwards is not.
            if let Some(last) = half.last_sequence {
                if sequence <= last {
                    self.close();
                    return Err(Error::AuthFailed(format!(
                        "record sequence went backwards ({} after {})",
                        sequence, last
                    )));
                }
            }
            half.last_sequence = Some(sequence);

            if !half.bucket.try_take() {
                self.rate_limited_frames.fetch_add(1, Ordering::Relaxed);
                log::warn!("{}: dropped frame over message-rate ceiling", self.domain);
                continue;
            }

            let plaintext = match self.cipher.open(Direction::GuestToHost, sequence, sealed) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            };

            return serde_json::from_slice(&plaintext)
                .map_err(|e| Error::parse("channel record", e.to_string()));
        }
    }

    pub fn send_request(&self, request: &Request) -> Result<()> {
        self.send_record(request)
    }

    pub fn recv_response(&self) -> Result<Response> {
        self.recv_record()
    }

    /// Send a request and wait for its response, skipping replies to
    /// earlier requests that the guest answered late.
    pub fn call(&self, request: &Request) -> Result<Response> {
        self.send_request(request)?;
        loop {
            let response = self.recv_response()?;
            if response.request_id == request.id {
                return Ok(response);
            }
            log::debug!(
                "{}: out-of-turn response to request {} (waiting on {})",
                self.domain,
                response.request_id,
                request.id
            );
        }
    }

    fn unregister(&self) {
        AUTHENTICATED_DOMAINS
            .lock()
            .expect("channel registry poisoned")
            .remove(&self.domain);
    }
}

impl<R: Read, W: Write> Drop for HostChannel<R, W> {
    fn drop(&mut self) {
        self.close();
        self.unregister();
    }
}

/// Open and authenticate the channel for a live domain: connect to the
/// daemon-bound socket behind the guest's virtio-serial port, load the
/// domain's provisioned key, and run the handshake against its UUID.
pub fn connect_domain(
    config: &crate::config::Config,
    store: &crate::config::ProfileStore,
    domain: &str,
    domain_uuid: &str,
) -> Result<HostChannel<std::os::unix::net::UnixStream, std::os::unix::net::UnixStream>> {
    let key = store.load_channel_key(domain)?;
    let socket = config.state_dir.join("channels").join(format!("{}.sock", domain));
    let stream = std::os::unix::net::UnixStream::connect(&socket)
        .map_err(|e| Error::io(&socket, e))?;
    let reader = stream.try_clone().map_err(|e| Error::io(&socket, e))?;

    let limits = ChannelLimits {
        max_message_bytes: config.channel_max_message_bytes,
        messages_per_second: config.channel_messages_per_second,
    };
    HostChannel::handshake(domain, domain_uuid, &key, reader, stream, limits)
}

/// Build a launch request, refusing executable paths outside the profile's
/// whitelisted installation roots.
pub fn launch_request(
    id: u64,
    launch_roots: &[PathBuf],
    path: &str,
    args: &[String],
) -> Result<Request> {
    if !launch_path_allowed(launch_roots, path) {
        return Err(Error::StorageOutsideRoot {
            path: PathBuf::from(path),
            root: launch_roots.first().cloned().unwrap_or_default(),
        });
    }
    Ok(Request::new(id, Command::Launch)
        .with_param("path", path)
        .with_param("args", Value::Array(args.iter().map(|a| Value::from(a.clone())).collect())))
}

/// Guest paths are Windows-style; comparison is case-insensitive and
/// separator-tolerant.
fn launch_path_allowed(roots: &[PathBuf], path: &str) -> bool {
    let normalized = normalize_guest_path(path);
    if normalized.contains("/../") || normalized.ends_with("/..") {
        return false;
    }
    roots.iter().any(|root| {
        let root = normalize_guest_path(&root.to_string_lossy());
        !root.is_empty() && normalized.starts_with(&format!("{}/", root.trim_end_matches('/')))
    })
}

fn normalize_guest_path(path: &str) -> String {
    path.replace('\\', "/").to_lowercase()
}

/// Simple token bucket; a burst up to the per-second ceiling, refilled
/// continuously.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_second: u32) -> Self {
        let capacity = f64::from(per_second.max(1));
        Self { capacity, tokens: capacity, refill_per_sec: capacity, last_refill: Instant::now() }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_whitelist() {
        let roots = vec![PathBuf::from("C:\\Program Files"), PathBuf::from("D:\\Games")];
        assert!(launch_path_allowed(&roots, "C:\\Program Files\\App\\app.exe"));
        assert!(launch_path_allowed(&roots, "d:\\games\\rocket\\rocket.exe"));
        assert!(!launch_path_allowed(&roots, "C:\\Windows\\System32\\cmd.exe"));
        assert!(!launch_path_allowed(&roots, "C:\\Program Files\\..\\Windows\\evil.exe"));
        assert!(!launch_path_allowed(&[], "C:\\Program Files\\App\\app.exe"));
    }

    #[test]
    fn launch_request_refused_outside_roots() {
        let roots = vec![PathBuf::from("C:\\Program Files")];
        assert!(launch_request(1, &roots, "C:\\Windows\\cmd.exe", &[]).is_err());

        let request = launch_request(2, &roots, "C:\\Program Files\\App\\app.exe", &[]).unwrap();
        assert_eq!(request.command, Command::Launch);
        assert_eq!(request.params["path"], "C:\\Program Files\\App\\app.exe");
    }

    #[test]
    fn token_bucket_caps_burst() {
        let mut bucket = TokenBucket::new(4);
        let taken = (0..10).filter(|_| bucket.try_take()).count();
        assert_eq!(taken, 4);
    }

    #[test]
    fn request_serialization_shape() {
        let request = Request::new(7, Command::SetResolution)
            .with_param("w", 2560)
            .with_param("h", 1440)
            .with_param("hz", 144);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["command"], "set_resolution");
        assert_eq!(json["params"]["w"], 2560);
        assert!(json["ts"].is_string());

        let back: Request = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn response_round_trip() {
        let response = Response {
            request_id: 7,
            ok: false,
            data: None,
            error: Some("window not found".into()),
        };
        let json = serde_json::to_string(&response).unwrap();
        let back: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(back, response);
        assert!(!json.contains("\"data\""));
    }
}
