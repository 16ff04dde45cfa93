//! Error taxonomy shared across the crate
//!
//! Every fallible operation in the library surfaces one of these kinds.
//! Binaries map them onto process exit codes; retry loops consult
//! [`Error::is_transient`] before backing off.

use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parse error in {what}: {detail}")]
    Parse { what: String, detail: String },

    #[error("IOMMU is not enabled on this kernel")]
    IommuDisabled,

    #[error("no GPU eligible for passthrough was found")]
    NoPassthroughCandidate,

    #[error("IOMMU group {group} contains devices other than GPU/audio/bridge")]
    GroupContaminated { group: u32 },

    #[error("no supported bootloader layout found under {root}")]
    UnknownBootloader { root: PathBuf },

    #[error("invalid name {0:?}: only letters, digits, dash and underscore are allowed")]
    InvalidName(String),

    #[error("storage path {path} lies outside the configured storage root {root}")]
    StorageOutsideRoot { path: PathBuf, root: PathBuf },

    #[error("domain {domain} is {state}; {operation} is not valid in that state")]
    InvalidState {
        domain: String,
        state: String,
        operation: String,
    },

    #[error("virtualization daemon refused the operation (code {code}): {message}")]
    Daemon { code: i32, message: String },

    #[error("device {0} is busy")]
    DeviceBusy(String),

    #[error("device {0} is not present")]
    DeviceMissing(String),

    #[error("operation {operation} timed out after {seconds}s")]
    TimedOut { operation: String, seconds: u64 },

    #[error("channel closed")]
    ChannelClosed,

    #[error("channel authentication failed: {0}")]
    AuthFailed(String),

    #[error("frame of {declared} bytes exceeds the {limit}-byte ceiling")]
    FrameTooLarge { declared: usize, limit: usize },

    #[error("message rate limit exceeded")]
    RateLimited,

    #[error("internal invariant violated: {0}")]
    Bug(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }

    pub fn parse(what: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Parse { what: what.into(), detail: detail.into() }
    }

    /// Whether a bounded retry with backoff is appropriate.
    ///
    /// Safety violations (`InvalidName`, `StorageOutsideRoot`, `AuthFailed`)
    /// are never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::DeviceBusy(_) => true,
            Error::TimedOut { .. } => true,
            Error::Io { source, .. } => source.kind() == io::ErrorKind::WouldBlock,
            _ => false,
        }
    }
}
