//! gpu-valet: GPU passthrough planning and VM lifecycle management
//!
//! The crate is split along the subsystem seams:
//!
//! - [`hardware`] — PCI/sysfs enumeration, GPU classification, IOMMU
//!   topology, CPU platform probing
//! - [`plan`] — turns a hardware snapshot into a passthrough plan
//! - [`bootcfg`] — applies a plan to a host's boot configuration,
//!   atomically and resumably
//! - [`domain`] — domain lifecycle through the virtualization daemon,
//!   including runtime PCI attach/detach
//! - [`display`] — shared-memory region and display client supervision
//! - [`channel`] — framed, encrypted message channel to the in-guest agent
//!
//! The `hwdetect`, `vmctl` and `display` binaries are thin CLI shells over
//! these modules.

pub mod bootcfg;
pub mod channel;
pub mod config;
pub mod display;
pub mod domain;
pub mod error;
pub mod hardware;
pub mod plan;

pub use error::{Error, Result};

/// Single environment variable gating verbose logging across the binaries.
pub const LOG_ENV_VAR: &str = "GPU_VALET_LOG";

/// Standard logger setup shared by the binaries.
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or(LOG_ENV_VAR, "info"))
        .format_timestamp(None)
        .init();
}
