//! Volume lifecycle orchestration for network block-storage appliances
//!
//! This crate provisions, resizes, clones, snapshots and destroys volumes
//! on a remote storage appliance and reconciles them with the local block
//! devices the kernel exposes for them, over iSCSI or NVMe-TCP. The hard
//! part it owns is idempotent multi-step create/export/teardown across two
//! independently-failing systems: the appliance API and the local kernel
//! transport.

pub mod align;
pub mod api;
pub mod config;
pub mod device;
pub mod error;
pub mod mapping;
pub mod naming;
pub mod orchestrator;
pub mod preflight;
pub mod session;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::StorageConfig;
pub use error::{VolumeError, VolumeResult};
pub use orchestrator::{AllocatedVolume, VolumeInfo, VolumeManager};
