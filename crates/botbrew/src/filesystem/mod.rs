//! Mount plumbing for the BotBrew namespace.
//!
//! This module handles:
//! - Reading the live mount table
//! - Loop device management for image-backed roots
//! - The mount topology applied to a root
//! - Transplanting the host's `/mnt` tree to shared propagation

mod loopdev;
mod mounts;
mod scanner;
mod table;
mod topology;
mod transplant;

#[cfg(test)]
pub(crate) mod simulated;

pub use loopdev::{LoopManager, device_number, is_loop_device, mount_image, unmount_image};
pub use mounts::{HostNamespace, MountNamespace, MountReport, Propagation, StepFailure};
pub use scanner::{MountRecord, MountTable};
pub use table::{FOREIGN_MOUNTS, LOCAL_MOUNTS, MountSource, MountSpec, NODEV_NOATIME};
pub use topology::Topology;
pub use transplant::Transplant;
