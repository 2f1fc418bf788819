//! Standard filesystem paths and compiled-in constants for BotBrew.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Directory holding loop device nodes.
pub static LOOP_DIR: Lazy<PathBuf> = Lazy::new(|| env_or("BOTBREW_LOOP_DIR", "/dev/block"));

/// Scratch directory used while transplanting the shared host mounts.
pub static STAGING_DIR: Lazy<PathBuf> = Lazy::new(|| env_or("BOTBREW_STAGING", "/data/.botbrew"));

/// Read a path override from the environment.
///
/// The binary runs setuid-root, so overrides are only honored when the
/// real uid is 0.
fn env_or(var: &str, default: &str) -> PathBuf {
    let trusted = rustix::process::getuid().is_root();
    select_override(var, std::env::var_os(var), default, trusted)
}

fn select_override(var: &str, value: Option<OsString>, default: &str, trusted: bool) -> PathBuf {
    match value {
        Some(value) if !value.is_empty() && trusted => {
            tracing::debug!(var, value = ?value, "Using path override");
            PathBuf::from(value)
        }
        Some(value) if !value.is_empty() => {
            tracing::warn!(var, value = ?value, "Ignoring path override from unprivileged caller");
            PathBuf::from(default)
        }
        _ => PathBuf::from(default),
    }
}

/// Host directory whose propagation is switched to shared on cold start.
pub const TRANSPLANT_SOURCE: &str = "/mnt";

/// Live mount table of the calling process.
pub const MOUNT_TABLE: &str = "/proc/self/mounts";

/// Toolchain segment injected into `PATH`.
pub const ENV_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin:/usr/local/games:/usr/games:/botbrew/bin:/usr/lib/busybox";

/// Appended to [`ENV_PATH`] when the caller has no usable `PATH`.
pub const ANDROID_PATH: &str = "/android/sbin:/system/sbin:/system/bin:/system/xbin";

/// Command run when none is given.
pub const DEFAULT_COMMAND: &str = "/init.sh";

/// Name of the installed copy of the executable inside the root.
pub const INSTALLED_NAME: &str = "init";

/// Filesystem type of loop-backed images.
pub const IMAGE_FSTYPE: &str = "ext4";

/// Exported with the namespace root.
pub const PREFIX_VAR: &str = "BOTBREW_PREFIX";

/// Exported with the backing image, when there is one.
pub const IMAGE_VAR: &str = "BOTBREW_IMAGE";

/// Size of the loop device index space.
pub const LOOP_MAX: u32 = 4096;

/// Block major number of loop devices.
pub const LOOP_MAJOR: u32 = 7;

/// Names under the root that are replaced by links into `/mnt`.
pub const COMPAT_LINKS: &[&str] = &["emmc", "sdcard", "sdcard2", "usbdisk"];

/// Paths derived from a namespace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootPaths {
    /// The namespace root.
    pub root: PathBuf,
}

impl RootPaths {
    /// Create paths for `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Join a path that may be absolute onto the root.
    ///
    /// `join("/run")` yields `<root>/run`, not `/run`.
    #[must_use]
    pub fn join(&self, segment: impl AsRef<Path>) -> PathBuf {
        join(&self.root, segment)
    }

    /// The root's own `run` directory, present once setup completed.
    #[must_use]
    pub fn run(&self) -> PathBuf {
        self.join("run")
    }

    /// Installed copy of the executable.
    #[must_use]
    pub fn installed_binary(&self) -> PathBuf {
        self.join(INSTALLED_NAME)
    }
}

/// Compose `segment` under `base`, treating an absolute `segment` as relative.
#[must_use]
pub fn join(base: &Path, segment: impl AsRef<Path>) -> PathBuf {
    let segment = segment.as_ref();
    let relative = segment.strip_prefix("/").unwrap_or(segment);
    if relative.as_os_str().is_empty() {
        base.to_path_buf()
    } else {
        base.join(relative)
    }
}
