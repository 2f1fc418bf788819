//! Mount operations.

use std::io;
use std::path::{Path, PathBuf};

use botbrew_common::BotbrewResult;
use rustix::mount::MountFlags;

use super::loopdev::LoopManager;
use super::scanner::MountTable;

/// Mount propagation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Propagation {
    /// Mount events propagate to and from peers.
    Shared,
    /// No propagation in either direction.
    Private,
    /// Receive events from the master, send none.
    Slave,
    /// Private, and refuses to be the source of a bind mount.
    Unbindable,
}

impl Propagation {
    /// Convert to rustix propagation flags.
    #[must_use]
    pub fn to_flags(self, recursive: bool) -> rustix::mount::MountPropagationFlags {
        use rustix::mount::MountPropagationFlags;

        let mut flags = match self {
            Self::Shared => MountPropagationFlags::SHARED,
            Self::Private => MountPropagationFlags::PRIVATE,
            Self::Slave => MountPropagationFlags::DOWNSTREAM,
            Self::Unbindable => MountPropagationFlags::UNBINDABLE,
        };
        if recursive {
            flags |= MountPropagationFlags::REC;
        }
        flags
    }
}

/// Kernel-visible mount namespace operations.
///
/// Everything that mutates or observes the live mount table goes through
/// this trait, so the engines above it can run against the host or against
/// an in-memory namespace.
pub trait MountNamespace {
    /// Read the current mount table.
    fn snapshot(&self) -> BotbrewResult<MountTable>;

    /// Mount `source` (or a virtual filesystem) at `target`.
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MountFlags,
        data: Option<&str>,
    ) -> io::Result<()>;

    /// Remount `target` with `flags`.
    fn remount(&self, target: &Path, flags: MountFlags) -> io::Result<()>;

    /// Change the propagation type of the mount at `target`.
    fn set_propagation(
        &self,
        target: &Path,
        propagation: Propagation,
        recursive: bool,
    ) -> io::Result<()>;

    /// Lazily detach the mount at `target`.
    fn detach(&self, target: &Path) -> io::Result<()>;

    /// Bind `image` to a free loop device and return the device path.
    fn attach_loop(&self, image: &Path) -> BotbrewResult<PathBuf>;

    /// Clear the backing file of `device`.
    fn release_loop(&self, device: &Path) -> BotbrewResult<()>;
}

/// The mount namespace of the calling process.
#[derive(Debug, Clone)]
pub struct HostNamespace {
    table: PathBuf,
    loops: LoopManager,
}

impl HostNamespace {
    /// Create a namespace reading `table` and allocating loops from `loops`.
    pub fn new(table: impl Into<PathBuf>, loops: LoopManager) -> Self {
        Self {
            table: table.into(),
            loops,
        }
    }
}

impl Default for HostNamespace {
    fn default() -> Self {
        Self::new(botbrew_common::paths::MOUNT_TABLE, LoopManager::default())
    }
}

impl MountNamespace for HostNamespace {
    fn snapshot(&self) -> BotbrewResult<MountTable> {
        MountTable::read(&self.table)
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MountFlags,
        data: Option<&str>,
    ) -> io::Result<()> {
        use std::ffi::CString;

        tracing::debug!(
            source = ?source,
            target = %target.display(),
            fstype = ?fstype,
            ?flags,
            data = ?data,
            "Mounting filesystem"
        );

        let fstype_c = CString::new(fstype.unwrap_or(""))?;
        let data_c = CString::new(data.unwrap_or(""))?;

        rustix::mount::mount(
            source.unwrap_or(Path::new("none")),
            target,
            fstype_c.as_c_str(),
            flags,
            data_c.as_c_str(),
        )
        .map_err(io::Error::from)
    }

    fn remount(&self, target: &Path, flags: MountFlags) -> io::Result<()> {
        use std::ffi::CString;

        tracing::debug!(target = %target.display(), ?flags, "Remounting");

        let empty = CString::default();
        rustix::mount::mount_remount(target, flags, empty.as_c_str()).map_err(io::Error::from)
    }

    fn set_propagation(
        &self,
        target: &Path,
        propagation: Propagation,
        recursive: bool,
    ) -> io::Result<()> {
        tracing::debug!(
            target = %target.display(),
            ?propagation,
            recursive,
            "Changing mount propagation"
        );

        rustix::mount::mount_change(target, propagation.to_flags(recursive))
            .map_err(io::Error::from)
    }

    fn detach(&self, target: &Path) -> io::Result<()> {
        use rustix::mount::{UnmountFlags, unmount};

        tracing::debug!(target = %target.display(), "Detaching mount");

        unmount(target, UnmountFlags::DETACH).map_err(io::Error::from)
    }

    fn attach_loop(&self, image: &Path) -> BotbrewResult<PathBuf> {
        self.loops.acquire(image)
    }

    fn release_loop(&self, device: &Path) -> BotbrewResult<()> {
        self.loops.release(device)
    }
}

/// A best-effort step that failed and was skipped.
#[derive(Debug)]
pub struct StepFailure {
    /// What was being attempted.
    pub step: &'static str,
    /// Path the step operated on.
    pub target: PathBuf,
    /// Why it failed.
    pub error: io::Error,
}

/// Failures collected while applying a sequence of best-effort mount steps.
///
/// A failed step never aborts the sequence; it is logged and kept here.
#[derive(Debug, Default)]
pub struct MountReport {
    failures: Vec<StepFailure>,
}

impl MountReport {
    /// Create an empty report.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one step. Returns whether it succeeded.
    pub fn check(&mut self, step: &'static str, target: &Path, result: io::Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(step, target = %target.display(), error = %error, "Mount step failed");
                self.failures.push(StepFailure {
                    step,
                    target: target.to_path_buf(),
                    error,
                });
                false
            }
        }
    }

    /// `true` when no step failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failed steps in the order they happened.
    #[must_use]
    pub fn failures(&self) -> &[StepFailure] {
        &self.failures
    }
}

/// Create `dir` and any missing parents with `mode`, ignoring existing ones.
pub(crate) fn create_dir(dir: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    match std::fs::DirBuilder::new().recursive(true).mode(mode).create(dir) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propagation_flags() {
        use rustix::mount::MountPropagationFlags;

        assert_eq!(Propagation::Shared.to_flags(false), MountPropagationFlags::SHARED);
        assert_eq!(
            Propagation::Slave.to_flags(true),
            MountPropagationFlags::DOWNSTREAM | MountPropagationFlags::REC
        );
    }

    #[test]
    fn report_keeps_going() {
        let mut report = MountReport::new();
        assert!(report.check("bind", Path::new("/a"), Ok(())));
        assert!(!report.check(
            "bind",
            Path::new("/b"),
            Err(io::Error::from_raw_os_error(libc::EINVAL))
        ));
        assert!(report.check("bind", Path::new("/c"), Ok(())));

        assert!(!report.is_clean());
        assert_eq!(report.failures().len(), 1);
        assert_eq!(report.failures()[0].target, PathBuf::from("/b"));
    }

    #[test]
    fn create_dir_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("a/b");
        create_dir(&dir, 0o755).unwrap();
        create_dir(&dir, 0o755).unwrap();
        assert!(dir.is_dir());
    }
}
