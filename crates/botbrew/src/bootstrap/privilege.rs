//! Privilege guards and the final privilege drop.

#![allow(unsafe_code)]

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use botbrew_common::{BotbrewError, BotbrewResult};

/// Real and effective identity of the invoking process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    /// Real user id.
    pub uid: u32,
    /// Effective user id.
    pub euid: u32,
    /// Real group id.
    pub gid: u32,
}

impl Credentials {
    /// Identity of the current process.
    #[must_use]
    pub fn current() -> Self {
        Self {
            uid: rustix::process::getuid().as_raw(),
            euid: rustix::process::geteuid().as_raw(),
            gid: rustix::process::getgid().as_raw(),
        }
    }

    /// Only the real superuser may choose the namespace root.
    pub fn check_target_override(&self, requested: bool) -> BotbrewResult<()> {
        if requested && self.uid != 0 {
            return Err(BotbrewError::TargetOverrideDenied);
        }
        Ok(())
    }

    /// Refuse to run from an executable not owned by uid 0 unless the real
    /// user is the superuser.
    ///
    /// `invoked` is inspected without following symlinks, so a link owned
    /// by someone else is refused even if it points at a root-owned file.
    pub fn check_invoker(&self, invoked: &Path) -> BotbrewResult<()> {
        if self.uid == 0 {
            return Ok(());
        }
        let metadata =
            std::fs::symlink_metadata(invoked).map_err(|_| BotbrewError::InvalidTarget {
                path: invoked.to_path_buf(),
            })?;
        if metadata.uid() != 0 {
            return Err(BotbrewError::NotOwnedByRoot {
                path: invoked.to_path_buf(),
            });
        }
        Ok(())
    }

    /// Teardown requires being the superuser, really and effectively.
    pub fn require_unmount(&self) -> BotbrewResult<()> {
        if self.uid != 0 || self.euid != 0 {
            return Err(BotbrewError::privilege("unmount"));
        }
        Ok(())
    }

    /// The first invocation for a root mounts it and needs effective uid 0.
    pub fn require_setup(&self, root: &Path) -> BotbrewResult<()> {
        if self.euid != 0 {
            return Err(BotbrewError::privilege(format!(
                "set up `{}'",
                root.display()
            )));
        }
        Ok(())
    }

    /// Irreversibly become the real user: supplementary groups are reduced
    /// to the real group, then real and effective gid and uid are set.
    pub fn drop_privileges(&self) -> BotbrewResult<()> {
        let gid = self.gid as libc::gid_t;
        let uid = self.uid as libc::uid_t;

        // setgroups needs CAP_SETGID; only an effective superuser must succeed.
        let ret = unsafe { libc::setgroups(1, &gid) };
        if ret != 0 && self.euid == 0 {
            return Err(io::Error::last_os_error().into());
        }
        let ret = unsafe { libc::setregid(gid, gid) };
        if ret != 0 {
            return Err(io::Error::last_os_error().into());
        }
        let ret = unsafe { libc::setreuid(uid, uid) };
        if ret != 0 {
            return Err(io::Error::last_os_error().into());
        }

        tracing::debug!(uid, gid, "Dropped privileges");
        Ok(())
    }
}
