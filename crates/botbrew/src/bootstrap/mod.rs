//! Bootstrapping and entering a namespace root.
//!
//! A run observes the live mount table, decides whether the root needs to
//! be torn down or set up, performs that work, and finally enters the root
//! with [`enter`]:
//!
//! ```text
//!   Unmounting ──(--remount)──► NotMounted ──► Mounted ──► enter
//!       │                                        ▲
//!       └──► exit                 (already set up)┘
//! ```
//!
//! All privilege guards run before the first mutation.

pub mod environment;
pub mod install;
pub mod privilege;
pub mod state;
pub mod target;

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use botbrew_common::paths::{IMAGE_FSTYPE, STAGING_DIR, TRANSPLANT_SOURCE};
use botbrew_common::{BotbrewError, BotbrewResult};
use rustix::mount::MountFlags;

use crate::filesystem::{self, MountNamespace, MountReport, Propagation, Topology, Transplant};
use crate::namespace::NamespaceConfig;

pub use privilege::Credentials;
pub use state::{NamespaceState, Phase};

/// Requested teardown behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Request {
    /// Tear the namespace down.
    pub unmount: bool,
    /// Set it up again after tearing it down. Implies `unmount`.
    pub remount: bool,
}

/// Result of [`Bootstrap::prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prepared {
    /// The root is ready to be entered.
    Enter,
    /// The run is complete; the root must not be entered.
    Done,
}

/// Drives the namespace root into the mounted state.
#[derive(Debug)]
pub struct Bootstrap<'a, N: MountNamespace + ?Sized> {
    ns: &'a N,
    credentials: Credentials,
    transplant_source: PathBuf,
    staging: PathBuf,
    host: PathBuf,
}

impl<'a, N: MountNamespace + ?Sized> Bootstrap<'a, N> {
    /// Create a bootstrapper acting on `ns` with the caller's `credentials`.
    pub fn new(ns: &'a N, credentials: Credentials) -> Self {
        Self {
            ns,
            credentials,
            transplant_source: PathBuf::from(TRANSPLANT_SOURCE),
            staging: STAGING_DIR.clone(),
            host: PathBuf::from("/"),
        }
    }

    /// Transplant `source` through `staging` on cold start.
    #[must_use]
    pub fn with_transplant(mut self, source: impl Into<PathBuf>, staging: impl Into<PathBuf>) -> Self {
        self.transplant_source = source.into();
        self.staging = staging.into();
        self
    }

    /// Resolve host mount sources below `host` instead of `/`.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<PathBuf>) -> Self {
        self.host = host.into();
        self
    }

    /// Bring the root described by `config` into the requested state.
    ///
    /// `invoked` is the path of the running executable, installed into the
    /// root on cold start.
    pub fn prepare(
        &self,
        config: &NamespaceConfig,
        request: Request,
        invoked: &Path,
    ) -> BotbrewResult<Prepared> {
        let mut state = match self.ns.snapshot() {
            Ok(table) => NamespaceState::detect(&table, &config.root),
            Err(e) => {
                tracing::warn!(error = %e, "Mount table unavailable, assuming not mounted");
                NamespaceState::NotMounted
            }
        };
        let mut phase = Phase::initial(state, request.unmount, request.remount);
        tracing::info!(root = %config.root_dir().display(), ?state, ?phase, "Bootstrapping");

        loop {
            match phase {
                Phase::Unmounting { remount } => {
                    self.credentials.require_unmount()?;
                    self.teardown(config, state)?;
                    if !remount {
                        return Ok(Prepared::Done);
                    }
                    state = NamespaceState::NotMounted;
                    phase = Phase::NotMounted;
                }
                Phase::NotMounted => {
                    self.credentials.require_setup(config.root_dir())?;
                    self.cold_start(config, state, invoked)?;
                    phase = Phase::Mounted;
                }
                Phase::Mounted => return Ok(Prepared::Enter),
            }
        }
    }

    fn teardown(&self, config: &NamespaceConfig, state: NamespaceState) -> BotbrewResult<()> {
        let report = Topology::new(self.ns, config.root.clone()).teardown(state.is_loop_backed())?;
        summarize("teardown", &report);
        Ok(())
    }

    fn cold_start(
        &self,
        config: &NamespaceConfig,
        state: NamespaceState,
        invoked: &Path,
    ) -> BotbrewResult<()> {
        let root = &config.root;

        match Transplant::new(self.ns, &self.staging).run(&self.transplant_source, Propagation::Shared) {
            Ok(report) => summarize("transplant", &report),
            Err(e) => tracing::warn!(
                src = %self.transplant_source.display(),
                error = %e,
                "Skipping transplant"
            ),
        }

        let loop_backed = match (&config.image, state) {
            (_, NamespaceState::ImageAttached) => true,
            (Some(image), _) => {
                filesystem::mount_image(
                    self.ns,
                    image,
                    root.root.as_path(),
                    IMAGE_FSTYPE,
                    MountFlags::empty(),
                )?;
                true
            }
            (None, _) => false,
        };

        install::remove_stale_mnt(root);
        let report = Topology::new(self.ns, root.clone())
            .with_host(&self.host)
            .setup(loop_backed);
        summarize("setup", &report);

        install::fix_compat_links(root);
        install::install_self(invoked, &root.installed_binary());
        Ok(())
    }
}

fn summarize(stage: &str, report: &MountReport) {
    if report.is_clean() {
        tracing::debug!(stage, "Completed");
    } else {
        tracing::warn!(stage, failures = report.failures().len(), "Completed with failures");
    }
}

/// Enter the root described by `config` and replace the process with its
/// command.
///
/// Only returns when the command could not be executed, with the raw
/// system error code to exit with.
pub fn enter(config: &NamespaceConfig, credentials: &Credentials) -> BotbrewResult<i32> {
    let root = config.root_dir();
    let chroot_error = |step, source| BotbrewError::Chroot {
        step,
        root: root.to_path_buf(),
        source,
    };

    std::env::set_current_dir(root).map_err(|e| chroot_error("chdir", e))?;
    std::os::unix::fs::chroot(".").map_err(|e| chroot_error("chroot", e))?;
    if std::env::set_current_dir(&config.cwd).is_err() {
        std::env::set_current_dir("/").map_err(|e| chroot_error("chdir", e))?;
    }
    tracing::debug!(root = %root.display(), cwd = %config.cwd.display(), "Entered root");

    credentials.drop_privileges()?;

    let inherited = std::env::var_os("PATH");
    let mut command = Command::new(config.program());
    command.args(config.args());
    environment::apply(&mut command, config, inherited.as_deref());

    let error = command.exec();
    eprintln!("whoops: cannot run `{}'", config.command_line());
    tracing::debug!(error = %error, "exec failed");
    Ok(error.raw_os_error().unwrap_or(1))
}
