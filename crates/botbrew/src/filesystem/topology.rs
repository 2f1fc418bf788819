//! Applying and tearing down the namespace mount topology.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use botbrew_common::paths::join;
use botbrew_common::{BotbrewResult, RootPaths};
use rustix::mount::MountFlags;

use super::loopdev;
use super::mounts::{MountNamespace, MountReport, Propagation, create_dir};
use super::scanner::MountRecord;
use super::table::{FOREIGN_MOUNTS, LOCAL_MOUNTS, MountSpec, NODEV_NOATIME, RUN_SCRATCH_DIRS};

/// Applies the mount tables to a namespace root.
#[derive(Debug)]
pub struct Topology<'a, N: MountNamespace + ?Sized> {
    ns: &'a N,
    root: RootPaths,
    host: PathBuf,
}

impl<'a, N: MountNamespace + ?Sized> Topology<'a, N> {
    /// Create a topology for `root`, binding host trees from `/`.
    pub fn new(ns: &'a N, root: RootPaths) -> Self {
        Self {
            ns,
            root,
            host: PathBuf::from("/"),
        }
    }

    /// Resolve foreign sources below `host` instead of `/`.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<PathBuf>) -> Self {
        self.host = host.into();
        self
    }

    /// Mount everything the root needs.
    ///
    /// Individual rows are best-effort: a failed row leaves no empty
    /// destination behind and the remaining rows are still applied.
    pub fn setup(&self, loop_backed: bool) -> MountReport {
        let root = self.root.root.as_path();
        let mut report = MountReport::new();

        tracing::info!(root = %root.display(), loop_backed, "Setting up namespace mounts");

        if !loop_backed {
            report.check(
                "self bind",
                root,
                self.ns.mount(Some(root), root, None, MountFlags::BIND, None),
            );
        }
        report.check("self remount", root, self.ns.remount(root, NODEV_NOATIME));

        for row in FOREIGN_MOUNTS {
            self.apply_foreign(row, &mut report);
        }

        report.check(
            "share root",
            root,
            self.ns.set_propagation(root, Propagation::Shared, true),
        );

        for dir in RUN_SCRATCH_DIRS {
            let dir = self.root.join(dir);
            if report.check("create scratch", &dir, create_dir(&dir, 0o755)) {
                report.check(
                    "scratch mode",
                    &dir,
                    fs::set_permissions(&dir, fs::Permissions::from_mode(0o1777)),
                );
            }
        }

        for row in LOCAL_MOUNTS {
            self.apply_local(row, &mut report);
        }

        report
    }

    /// Apply one host row, keeping the root unbindable while the mount is
    /// incomplete.
    fn apply_foreign(&self, row: &MountSpec, report: &mut MountReport) {
        let source = row.bind_path().map(|path| join(&self.host, path));
        if let Some(source) = &source {
            if !source.exists() {
                tracing::debug!(source = %source.display(), "Skipping missing mount source");
                return;
            }
            report.check(
                "share source",
                source,
                self.ns.set_propagation(source, Propagation::Shared, true),
            );
        }

        let target = self.root.join(row.target);
        report.check("create target", &target, create_dir(&target, 0o755));
        report.check(
            "unbind root",
            &self.root.root,
            self.ns
                .set_propagation(&self.root.root, Propagation::Unbindable, false),
        );

        if self.mount_row(row, source.as_deref(), &target, report) {
            report.check(
                "seal mount",
                &target,
                self.ns
                    .set_propagation(&target, Propagation::Unbindable, false),
            );
        }
    }

    /// Apply one row whose source lives inside the root.
    fn apply_local(&self, row: &MountSpec, report: &mut MountReport) {
        let source = row.bind_path().map(|path| self.root.join(path));
        if let Some(source) = &source {
            if !source.exists() {
                tracing::debug!(source = %source.display(), "Skipping missing mount source");
                return;
            }
        }

        let target = self.root.join(row.target);
        report.check("create target", &target, create_dir(&target, 0o755));
        if let Some(source) = &source {
            report.check(
                "share source",
                source,
                self.ns.set_propagation(source, Propagation::Shared, true),
            );
        }

        self.mount_row(row, source.as_deref(), &target, report);
    }

    /// Mount a row and apply its remount flags. On failure the destination
    /// directory is removed again.
    fn mount_row(
        &self,
        row: &MountSpec,
        source: Option<&Path>,
        target: &Path,
        report: &mut MountReport,
    ) -> bool {
        let mounted = self
            .ns
            .mount(source, target, row.fstype(), row.flags, row.data());
        if !report.check("mount", target, mounted) {
            report.check("remove target", target, fs::remove_dir(target));
            return false;
        }
        if let Some(flags) = row.remount {
            report.check("remount", target, self.ns.remount(target, flags));
        }
        true
    }

    /// Detach everything mounted at or below the root.
    ///
    /// Mounts are detached in the reverse of the order the mount table
    /// reports them. Loop-backed mounts release their device. When the
    /// mount table cannot be read only the root itself is detached, which
    /// may leave nested mounts behind and, for an image, its loop device
    /// bound.
    pub fn teardown(&self, loop_backed: bool) -> BotbrewResult<MountReport> {
        let root = self.root.root.as_path();
        let mut report = MountReport::new();

        let table = match self.ns.snapshot() {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "Mount table unavailable, detaching root only");
                report.check(
                    "enslave root",
                    root,
                    self.ns.set_propagation(root, Propagation::Slave, true),
                );
                report.check("detach", root, self.ns.detach(root));
                if loop_backed {
                    report.check(
                        "release image",
                        root,
                        Err(io::Error::new(
                            io::ErrorKind::NotFound,
                            "loop device unknown without a mount table",
                        )),
                    );
                }
                return Ok(report);
            }
        };

        let subtree: Vec<MountRecord> = table.subtree(root).into_iter().cloned().collect();
        tracing::info!(root = %root.display(), mounts = subtree.len(), "Tearing down namespace mounts");

        for record in &subtree {
            report.check(
                "enslave",
                &record.target,
                self.ns
                    .set_propagation(&record.target, Propagation::Slave, false),
            );
        }

        for record in subtree.iter().rev() {
            report.check(
                "enslave subtree",
                &record.target,
                self.ns
                    .set_propagation(&record.target, Propagation::Slave, true),
            );
            self.detach(&record.target, record.is_loop_backed(), &mut report);
        }

        Ok(report)
    }

    fn detach(&self, target: &Path, loop_backed: bool, report: &mut MountReport) {
        if loop_backed {
            if let Err(e) = loopdev::unmount_image(self.ns, target) {
                report.check("detach image", target, Err(io::Error::other(e)));
            }
        } else {
            report.check("detach", target, self.ns.detach(target));
        }
    }
}
