//! Changing the propagation type of a live mount subtree.
//!
//! The kernel cannot change the propagation of a mount that already has
//! children without losing them, so the subtree is rebuilt: every nested
//! mount is mirrored into a private staging tmpfs, the originals are
//! detached, and the staging tree is bound back over the source.
//!
//! At every step each original mount stays reachable either at its
//! original location or through its mirror. Callers must serialize
//! transplants; concurrent observers of the mount table may see the
//! intermediate states.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use botbrew_common::paths::join;
use botbrew_common::{BotbrewError, BotbrewResult};
use rustix::mount::MountFlags;

use super::mounts::{MountNamespace, MountReport, Propagation, create_dir};
use super::scanner::MountRecord;

/// Data of the staging tmpfs.
const STAGING_DATA: &str = "size=1M";

/// Relocates a mount subtree through a staging directory.
#[derive(Debug)]
pub struct Transplant<'a, N: MountNamespace + ?Sized> {
    ns: &'a N,
    staging: PathBuf,
}

impl<'a, N: MountNamespace + ?Sized> Transplant<'a, N> {
    /// Create a transplant that stages through `staging`.
    ///
    /// `staging` must not lie inside any subtree it is used on.
    pub fn new(ns: &'a N, staging: impl Into<PathBuf>) -> Self {
        Self {
            ns,
            staging: staging.into(),
        }
    }

    /// Give the subtree at `src` the `propagation` type, keeping every
    /// mount nested below it.
    ///
    /// Fails only when `src` cannot be resolved or the mount table cannot
    /// be read; individual mount steps are best-effort and reported.
    pub fn run(&self, src: &Path, propagation: Propagation) -> BotbrewResult<MountReport> {
        let src = src
            .canonicalize()
            .map_err(|_| BotbrewError::InvalidTarget {
                path: src.to_path_buf(),
            })?;
        let table = self.ns.snapshot()?;
        let nested: Vec<MountRecord> = table.find_by_prefix(&src).into_iter().cloned().collect();

        tracing::info!(
            src = %src.display(),
            staging = %self.staging.display(),
            nested = nested.len(),
            ?propagation,
            "Transplanting mount subtree"
        );

        let mut report = MountReport::new();
        self.prepare_staging(&mut report);
        self.mirror(&src, &nested, &mut report);
        self.detach_originals(&nested, &mut report);
        self.copy_shape(&src, &mut report);
        self.commit(&src, propagation, &mut report);

        Ok(report)
    }

    /// Mount a private tmpfs on the staging directory.
    fn prepare_staging(&self, report: &mut MountReport) {
        let staging = self.staging.as_path();
        report.check("create staging", staging, create_dir(staging, 0o755));
        report.check(
            "mount staging",
            staging,
            self.ns.mount(
                None,
                staging,
                Some("tmpfs"),
                MountFlags::empty(),
                Some(STAGING_DATA),
            ),
        );
        report.check(
            "isolate staging",
            staging,
            self.ns
                .set_propagation(staging, Propagation::Private, false),
        );
    }

    /// Bind every nested mount into the staging tree, parents first.
    fn mirror(&self, src: &Path, nested: &[MountRecord], report: &mut MountReport) {
        for record in nested {
            let original = record.target.as_path();
            let mirror = self.mirror_path(src, original);

            report.check("create mirror", &mirror, create_dir(&mirror, 0o755));
            if let Ok(meta) = fs::metadata(original) {
                report.check(
                    "copy mode",
                    &mirror,
                    fs::set_permissions(&mirror, fs::Permissions::from_mode(meta.permissions().mode())),
                );
            }

            report.check(
                "share original",
                original,
                self.ns.set_propagation(original, Propagation::Shared, false),
            );
            report.check(
                "bind mirror",
                &mirror,
                self.ns
                    .mount(Some(original), &mirror, None, MountFlags::BIND, None),
            );
            report.check(
                "enslave original",
                original,
                self.ns.set_propagation(original, Propagation::Slave, false),
            );
        }
    }

    /// Detach the originals, most recently mounted first.
    fn detach_originals(&self, nested: &[MountRecord], report: &mut MountReport) {
        for record in nested.iter().rev() {
            report.check("detach original", &record.target, self.ns.detach(&record.target));
        }
    }

    /// Recreate the plain subdirectories of `src` inside the staging tree.
    fn copy_shape(&self, src: &Path, report: &mut MountReport) {
        let entries = match fs::read_dir(src) {
            Ok(entries) => entries,
            Err(e) => {
                report.check("read source", src, Err(e));
                return;
            }
        };

        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let Ok(meta) = fs::metadata(entry.path()) else {
                continue;
            };
            if !meta.is_dir() {
                continue;
            }
            let dir = self.staging.join(entry.file_name());
            if dir.exists() {
                continue;
            }
            if report.check("create subdirectory", &dir, fs::create_dir(&dir)) {
                report.check(
                    "copy mode",
                    &dir,
                    fs::set_permissions(&dir, fs::Permissions::from_mode(meta.permissions().mode())),
                );
            }
        }
    }

    /// Replace `src` with the staging tree and drop the staging mount.
    fn commit(&self, src: &Path, propagation: Propagation, report: &mut MountReport) {
        let staging = self.staging.as_path();

        report.check("detach source", src, self.ns.detach(src));
        report.check(
            "share staging",
            staging,
            self.ns.set_propagation(staging, Propagation::Shared, true),
        );
        report.check(
            "bind staging",
            src,
            self.ns.mount(
                Some(staging),
                src,
                None,
                MountFlags::BIND | MountFlags::REC,
                None,
            ),
        );
        report.check(
            "enslave staging",
            staging,
            self.ns.set_propagation(staging, Propagation::Slave, true),
        );
        if propagation != Propagation::Shared {
            report.check(
                "set propagation",
                src,
                self.ns.set_propagation(src, propagation, true),
            );
        }
        report.check("detach staging", staging, self.ns.detach(staging));
        report.check("remove staging", staging, fs::remove_dir(staging));
    }

    fn mirror_path(&self, src: &Path, original: &Path) -> PathBuf {
        let relative = original.strip_prefix(src).unwrap_or(original);
        join(&self.staging, relative)
    }
}
