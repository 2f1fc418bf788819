//! Compiled-in mount tables.
//!
//! Rows are applied in order. A row either mounts a virtual filesystem or
//! binds an existing directory; [`MountSource`] keeps the two apart.

use rustix::mount::MountFlags;

/// Where a mounted tree comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountSource {
    /// A filesystem with no backing path (proc, sysfs, tmpfs).
    Virtual {
        /// Filesystem type.
        fstype: &'static str,
        /// Type-specific mount data.
        data: Option<&'static str>,
    },
    /// An existing directory made visible at the destination.
    Bind {
        /// Source directory.
        path: &'static str,
    },
}

/// One row of a mount table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountSpec {
    /// What to mount.
    pub source: MountSource,
    /// Destination, relative to the namespace root.
    pub target: &'static str,
    /// Flags passed to the mount call.
    pub flags: MountFlags,
    /// Flags applied with a remount once the mount succeeded.
    pub remount: Option<MountFlags>,
}

impl MountSpec {
    const fn bind(path: &'static str, target: &'static str) -> Self {
        Self {
            source: MountSource::Bind { path },
            target,
            flags: RBIND,
            remount: None,
        }
    }

    const fn fs(fstype: &'static str, target: &'static str) -> Self {
        Self {
            source: MountSource::Virtual { fstype, data: None },
            target,
            flags: MountFlags::empty(),
            remount: None,
        }
    }

    const fn with_data(mut self, data: &'static str) -> Self {
        if let MountSource::Virtual { fstype, .. } = self.source {
            self.source = MountSource::Virtual {
                fstype,
                data: Some(data),
            };
        }
        self
    }

    const fn with_flags(mut self, flags: MountFlags) -> Self {
        self.flags = self.flags.union(flags);
        self
    }

    const fn with_remount(mut self, flags: MountFlags) -> Self {
        self.remount = Some(flags);
        self
    }

    /// `true` for bind rows.
    #[must_use]
    pub const fn is_bind(&self) -> bool {
        matches!(self.source, MountSource::Bind { .. })
    }

    /// Source path of a bind row.
    #[must_use]
    pub const fn bind_path(&self) -> Option<&'static str> {
        match self.source {
            MountSource::Bind { path } => Some(path),
            MountSource::Virtual { .. } => None,
        }
    }

    /// Filesystem type of a virtual row.
    #[must_use]
    pub const fn fstype(&self) -> Option<&'static str> {
        match self.source {
            MountSource::Virtual { fstype, .. } => Some(fstype),
            MountSource::Bind { .. } => None,
        }
    }

    /// Mount data of a virtual row.
    #[must_use]
    pub const fn data(&self) -> Option<&'static str> {
        match self.source {
            MountSource::Virtual { data, .. } => data,
            MountSource::Bind { .. } => None,
        }
    }
}

const RBIND: MountFlags = MountFlags::BIND.union(MountFlags::REC);

/// `nodev,noatime`, applied to the root itself and to `/android/system`.
pub const NODEV_NOATIME: MountFlags = MountFlags::NODEV.union(MountFlags::NOATIME);

/// Host trees made visible inside the root. Sources are host paths.
pub const FOREIGN_MOUNTS: &[MountSpec] = &[
    MountSpec::fs("proc", "/proc"),
    MountSpec::bind("/dev", "/dev"),
    MountSpec::fs("sysfs", "/sys"),
    MountSpec::fs("tmpfs", "/run").with_data("size=10%,mode=0755"),
    MountSpec::bind("/mnt", "/mnt"),
    MountSpec::fs("tmpfs", "/android")
        .with_flags(
            MountFlags::NODEV
                .union(MountFlags::NOEXEC)
                .union(MountFlags::NOATIME),
        )
        .with_data("size=1M,mode=0755"),
    MountSpec::bind("/cache", "/android/cache"),
    MountSpec::bind("/data", "/android/data"),
    MountSpec::bind("/datadata", "/android/datadata"),
    MountSpec::bind("/sd-ext", "/android/sd-ext"),
    MountSpec::bind("/system", "/android/system").with_remount(NODEV_NOATIME),
];

/// Trees of the root exported into the private environment directory.
/// Sources are relative to the root.
pub const LOCAL_MOUNTS: &[MountSpec] = &[
    MountSpec::bind("/etc", "/botbrew/etc"),
    MountSpec::bind("/home", "/botbrew/home"),
    MountSpec::bind("/root", "/botbrew/root"),
    MountSpec::bind("/var", "/botbrew/var"),
    MountSpec::bind("/usr/share", "/botbrew/share"),
    MountSpec::bind("/run", "/botbrew/run"),
];

/// Scratch directories created under the root's `/run`, world-writable and sticky.
pub const RUN_SCRATCH_DIRS: &[&str] = &["/run/tmp", "/run/lock"];
