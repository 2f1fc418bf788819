//! Namespace state detection and the bootstrap phase machine.

use botbrew_common::RootPaths;

use crate::filesystem::MountTable;

/// What the live mount table says about a namespace root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceState {
    /// Nothing is mounted at the root.
    NotMounted,
    /// A loop-backed image is mounted at the root but setup never finished.
    ImageAttached,
    /// The root is fully configured.
    Mounted {
        /// The root itself is a loop-backed image.
        loop_backed: bool,
    },
}

impl NamespaceState {
    /// Classify `root` against a mount table snapshot.
    ///
    /// A loop-backed root only counts as configured once its `run`
    /// directory is mounted too.
    #[must_use]
    pub fn detect(table: &MountTable, root: &RootPaths) -> Self {
        match table.find_by_target(&root.root) {
            None => Self::NotMounted,
            Some(record) if record.is_loop_backed() => {
                if table.find_by_target(&root.run()).is_some() {
                    Self::Mounted { loop_backed: true }
                } else {
                    Self::ImageAttached
                }
            }
            Some(_) => Self::Mounted { loop_backed: false },
        }
    }

    /// `true` when setup can be skipped.
    #[must_use]
    pub const fn is_mounted(self) -> bool {
        matches!(self, Self::Mounted { .. })
    }

    /// `true` when the root is a loop-backed image.
    #[must_use]
    pub const fn is_loop_backed(self) -> bool {
        matches!(
            self,
            Self::ImageAttached | Self::Mounted { loop_backed: true }
        )
    }
}

/// Phases of a bootstrap run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Setup is required before entry.
    NotMounted,
    /// Ready to enter.
    Mounted,
    /// Tearing the namespace down, optionally setting it up again afterwards.
    Unmounting {
        /// Continue with a cold start after teardown.
        remount: bool,
    },
}

impl Phase {
    /// The first phase for an observed state and the requested flags.
    /// `remount` implies `unmount`.
    #[must_use]
    pub const fn initial(state: NamespaceState, unmount: bool, remount: bool) -> Self {
        if unmount || remount {
            Self::Unmounting { remount }
        } else if state.is_mounted() {
            Self::Mounted
        } else {
            Self::NotMounted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
rootfs / rootfs ro 0 0
/dev/block/mmcblk0p2 /data ext4 rw 0 0
/data/botbrew /data/botbrew ext4 rw,nodev,noatime 0 0
proc /data/botbrew/proc proc rw 0 0
/dev/block/loop3 /sdcard/botbrew ext4 rw 0 0
/dev/block/loop4 /sdcard/other ext4 rw 0 0
tmpfs /sdcard/other/run tmpfs rw 0 0
";

    fn detect(root: &str) -> NamespaceState {
        NamespaceState::detect(&MountTable::parse(TABLE), &RootPaths::new(root))
    }

    #[test]
    fn detect_states() {
        assert_eq!(detect("/data/elsewhere"), NamespaceState::NotMounted);
        assert_eq!(
            detect("/data/botbrew"),
            NamespaceState::Mounted { loop_backed: false }
        );
        assert_eq!(detect("/sdcard/botbrew"), NamespaceState::ImageAttached);
        assert_eq!(
            detect("/sdcard/other"),
            NamespaceState::Mounted { loop_backed: true }
        );
    }

    #[test]
    fn image_attached_needs_setup() {
        let state = NamespaceState::ImageAttached;
        assert!(!state.is_mounted());
        assert!(state.is_loop_backed());
        assert_eq!(Phase::initial(state, false, false), Phase::NotMounted);
    }

    #[test]
    fn initial_phase() {
        let mounted = NamespaceState::Mounted { loop_backed: false };
        assert_eq!(Phase::initial(mounted, false, false), Phase::Mounted);
        assert_eq!(
            Phase::initial(NamespaceState::NotMounted, false, false),
            Phase::NotMounted
        );
        assert_eq!(
            Phase::initial(mounted, true, false),
            Phase::Unmounting { remount: false }
        );
        assert_eq!(
            Phase::initial(NamespaceState::NotMounted, false, true),
            Phase::Unmounting { remount: true }
        );
    }
}
