//! In-memory mount namespace for tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use botbrew_common::{BotbrewError, BotbrewResult};
use rustix::mount::MountFlags;

use super::mounts::{MountNamespace, Propagation};
use super::scanner::{MountRecord, MountTable, is_descendant};

/// An operation issued against the namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Op {
    Mount {
        source: Option<PathBuf>,
        target: PathBuf,
        fstype: Option<String>,
        flags: MountFlags,
    },
    Remount {
        target: PathBuf,
        flags: MountFlags,
    },
    Propagate {
        target: PathBuf,
        propagation: Propagation,
        recursive: bool,
    },
    Detach {
        target: PathBuf,
    },
    AttachLoop {
        image: PathBuf,
        device: PathBuf,
    },
    ReleaseLoop {
        device: PathBuf,
    },
}

#[derive(Debug, Clone)]
struct Mounted {
    record: MountRecord,
    propagation: Propagation,
    /// A virtual filesystem created here; its directory empties on detach.
    scratch: bool,
}

#[derive(Debug, Default)]
struct State {
    mounts: Vec<Mounted>,
    ops: Vec<Op>,
    failing: HashSet<PathBuf>,
    loops: BTreeMap<u32, PathBuf>,
    released: Vec<PathBuf>,
    unreadable: bool,
}

impl State {
    /// Topmost mount at `target`.
    fn top(&self, target: &Path) -> Option<usize> {
        self.mounts.iter().rposition(|m| m.record.target == target)
    }
}

/// Keeps an ordered mount table and records every operation.
///
/// Binds copy the source's record (recursive binds also copy everything
/// below it); detaching removes the topmost mount at the target together
/// with everything below it.
#[derive(Debug, Default)]
pub(crate) struct SimulatedNamespace {
    state: RefCell<State>,
}

impl SimulatedNamespace {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_records(records: Vec<MountRecord>) -> Self {
        let ns = Self::new();
        ns.state.borrow_mut().mounts = records
            .into_iter()
            .map(|record| Mounted {
                record,
                propagation: Propagation::Private,
                scratch: false,
            })
            .collect();
        ns
    }

    /// Make every mount onto `target` fail.
    pub(crate) fn fail_mount(&self, target: impl Into<PathBuf>) {
        self.state.borrow_mut().failing.insert(target.into());
    }

    /// Make `snapshot` fail.
    pub(crate) fn make_unreadable(&self) {
        self.state.borrow_mut().unreadable = true;
    }

    pub(crate) fn table(&self) -> MountTable {
        let state = self.state.borrow();
        MountTable::from_records(state.mounts.iter().map(|m| m.record.clone()).collect())
    }

    pub(crate) fn ops(&self) -> Vec<Op> {
        self.state.borrow().ops.clone()
    }

    pub(crate) fn propagation(&self, target: &Path) -> Option<Propagation> {
        let state = self.state.borrow();
        state.top(target).map(|i| state.mounts[i].propagation)
    }

    pub(crate) fn released(&self) -> Vec<PathBuf> {
        self.state.borrow().released.clone()
    }

    pub(crate) fn attached(&self) -> Vec<PathBuf> {
        self.state.borrow().loops.values().cloned().collect()
    }

    /// Targets of every detach, in issue order.
    pub(crate) fn detached(&self) -> Vec<PathBuf> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Detach { target } => Some(target),
                _ => None,
            })
            .collect()
    }

    fn device(index: u32) -> PathBuf {
        PathBuf::from(format!("/dev/block/loop{index}"))
    }
}

impl MountNamespace for SimulatedNamespace {
    fn snapshot(&self) -> BotbrewResult<MountTable> {
        if self.state.borrow().unreadable {
            return Err(BotbrewError::MountTableUnavailable {
                path: PathBuf::from("/proc/self/mounts"),
                source: io::Error::from_raw_os_error(libc::ENOENT),
            });
        }
        Ok(self.table())
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MountFlags,
        _data: Option<&str>,
    ) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.ops.push(Op::Mount {
            source: source.map(Path::to_path_buf),
            target: target.to_path_buf(),
            fstype: fstype.map(str::to_string),
            flags,
        });
        if state.failing.contains(target) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        if !flags.contains(MountFlags::BIND) {
            let fstype = fstype.unwrap_or("none").to_string();
            let source = source.map_or_else(|| fstype.clone(), |s| s.display().to_string());
            state.mounts.push(Mounted {
                record: MountRecord {
                    source,
                    target: target.to_path_buf(),
                    fstype,
                    options: "rw".into(),
                },
                propagation: Propagation::Private,
                scratch: true,
            });
            return Ok(());
        }

        let source = source.ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        let mut copies = Vec::new();
        match state.top(source) {
            Some(i) => {
                let origin = &state.mounts[i];
                if origin.propagation == Propagation::Unbindable {
                    return Err(io::Error::from_raw_os_error(libc::EINVAL));
                }
                copies.push(Mounted {
                    record: MountRecord {
                        target: target.to_path_buf(),
                        ..origin.record.clone()
                    },
                    propagation: joined(origin.propagation),
                    scratch: false,
                });
            }
            None => copies.push(Mounted {
                record: MountRecord {
                    source: source.display().to_string(),
                    target: target.to_path_buf(),
                    fstype: "none".into(),
                    options: "rw".into(),
                },
                propagation: Propagation::Private,
                scratch: false,
            }),
        }
        if flags.contains(MountFlags::REC) {
            for m in &state.mounts {
                if is_descendant(&m.record.target, source) {
                    let rest = m.record.target.strip_prefix(source).unwrap_or(&m.record.target);
                    copies.push(Mounted {
                        record: MountRecord {
                            target: target.join(rest),
                            ..m.record.clone()
                        },
                        propagation: joined(m.propagation),
                        scratch: false,
                    });
                }
            }
        }
        state.mounts.extend(copies);
        Ok(())
    }

    fn remount(&self, target: &Path, flags: MountFlags) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.ops.push(Op::Remount {
            target: target.to_path_buf(),
            flags,
        });
        state
            .top(target)
            .map(|_| ())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
    }

    fn set_propagation(
        &self,
        target: &Path,
        propagation: Propagation,
        recursive: bool,
    ) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.ops.push(Op::Propagate {
            target: target.to_path_buf(),
            propagation,
            recursive,
        });
        if let Some(i) = state.top(target) {
            state.mounts[i].propagation = propagation;
        }
        if recursive {
            for m in &mut state.mounts {
                if is_descendant(&m.record.target, target) {
                    m.propagation = propagation;
                }
            }
        }
        Ok(())
    }

    fn detach(&self, target: &Path) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.ops.push(Op::Detach {
            target: target.to_path_buf(),
        });
        let Some(i) = state.top(target) else {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        };
        let mut removed = vec![state.mounts.remove(i)];
        let (below, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.mounts)
            .into_iter()
            .partition(|m| is_descendant(&m.record.target, target));
        state.mounts = kept;
        removed.extend(below);
        for m in removed.iter().filter(|m| m.scratch) {
            clear_dir(&m.record.target);
        }
        Ok(())
    }

    fn attach_loop(&self, image: &Path) -> BotbrewResult<PathBuf> {
        let mut state = self.state.borrow_mut();
        let index = (0..)
            .find(|i| !state.loops.contains_key(i))
            .ok_or(BotbrewError::LoopDevicesExhausted { max: u32::MAX })?;
        let device = Self::device(index);
        state.loops.insert(index, image.to_path_buf());
        state.ops.push(Op::AttachLoop {
            image: image.to_path_buf(),
            device: device.clone(),
        });
        Ok(device)
    }

    fn release_loop(&self, device: &Path) -> BotbrewResult<()> {
        let mut state = self.state.borrow_mut();
        state.ops.push(Op::ReleaseLoop {
            device: device.to_path_buf(),
        });
        let index = state
            .loops
            .keys()
            .copied()
            .find(|i| Self::device(*i) == device)
            .ok_or_else(|| BotbrewError::Io(io::Error::from_raw_os_error(libc::ENXIO)))?;
        state.loops.remove(&index);
        state.released.push(device.to_path_buf());
        Ok(())
    }
}

/// Drop whatever was written into a detached virtual filesystem.
fn clear_dir(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() && !path.is_symlink() {
            let _ = std::fs::remove_dir_all(&path);
        } else {
            let _ = std::fs::remove_file(&path);
        }
    }
}

/// Propagation of a fresh bind of a mount with `origin` propagation.
fn joined(origin: Propagation) -> Propagation {
    match origin {
        Propagation::Shared => Propagation::Shared,
        _ => Propagation::Private,
    }
}
