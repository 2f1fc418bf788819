#![allow(unsafe_code)]
//! Loop device allocation and image mounts.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use botbrew_common::paths::{LOOP_DIR, LOOP_MAJOR, LOOP_MAX};
use botbrew_common::{BotbrewError, BotbrewResult};
use rustix::mount::MountFlags;

use super::mounts::MountNamespace;

// Linux ioctl constants for loop devices.
// Defined in include/uapi/linux/loop.h.
/// `LOOP_SET_FD`: attach a backing file.
const LOOP_SET_FD: u32 = 0x4C00;
/// `LOOP_CLR_FD`: detach the backing file.
const LOOP_CLR_FD: u32 = 0x4C01;
/// `LOOP_SET_STATUS64`: record backing-file metadata.
const LOOP_SET_STATUS64: u32 = 0x4C04;
/// `LOOP_GET_STATUS64`: fails with `ENXIO` on an unbound device.
const LOOP_GET_STATUS64: u32 = 0x4C05;

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

/// Device name prefixes that identify loop-backed mounts.
const LOOP_PREFIXES: &[&str] = &["/dev/block/loop", "/dev/loop"];

/// `struct loop_info64`.
#[repr(C)]
#[allow(dead_code)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl LoopInfo64 {
    const fn zeroed() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }

    /// Info naming `image`, truncated to the kernel's field width.
    fn for_image(image: &Path) -> Self {
        use std::os::unix::ffi::OsStrExt;

        let mut info = Self::zeroed();
        let name = image.as_os_str().as_bytes();
        // Keep the trailing NUL.
        let len = name.len().min(LO_NAME_SIZE - 1);
        info.lo_file_name[..len].copy_from_slice(&name[..len]);
        info
    }
}

/// Allocates loop devices from a fixed index space.
///
/// There is no cross-process locking: two concurrent `acquire` calls can
/// both pick the same free index before either binds it.
#[derive(Debug, Clone)]
pub struct LoopManager {
    dev_dir: PathBuf,
    max: u32,
}

impl LoopManager {
    /// Create a manager for device nodes under `dev_dir`.
    pub fn new(dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            max: LOOP_MAX,
        }
    }

    /// Limit the scanned index space to `0..max`.
    #[must_use]
    pub fn with_max(mut self, max: u32) -> Self {
        self.max = max;
        self
    }

    /// Path of the device node with `index`.
    #[must_use]
    pub fn device_path(&self, index: u32) -> PathBuf {
        self.dev_dir.join(format!("loop{index}"))
    }

    /// Bind `image` to the first unbound loop device and return its path.
    ///
    /// The image is opened before any device is touched. Missing device
    /// nodes are created on the way.
    pub fn acquire(&self, image: &Path) -> BotbrewResult<PathBuf> {
        let backing = OpenOptions::new()
            .read(true)
            .write(true)
            .open(image)
            .map_err(|source| BotbrewError::BackingFile {
                path: image.to_path_buf(),
                source,
            })?;

        let (path, device) = self.find_free()?;

        // SAFETY: both descriptors are open for the duration of the call.
        let ret = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                LOOP_SET_FD as _,
                backing.as_raw_fd() as libc::c_ulong,
            )
        };
        if ret < 0 {
            return Err(BotbrewError::BackingFile {
                path: image.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }

        let info = LoopInfo64::for_image(image);
        // SAFETY: `info` is a valid `loop_info64` that outlives the call.
        let ret = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                LOOP_SET_STATUS64 as _,
                std::ptr::from_ref(&info),
            )
        };
        if ret < 0 {
            let source = io::Error::last_os_error();
            // SAFETY: plain ioctl on an open descriptor.
            unsafe {
                libc::ioctl(device.as_raw_fd(), LOOP_CLR_FD as _, 0);
            }
            return Err(BotbrewError::BackingFile {
                path: image.to_path_buf(),
                source,
            });
        }

        tracing::debug!(device = %path.display(), image = %image.display(), "Attached loop device");
        Ok(path)
    }

    /// Detach the backing file of `device`.
    ///
    /// Must be called once per successful [`acquire`](Self::acquire).
    pub fn release(&self, device: &Path) -> BotbrewResult<()> {
        let file = File::open(device)?;

        // SAFETY: plain ioctl on an open descriptor.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), LOOP_CLR_FD as _, 0) };
        if ret < 0 {
            return Err(BotbrewError::Io(io::Error::last_os_error()));
        }

        tracing::debug!(device = %device.display(), "Released loop device");
        Ok(())
    }

    /// Scan `loop0..loopN` for the first device without a backing file.
    fn find_free(&self) -> BotbrewResult<(PathBuf, File)> {
        for index in 0..self.max {
            let path = self.device_path(index);
            self.ensure_node(&path, index)?;

            let device = OpenOptions::new().read(true).write(true).open(&path)?;

            let mut info = LoopInfo64::zeroed();
            // SAFETY: `info` is a writable `loop_info64` that outlives the call.
            let ret = unsafe {
                libc::ioctl(
                    device.as_raw_fd(),
                    LOOP_GET_STATUS64 as _,
                    std::ptr::from_mut(&mut info),
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ENXIO) {
                    tracing::debug!(device = %path.display(), "Found free loop device");
                    return Ok((path, device));
                }
                tracing::debug!(device = %path.display(), error = %err, "Skipping loop device");
            }
        }

        Err(BotbrewError::LoopDevicesExhausted { max: self.max })
    }

    /// Create the block device node for `index` unless it exists.
    fn ensure_node(&self, path: &Path, index: u32) -> BotbrewResult<()> {
        use rustix::fs::{CWD, FileType, Mode, mknodat};

        match mknodat(
            CWD,
            path,
            FileType::BlockDevice,
            Mode::from_raw_mode(0o660),
            device_number(index),
        ) {
            Ok(()) => {
                tracing::debug!(device = %path.display(), "Created loop device node");
                Ok(())
            }
            Err(rustix::io::Errno::EXIST) => Ok(()),
            Err(e) => Err(BotbrewError::Io(e.into())),
        }
    }
}

impl Default for LoopManager {
    fn default() -> Self {
        Self::new(LOOP_DIR.as_path())
    }
}

/// Device number of loop device `index`.
#[must_use]
pub fn device_number(index: u32) -> rustix::fs::Dev {
    rustix::fs::makedev(LOOP_MAJOR, index)
}

/// `true` if `source` names a loop block device.
#[must_use]
pub fn is_loop_device(source: &str) -> bool {
    let configured = LOOP_DIR.join("loop");
    LOOP_PREFIXES.iter().any(|prefix| source.starts_with(prefix))
        || source.starts_with(configured.to_string_lossy().as_ref())
}

/// Attach `image` to a loop device and mount it at `target`.
///
/// The device is released again when the mount fails.
pub fn mount_image<N: MountNamespace + ?Sized>(
    ns: &N,
    image: &Path,
    target: &Path,
    fstype: &str,
    flags: MountFlags,
) -> BotbrewResult<PathBuf> {
    let device = ns.attach_loop(image)?;

    if let Err(source) = ns.mount(Some(&device), target, Some(fstype), flags, None) {
        if let Err(e) = ns.release_loop(&device) {
            tracing::warn!(device = %device.display(), error = %e, "Failed to release loop device");
        }
        return Err(BotbrewError::ImageMount {
            image: image.to_path_buf(),
            source,
        });
    }

    tracing::info!(
        image = %image.display(),
        device = %device.display(),
        target = %target.display(),
        "Mounted image"
    );
    Ok(device)
}

/// Detach the loop-backed mount at `target` and release its device.
///
/// The device named in the mount table is released even when the detach
/// itself fails.
pub fn unmount_image<N: MountNamespace + ?Sized>(ns: &N, target: &Path) -> BotbrewResult<()> {
    let table = ns.snapshot()?;
    let Some(record) = table.find_by_target(target) else {
        return Err(BotbrewError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not mounted", target.display()),
        )));
    };

    let detached = ns.detach(target);
    ns.release_loop(Path::new(&record.source))?;
    detached?;
    Ok(())
}
