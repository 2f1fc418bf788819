//! Filesystem fixups performed on cold start.

use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use botbrew_common::RootPaths;
use botbrew_common::paths::{COMPAT_LINKS, TRANSPLANT_SOURCE, join};

/// Mode of the installed executable.
const INSTALLED_MODE: u32 = 0o4755;

/// Remove a leftover `mnt` link inside the root so it can be mounted over.
pub fn remove_stale_mnt(root: &RootPaths) {
    let mnt = root.join(TRANSPLANT_SOURCE);
    match fs::symlink_metadata(&mnt) {
        Ok(metadata) if !metadata.is_dir() => {
            if let Err(e) = fs::remove_file(&mnt) {
                tracing::warn!(path = %mnt.display(), error = %e, "Cannot remove stale mnt entry");
            }
        }
        _ => {}
    }
}

/// Point the legacy storage names inside the root at `/mnt`.
pub fn fix_compat_links(root: &RootPaths) {
    for name in COMPAT_LINKS {
        let link = root.join(name);
        let target = join(Path::new(TRANSPLANT_SOURCE), name);
        match fs::symlink_metadata(&link) {
            Ok(metadata) if metadata.is_dir() => {
                tracing::debug!(path = %link.display(), "Keeping directory in place of link");
                continue;
            }
            Ok(_) => {
                let _ = fs::remove_file(&link);
            }
            Err(_) => {}
        }
        if let Err(e) = std::os::unix::fs::symlink(&target, &link) {
            tracing::warn!(path = %link.display(), error = %e, "Cannot create link");
        }
    }
}

/// Install the running executable at `installed` and make the copy a
/// root-owned setuid binary.
///
/// The copy is refreshed only when it is missing or older than `current`.
/// Returns whether a copy was made.
pub fn install_self(current: &Path, installed: &Path) -> bool {
    let copied = if is_same_file(current, installed) {
        false
    } else {
        refresh(current, installed)
    };
    seal(installed);
    copied
}

fn is_same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn refresh(current: &Path, installed: &Path) -> bool {
    let source_mtime = fs::metadata(current).map_or(0, |m| m.mtime());
    match fs::metadata(installed) {
        Ok(metadata) if metadata.is_dir() || metadata.mtime() >= source_mtime => return false,
        _ => {}
    }

    match fs::copy(current, installed) {
        Ok(_) => {
            tracing::info!(path = %installed.display(), "Installed executable");
            true
        }
        Err(e) => {
            tracing::warn!(path = %installed.display(), error = %e, "Cannot install executable");
            let _ = fs::remove_file(installed);
            false
        }
    }
}

fn seal(installed: &Path) {
    let Ok(metadata) = fs::metadata(installed) else {
        return;
    };
    if metadata.is_dir() {
        return;
    }
    if metadata.uid() != 0 || metadata.gid() != 0 {
        if let Err(e) = std::os::unix::fs::chown(installed, Some(0), Some(0)) {
            warn(installed, &e);
        }
    }
    let mode = metadata.mode();
    if mode & 0o022 != 0 || mode & 0o4000 == 0 {
        if let Err(e) = fs::set_permissions(installed, fs::Permissions::from_mode(INSTALLED_MODE))
        {
            warn(installed, &e);
        }
    }
}

fn warn(path: &Path, e: &io::Error) {
    tracing::warn!(path = %path.display(), error = %e, "Cannot seal installed executable");
}
