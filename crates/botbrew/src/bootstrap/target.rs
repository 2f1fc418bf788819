//! Resolving the namespace root from the command line.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use botbrew_common::{BotbrewError, BotbrewResult};

/// A resolved namespace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Canonical root directory.
    pub root: PathBuf,
    /// Filesystem image to mount at `root`, when the target was a file.
    pub image: Option<PathBuf>,
}

/// The path the program was invoked through.
///
/// A bare program name found through `PATH` falls back to the running
/// executable.
#[must_use]
pub fn invoked_path(argv0: &Path) -> PathBuf {
    if argv0.components().count() > 1 {
        return argv0.to_path_buf();
    }
    std::env::current_exe().unwrap_or_else(|_| argv0.to_path_buf())
}

/// Canonicalize a user supplied path.
pub fn canonical(path: &Path) -> BotbrewResult<PathBuf> {
    fs::canonicalize(path).map_err(|_| BotbrewError::InvalidTarget {
        path: path.to_path_buf(),
    })
}

/// The default root: the directory holding the invoked executable.
pub fn default_root(invoked: &Path) -> BotbrewResult<PathBuf> {
    let parent = match invoked.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    canonical(parent)
}

/// Resolve `path` into a root directory and an optional image.
///
/// A regular file is an image mounted at its parent directory. A directory
/// is made root-owned and stripped of group and world write access; both
/// adjustments are best-effort.
pub fn resolve(path: &Path) -> BotbrewResult<Target> {
    let path = canonical(path)?;
    let metadata = fs::metadata(&path).map_err(|_| BotbrewError::InvalidTarget {
        path: path.clone(),
    })?;

    if metadata.is_file() {
        let root = default_root(&path)?;
        tracing::debug!(image = %path.display(), root = %root.display(), "Target is an image");
        return Ok(Target {
            root,
            image: Some(path),
        });
    }
    if !metadata.is_dir() {
        return Err(BotbrewError::NotADirectory { path });
    }

    normalize(&path, &metadata);
    Ok(Target {
        root: path,
        image: None,
    })
}

fn normalize(dir: &Path, metadata: &fs::Metadata) {
    if metadata.uid() != 0 || metadata.gid() != 0 {
        if let Err(e) = std::os::unix::fs::chown(dir, Some(0), Some(0)) {
            tracing::warn!(root = %dir.display(), error = %e, "Cannot hand root to uid 0");
        }
    }
    if metadata.mode() & 0o022 != 0 {
        if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o755)) {
            tracing::warn!(root = %dir.display(), error = %e, "Cannot restrict root permissions");
        }
    }
}
