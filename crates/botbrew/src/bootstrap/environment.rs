//! Environment of the command run inside the namespace.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::process::Command;

use botbrew_common::paths::{ANDROID_PATH, ENV_PATH, IMAGE_VAR, PREFIX_VAR};

use crate::namespace::NamespaceConfig;

/// Compose the `PATH` seen inside the namespace.
///
/// The toolchain segment replaces the empty entry of the first `::` in the
/// inherited value, or is prepended to it. Without a usable inherited value
/// the Android system directories follow the toolchain segment.
#[must_use]
pub fn compose_path(inherited: Option<&OsStr>) -> OsString {
    let inherited = inherited.map(OsStr::as_bytes).unwrap_or_default();
    if inherited.is_empty() {
        return OsString::from(format!("{ENV_PATH}:{ANDROID_PATH}"));
    }

    let mut path = Vec::with_capacity(ENV_PATH.len() + inherited.len() + 1);
    match inherited.windows(2).position(|pair| pair == b"::") {
        Some(at) => {
            let (head, tail) = inherited.split_at(at + 1);
            path.extend_from_slice(head);
            path.extend_from_slice(ENV_PATH.as_bytes());
            path.extend_from_slice(tail);
        }
        None => {
            path.extend_from_slice(ENV_PATH.as_bytes());
            path.push(b':');
            path.extend_from_slice(inherited);
        }
    }
    OsString::from_vec(path)
}

/// Configure `command` for running inside the namespace described by
/// `config`, given the caller's `PATH`.
pub fn apply(command: &mut Command, config: &NamespaceConfig, inherited_path: Option<&OsStr>) {
    command
        .env("PATH", compose_path(inherited_path))
        .env_remove("LD_LIBRARY_PATH")
        .env(PREFIX_VAR, config.root_dir());
    if let Some(image) = &config.image {
        command.env(IMAGE_VAR, image);
    }
}
