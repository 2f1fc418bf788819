//! Namespace configuration and process supervision.
//!
//! A [`NamespaceConfig`] is resolved once from the command line and read
//! by every later stage. The [`Supervisor`] runs the bootstrapper again in
//! a private mount namespace and relays signals to it.

mod supervise;

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use botbrew_common::RootPaths;
use botbrew_common::paths::DEFAULT_COMMAND;

pub use supervise::{FORWARDED_SIGNALS, SIGNALED_EXIT, Supervisor, exit_code, strip_isolate};

/// Everything needed to enter a namespace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// The resolved namespace root.
    pub root: RootPaths,
    /// Backing filesystem image, when the root is loop-backed.
    pub image: Option<PathBuf>,
    /// Working directory of the caller, restored inside the root.
    pub cwd: PathBuf,
    command: Vec<OsString>,
}

impl NamespaceConfig {
    /// Create a configuration. An empty `command` runs the default
    /// bootstrap script.
    #[must_use]
    pub fn new(
        root: impl Into<PathBuf>,
        image: Option<PathBuf>,
        cwd: impl Into<PathBuf>,
        command: Vec<OsString>,
    ) -> Self {
        let command = if command.is_empty() {
            vec![OsString::from(DEFAULT_COMMAND)]
        } else {
            command
        };
        Self {
            root: RootPaths::new(root),
            image,
            cwd: cwd.into(),
            command,
        }
    }

    /// The namespace root directory.
    #[must_use]
    pub fn root_dir(&self) -> &Path {
        &self.root.root
    }

    /// Program to execute.
    #[must_use]
    pub fn program(&self) -> &OsStr {
        // `new` never leaves the command empty.
        self.command.first().map_or(OsStr::new(DEFAULT_COMMAND), OsString::as_os_str)
    }

    /// Arguments following the program.
    #[must_use]
    pub fn args(&self) -> &[OsString] {
        self.command.get(1..).unwrap_or_default()
    }

    /// The command line, space separated, for diagnostics.
    #[must_use]
    pub fn command_line(&self) -> String {
        self.command
            .iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_command() {
        let config = NamespaceConfig::new("/data/botbrew", None, "/", Vec::new());
        assert_eq!(config.program(), "/init.sh");
        assert!(config.args().is_empty());
        assert_eq!(config.command_line(), "/init.sh");
    }

    #[test]
    fn explicit_command() {
        let command = ["/bin/sh", "-lc", "echo hi"].map(OsString::from).to_vec();
        let config = NamespaceConfig::new(
            "/data/botbrew",
            Some(PathBuf::from("/sdcard/botbrew.img")),
            "/data/botbrew/home",
            command,
        );
        assert_eq!(config.program(), "/bin/sh");
        assert_eq!(config.args(), ["-lc", "echo hi"].map(OsString::from));
        assert_eq!(config.command_line(), "/bin/sh -lc echo hi");
        assert_eq!(config.root_dir(), Path::new("/data/botbrew"));
        assert_eq!(config.root.run(), PathBuf::from("/data/botbrew/run"));
    }
}
