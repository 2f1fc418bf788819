//! Common error types for BotBrew.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`BotbrewError`].
pub type BotbrewResult<T> = Result<T, BotbrewError>;

/// Errors raised while bootstrapping or entering a namespace.
#[derive(Error, Diagnostic, Debug)]
pub enum BotbrewError {
    /// The requested root does not exist or cannot be resolved.
    #[error("`{}' does not exist", path.display())]
    #[diagnostic(code(botbrew::target::invalid))]
    InvalidTarget {
        /// The path as given.
        path: PathBuf,
    },

    /// The requested root is neither a directory nor an image file.
    #[error("`{}' is not a directory", path.display())]
    #[diagnostic(
        code(botbrew::target::not_a_directory),
        help("Pass a directory or a regular filesystem image with --target")
    )]
    NotADirectory {
        /// The offending path.
        path: PathBuf,
    },

    /// A non-superuser tried to choose the namespace root.
    #[error("--target is only available for uid=0")]
    #[diagnostic(code(botbrew::privilege::target_override))]
    TargetOverrideDenied,

    /// The invoked executable is not owned by the superuser.
    #[error("`{}' is not owned by uid=0", path.display())]
    #[diagnostic(
        code(botbrew::privilege::not_owned_by_root),
        help("Only a root-owned copy of botbrew may be invoked by other users")
    )]
    NotOwnedByRoot {
        /// The invoked path.
        path: PathBuf,
    },

    /// The operation needs superuser privileges.
    #[error("superuser privileges required to {operation}")]
    #[diagnostic(
        code(botbrew::privilege::required),
        help("Try running with elevated privileges (su)")
    )]
    PrivilegeRequired {
        /// The operation that was refused.
        operation: String,
    },

    /// Every loop device index is bound to a backing file.
    #[error("no free loop device among {max} candidates")]
    #[diagnostic(code(botbrew::loopdev::exhausted))]
    LoopDevicesExhausted {
        /// Size of the scanned index space.
        max: u32,
    },

    /// The backing file of a loop device cannot be used.
    #[error("cannot attach `{}': {source}", path.display())]
    #[diagnostic(code(botbrew::loopdev::backing_file))]
    BackingFile {
        /// The image path.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The filesystem image could not be mounted.
    #[error("cannot mount `{}': {source}", image.display())]
    #[diagnostic(code(botbrew::loopdev::mount))]
    ImageMount {
        /// The image path.
        image: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// Entering the namespace root failed.
    #[error("cannot {step} into `{}': {source}", root.display())]
    #[diagnostic(code(botbrew::chroot))]
    Chroot {
        /// `chdir` or `chroot`.
        step: &'static str,
        /// The namespace root.
        root: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The live mount table could not be read.
    #[error("cannot read mount table `{}': {source}", path.display())]
    #[diagnostic(code(botbrew::mounts::unavailable))]
    MountTableUnavailable {
        /// Mount table location.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(botbrew::io))]
    Io(#[from] std::io::Error),
}

impl BotbrewError {
    /// Shorthand for [`BotbrewError::PrivilegeRequired`].
    pub fn privilege(operation: impl Into<String>) -> Self {
        Self::PrivilegeRequired {
            operation: operation.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = BotbrewError::NotOwnedByRoot {
            path: PathBuf::from("/data/botbrew/init"),
        };
        assert_eq!(err.to_string(), "`/data/botbrew/init' is not owned by uid=0");

        let err = BotbrewError::privilege("unmount");
        assert_eq!(err.to_string(), "superuser privileges required to unmount");
    }

    #[test]
    fn loop_diagnostic_codes() {
        let err = BotbrewError::LoopDevicesExhausted { max: 4096 };
        assert_eq!(
            err.code().map(|code| code.to_string()).as_deref(),
            Some("botbrew::loopdev::exhausted")
        );
        assert_eq!(err.to_string(), "no free loop device among 4096 candidates");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BotbrewError = io_err.into();
        assert!(matches!(err, BotbrewError::Io(_)));
    }
}
