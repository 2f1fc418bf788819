//! # BotBrew
//!
//! BotBrew bootstraps a persistent chroot namespace on top of a host system
//! and re-enters it on every later invocation.
//!
//! ## Features
//!
//! - **Mount topology**: Host trees and the root's own directories are
//!   mounted from compiled-in tables, each sealed until fully configured
//! - **Propagation transplant**: A live mount subtree is switched to shared
//!   propagation without losing the mounts nested below it
//! - **Loop devices**: Filesystem images are attached and mounted as the root
//! - **Privilege guards**: Non-root callers can only enter a root prepared by
//!   a root-owned executable
//!
//! ## Usage
//!
//! ```no_run
//! use botbrew::bootstrap::{self, Bootstrap, Credentials, Prepared, Request};
//! use botbrew::filesystem::HostNamespace;
//! use botbrew::namespace::NamespaceConfig;
//!
//! # fn example() -> botbrew_common::BotbrewResult<()> {
//! let config = NamespaceConfig::new("/data/botbrew", None, "/", Vec::new());
//! let credentials = Credentials::current();
//! let ns = HostNamespace::default();
//!
//! let bootstrap = Bootstrap::new(&ns, credentials);
//! if bootstrap.prepare(&config, Request::default(), "/data/botbrew/init".as_ref())?
//!     == Prepared::Enter
//! {
//!     // Only returns when the command cannot be executed.
//!     let code = bootstrap::enter(&config, &credentials)?;
//!     std::process::exit(code);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod bootstrap;
pub mod cli;
pub mod filesystem;
pub mod namespace;
