//! # botbrew-common
//!
//! Shared types for the BotBrew namespace bootstrapper:
//! - Common error types
//! - Standard filesystem paths and compiled-in constants

#![warn(missing_docs)]

pub mod error;
pub mod paths;

pub use error::{BotbrewError, BotbrewResult};
pub use paths::RootPaths;
