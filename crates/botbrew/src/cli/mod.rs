//! Command line interface.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use clap::Parser;
use color_eyre::eyre::Result;

use crate::bootstrap::{self, Bootstrap, Credentials, Prepared, Request, target};
use crate::filesystem::HostNamespace;
use crate::namespace::{NamespaceConfig, Supervisor, strip_isolate};

/// BotBrew - enter a persistent chroot namespace
#[derive(Parser, Debug)]
#[command(name = "botbrew")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Namespace root directory or filesystem image (uid 0 only)
    #[arg(
        short = 't',
        long,
        visible_alias = "dir",
        short_alias = 'd',
        value_name = "TARGET"
    )]
    pub target: Option<PathBuf>,

    /// Tear the namespace down and set it up again
    #[arg(short, long)]
    pub remount: bool,

    /// Tear the namespace down and exit
    #[arg(short, long)]
    pub unmount: bool,

    /// Run in a private mount namespace, relaying signals to it
    #[arg(long)]
    pub isolate: bool,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Command to run inside the namespace (default: /init.sh)
    #[arg(trailing_var_arg = true, value_name = "COMMAND")]
    pub command: Vec<OsString>,
}

impl Cli {
    /// Execute the command line and return the exit status.
    pub fn execute(self) -> Result<i32> {
        let mut args = std::env::args_os();
        let argv0 = args.next().unwrap_or_else(|| OsString::from("botbrew"));
        let invoked = target::invoked_path(Path::new(&argv0));

        if self.isolate {
            let code = Supervisor::new(&invoked, strip_isolate(args)).run()?;
            return Ok(code);
        }

        let credentials = Credentials::current();
        credentials.check_target_override(self.target.is_some())?;
        let requested = match &self.target {
            Some(path) => target::canonical(path)?,
            None => target::default_root(&invoked)?,
        };
        credentials.check_invoker(&invoked)?;

        let resolved = target::resolve(&requested)?;
        let cwd = std::env::current_dir()?;
        let config = NamespaceConfig::new(resolved.root, resolved.image, cwd, self.command);

        let ns = HostNamespace::default();
        let request = Request {
            unmount: self.unmount || self.remount,
            remount: self.remount,
        };
        match Bootstrap::new(&ns, credentials).prepare(&config, request, &invoked)? {
            Prepared::Done => Ok(0),
            Prepared::Enter => Ok(bootstrap::enter(&config, &credentials)?),
        }
    }
}
