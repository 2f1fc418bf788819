//! Supervising a bootstrapper running in a private mount namespace.
//!
//! The supervisor re-executes the current program with the mount namespace
//! unshared just before `exec`, forwards a fixed set of signals to it and
//! exits with its status.

#![allow(unsafe_code)]

use std::ffi::OsString;
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, ExitStatus};
use std::thread;

use botbrew_common::BotbrewResult;
use rustix::thread::UnshareFlags;
use signal_hook::consts::signal::{
    SIGCONT, SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGTSTP, SIGUSR1, SIGUSR2, SIGWINCH,
};
use signal_hook::iterator::Signals;

/// Signals relayed from the supervisor to its child.
pub const FORWARDED_SIGNALS: &[libc::c_int] = &[
    SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2, SIGWINCH, SIGCONT, SIGTSTP,
];

/// Exit status of the supervisor when the child did not exit normally.
pub const SIGNALED_EXIT: i32 = 1;

/// Runs a program in a new mount namespace and waits for it.
#[derive(Debug, Clone)]
pub struct Supervisor {
    program: PathBuf,
    args: Vec<OsString>,
}

impl Supervisor {
    /// Supervise `program` with `args`.
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Spawn the child, relay signals until it exits, and return the exit
    /// status to report.
    pub fn run(self) -> BotbrewResult<i32> {
        // Handlers go in before the child exists so no signal is lost.
        let mut signals = Signals::new(FORWARDED_SIGNALS)?;
        let handle = signals.handle();

        let mut command = Command::new(&self.program);
        command.args(&self.args);
        // Safety: unshare is async-signal-safe and touches no parent state.
        unsafe {
            command.pre_exec(|| {
                rustix::thread::unshare_unsafe(UnshareFlags::NEWNS).map_err(io::Error::from)
            });
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                handle.close();
                return Err(e.into());
            }
        };
        let pid = child.id();
        tracing::info!(pid, program = %self.program.display(), "Spawned isolated child");

        let relay = thread::spawn(move || {
            let Ok(pid) = libc::pid_t::try_from(pid) else {
                return;
            };
            for signal in signals.forever() {
                tracing::debug!(pid, signal, "Forwarding signal");
                // Safety: plain kill(2) on the child we spawned.
                unsafe {
                    libc::kill(pid, signal);
                }
            }
        });

        let status = child.wait();
        handle.close();
        if relay.join().is_err() {
            tracing::warn!("Signal relay thread panicked");
        }

        let status = status?;
        let code = exit_code(status);
        tracing::info!(pid, code, "Isolated child exited");
        Ok(code)
    }
}

/// Exit status to report for a child that finished with `status`.
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or_else(|| {
        tracing::debug!(signal = status.signal(), "Child terminated by signal");
        SIGNALED_EXIT
    })
}

/// Drop `--isolate` from an argument list, leaving anything after `--`
/// untouched.
pub fn strip_isolate<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut options = true;
    args.into_iter()
        .filter(|arg| {
            if !options {
                return true;
            }
            if arg == "--" {
                options = false;
            }
            arg != "--isolate"
        })
        .collect()
}
