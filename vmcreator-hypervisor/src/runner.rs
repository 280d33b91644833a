//! External process boundary.
//!
//! `qemu-img` and `genisoimage` are fire-and-forget: argument list in, exit
//! code out, files on disk as a side effect. [`SystemRunner`] spawns them for
//! real; [`MockRunner`] records the calls for tests.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;
use tracing::debug;

use crate::error::{HypervisorError, Result};

/// Outcome of an external command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code, `-1` when the process was killed by a signal
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs an external program to completion.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, blocking until it exits.
    ///
    /// A non-zero exit is reported through [`CommandOutput::status`], not as
    /// an error; only failure to spawn is an error.
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Render a command line for logs and error messages.
pub fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Production runner backed by `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!(command = %command_line(program, args), "Running external command");

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| HypervisorError::CommandFailed {
                program: program.to_string(),
                reason: e.to_string(),
            })?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Test runner that records invocations.
///
/// By default every command succeeds and the file it would have produced is
/// created empty: the target image of `qemu-img create`, and the value of
/// `-output` for `genisoimage`.
#[derive(Debug, Default)]
pub struct MockRunner {
    calls: Mutex<Vec<Vec<String>>>,
    fail_with: Mutex<Option<i32>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following command exit with `status` and produce nothing.
    pub fn fail_with(&self, status: i32) {
        if let Ok(mut fail) = self.fail_with.lock() {
            *fail = Some(status);
        }
    }

    /// Every recorded invocation, program first.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Recorded invocations of one program.
    pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.first().map(String::as_str) == Some(program))
            .collect()
    }

    fn produced_file(program: &str, args: &[String]) -> Option<PathBuf> {
        match program {
            "qemu-img" => {
                // First positional argument after the subcommand; flags
                // used with `create` all take a value.
                let mut rest = args.iter().skip(1);
                while let Some(arg) = rest.next() {
                    if arg.starts_with('-') {
                        rest.next();
                    } else {
                        return Some(PathBuf::from(arg));
                    }
                }
                None
            }
            "genisoimage" => args
                .iter()
                .position(|a| a == "-output")
                .and_then(|i| args.get(i + 1))
                .map(PathBuf::from),
            _ => None,
        }
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let mut call = vec![program.to_string()];
        call.extend(args.iter().cloned());
        self.calls
            .lock()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?
            .push(call);

        let fail = *self
            .fail_with
            .lock()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
        if let Some(status) = fail {
            return Ok(CommandOutput {
                status,
                stderr: format!("{} failed (mock)", program),
                ..Default::default()
            });
        }

        if let Some(path) = Self::produced_file(program, args) {
            std::fs::write(&path, b"")?;
        }

        Ok(CommandOutput::default())
    }
}
