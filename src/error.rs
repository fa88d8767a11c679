//! Error taxonomy for the harness.
//!
//! Skips are errors too: a scenario that cannot apply (missing build
//! variable, feature not configured) bails with `MissingConfiguration` or
//! `Skip` and the orchestrator reports it as skipped rather than failed.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// Local command exited non-zero and the status was not ignored.
    #[error("command failed (exit {status}): {command}\nOutput: {output}")]
    CommandExecution {
        command: String,
        status: i32,
        output: String,
    },

    #[error("build of '{target}' failed\nOutput: {output}")]
    Build { target: String, output: String },

    /// The device could not be reached at all. Distinct from a remote
    /// command that ran and returned non-zero.
    #[error("device unreachable on port {port}: {detail}")]
    Connection { port: u16, detail: String },

    #[error("{0}")]
    Assertion(String),

    #[error("build variable '{0}' is not set")]
    MissingConfiguration(String),

    #[error("{0}")]
    Skip(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("emulator error: {0}")]
    Emulator(String),
}

impl HarnessError {
    /// Errors that mean "not applicable here" rather than "broken".
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::MissingConfiguration(_) | Self::Skip(_))
    }

    /// Errors worth retrying while a device is still coming up.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Attach a description to `io::Result`s, in the spirit of
/// `anyhow::Context`.
pub trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| HarnessError::io(f(), e))
    }
}

/// Return an [`HarnessError::Assertion`] unless the condition holds.
///
/// ```ignore
/// verify!(out.exit_code == 0, "hostname failed: {}", out.transcript());
/// ```
#[macro_export]
macro_rules! verify {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::HarnessError::Assertion(format!($($arg)+)));
        }
    };
}
