//! Structured error taxonomy shared by every module in this crate.
//!
//! Recoverable conditions are returned as [`Error`]; an invariant violation
//! that a caller cannot sensibly recover from is wrapped in [`Fatal`] and
//! propagated to the process boundary (the connection handler or the daemon
//! main loop), which logs it and exits. There is no exception-based control
//! flow anywhere below that boundary.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error as ThisError;

/// The recoverable error taxonomy.
#[derive(ThisError, Debug)]
pub enum Error {
    /// No such token, message-ID, or group.
    #[error("not found")]
    NotFound,

    /// Stored data failed a checksum or could not be parsed.
    #[error("corrupt data at {path}: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    /// An advisory lock could not be acquired after retrying.
    #[error("resource locked: {0}")]
    Locked(String),

    /// The backing store (buffer bitmap, filesystem) has no room left.
    #[error("out of space: {0}")]
    NoSpace(String),

    /// A blocking operation exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A cancel or supersede request failed Cancel-Lock verification.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// An invariant was violated; the condition is logged and surfaced but
    /// does not by itself tear down the process.
    #[error("internal error: {0}")]
    Internal(String),

    /// Wraps an I/O failure that doesn't map cleanly onto the above.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn corrupt(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Error::Corrupt { path: path.into(), detail: detail.into() }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Error::Internal(detail.into())
    }

    /// True for conditions that §7 of the design says should not be logged
    /// (a plain miss is an expected outcome, not a fault).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

/// Marks an [`Error`] as unrecoverable at the call site that raised it. Only
/// the process boundary is allowed to turn a `Fatal` into a process exit; it
/// must log the wrapped error first.
#[derive(Debug)]
pub struct Fatal(pub Error);

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal: {}", self.0)
    }
}

impl std::error::Error for Fatal {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl From<Error> for Fatal {
    fn from(err: Error) -> Self {
        Fatal(err)
    }
}

/// Logs a [`Fatal`] at error level. Called immediately before the holder of
/// the error decides to exit; kept as a free function so every exit path
/// (daemon main loop, admin tool, test harness) logs identically.
pub fn report_fatal(err: &Fatal) {
    log::error!("{}", err);
}
