//! Error types
//!
//! Every failure the engine can report maps onto one of the variants below.
//! Lower layers return `Error` as-is; the pipeline wraps it in a
//! [`StageError`] carrying the target process and the stage that failed.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The target process could not be attached to or bootstrapped.
    #[error("cannot attach to process {pid}: {message}")]
    Attach { pid: u32, message: String },

    /// The management channel is unreachable, dropped, timed out or spoke
    /// an unexpected protocol.
    #[error("management channel error: {0}")]
    Connection(String),

    /// A facility-name pattern or object query is syntactically invalid.
    #[error("malformed query `{query}`: {reason}")]
    MalformedQuery { query: String, reason: String },

    /// A lookup the caller required to succeed found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Writing the dump failed.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn connection(message: impl Into<String>) -> Self {
        Error::Connection(message.into())
    }

    pub fn malformed(query: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::MalformedQuery {
            query: query.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for this error class
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Attach { .. } => 10,
            Error::Connection(_) => 11,
            Error::MalformedQuery { .. } => 12,
            Error::NotFound(_) => 13,
            Error::Io { .. } => 14,
            Error::Cancelled => 130,
        }
    }
}

/// Pipeline stage a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Attach,
    Resolve,
    Collect,
    Detect,
    /// Rendering into memory cannot fail, so the pipeline never reports
    /// this stage. Callers rendering into their own writers may.
    Format,
    Write,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Attach => "attach",
            Stage::Resolve => "resolve",
            Stage::Collect => "collect",
            Stage::Detect => "detect",
            Stage::Format => "format",
            Stage::Write => "write",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An [`Error`] annotated with the target process and the failing stage
#[derive(Debug, Error)]
#[error("{stage} stage failed for process {target}: {source}")]
pub struct StageError {
    pub target: u32,
    pub stage: Stage,
    #[source]
    pub source: Error,
}

impl StageError {
    pub fn new(target: u32, stage: Stage, source: Error) -> Self {
        Self {
            target,
            stage,
            source,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.source.exit_code()
    }
}

/// Attach pipeline context to a `Result<T, Error>`
pub trait StageContext<T> {
    fn stage(self, target: u32, stage: Stage) -> std::result::Result<T, StageError>;
}

impl<T> StageContext<T> for Result<T> {
    fn stage(self, target: u32, stage: Stage) -> std::result::Result<T, StageError> {
        self.map_err(|e| StageError::new(target, stage, e))
    }
}
