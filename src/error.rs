//! Error taxonomy for a collection run.
//!
//! Fatal errors end the run with exit code 1 ([`CollectError`]). Stage and
//! upload failures are reported but never change the exit code.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("required dependency missing: {tool} ({reason})")]
    DependencyMissing { tool: String, reason: String },
    #[error("insufficient privileges: {0}")]
    Privileges(String),
    #[error(transparent)]
    Start(#[from] StartError),
    #[error("sampler exited unexpectedly during collection ({})", describe_status(.status))]
    Crash { status: Option<ExitStatus> },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl CollectError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        CollectError::Io {
            context: context.into(),
            source,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// The sampler could not be brought up.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to spawn sampler '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("sampler exited immediately after start ({})", describe_status(.status))]
    ImmediateExit { status: Option<ExitStatus> },
    #[error("sampler is running but did not create {}", .path.display())]
    NoOutputFile { path: PathBuf },
}

/// A non-fatal finalization stage failure.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("symbol archive failed: {0}")]
    Archive(String),
    #[error("bundle failed: {0}")]
    Bundle(String),
}

/// Why the network transfer of a bundle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Dns,
    Connect,
    Timeout,
    Other,
}

impl std::fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NetworkErrorKind::Dns => "DNS resolution failed",
            NetworkErrorKind::Connect => "connection failed",
            NetworkErrorKind::Timeout => "timed out",
            NetworkErrorKind::Other => "transport error",
        };
        f.write_str(s)
    }
}

/// Upload outcome classification. Never fatal to the run.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("bundle not found: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("network error ({kind}): {detail}")]
    Network {
        kind: NetworkErrorKind,
        detail: String,
    },
    #[error("authentication rejected (HTTP 403), check the upload token")]
    Auth,
    #[error("server rejected the request (HTTP 400): {body}")]
    BadRequest { body: String },
    #[error("bundle too large for the collector (HTTP 413)")]
    TooLarge,
    #[error("collector server error (HTTP {code})")]
    Server { code: u16 },
    #[error("unexpected response (HTTP {code}): {body}")]
    Unexpected { code: u16, body: String },
}

fn describe_status(status: &Option<ExitStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "exit status unknown".to_string(),
    }
}
