use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Structured reason a process invocation failed, assigned once by the command layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFailure {
    PermissionDenied,
    Authentication,
    HostKeyMismatch,
    NotFound,
    /// The program or docker subcommand itself is not installed.
    CommandMissing,
    ConnectionLost,
    Failed,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandFailure::PermissionDenied => "permission denied",
            CommandFailure::Authentication => "authentication failed",
            CommandFailure::HostKeyMismatch => "host key verification failed",
            CommandFailure::NotFound => "not found",
            CommandFailure::CommandMissing => "command not available",
            CommandFailure::ConnectionLost => "connection lost",
            CommandFailure::Failed => "command failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Validation,
    PermissionDenied,
    Authentication,
    HostKeyMismatch,
    NotFound,
    CommandMissing,
    SizeExceeded,
    BuildFailed,
    Timeout,
    ConnectionLost,
    ProcessFailed,
    Cancelled,
    PartialFailure,
    Io,
}

impl ErrorKind {
    /// Permanent kinds abort a retry loop without consuming the remaining attempts.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            ErrorKind::Validation
                | ErrorKind::PermissionDenied
                | ErrorKind::Authentication
                | ErrorKind::HostKeyMismatch
                | ErrorKind::NotFound
                | ErrorKind::CommandMissing
                | ErrorKind::SizeExceeded
                | ErrorKind::BuildFailed
                | ErrorKind::Cancelled
                | ErrorKind::PartialFailure
        )
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),

    /// A process exited unsuccessfully; `output` holds the captured stdout+stderr.
    #[error("`{command}` {failure} (exit status {}): {}", fmt_status(.status), .output.trim())]
    Command {
        command: String,
        failure: CommandFailure,
        status: Option<i32>,
        output: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("archive of {image} would be {actual} bytes, exceeding the limit of {limit} bytes")]
    SizeExceeded { image: String, actual: u64, limit: u64 },

    #[error("build of {tag} failed: {message}")]
    BuildFailed { tag: String, message: String },

    /// Some required images could not be acquired; each entry names the image and its failures.
    #[error("{} of {total} image(s) could not be acquired: {}", .failed.len(), .failed.join("; "))]
    AcquisitionFailed { total: usize, failed: Vec<String> },

    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<EngineError>,
    },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_status(status: &Option<i32>) -> String {
    status.map_or_else(|| "none".to_string(), |code| code.to_string())
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::Command { failure, .. } => match failure {
                CommandFailure::PermissionDenied => ErrorKind::PermissionDenied,
                CommandFailure::Authentication => ErrorKind::Authentication,
                CommandFailure::HostKeyMismatch => ErrorKind::HostKeyMismatch,
                CommandFailure::NotFound => ErrorKind::NotFound,
                CommandFailure::CommandMissing => ErrorKind::CommandMissing,
                CommandFailure::ConnectionLost => ErrorKind::ConnectionLost,
                CommandFailure::Failed => ErrorKind::ProcessFailed,
            },
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::SizeExceeded { .. } => ErrorKind::SizeExceeded,
            EngineError::BuildFailed { .. } => ErrorKind::BuildFailed,
            EngineError::AcquisitionFailed { .. } => ErrorKind::PartialFailure,
            EngineError::RetriesExhausted { source, .. } => source.kind(),
            EngineError::Context { source, .. } => source.kind(),
            EngineError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorKind::PermissionDenied
            }
            EngineError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            EngineError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind().is_permanent()
    }

    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation(message.into())
    }

    /// Wraps the error with the operation and identifying details of the boundary it crosses.
    pub fn context(self, context: impl Into<String>) -> Self {
        EngineError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E: Into<EngineError>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}
