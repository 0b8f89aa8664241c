//! Error taxonomy for the calibredb gateway.
//!
//! Every error that originates from an external process carries the rendered
//! command line, so a log line or HTTP response is enough to reproduce the
//! failing invocation by hand.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Executable or library path missing at startup. Fatal.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Bad id, limit, start, file name or payload. Never retried.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("executable could not be found: {}", program.display())]
    ExecutableNotFound {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// calibredb refused to run because another program holds the library.
    #[error("another calibre program is using the library, retry later: {stderr}")]
    ConcurrencyConflict { command: String, stderr: String },

    #[error("{command} exited with status {exit_code}.\n\nSTDOUT:\n{stdout}\nSTDERR:\n{stderr}")]
    Runtime {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("{command} timed out after {}s", timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    /// Output did not match any shape we know how to interpret.
    #[error("unexpected output from {command}: {reason}")]
    Parse {
        command: String,
        reason: String,
        stdout: String,
        stderr: String,
    },

    /// calibredb exited cleanly but the expected change is not visible.
    #[error("{0}")]
    NotApplied(String),

    #[error("failed to decode calibredb JSON output: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn validation(message: impl Into<String>) -> Self {
        GatewayError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        GatewayError::NotFound(message.into())
    }
}
