use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by terminal session and registry operations.
///
/// OS and backend errors are converted into one of these at the boundary of
/// every public operation; none of them is fatal to the host process.
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("terminal session is already active")]
    AlreadyActive,

    #[error("terminal session has been stopped")]
    SessionStopped,

    #[error("invalid working directory {}: {reason}", path.display())]
    InvalidWorkingDirectory { path: PathBuf, reason: &'static str },

    #[error("PTY backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("failed to spawn shell: {0}")]
    SpawnFailure(String),

    #[error("failed to write to terminal: {0}")]
    WriteFailure(String),

    #[error("failed to resize terminal: {0}")]
    ResizeFailure(String),
}

pub type Result<T> = std::result::Result<T, TerminalError>;
