// Terminal session management
//
// Gives every terminal of a project its own PTY-backed shell, fans its output
// out to any number of observers, and tears processes down without leaving
// zombies or open descriptors behind, on Unix and on Windows (ConPTY).

pub mod backend;
#[cfg(unix)]
mod unix_backend;
#[cfg(any(windows, test))]
mod conpty_backend;
pub mod shell;
mod session;
mod registry;
mod observer;

// Re-export public API
pub use backend::{
    native_backend, PtyBackend, PtyProcess, PtyReader, PtyWriter, ReadOutcome, SpawnRequest, SpawnedPty,
};
pub use observer::TerminalObserver;
pub use registry::TerminalRegistry;
pub use session::{OutputCallback, SubscriptionId, TerminalSession};
pub use shell::resolve_shell;

pub use termhub_types::{
    Geometry, Result, SessionState, TerminalConfig, TerminalError, TerminalInfo,
};
