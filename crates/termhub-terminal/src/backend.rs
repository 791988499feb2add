/// PTY backend abstraction over the Unix and Windows implementations
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use portable_pty::PtySize;
use termhub_types::{Geometry, Result};

/// Everything a backend needs to launch a shell in a fresh PTY
#[derive(Debug, Clone)]
pub struct SpawnRequest<'a> {
    pub shell: &'a Path,
    pub working_dir: &'a Path,
    pub geometry: Geometry,
    pub env: Vec<(String, String)>,
    pub read_buffer_size: usize,
}

/// Result of one bounded read from the PTY output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were copied into the buffer
    Data(usize),
    /// Nothing arrived within the timeout
    TimedOut,
    /// The output stream is closed for good
    Eof,
}

/// Output side of a spawned PTY, owned by the session's read loop
pub trait PtyReader: Send {
    /// Wait at most `timeout` for output and copy what is available into `buf`
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<ReadOutcome>;
}

/// Input side of a spawned PTY.
///
/// Kept apart from [`PtyProcess`] so a shell that stops reading its input
/// never holds up liveness checks or teardown.
pub trait PtyWriter: Send {
    /// Deliver all of `data`, failing with `TimedOut` if the shell has not
    /// accepted it within `timeout`. Bytes not yet written are dropped.
    fn write_timeout(&mut self, data: &[u8], timeout: Duration) -> io::Result<()>;
}

/// Control side of a spawned PTY: geometry and process lifetime.
///
/// Dropping it releases every OS handle it holds.
pub trait PtyProcess: Send {
    fn pid(&self) -> Option<u32>;

    fn resize(&mut self, geometry: Geometry) -> io::Result<()>;

    /// Non-blocking liveness check; `Some(code)` once the process has exited
    fn try_wait(&mut self) -> io::Result<Option<i32>>;

    /// Ask the process to exit
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the process to exit
    fn kill(&mut self) -> io::Result<()>;

    /// Block until the process has exited and been reaped
    fn wait(&mut self) -> io::Result<i32>;
}

/// A freshly spawned shell, split into its controlling, reading and
/// writing parts
pub struct SpawnedPty {
    pub process: Box<dyn PtyProcess>,
    pub reader: Box<dyn PtyReader>,
    pub writer: Box<dyn PtyWriter>,
}

/// Platform PTY capability.
///
/// Both implementations must be indistinguishable to the session: same read
/// semantics, same termination contract.
pub trait PtyBackend: Send + Sync {
    /// Spawn `request.shell` attached to a new PTY.
    ///
    /// Fails with `BackendUnavailable` when no PTY can be created at all and
    /// with `SpawnFailure` when the process itself cannot be launched.
    fn spawn(&self, request: &SpawnRequest<'_>) -> Result<SpawnedPty>;

    /// Get backend name for debugging
    fn backend_name(&self) -> &'static str;
}

/// Select the backend for the platform this binary was built for
pub fn native_backend() -> Arc<dyn PtyBackend> {
    #[cfg(unix)]
    {
        Arc::new(crate::unix_backend::UnixPtyBackend::new())
    }

    #[cfg(windows)]
    {
        Arc::new(crate::conpty_backend::ConPtyBackend::new())
    }
}

pub(crate) fn pty_size(geometry: Geometry) -> PtySize {
    PtySize {
        rows: geometry.rows,
        cols: geometry.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

pub(crate) fn other_io_error(err: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

pub(crate) fn write_timed_out(written: usize, total: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("shell stopped accepting input after {} of {} bytes", written, total),
    )
}
