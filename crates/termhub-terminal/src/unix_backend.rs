/// Unix PTY backend: fork/exec of the shell on a pseudo-terminal
use std::ffi::CStr;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty};
use termhub_types::{Geometry, Result, TerminalError};

use super::backend::{
    other_io_error, pty_size, write_timed_out, PtyBackend, PtyProcess, PtyReader, PtyWriter,
    ReadOutcome, SpawnRequest, SpawnedPty,
};

/// PTY backend for POSIX systems
#[derive(Debug, Default)]
pub struct UnixPtyBackend;

impl UnixPtyBackend {
    pub fn new() -> Self {
        Self
    }
}

impl PtyBackend for UnixPtyBackend {
    fn spawn(&self, request: &SpawnRequest<'_>) -> Result<SpawnedPty> {
        let pty_system = native_pty_system();

        // Window size is set on the PTY before the shell execs, so the first
        // frame is drawn at the requested geometry.
        let pair = pty_system
            .openpty(pty_size(request.geometry))
            .map_err(|e| TerminalError::BackendUnavailable(format!("failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(request.shell);
        cmd.cwd(request.working_dir);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TerminalError::SpawnFailure(e.to_string()))?;

        // Only the child may keep the slave side open, otherwise EOF never
        // reaches the master once the shell exits.
        drop(pair.slave);

        let master = pair.master;
        let handles = match master.as_raw_fd() {
            Some(fd) => FdReader::duplicate(fd)
                .and_then(|reader| FdWriter::duplicate(fd).map(|writer| (reader, writer))),
            None => Err(io::Error::new(io::ErrorKind::Other, "PTY master has no file descriptor")),
        };
        let (reader, writer) = match handles {
            Ok(handles) => handles,
            Err(e) => {
                reap_after_failure(child);
                return Err(TerminalError::SpawnFailure(format!("failed to duplicate PTY master: {}", e)));
            }
        };

        let pid = child.process_id();

        Ok(SpawnedPty {
            process: Box::new(UnixPtyProcess {
                master,
                child,
                pid,
                exit_code: None,
            }),
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    fn backend_name(&self) -> &'static str {
        "unix-pty"
    }
}

fn reap_after_failure(mut child: Box<dyn Child + Send + Sync>) {
    let _ = child.kill();
    let _ = child.wait();
}

fn duplicate_fd(fd: RawFd) -> io::Result<File> {
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { File::from_raw_fd(dup) })
}

/// Wait for `events` on `fd`.
///
/// Returns the reported events, or `None` if the timeout passed or a signal
/// interrupted the wait.
fn poll_fd(fd: RawFd, events: libc::c_short, timeout: Duration) -> io::Result<Option<libc::c_short>> {
    let mut pollfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().clamp(1, i32::MAX as u128) as libc::c_int;

    let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if ready < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(None);
        }
        return Err(err);
    }
    if ready == 0 {
        return Ok(None);
    }
    Ok(Some(pollfd.revents))
}

/// Reader over a private duplicate of the PTY master descriptor.
///
/// Owning its own descriptor keeps polling valid even after the controlling
/// half has dropped the master.
pub(crate) struct FdReader {
    file: File,
}

impl FdReader {
    fn duplicate(fd: RawFd) -> io::Result<Self> {
        Ok(Self {
            file: duplicate_fd(fd)?,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_file(file: File) -> Self {
        Self { file }
    }
}

impl PtyReader for FdReader {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<ReadOutcome> {
        let Some(revents) = poll_fd(self.file.as_raw_fd(), libc::POLLIN, timeout)? else {
            return Ok(ReadOutcome::TimedOut);
        };

        if revents & libc::POLLIN == 0 {
            // POLLHUP / POLLERR with nothing left to read
            return Ok(ReadOutcome::Eof);
        }

        match self.file.read(buf) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadOutcome::TimedOut),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::TimedOut),
            // Linux reports EIO on the master once the slave side is gone
            Err(e) if e.raw_os_error() == Some(libc::EIO) => Ok(ReadOutcome::Eof),
            Err(e) => Err(e),
        }
    }
}

/// Writer over a non-blocking duplicate of the PTY master descriptor.
///
/// `O_NONBLOCK` lives on the open file description, so the reader's
/// duplicate shares it. The reader only reads after `poll` reports input.
pub(crate) struct FdWriter {
    file: File,
}

impl FdWriter {
    fn duplicate(fd: RawFd) -> io::Result<Self> {
        Self::from_file(duplicate_fd(fd)?)
    }

    pub(crate) fn from_file(file: File) -> io::Result<Self> {
        let fd = file.as_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { file })
    }
}

impl PtyWriter for FdWriter {
    fn write_timeout(&mut self, data: &[u8], timeout: Duration) -> io::Result<()> {
        let deadline = Instant::now() + timeout;
        let mut written = 0;

        while written < data.len() {
            match self.file.write(&data[written..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "PTY accepted no input")),
                Ok(n) => {
                    written += n;
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            // Input queue is full: wait for the shell to drain it
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(write_timed_out(written, data.len()));
            }
            if let Some(revents) = poll_fd(self.file.as_raw_fd(), libc::POLLOUT, remaining)? {
                if revents & libc::POLLOUT == 0 && revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "PTY input is closed"));
                }
            }
        }
        Ok(())
    }
}

/// Exit code in shell convention: `128 + signo` when a signal ended the process
fn exit_code_of(status: &ExitStatus) -> i32 {
    status
        .to_string()
        .strip_prefix("Terminated by ")
        .and_then(signal_number)
        .map(|signo| 128 + signo)
        .unwrap_or(status.exit_code() as i32)
}

// portable-pty keeps only the signal's description
fn signal_number(description: &str) -> Option<i32> {
    if let Some(number) = description.strip_prefix("Signal ") {
        return number.parse().ok();
    }
    (1..65).find(|&signo| {
        let name = unsafe { libc::strsignal(signo) };
        !name.is_null() && unsafe { CStr::from_ptr(name) }.to_string_lossy() == description
    })
}

/// Controlling half of a Unix PTY child
struct UnixPtyProcess {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
    exit_code: Option<i32>,
}

impl UnixPtyProcess {
    /// Signal the child unless it has already been reaped, so a recycled pid
    /// is never hit.
    fn signal(&mut self, signal: libc::c_int) -> io::Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        let Some(pid) = self.pid else {
            return Ok(());
        };

        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl PtyProcess for UnixPtyProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn resize(&mut self, geometry: Geometry) -> io::Result<()> {
        self.master.resize(pty_size(geometry)).map_err(other_io_error)
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        if self.exit_code.is_none() {
            self.exit_code = self.child.try_wait()?.as_ref().map(exit_code_of);
        }
        Ok(self.exit_code)
    }

    fn terminate(&mut self) -> io::Result<()> {
        // Interactive shells ignore SIGTERM; a hangup is what they expect
        // when their terminal goes away.
        self.signal(libc::SIGHUP)?;
        self.signal(libc::SIGTERM)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.signal(libc::SIGKILL)
    }

    fn wait(&mut self) -> io::Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let code = exit_code_of(&self.child.wait()?);
        self.exit_code = Some(code);
        Ok(code)
    }
}
