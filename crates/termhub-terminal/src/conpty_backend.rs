/// Windows PTY backend built on the ConPTY console host
use std::io::{self, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::thread;
use std::time::Duration;

use super::backend::{write_timed_out, PtyReader, PtyWriter, ReadOutcome};

/// Turns a blocking reader thread's chunks into bounded reads.
///
/// ConPTY output pipes cannot be polled, so a dedicated thread performs the
/// blocking reads and this side waits on the channel with a timeout.
pub(crate) struct ChannelReader {
    rx: Receiver<io::Result<Vec<u8>>>,
    pending: Vec<u8>,
    closed: bool,
}

impl ChannelReader {
    pub(crate) fn new(rx: Receiver<io::Result<Vec<u8>>>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            closed: false,
        }
    }

    fn drain_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        n
    }
}

impl PtyReader for ChannelReader {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<ReadOutcome> {
        if !self.pending.is_empty() {
            return Ok(ReadOutcome::Data(self.drain_pending(buf)));
        }
        if self.closed {
            return Ok(ReadOutcome::Eof);
        }

        match self.rx.recv_timeout(timeout) {
            Ok(Ok(chunk)) if chunk.is_empty() => {
                self.closed = true;
                Ok(ReadOutcome::Eof)
            }
            Ok(Ok(chunk)) => {
                self.pending = chunk;
                Ok(ReadOutcome::Data(self.drain_pending(buf)))
            }
            Ok(Err(e)) => {
                self.closed = true;
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => Ok(ReadOutcome::TimedOut),
            Err(RecvTimeoutError::Disconnected) => {
                self.closed = true;
                Ok(ReadOutcome::Eof)
            }
        }
    }
}

type WriteRequest = (Vec<u8>, SyncSender<io::Result<()>>);

/// Bounded writes over a blocking input pipe.
///
/// A dedicated thread owns the pipe and performs each write in order; the
/// caller waits for the acknowledgement with a timeout. A write that times
/// out is still completed by the thread before later ones.
pub(crate) struct ChannelWriter {
    tx: Sender<WriteRequest>,
}

impl ChannelWriter {
    pub(crate) fn spawn(mut writer: Box<dyn Write + Send>) -> Self {
        let (tx, rx) = mpsc::channel::<WriteRequest>();
        thread::spawn(move || {
            for (data, reply) in rx {
                let result = writer.write_all(&data).and_then(|_| writer.flush());
                let _ = reply.send(result);
            }
        });
        Self { tx }
    }
}

impl PtyWriter for ChannelWriter {
    fn write_timeout(&mut self, data: &[u8], timeout: Duration) -> io::Result<()> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.tx
            .send((data.to_vec(), reply_tx))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "PTY input is closed"))?;

        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(write_timed_out(0, data.len())),
            Err(RecvTimeoutError::Disconnected) => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "PTY input is closed"))
            }
        }
    }
}

#[cfg(windows)]
pub use self::windows::ConPtyBackend;

#[cfg(windows)]
mod windows {
    use std::io::{self, Read};
    use std::sync::mpsc;
    use std::thread;

    use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty};
    use termhub_types::{Geometry, Result, TerminalError};

    use super::{ChannelReader, ChannelWriter};
    use crate::backend::{other_io_error, pty_size, PtyBackend, PtyProcess, SpawnRequest, SpawnedPty};

    /// PTY backend for Windows 10 1809+ (ConPTY)
    #[derive(Debug, Default)]
    pub struct ConPtyBackend;

    impl ConPtyBackend {
        pub fn new() -> Self {
            Self
        }
    }

    impl PtyBackend for ConPtyBackend {
        fn spawn(&self, request: &SpawnRequest<'_>) -> Result<SpawnedPty> {
            let pty_system = native_pty_system();

            let pair = pty_system.openpty(pty_size(request.geometry)).map_err(|e| {
                TerminalError::BackendUnavailable(format!(
                    "ConPTY could not be created ({}); terminals require Windows 10 version 1809 or later",
                    e
                ))
            })?;

            let mut cmd = CommandBuilder::new(request.shell);
            cmd.cwd(request.working_dir);
            for (key, value) in &request.env {
                cmd.env(key, value);
            }

            let mut child = pair
                .slave
                .spawn_command(cmd)
                .map_err(|e| TerminalError::SpawnFailure(e.to_string()))?;
            drop(pair.slave);

            let master = pair.master;
            let handles = master
                .try_clone_reader()
                .and_then(|reader| master.take_writer().map(|writer| (reader, writer)));
            let (mut raw_reader, writer) = match handles {
                Ok(handles) => handles,
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(TerminalError::SpawnFailure(format!("failed to open PTY pipes: {}", e)));
                }
            };

            let (tx, rx) = mpsc::channel();
            let buffer_size = request.read_buffer_size.max(1);
            thread::spawn(move || {
                let mut buf = vec![0u8; buffer_size];
                loop {
                    match raw_reader.read(&mut buf) {
                        Ok(0) => {
                            let _ = tx.send(Ok(Vec::new()));
                            break;
                        }
                        Ok(n) => {
                            if tx.send(Ok(buf[..n].to_vec())).is_err() {
                                break; // Reader side dropped
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            break;
                        }
                    }
                }
            });

            let pid = child.process_id();

            Ok(SpawnedPty {
                process: Box::new(ConPtyProcess {
                    master,
                    child,
                    pid,
                    exit_code: None,
                }),
                reader: Box::new(ChannelReader::new(rx)),
                writer: Box::new(ChannelWriter::spawn(writer)),
            })
        }

        fn backend_name(&self) -> &'static str {
            "conpty"
        }
    }

    struct ConPtyProcess {
        master: Box<dyn MasterPty + Send>,
        child: Box<dyn Child + Send + Sync>,
        pid: Option<u32>,
        exit_code: Option<i32>,
    }

    impl PtyProcess for ConPtyProcess {
        fn pid(&self) -> Option<u32> {
            self.pid
        }

        fn resize(&mut self, geometry: Geometry) -> io::Result<()> {
            self.master.resize(pty_size(geometry)).map_err(other_io_error)
        }

        fn try_wait(&mut self) -> io::Result<Option<i32>> {
            if self.exit_code.is_none() {
                self.exit_code = self.child.try_wait()?.map(|status| status.exit_code() as i32);
            }
            Ok(self.exit_code)
        }

        // Console processes have no graceful signal; both paths end in
        // TerminateProcess.
        fn terminate(&mut self) -> io::Result<()> {
            self.kill()
        }

        fn kill(&mut self) -> io::Result<()> {
            if self.try_wait()?.is_some() {
                return Ok(());
            }
            self.child.kill()
        }

        fn wait(&mut self) -> io::Result<i32> {
            if let Some(code) = self.exit_code {
                return Ok(code);
            }
            let code = self.child.wait()?.exit_code() as i32;
            self.exit_code = Some(code);
            Ok(code)
        }
    }
}
