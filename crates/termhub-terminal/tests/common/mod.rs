#![allow(dead_code)]

use std::io;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::watch;
use termhub_terminal::{
    Geometry, OutputCallback, PtyBackend, PtyProcess, PtyReader, PtyWriter, ReadOutcome, Result,
    SessionState, SpawnRequest, SpawnedPty, TerminalConfig, TerminalError,
};

/// What one call to `spawn` was asked to do
#[derive(Debug, Clone)]
pub struct SpawnRecord {
    pub shell: PathBuf,
    pub working_dir: PathBuf,
    pub geometry: Geometry,
    pub env: Vec<(String, String)>,
}

/// Observable state of the scripted shells
#[derive(Default)]
pub struct ScriptState {
    pub spawns: Vec<SpawnRecord>,
    pub writes: Vec<u8>,
    pub resizes: Vec<Geometry>,
    pub terminate_calls: usize,
    pub kill_calls: usize,
    pub waits: usize,
    shells: Vec<ShellState>,
}

impl ScriptState {
    /// Exit code of the most recently spawned shell
    pub fn last_exit_code(&self) -> Option<i32> {
        self.shells.last().and_then(|shell| shell.exit_code)
    }
}

#[derive(Default)]
struct ShellState {
    exit_code: Option<i32>,
    output: Option<Sender<Vec<u8>>>,
}

/// How a scripted shell treats its input
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum InputMode {
    /// Record the bytes and echo them back as output
    #[default]
    Echo,
    /// Every write fails while the shell keeps running
    Broken,
    /// The shell never reads: writes wait out their timeout
    Stalled,
}

/// In-memory backend whose "shell" echoes every write back as output
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    pub state: Arc<Mutex<ScriptState>>,
    unavailable: bool,
    ignore_terminate: bool,
    input: InputMode,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every spawn fails as if the platform had no PTY support
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// The shell only dies from a forced kill
    pub fn stubborn() -> Self {
        Self {
            ignore_terminate: true,
            ..Self::default()
        }
    }

    /// Writes fail as if the input pipe broke under a live shell
    pub fn broken_input() -> Self {
        Self {
            input: InputMode::Broken,
            ..Self::default()
        }
    }

    /// The shell stops reading its input, as when it is busy running a command
    pub fn stalled_input() -> Self {
        Self {
            input: InputMode::Stalled,
            ..Self::default()
        }
    }

    pub fn shared(&self) -> Arc<dyn PtyBackend> {
        Arc::new(self.clone())
    }

    pub fn spawn_count(&self) -> usize {
        self.state.lock().spawns.len()
    }

    pub fn last_spawn(&self) -> SpawnRecord {
        self.state.lock().spawns.last().cloned().expect("nothing was spawned")
    }

    /// Emit output as if the latest shell printed it
    pub fn emit(&self, data: &[u8]) {
        let state = self.state.lock();
        if let Some(tx) = state.shells.last().and_then(|shell| shell.output.as_ref()) {
            let _ = tx.send(data.to_vec());
        }
    }

    /// Make the latest shell exit on its own with `code`
    pub fn exit(&self, code: i32) {
        if let Some(shell) = self.state.lock().shells.last_mut() {
            shell.exit_code = Some(code);
            shell.output = None;
        }
    }
}

impl PtyBackend for ScriptedBackend {
    fn spawn(&self, request: &SpawnRequest<'_>) -> Result<SpawnedPty> {
        if self.unavailable {
            return Err(TerminalError::BackendUnavailable("no PTY support in this test".to_string()));
        }

        let (tx, rx) = mpsc::channel();
        let index = {
            let mut state = self.state.lock();
            state.spawns.push(SpawnRecord {
                shell: request.shell.to_path_buf(),
                working_dir: request.working_dir.to_path_buf(),
                geometry: request.geometry,
                env: request.env.clone(),
            });
            state.shells.push(ShellState {
                exit_code: None,
                output: Some(tx),
            });
            state.shells.len() - 1
        };

        Ok(SpawnedPty {
            process: Box::new(ScriptedProcess {
                state: Arc::clone(&self.state),
                index,
                ignore_terminate: self.ignore_terminate,
            }),
            reader: Box::new(ScriptedReader { rx, pending: Vec::new() }),
            writer: Box::new(ScriptedWriter {
                state: Arc::clone(&self.state),
                index,
                mode: self.input,
            }),
        })
    }

    fn backend_name(&self) -> &'static str {
        "scripted"
    }
}

struct ScriptedProcess {
    state: Arc<Mutex<ScriptState>>,
    index: usize,
    ignore_terminate: bool,
}

impl ScriptedProcess {
    fn exit_code(&self) -> Option<i32> {
        self.state.lock().shells[self.index].exit_code
    }

    fn die(&self, code: i32) {
        let mut state = self.state.lock();
        let shell = &mut state.shells[self.index];
        if shell.exit_code.is_none() {
            shell.exit_code = Some(code);
        }
        shell.output = None;
    }
}

impl PtyProcess for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        Some(1001 + self.index as u32)
    }

    fn resize(&mut self, geometry: Geometry) -> io::Result<()> {
        self.state.lock().resizes.push(geometry);
        Ok(())
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.exit_code())
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.state.lock().terminate_calls += 1;
        if !self.ignore_terminate {
            self.die(143);
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.state.lock().kill_calls += 1;
        self.die(137);
        Ok(())
    }

    fn wait(&mut self) -> io::Result<i32> {
        loop {
            if let Some(code) = self.exit_code() {
                self.state.lock().waits += 1;
                return Ok(code);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

struct ScriptedWriter {
    state: Arc<Mutex<ScriptState>>,
    index: usize,
    mode: InputMode,
}

impl PtyWriter for ScriptedWriter {
    fn write_timeout(&mut self, data: &[u8], timeout: Duration) -> io::Result<()> {
        match self.mode {
            InputMode::Echo => {}
            InputMode::Broken => {
                return Err(io::Error::new(io::ErrorKind::Other, "input pipe broken"));
            }
            InputMode::Stalled => {
                std::thread::sleep(timeout);
                return Err(io::Error::new(io::ErrorKind::TimedOut, "shell is not reading input"));
            }
        }

        let mut state = self.state.lock();
        let ScriptState { writes, shells, .. } = &mut *state;
        let shell = &shells[self.index];
        if shell.exit_code.is_some() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "shell has exited"));
        }
        writes.extend_from_slice(data);
        if let Some(tx) = shell.output.as_ref() {
            let _ = tx.send(data.to_vec());
        }
        Ok(())
    }
}

struct ScriptedReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl PtyReader for ScriptedReader {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<ReadOutcome> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(timeout) {
                Ok(chunk) => self.pending = chunk,
                Err(RecvTimeoutError::Timeout) => return Ok(ReadOutcome::TimedOut),
                Err(RecvTimeoutError::Disconnected) => return Ok(ReadOutcome::Eof),
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(ReadOutcome::Data(n))
    }
}

/// Config with short intervals so lifecycle tests stay fast
pub fn fast_config() -> TerminalConfig {
    TerminalConfig {
        poll_interval_ms: 10,
        grace_period_ms: 10,
        ..TerminalConfig::default()
    }
}

pub fn project_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// Callback appending everything it receives to a shared buffer
pub fn collector() -> (OutputCallback, Arc<Mutex<Vec<u8>>>) {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let writer = Arc::clone(&sink);
    let callback: OutputCallback = Arc::new(move |data: &[u8]| writer.lock().extend_from_slice(data));
    (callback, sink)
}

/// Poll `sink` until it holds `expected` bytes or the deadline passes
pub async fn wait_for_len(sink: &Mutex<Vec<u8>>, expected: usize, deadline: Duration) -> Vec<u8> {
    let started = tokio::time::Instant::now();
    loop {
        let current = sink.lock().clone();
        if current.len() >= expected || started.elapsed() >= deadline {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll `sink` until `needle` appears in it or the deadline passes
pub async fn wait_for_output(sink: &Mutex<Vec<u8>>, needle: &[u8], deadline: Duration) -> bool {
    let started = tokio::time::Instant::now();
    loop {
        if sink.lock().windows(needle.len()).any(|w| w == needle) {
            return true;
        }
        if started.elapsed() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_state(
    rx: &mut watch::Receiver<SessionState>,
    predicate: impl FnMut(&SessionState) -> bool,
) -> SessionState {
    let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
        .await
        .expect("timed out waiting for session state")
        .expect("session state channel closed");
    *state
}
