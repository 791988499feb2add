use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use termhub_types::{Geometry, Result, SessionState, TerminalConfig, TerminalError};

use super::backend::{PtyBackend, PtyProcess, PtyReader, PtyWriter, ReadOutcome, SpawnRequest};
use super::shell::resolve_shell;

/// Receives raw PTY output.
///
/// Callbacks run on the read loop. They must not block: a slow consumer
/// should enqueue the bytes and do its work elsewhere.
pub type OutputCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Handle identifying one registered output callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct CallbackSet {
    next_id: u64,
    entries: Vec<(SubscriptionId, OutputCallback)>,
}

impl CallbackSet {
    fn insert(&mut self, callback: OutputCallback) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.entries.push((id, callback));
        id
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    fn snapshot(&self) -> Vec<OutputCallback> {
        self.entries.iter().map(|(_, cb)| Arc::clone(cb)).collect()
    }
}

type SharedProcess = Arc<Mutex<Option<Box<dyn PtyProcess>>>>;

/// Background read task of an active session
struct ReadTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// One PTY-backed shell for a terminal.
///
/// Constructed inert; `start` spawns the shell, `stop` tears it down for good.
/// Output is broadcast to every registered callback in production order.
pub struct TerminalSession {
    project: String,
    terminal_id: String,
    working_dir: PathBuf,
    backend: Arc<dyn PtyBackend>,
    config: TerminalConfig,
    callbacks: Arc<Mutex<CallbackSet>>,
    process: SharedProcess,
    // Never locked by the read loop, so a stalled write cannot stop output
    writer: Mutex<Option<Box<dyn PtyWriter>>>,
    read_task: Mutex<Option<ReadTask>>,
    // Serializes start/stop
    lifecycle: tokio::sync::Mutex<()>,
    state: Arc<watch::Sender<SessionState>>,
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("project", &self.project)
            .field("terminal_id", &self.terminal_id)
            .field("working_dir", &self.working_dir)
            .field("backend", &self.backend.backend_name())
            .field("state", &self.state())
            .finish()
    }
}

impl TerminalSession {
    /// Create an inert session; no process is spawned until `start`
    pub fn new(
        project: impl Into<String>,
        terminal_id: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        backend: Arc<dyn PtyBackend>,
        config: TerminalConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Inert);
        Self {
            project: project.into(),
            terminal_id: terminal_id.into(),
            working_dir: working_dir.into(),
            backend,
            config,
            callbacks: Arc::new(Mutex::new(CallbackSet::default())),
            process: Arc::new(Mutex::new(None)),
            writer: Mutex::new(None),
            read_task: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            state: Arc::new(state),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions, including the exit code once known
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Process id of the running shell
    pub fn pid(&self) -> Option<u32> {
        match self.state() {
            SessionState::Active { pid } => pid,
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Output callbacks
    // ------------------------------------------------------------------

    /// Register a callback; it receives output from now on, including output
    /// of a process started later.
    pub fn add_output_callback(&self, callback: OutputCallback) -> SubscriptionId {
        self.callbacks.lock().insert(callback)
    }

    /// Unregister a callback and return how many remain.
    ///
    /// The count is taken under the same lock as the removal, so exactly one
    /// caller observes the set becoming empty.
    pub fn remove_output_callback(&self, id: SubscriptionId) -> usize {
        let mut callbacks = self.callbacks.lock();
        if !callbacks.remove(id) {
            debug!(project = %self.project, terminal_id = %self.terminal_id, ?id, "callback was not registered");
        }
        callbacks.entries.len()
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.lock().entries.len()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the shell with the given geometry.
    ///
    /// Returns false (after logging why) if the session is already active,
    /// the working directory is unusable or the backend cannot spawn.
    pub async fn start(&self, geometry: Geometry) -> bool {
        match self.try_start(geometry).await {
            Ok(_) => true,
            Err(TerminalError::AlreadyActive) => {
                warn!(project = %self.project, terminal_id = %self.terminal_id, "terminal session already active");
                false
            }
            Err(e) => {
                error!(project = %self.project, terminal_id = %self.terminal_id, "failed to start terminal: {}", e);
                false
            }
        }
    }

    /// Start the shell, reporting the failure reason.
    ///
    /// Returns the pid of the spawned shell when the platform reports one.
    pub async fn try_start(&self, geometry: Geometry) -> Result<Option<u32>> {
        let _lifecycle = self.lifecycle.lock().await;

        match self.state() {
            SessionState::Active { .. } => return Err(TerminalError::AlreadyActive),
            SessionState::Stopped { .. } => return Err(TerminalError::SessionStopped),
            SessionState::Inert | SessionState::Exited { .. } => {}
        }

        let working_dir = self.validated_working_dir()?;

        // Handles left behind by a shell that exited on its own
        self.shutdown_read_task().await;
        self.writer.lock().take();
        let leftover = self.process.lock().take();
        if let Some(process) = leftover {
            self.reap(process).await;
        }

        let shell = resolve_shell();
        let request = SpawnRequest {
            shell: &shell,
            working_dir: &working_dir,
            geometry,
            env: vec![
                ("TERM".to_string(), self.config.term.clone()),
                ("COLORTERM".to_string(), "truecolor".to_string()),
            ],
            read_buffer_size: self.config.read_buffer_size,
        };

        let spawned = self.backend.spawn(&request)?;
        let pid = spawned.process.pid();

        *self.process.lock() = Some(spawned.process);
        *self.writer.lock() = Some(spawned.writer);
        self.state.send_replace(SessionState::Active { pid });

        let cancel = CancellationToken::new();
        let read_loop = ReadLoop {
            project: self.project.clone(),
            terminal_id: self.terminal_id.clone(),
            reader: spawned.reader,
            callbacks: Arc::clone(&self.callbacks),
            process: Arc::clone(&self.process),
            state: Arc::clone(&self.state),
            cancel: cancel.clone(),
            config: self.config.clone(),
        };
        let handle = tokio::spawn(read_loop.run());
        *self.read_task.lock() = Some(ReadTask { cancel, handle });

        info!(
            project = %self.project,
            terminal_id = %self.terminal_id,
            pid = ?pid,
            shell = %shell.display(),
            backend = self.backend.backend_name(),
            %geometry,
            "terminal started"
        );
        Ok(pid)
    }

    fn validated_working_dir(&self) -> Result<PathBuf> {
        if !self.working_dir.exists() {
            return Err(TerminalError::InvalidWorkingDirectory {
                path: self.working_dir.clone(),
                reason: "does not exist",
            });
        }
        if !self.working_dir.is_dir() {
            return Err(TerminalError::InvalidWorkingDirectory {
                path: self.working_dir.clone(),
                reason: "is not a directory",
            });
        }
        Ok(std::fs::canonicalize(&self.working_dir).unwrap_or_else(|_| self.working_dir.clone()))
    }

    /// Forward raw input to the shell.
    ///
    /// Blocks for at most the configured write timeout; input the shell has
    /// not accepted by then is dropped and reported as a `WriteFailure`.
    /// Writing to an inactive session is a logged no-op.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if !self.is_active() {
            warn!(project = %self.project, terminal_id = %self.terminal_id, "cannot write to inactive terminal");
            return Ok(());
        }

        let mut writer = self.writer.lock();
        let Some(writer) = writer.as_mut() else {
            warn!(project = %self.project, terminal_id = %self.terminal_id, "cannot write to inactive terminal");
            return Ok(());
        };

        writer.write_timeout(data, self.config.write_timeout()).map_err(|e| {
            warn!(project = %self.project, terminal_id = %self.terminal_id, "failed to write to PTY: {}", e);
            TerminalError::WriteFailure(e.to_string())
        })
    }

    /// [`write`](Self::write) on the blocking pool, for callers running on
    /// the async runtime
    pub async fn write_async(self: &Arc<Self>, data: Vec<u8>) -> Result<()> {
        let session = Arc::clone(self);
        tokio::task::spawn_blocking(move || session.write(&data))
            .await
            .map_err(|e| TerminalError::WriteFailure(format!("write task failed: {}", e)))?
    }

    /// Apply a new window size. Inputs are expected to be clamped already.
    pub fn resize(&self, geometry: Geometry) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }

        let mut process = self.process.lock();
        let Some(process) = process.as_mut() else {
            return Ok(());
        };

        process.resize(geometry).map_err(|e| {
            warn!(project = %self.project, terminal_id = %self.terminal_id, "failed to resize terminal: {}", e);
            TerminalError::ResizeFailure(e.to_string())
        })?;
        debug!(project = %self.project, terminal_id = %self.terminal_id, %geometry, "terminal resized");
        Ok(())
    }

    /// Tear the shell down: cancel and await the read loop, terminate and
    /// reap the process, release its handles.
    ///
    /// Idempotent, and completes even when the shell already exited on its own.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        let had_task = self.shutdown_read_task().await;
        self.writer.lock().take();
        let process = self.process.lock().take();
        if !had_task && process.is_none() {
            return;
        }

        let previous = self.state().exit_code();
        let code = match process {
            Some(process) => self.terminate(process).await,
            None => None,
        };

        self.state.send_replace(SessionState::Stopped {
            code: code.or(previous),
        });
        info!(project = %self.project, terminal_id = %self.terminal_id, exit_code = ?code, "terminal stopped");
    }

    /// Cancel the read loop and wait for it to finish.
    ///
    /// Returns whether a task was running.
    async fn shutdown_read_task(&self) -> bool {
        let Some(task) = self.read_task.lock().take() else {
            return false;
        };

        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            if !e.is_cancelled() {
                warn!(project = %self.project, terminal_id = %self.terminal_id, "read loop ended abnormally: {}", e);
            }
        }
        true
    }

    /// Graceful signal, forced kills after the grace period, and an
    /// unconditional kill on the final attempt, then reap.
    async fn terminate(&self, mut process: Box<dyn PtyProcess>) -> Option<i32> {
        let attempts = self.config.kill_attempts.max(1);
        let grace = self.config.grace_period();

        for attempt in 1..attempts {
            match process.try_wait() {
                Ok(Some(code)) => return self.reap(process).await.or(Some(code)),
                Ok(None) => {}
                Err(e) => {
                    warn!(project = %self.project, terminal_id = %self.terminal_id, "failed to poll terminal process: {}", e);
                    break;
                }
            }

            let signalled = if attempt == 1 {
                process.terminate()
            } else {
                process.kill()
            };
            if let Err(e) = signalled {
                warn!(project = %self.project, terminal_id = %self.terminal_id, attempt, "error terminating PTY child: {}", e);
            }
            tokio::time::sleep(grace).await;
        }

        if let Err(e) = process.kill() {
            warn!(project = %self.project, terminal_id = %self.terminal_id, "error killing PTY child: {}", e);
        }
        self.reap(process).await
    }

    /// Block (off the runtime) until the process is reaped, then drop its handles
    async fn reap(&self, mut process: Box<dyn PtyProcess>) -> Option<i32> {
        let result = tokio::task::spawn_blocking(move || process.wait()).await;
        match result {
            Ok(Ok(code)) => Some(code),
            Ok(Err(e)) => {
                warn!(project = %self.project, terminal_id = %self.terminal_id, "failed to reap PTY child: {}", e);
                None
            }
            Err(e) => {
                warn!(project = %self.project, terminal_id = %self.terminal_id, "reaper task failed: {}", e);
                None
            }
        }
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.get_mut().take() {
            task.cancel.cancel();
        }
        self.writer.get_mut().take();

        // Last-resort cleanup when nobody called stop()
        let leftover = self.process.lock().take();
        if let Some(mut process) = leftover {
            warn!(project = %self.project, terminal_id = %self.terminal_id, "terminal dropped while running; killing shell");
            let _ = process.kill();
            let _ = process.wait();
        }
    }
}

/// Everything the background read loop owns
struct ReadLoop {
    project: String,
    terminal_id: String,
    reader: Box<dyn PtyReader>,
    callbacks: Arc<Mutex<CallbackSet>>,
    process: SharedProcess,
    state: Arc<watch::Sender<SessionState>>,
    cancel: CancellationToken,
    config: TerminalConfig,
}

impl ReadLoop {
    async fn run(self) {
        let ReadLoop {
            project,
            terminal_id,
            mut reader,
            callbacks,
            process,
            state,
            cancel,
            config,
        } = self;

        let poll_interval = config.poll_interval();
        let mut buf = vec![0u8; config.read_buffer_size.max(1)];

        let exit_code = loop {
            if cancel.is_cancelled() {
                debug!(project = %project, terminal_id = %terminal_id, "read loop cancelled");
                return;
            }

            let joined = tokio::task::spawn_blocking(move || {
                let outcome = reader.read_timeout(&mut buf, poll_interval);
                (reader, buf, outcome)
            })
            .await;

            let outcome = match joined {
                Ok((returned_reader, returned_buf, outcome)) => {
                    reader = returned_reader;
                    buf = returned_buf;
                    outcome
                }
                Err(e) => {
                    warn!(project = %project, terminal_id = %terminal_id, "PTY read task failed: {}", e);
                    break None;
                }
            };

            match outcome {
                Ok(ReadOutcome::Data(n)) => broadcast(&callbacks, &buf[..n], &project),
                Ok(ReadOutcome::TimedOut) => {
                    if let Some(code) = exited(&process) {
                        break Some(code);
                    }
                }
                Ok(ReadOutcome::Eof) => break exit_status_after_eof(&process, poll_interval).await,
                Err(e) => {
                    if !cancel.is_cancelled() {
                        warn!(project = %project, terminal_id = %terminal_id, "PTY read error: {}", e);
                    }
                    break exited(&process);
                }
            }
        };

        state.send_if_modified(|current| {
            if current.is_active() {
                *current = SessionState::Exited { code: exit_code };
                true
            } else {
                false
            }
        });
        info!(project = %project, terminal_id = %terminal_id, exit_code = ?exit_code, "terminal output stream ended");
    }
}

/// Deliver one chunk to a snapshot of the registered callbacks
fn broadcast(callbacks: &Mutex<CallbackSet>, data: &[u8], project: &str) {
    let snapshot = callbacks.lock().snapshot();

    for callback in snapshot {
        if catch_unwind(AssertUnwindSafe(|| callback(data))).is_err() {
            warn!(project = %project, "output callback panicked");
        }
    }
}

fn exited(process: &SharedProcess) -> Option<i32> {
    let mut guard = process.lock();
    let process = guard.as_mut()?;
    process.try_wait().ok().flatten()
}

/// The output stream can close a moment before the child is reapable
async fn exit_status_after_eof(process: &SharedProcess, poll_interval: std::time::Duration) -> Option<i32> {
    let step = poll_interval / 10;
    for _ in 0..20 {
        if let Some(code) = exited(process) {
            return Some(code);
        }
        tokio::time::sleep(step).await;
    }
    exited(process)
}
