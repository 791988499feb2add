//! Drives one client connection against a terminal session.
//!
//! The connection speaks the JSON frame protocol over a pair of channels, so
//! any transport (a WebSocket, stdin/stdout, a test) can sit on either end.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use termhub_terminal::{OutputCallback, TerminalObserver, TerminalRegistry, TerminalSession};

use crate::protocol::{decode_input, ClientMessage, ProtocolError, ServerMessage};

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client went away or closed its side
    ClientClosed,
    /// The deferred start of the shell failed
    FailedToStart,
}

impl CloseReason {
    /// Close code for transports that carry one
    pub fn code(self) -> u16 {
        match self {
            CloseReason::ClientClosed => 1000,
            CloseReason::FailedToStart => 4500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "Client disconnected",
            CloseReason::FailedToStart => "Failed to start terminal",
        }
    }
}

enum Flow {
    Continue,
    Close(CloseReason),
}

pub struct TerminalConnection {
    registry: Arc<TerminalRegistry>,
    session: Arc<TerminalSession>,
}

impl TerminalConnection {
    pub fn new(registry: Arc<TerminalRegistry>, session: Arc<TerminalSession>) -> Self {
        Self { registry, session }
    }

    /// Serve frames from `incoming` until it closes or the shell fails to
    /// start, then detach (stopping the shell if this was its last observer).
    pub async fn run(
        self,
        mut incoming: mpsc::Receiver<String>,
        outgoing: mpsc::Sender<ServerMessage>,
    ) -> CloseReason {
        let project = self.session.project().to_string();
        let terminal_id = self.session.terminal_id().to_string();
        let queue_limit = self.registry.config().output_queue_limit.max(1);

        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(queue_limit);
        let observer = TerminalObserver::begin_observing(
            Arc::clone(&self.session),
            output_callback(output_tx, project.clone()),
        );

        let cancel = CancellationToken::new();
        let output_task = spawn_output_forwarder(output_rx, outgoing.clone(), cancel.clone());
        let exit_task = spawn_exit_monitor(&self.session, outgoing.clone(), cancel.clone());

        info!(project = %project, terminal_id = %terminal_id, "terminal connection opened");

        let mut reason = CloseReason::ClientClosed;
        while let Some(text) = incoming.recv().await {
            match handle_frame(&observer, &outgoing, &text).await {
                Flow::Continue => {}
                Flow::Close(close) => {
                    reason = close;
                    break;
                }
            }
            if outgoing.is_closed() {
                break;
            }
        }

        cancel.cancel();
        for task in [output_task, exit_task] {
            if let Err(e) = task.await {
                warn!(project = %project, "connection task failed: {}", e);
            }
        }

        let remaining = observer.end_observing(&self.registry).await;
        info!(
            project = %project,
            terminal_id = %terminal_id,
            remaining,
            close_code = reason.code(),
            "terminal connection closed"
        );
        reason
    }
}

/// Queue output for the forwarder without ever blocking the read loop
fn output_callback(output_tx: mpsc::Sender<Vec<u8>>, project: String) -> OutputCallback {
    Arc::new(move |data: &[u8]| {
        if let Err(mpsc::error::TrySendError::Full(_)) = output_tx.try_send(data.to_vec()) {
            warn!(project = %project, "output queue full, dropping data");
        }
    })
}

fn spawn_output_forwarder(
    mut output_rx: mpsc::Receiver<Vec<u8>>,
    outgoing: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = output_rx.recv() => chunk,
            };
            let Some(chunk) = chunk else { break };
            if outgoing.send(ServerMessage::output(&chunk)).await.is_err() {
                break;
            }
        }
    })
}

/// Report every time the shell stops running, with its exit code
fn spawn_exit_monitor(
    session: &TerminalSession,
    outgoing: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut states = session.subscribe_state();
    tokio::spawn(async move {
        loop {
            let ended = tokio::select! {
                _ = cancel.cancelled() => return,
                ended = async {
                    states.wait_for(|s| s.is_active()).await?;
                    let state = *states.wait_for(|s| !s.is_active()).await?;
                    Ok::<_, tokio::sync::watch::error::RecvError>(state)
                } => ended,
            };

            let Ok(state) = ended else { return };
            debug!(?state, "terminal process ended");
            if outgoing.send(ServerMessage::exit(state.exit_code())).await.is_err() {
                return;
            }
        }
    })
}

async fn handle_frame(
    observer: &TerminalObserver,
    outgoing: &mpsc::Sender<ServerMessage>,
    text: &str,
) -> Flow {
    let message = match ClientMessage::parse(text) {
        Ok(message) => message,
        Err(err) => return reply_error(outgoing, err).await,
    };

    match message {
        ClientMessage::Ping => {
            let _ = outgoing.send(ServerMessage::Pong).await;
            Flow::Continue
        }
        ClientMessage::Input { data } => {
            if !observer.is_ready() {
                return reply_error(outgoing, ProtocolError::NotReady).await;
            }
            let bytes = match decode_input(&data) {
                Ok(bytes) => bytes,
                Err(err) => {
                    if err == ProtocolError::InvalidBase64 {
                        warn!("failed to decode base64 input");
                    }
                    return reply_error(outgoing, err).await;
                }
            };
            if bytes.is_empty() {
                return Flow::Continue;
            }
            if let Err(e) = observer.send_input(&bytes).await {
                warn!("failed to write to terminal: {}", e);
                return reply_error(outgoing, ProtocolError::WriteFailed).await;
            }
            Flow::Continue
        }
        ClientMessage::Resize { cols, rows } => {
            let starting = !observer.is_ready();
            match observer.request_resize(cols, rows).await {
                Ok(geometry) => {
                    debug!(%geometry, "resize applied");
                    Flow::Continue
                }
                Err(e) if starting => {
                    warn!("failed to start terminal session: {}", e);
                    let _ = outgoing.send(ServerMessage::error(&ProtocolError::StartFailed)).await;
                    Flow::Close(CloseReason::FailedToStart)
                }
                Err(e) => {
                    warn!("failed to resize terminal: {}", e);
                    Flow::Continue
                }
            }
        }
    }
}

async fn reply_error(outgoing: &mpsc::Sender<ServerMessage>, err: ProtocolError) -> Flow {
    let _ = outgoing.send(ServerMessage::error(&err)).await;
    Flow::Continue
}
