use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use termhub::{ClientMessage, CloseReason, ServerMessage, TerminalConnection};
use termhub_terminal::{
    Geometry, PtyBackend, PtyProcess, PtyReader, PtyWriter, ReadOutcome, SpawnRequest, SpawnedPty,
    TerminalConfig, TerminalRegistry, TerminalSession,
};

const DEADLINE: Duration = Duration::from_secs(10);

/// Test double for the client side of a transport
struct TestClient {
    tx: Option<mpsc::Sender<String>>,
    rx: mpsc::Receiver<ServerMessage>,
    handle: JoinHandle<CloseReason>,
}

impl TestClient {
    fn connect(registry: &Arc<TerminalRegistry>, session: Arc<TerminalSession>) -> Self {
        let (tx, in_rx) = mpsc::channel(32);
        let (out_tx, rx) = mpsc::channel(256);
        let connection = TerminalConnection::new(Arc::clone(registry), session);
        let handle = tokio::spawn(connection.run(in_rx, out_tx));
        Self {
            tx: Some(tx),
            rx,
            handle,
        }
    }

    async fn send(&self, frame: serde_json::Value) {
        self.send_text(&frame.to_string()).await;
    }

    async fn send_text(&self, text: &str) {
        self.tx
            .as_ref()
            .expect("client already closed")
            .send(text.to_string())
            .await
            .expect("connection is gone");
    }

    async fn recv(&mut self) -> ServerMessage {
        tokio::time::timeout(DEADLINE, self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
    }

    /// Next frame that is not terminal output
    async fn recv_control(&mut self) -> ServerMessage {
        loop {
            let message = self.recv().await;
            if !matches!(message, ServerMessage::Output { .. }) {
                return message;
            }
        }
    }

    /// Accumulate output until `needle` shows up
    async fn read_until(&mut self, needle: &str) -> String {
        let mut seen = Vec::new();
        loop {
            let message = self.recv().await;
            if let Some(bytes) = message.output_bytes() {
                seen.extend_from_slice(&bytes);
                if String::from_utf8_lossy(&seen).contains(needle) {
                    return String::from_utf8_lossy(&seen).into_owned();
                }
            }
        }
    }

    async fn close(mut self) -> CloseReason {
        self.tx = None;
        tokio::time::timeout(DEADLINE, self.handle)
            .await
            .expect("connection did not finish")
            .expect("connection task panicked")
    }
}

fn registry() -> Arc<TerminalRegistry> {
    Arc::new(TerminalRegistry::new(TerminalConfig::default()))
}

fn error_frame(message: &str) -> ServerMessage {
    ServerMessage::Error {
        message: message.to_string(),
    }
}

fn session_in(registry: &TerminalRegistry, dir: &Path) -> Arc<TerminalSession> {
    registry.get_or_create_session("demo", dir, None)
}

/// A shell that stays up but whose input pipe is broken
struct BrokenInputBackend;

impl PtyBackend for BrokenInputBackend {
    fn spawn(&self, _request: &SpawnRequest<'_>) -> termhub_terminal::Result<SpawnedPty> {
        Ok(SpawnedPty {
            process: Box::new(IdleProcess { exit_code: None }),
            reader: Box::new(IdleReader),
            writer: Box::new(BrokenWriter),
        })
    }

    fn backend_name(&self) -> &'static str {
        "broken-input"
    }
}

struct IdleProcess {
    exit_code: Option<i32>,
}

impl PtyProcess for IdleProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn resize(&mut self, _geometry: Geometry) -> io::Result<()> {
        Ok(())
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.exit_code)
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.exit_code.get_or_insert(143);
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.exit_code.get_or_insert(137);
        Ok(())
    }

    fn wait(&mut self) -> io::Result<i32> {
        Ok(*self.exit_code.get_or_insert(137))
    }
}

struct IdleReader;

impl PtyReader for IdleReader {
    fn read_timeout(&mut self, _buf: &mut [u8], timeout: Duration) -> io::Result<ReadOutcome> {
        std::thread::sleep(timeout);
        Ok(ReadOutcome::TimedOut)
    }
}

struct BrokenWriter;

impl PtyWriter for BrokenWriter {
    fn write_timeout(&mut self, _data: &[u8], _timeout: Duration) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "input pipe broken"))
    }
}

#[tokio::test]
async fn answers_ping_and_reports_bad_frames() {
    let dir = tempfile::TempDir::new().unwrap();
    let registry = registry();
    let mut client = TestClient::connect(&registry, session_in(&registry, dir.path()));

    client.send(json!({"type": "ping"})).await;
    assert_eq!(client.recv().await, ServerMessage::Pong);

    client.send_text("{not json").await;
    assert_eq!(client.recv().await, error_frame("Invalid JSON"));

    client.send(json!({"type": "launch"})).await;
    assert_eq!(client.recv().await, error_frame("Unknown message type: launch"));

    client.send(json!({"type": "resize", "cols": "wide", "rows": 24})).await;
    assert_eq!(client.recv().await, error_frame("Invalid resize dimensions"));

    assert_eq!(client.close().await, CloseReason::ClientClosed);
}

#[tokio::test]
async fn input_before_first_resize_is_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    let registry = registry();
    let session = session_in(&registry, dir.path());
    let mut client = TestClient::connect(&registry, Arc::clone(&session));

    client.send(serde_json::to_value(ClientMessage::input(b"ls\n")).unwrap()).await;
    assert_eq!(
        client.recv().await,
        error_frame("Terminal not ready - send resize first")
    );
    assert!(!session.is_active());

    client.close().await;
}

#[tokio::test]
async fn failed_start_closes_with_4500() {
    let dir = tempfile::TempDir::new().unwrap();
    let registry = registry();
    let session = session_in(&registry, &dir.path().join("missing"));
    let mut client = TestClient::connect(&registry, Arc::clone(&session));

    client.send(json!({"type": "resize", "cols": 80, "rows": 24})).await;
    assert_eq!(client.recv().await, error_frame("Failed to start terminal session"));

    let reason = tokio::time::timeout(DEADLINE, client.handle)
        .await
        .expect("connection did not finish")
        .unwrap();
    assert_eq!(reason, CloseReason::FailedToStart);
    assert_eq!(reason.code(), 4500);
    assert_eq!(session.callback_count(), 0);
}

#[tokio::test]
async fn write_failure_is_reported_and_keeps_the_shell() {
    let dir = tempfile::TempDir::new().unwrap();
    let registry = Arc::new(TerminalRegistry::with_backend(
        Arc::new(BrokenInputBackend),
        TerminalConfig::default(),
    ));
    let session = session_in(&registry, dir.path());
    let mut client = TestClient::connect(&registry, Arc::clone(&session));

    client.send(json!({"type": "resize", "cols": 80, "rows": 24})).await;
    client.send(serde_json::to_value(ClientMessage::input(b"ls\n")).unwrap()).await;
    assert_eq!(client.recv_control().await, error_frame("Failed to write to terminal"));
    assert!(session.is_active());

    client.send(json!({"type": "ping"})).await;
    assert_eq!(client.recv_control().await, ServerMessage::Pong);

    assert_eq!(client.close().await, CloseReason::ClientClosed);
    assert!(session.state().is_stopped());
}

#[cfg(unix)]
mod unix {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sh_registry() -> Arc<TerminalRegistry> {
        std::env::set_var("SHELL", "/bin/sh");
        registry()
    }

    #[tokio::test]
    async fn round_trip_through_a_real_shell() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = sh_registry();
        let session = session_in(&registry, dir.path());
        let mut client = TestClient::connect(&registry, Arc::clone(&session));

        client.send(json!({"type": "resize", "cols": 5, "rows": 1000})).await;
        client.send(serde_json::to_value(ClientMessage::input(b"stty size\n")).unwrap()).await;
        client.read_until("200 10").await;

        client.send(json!({"type": "input", "data": "%%%"})).await;
        assert_eq!(client.recv_control().await, error_frame("Invalid base64 data"));

        client
            .send(serde_json::to_value(ClientMessage::input(b"printf 'hi-%s\\n' there\n")).unwrap())
            .await;
        client.read_until("hi-there").await;

        assert_eq!(client.close().await, CloseReason::ClientClosed);
        assert!(session.state().is_stopped());
    }

    #[tokio::test]
    async fn exit_frame_carries_the_real_exit_code() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = sh_registry();
        let session = session_in(&registry, dir.path());
        let mut client = TestClient::connect(&registry, Arc::clone(&session));

        client.send(json!({"type": "resize", "cols": 80, "rows": 24})).await;
        client.send(serde_json::to_value(ClientMessage::input(b"exit 4\n")).unwrap()).await;
        assert_eq!(client.recv_control().await, ServerMessage::Exit { code: 4 });

        // A later resize does not bring the shell back
        client.send(json!({"type": "resize", "cols": 100, "rows": 30})).await;
        client.send(serde_json::to_value(ClientMessage::input(b"ls\n")).unwrap()).await;
        assert_eq!(
            client.recv_control().await,
            error_frame("Terminal not ready - send resize first")
        );

        client.close().await;
    }

    #[tokio::test]
    async fn shell_survives_until_last_client_leaves() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = sh_registry();
        let session = session_in(&registry, dir.path());

        let mut first = TestClient::connect(&registry, Arc::clone(&session));
        let mut second = TestClient::connect(&registry, Arc::clone(&session));

        first.send(json!({"type": "resize", "cols": 80, "rows": 24})).await;
        first.send(json!({"type": "ping"})).await;
        assert_eq!(first.recv_control().await, ServerMessage::Pong);

        second.send(json!({"type": "resize", "cols": 90, "rows": 30})).await;
        second
            .send(serde_json::to_value(ClientMessage::input(b"echo shared-$((6*7))\n")).unwrap())
            .await;
        first.read_until("shared-42").await;
        second.read_until("shared-42").await;

        first.close().await;
        assert!(session.is_active());

        second.close().await;
        assert!(!session.is_active());
        assert!(session.state().is_stopped());
    }
}
