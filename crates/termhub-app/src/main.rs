use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use termhub::{logging, AppConfig, Cli, ClientMessage, CloseReason, Commands, ServerMessage, TerminalConnection};
use termhub_terminal::{resolve_shell, TerminalRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = AppConfig::resolve(&cli)?;
    logging::init(&config.log_level)?;

    match cli.command {
        Commands::Shell => {
            println!("{}", resolve_shell().display());
            Ok(())
        }
        Commands::Attach {
            project,
            dir,
            name,
            cols,
            rows,
        } => attach(config, project, dir, name, cols, rows).await,
    }
}

/// Run one terminal with stdin lines as input and raw output on stdout
async fn attach(
    config: AppConfig,
    project: String,
    dir: PathBuf,
    name: Option<String>,
    cols: Option<u16>,
    rows: Option<u16>,
) -> Result<()> {
    let dir = std::fs::canonicalize(&dir)
        .with_context(|| format!("Project directory not found: {}", dir.display()))?;

    let default_geometry = config.terminal.default_geometry();
    let registry = Arc::new(TerminalRegistry::new(config.terminal));
    let info = registry.create_terminal(&project, name.as_deref());
    let session = registry.get_or_create_session(&project, &dir, Some(&info.id));
    info!(project = %project, terminal_id = %info.id, name = %info.name, "attaching");

    let (in_tx, in_rx) = mpsc::channel::<String>(64);
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(256);
    let connection = tokio::spawn(TerminalConnection::new(Arc::clone(&registry), session).run(in_rx, out_tx));

    let resize = serde_json::to_string(&ClientMessage::Resize {
        cols: cols.unwrap_or(default_geometry.cols).into(),
        rows: rows.unwrap_or(default_geometry.rows).into(),
    })?;
    in_tx.send(resize).await.context("Terminal connection closed")?;

    let mut lines = stdin_lines();
    let mut stdout = tokio::io::stdout();
    let mut input = Some(in_tx);
    let mut exit_code = None;

    loop {
        tokio::select! {
            line = lines.recv(), if input.is_some() => {
                match line {
                    Some(line) => {
                        let frame = serde_json::to_string(&ClientMessage::input(format!("{}\n", line).as_bytes()))?;
                        if let Some(tx) = &input {
                            if tx.send(frame).await.is_err() {
                                input = None;
                            }
                        }
                    }
                    // EOF: closing our side ends the connection
                    None => input = None,
                }
            }
            message = out_rx.recv() => {
                let Some(message) = message else { break };
                match message {
                    ServerMessage::Output { .. } => {
                        if let Some(bytes) = message.output_bytes() {
                            stdout.write_all(&bytes).await?;
                            stdout.flush().await?;
                        }
                    }
                    ServerMessage::Exit { code } => {
                        info!(code, "shell exited");
                        exit_code = Some(code);
                        input = None;
                    }
                    ServerMessage::Error { message } => warn!("{}", message),
                    ServerMessage::Pong => {}
                }
            }
        }
    }

    let reason = connection.await.context("Terminal connection task failed")?;
    registry.shutdown().await;

    if reason != CloseReason::ClientClosed {
        bail!("{} (close code {})", reason.reason(), reason.code());
    }
    if let Some(code) = exit_code.filter(|code| *code != 0) {
        std::process::exit(code);
    }
    Ok(())
}

/// Stdin lines from a plain thread, so a pending read never holds up exit
fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(64);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}
