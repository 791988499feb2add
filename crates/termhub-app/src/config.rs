use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use termhub_types::TerminalConfig;

/// CLI arguments for termhub
#[derive(Parser, Debug)]
#[command(name = "termhub")]
#[command(about = "PTY-backed terminal sessions for projects")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a TOML config file
    #[arg(long, global = true, value_name = "PATH", env = "TERMHUB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `termhub_terminal=trace,info`
    #[arg(long, global = true, value_name = "FILTER", env = "TERMHUB_LOG")]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the shell new terminals would run
    Shell,
    /// Attach stdin/stdout to a new terminal of a project
    Attach {
        /// Project the terminal belongs to
        #[arg(long)]
        project: String,
        /// Project directory; the shell starts here
        #[arg(long, value_name = "PATH")]
        dir: PathBuf,
        /// Terminal name (defaults to "Terminal N")
        #[arg(long)]
        name: Option<String>,
        /// Terminal columns (defaults to the configured size)
        #[arg(long)]
        cols: Option<u16>,
        /// Terminal rows (defaults to the configured size)
        #[arg(long)]
        rows: Option<u16>,
    },
}

/// Application settings after merging defaults, the config file and the CLI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub terminal: TerminalConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            terminal: TerminalConfig::default(),
        }
    }
}

impl AppConfig {
    /// Resolve the effective configuration for a parsed command line
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let mut config = match cli.config.as_deref() {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if let Some(level) = &cli.log_level {
            config.log_level = level.clone();
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        Ok(toml::from_str(input)?)
    }
}
