use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Geometry;

/// Tunables for terminal sessions.
///
/// Every field has a default, so a partial TOML table is enough to override
/// a single value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Upper bound on a single blocking read before the read loop re-checks
    /// liveness and cancellation
    pub poll_interval_ms: u64,
    pub read_buffer_size: usize,
    /// Longest a single write may wait for the shell to accept input
    pub write_timeout_ms: u64,
    /// Wait between a graceful termination signal and a forced kill
    pub grace_period_ms: u64,
    /// Termination rounds before the final unconditional kill
    pub kill_attempts: u32,
    /// Value of `TERM` in the shell's environment
    pub term: String,
    pub default_cols: u16,
    pub default_rows: u16,
    /// Output chunks buffered per observer before new chunks are dropped
    pub output_queue_limit: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            read_buffer_size: 4096,
            write_timeout_ms: 2000,
            grace_period_ms: 100,
            kill_attempts: 3,
            term: "xterm-256color".to_string(),
            default_cols: 80,
            default_rows: 24,
            output_queue_limit: 1024,
        }
    }
}

impl TerminalConfig {
    /// Parse a TOML document containing the terminal settings
    pub fn from_toml_str(input: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.max(1))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn default_geometry(&self) -> Geometry {
        Geometry::new(self.default_cols, self.default_rows)
    }
}
