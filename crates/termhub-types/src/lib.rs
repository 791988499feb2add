//! Core types shared across the termhub crates
//!
//! Terminal metadata, session lifecycle states, window geometry and the error
//! taxonomy used by the session manager and its transport glue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod config;
mod error;

pub use config::TerminalConfig;
pub use error::{Result, TerminalError};

// ============================================================================
// Constants
// ============================================================================

/// Prefix of auto-generated terminal names ("Terminal 1", "Terminal 2", ...)
pub const AUTO_NAME_PREFIX: &str = "Terminal ";

/// Number of hex characters kept from a UUID for a terminal id
pub const TERMINAL_ID_LEN: usize = 8;

pub const MIN_COLS: u16 = 10;
pub const MAX_COLS: u16 = 500;
pub const MIN_ROWS: u16 = 5;
pub const MAX_ROWS: u16 = 200;

// ============================================================================
// Terminal metadata
// ============================================================================

/// Metadata for a terminal instance.
///
/// Exists independently of whether a shell process is running for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInfo {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl TerminalInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }

    /// Sequence number of an auto-generated name, if this is one.
    ///
    /// `"Terminal 7"` yields `Some(7)`; user-chosen names yield `None`.
    pub fn auto_sequence(&self) -> Option<u64> {
        self.name
            .strip_prefix(AUTO_NAME_PREFIX)
            .and_then(|rest| rest.parse().ok())
    }
}

// ============================================================================
// Session state
// ============================================================================

/// Lifecycle state of a terminal session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    /// No process has been started yet
    Inert,
    /// A shell process is running and its output is being read
    Active { pid: Option<u32> },
    /// The process ended on its own (e.g. the user typed `exit`)
    Exited { code: Option<i32> },
    /// Torn down by an explicit stop; the session will not start again
    Stopped { code: Option<i32> },
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, SessionState::Stopped { .. })
    }

    /// Exit code of the process, once it is known
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SessionState::Exited { code } | SessionState::Stopped { code } => *code,
            _ => None,
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Inert
    }
}

// ============================================================================
// Geometry
// ============================================================================

/// Terminal window size in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    pub cols: u16,
    pub rows: u16,
}

impl Geometry {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Clamp a requested size into the supported range
    /// (10..=500 columns, 5..=200 rows).
    pub fn clamped(cols: i64, rows: i64) -> Self {
        Self {
            cols: cols.clamp(MIN_COLS as i64, MAX_COLS as i64) as u16,
            rows: rows.clamp(MIN_ROWS as i64, MAX_ROWS as i64) as u16,
        }
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}
