use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use termhub_types::{TerminalConfig, TerminalInfo, AUTO_NAME_PREFIX, TERMINAL_ID_LEN};

use super::backend::{native_backend, PtyBackend};
use super::session::TerminalSession;

type SessionIndex = HashMap<String, HashMap<String, Arc<TerminalSession>>>;
type MetadataIndex = HashMap<String, Vec<TerminalInfo>>;

/// Owns every terminal's metadata and runtime session, per project.
///
/// The two indices are locked independently and may briefly disagree:
/// metadata records that a terminal exists, a session is materialized only
/// when someone asks for it. Nothing here survives a restart.
pub struct TerminalRegistry {
    backend: Arc<dyn PtyBackend>,
    config: TerminalConfig,
    sessions: Mutex<SessionIndex>,
    metadata: Mutex<MetadataIndex>,
}

impl std::fmt::Debug for TerminalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalRegistry")
            .field("backend", &self.backend.backend_name())
            .field("projects", &self.metadata.lock().len())
            .finish()
    }
}

impl TerminalRegistry {
    /// Create a registry using the platform's PTY backend
    pub fn new(config: TerminalConfig) -> Self {
        Self::with_backend(native_backend(), config)
    }

    pub fn with_backend(backend: Arc<dyn PtyBackend>, config: TerminalConfig) -> Self {
        info!(backend = backend.backend_name(), "terminal registry initialized");
        Self {
            backend,
            config,
            sessions: Mutex::new(HashMap::new()),
            metadata: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// Create a terminal entry for a project. Does not spawn anything.
    ///
    /// Without a name, the terminal is called "Terminal N" where N is one
    /// past the highest auto-generated number in the project, so names of
    /// deleted terminals are never reused.
    pub fn create_terminal(&self, project: &str, name: Option<&str>) -> TerminalInfo {
        let mut metadata = self.metadata.lock();
        let terminals = metadata.entry(project.to_string()).or_default();
        let info = Self::push_terminal(terminals, name);

        info!(project, terminal_id = %info.id, name = %info.name, "created terminal");
        info
    }

    fn push_terminal(terminals: &mut Vec<TerminalInfo>, name: Option<&str>) -> TerminalInfo {
        let name = match name {
            Some(name) => name.to_string(),
            None => {
                let next = Self::next_sequence(terminals);
                format!("{}{}", AUTO_NAME_PREFIX, next)
            }
        };

        let id = loop {
            let candidate = short_id();
            if !terminals.iter().any(|t| t.id == candidate) {
                break candidate;
            }
        };

        let info = TerminalInfo::new(id, name);
        terminals.push(info.clone());
        info
    }

    /// One past the highest auto-generated number.
    ///
    /// Once `u64::MAX` is taken there is no higher number left; the lowest
    /// number not currently in use keeps names unique.
    fn next_sequence(terminals: &[TerminalInfo]) -> u64 {
        let used: Vec<u64> = terminals.iter().filter_map(TerminalInfo::auto_sequence).collect();
        match used.iter().max() {
            None => 1,
            Some(highest) => highest
                .checked_add(1)
                .unwrap_or_else(|| (1..).find(|n| !used.contains(n)).unwrap_or(1)),
        }
    }

    /// Snapshot of a project's terminals in creation order; empty when the
    /// project has none
    pub fn list_terminals(&self, project: &str) -> Vec<TerminalInfo> {
        self.metadata
            .lock()
            .get(project)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_terminal_info(&self, project: &str, terminal_id: &str) -> Option<TerminalInfo> {
        self.metadata
            .lock()
            .get(project)?
            .iter()
            .find(|t| t.id == terminal_id)
            .cloned()
    }

    /// Rename in place; false if no such terminal
    pub fn rename_terminal(&self, project: &str, terminal_id: &str, new_name: &str) -> bool {
        let mut metadata = self.metadata.lock();
        let Some(terminal) = metadata
            .get_mut(project)
            .and_then(|terminals| terminals.iter_mut().find(|t| t.id == terminal_id))
        else {
            return false;
        };

        let old_name = std::mem::replace(&mut terminal.name, new_name.to_string());
        info!(project, terminal_id, old_name = %old_name, new_name, "renamed terminal");
        true
    }

    /// Remove a terminal's metadata and its session index entry.
    ///
    /// A running shell is not stopped here: call [`stop_session`] first.
    /// Returns false if no such terminal.
    ///
    /// [`stop_session`]: TerminalRegistry::stop_session
    pub fn delete_terminal(&self, project: &str, terminal_id: &str) -> bool {
        let removed = {
            let mut metadata = self.metadata.lock();
            let Some(terminals) = metadata.get_mut(project) else {
                return false;
            };
            let Some(index) = terminals.iter().position(|t| t.id == terminal_id) else {
                return false;
            };
            terminals.remove(index)
        };
        info!(project, terminal_id, name = %removed.name, "deleted terminal");

        if let Some(session) = self.remove_session(project, terminal_id) {
            if session.is_active() {
                warn!(project, terminal_id, "deleted terminal still has a running session");
            }
        }
        true
    }

    /// The project's first terminal, creating "Terminal 1" when it has none
    fn default_terminal(&self, project: &str) -> TerminalInfo {
        let mut metadata = self.metadata.lock();
        let terminals = metadata.entry(project.to_string()).or_default();
        if let Some(first) = terminals.first() {
            return first.clone();
        }

        let info = Self::push_terminal(terminals, None);
        info!(project, terminal_id = %info.id, name = %info.name, "created default terminal");
        info
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Existing session for `(project, terminal_id)`, or a new inert one.
    ///
    /// Without an id the project's default terminal is used. Never starts a
    /// process.
    pub fn get_or_create_session(
        &self,
        project: &str,
        project_dir: &Path,
        terminal_id: Option<&str>,
    ) -> Arc<TerminalSession> {
        let terminal_id = match terminal_id {
            Some(id) => id.to_string(),
            None => self.default_terminal(project).id,
        };

        let mut sessions = self.sessions.lock();
        let project_sessions = sessions.entry(project.to_string()).or_default();
        let session = project_sessions.entry(terminal_id.clone()).or_insert_with(|| {
            Arc::new(TerminalSession::new(
                project,
                terminal_id.as_str(),
                project_dir,
                Arc::clone(&self.backend),
                self.config.clone(),
            ))
        });
        Arc::clone(session)
    }

    /// Drop the index entry for a session without touching its process
    pub fn remove_session(&self, project: &str, terminal_id: &str) -> Option<Arc<TerminalSession>> {
        let mut sessions = self.sessions.lock();
        let project_sessions = sessions.get_mut(project)?;
        let removed = project_sessions.remove(terminal_id);
        if project_sessions.is_empty() {
            sessions.remove(project);
        }
        removed
    }

    /// Drop the index entry only if it still refers to `session`.
    ///
    /// Used once the last observer has stopped a session, so the next
    /// request gets a fresh one.
    pub fn release_session(&self, session: &Arc<TerminalSession>) -> bool {
        Self::remove_if_current(&mut self.sessions.lock(), session)
    }

    /// Drop the index entry for `session` if nobody observes it.
    ///
    /// The observer count is read under the index lock, so an observed
    /// session never leaves the index. Returns whether the session is
    /// unobserved; an entry already pointing elsewhere is left alone.
    pub fn release_if_unobserved(&self, session: &Arc<TerminalSession>) -> bool {
        let mut sessions = self.sessions.lock();
        if session.callback_count() > 0 {
            return false;
        }
        Self::remove_if_current(&mut sessions, session);
        true
    }

    fn remove_if_current(sessions: &mut SessionIndex, session: &Arc<TerminalSession>) -> bool {
        let Some(project_sessions) = sessions.get_mut(session.project()) else {
            return false;
        };

        let same = project_sessions
            .get(session.terminal_id())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if same {
            project_sessions.remove(session.terminal_id());
            if project_sessions.is_empty() {
                sessions.remove(session.project());
            }
        }
        same
    }

    /// Remove a session and stop it. True if a live shell was stopped.
    pub async fn stop_session(&self, project: &str, terminal_id: &str) -> bool {
        let Some(session) = self.remove_session(project, terminal_id) else {
            return false;
        };

        let was_active = session.is_active();
        session.stop().await;
        was_active
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().values().map(HashMap::len).sum()
    }

    /// Stop every session, then forget all sessions and metadata
    pub async fn shutdown(&self) {
        let all: Vec<Arc<TerminalSession>> = self
            .sessions
            .lock()
            .values()
            .flat_map(|project_sessions| project_sessions.values().cloned())
            .collect();

        for session in &all {
            session.stop().await;
        }

        self.sessions.lock().clear();
        self.metadata.lock().clear();
        info!(stopped = all.len(), "all terminal sessions cleaned up");
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..TERMINAL_ID_LEN].to_string()
}
