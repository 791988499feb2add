use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use termhub_types::{Geometry, Result, TerminalError};

use super::registry::TerminalRegistry;
use super::session::{OutputCallback, SubscriptionId, TerminalSession};

/// One consumer attached to a session's output.
///
/// This is the surface a transport drives: it registers the output callback,
/// forwards input, owns the deferred start on the first resize and decides on
/// teardown when it is the last observer to leave. Dropping an observer
/// without `end_observing` unregisters its callback but never stops the shell.
pub struct TerminalObserver {
    session: Arc<TerminalSession>,
    subscription: Option<SubscriptionId>,
    // Set once this observer has sent its first resize
    sized: AtomicBool,
}

impl std::fmt::Debug for TerminalObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalObserver")
            .field("project", &self.session.project())
            .field("terminal_id", &self.session.terminal_id())
            .field("subscription", &self.subscription)
            .finish()
    }
}

impl TerminalObserver {
    pub fn begin_observing(session: Arc<TerminalSession>, on_output: OutputCallback) -> Self {
        let subscription = session.add_output_callback(on_output);
        debug!(
            project = %session.project(),
            terminal_id = %session.terminal_id(),
            ?subscription,
            observers = session.callback_count(),
            "observer attached"
        );
        Self {
            session,
            subscription: Some(subscription),
            sized: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &Arc<TerminalSession> {
        &self.session
    }

    /// Whether input can be delivered: the shell is running
    pub fn is_ready(&self) -> bool {
        self.session.is_active()
    }

    /// Forward input without tying up the runtime while the shell is busy
    pub async fn send_input(&self, data: &[u8]) -> Result<()> {
        self.session.write_async(data.to_vec()).await
    }

    /// Clamp the requested size and apply it.
    ///
    /// The first resize of an observer on a session that is not running is
    /// what starts the shell, sized correctly from its first frame. Later
    /// resizes only ever resize. Returns the geometry applied.
    pub async fn request_resize(&self, cols: i64, rows: i64) -> Result<Geometry> {
        let geometry = Geometry::clamped(cols, rows);
        let first = !self.sized.swap(true, Ordering::AcqRel);

        if !first || self.session.is_active() {
            self.session.resize(geometry)?;
            return Ok(geometry);
        }

        match self.session.try_start(geometry).await {
            Ok(_) => Ok(geometry),
            // Another observer started it first
            Err(TerminalError::AlreadyActive) => {
                self.session.resize(geometry)?;
                Ok(geometry)
            }
            Err(e) => {
                self.sized.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Detach, stopping the session when no observers remain.
    ///
    /// The last observer also drops the session from the registry so the
    /// next request gets a fresh one. Returns how many observers remain.
    pub async fn end_observing(mut self, registry: &TerminalRegistry) -> usize {
        let remaining = match self.subscription.take() {
            Some(id) => self.session.remove_output_callback(id),
            None => self.session.callback_count(),
        };

        if remaining > 0 {
            debug!(
                project = %self.session.project(),
                terminal_id = %self.session.terminal_id(),
                remaining,
                "observer detached"
            );
            return remaining;
        }

        // Someone may have picked the session up since the removal; it then
        // stays registered and running for them
        if !registry.release_if_unobserved(&self.session) {
            let remaining = self.session.callback_count();
            debug!(
                project = %self.session.project(),
                terminal_id = %self.session.terminal_id(),
                remaining,
                "observer joined while the last one left, keeping terminal"
            );
            return remaining;
        }

        info!(
            project = %self.session.project(),
            terminal_id = %self.session.terminal_id(),
            "last observer left, stopping terminal"
        );
        self.session.stop().await;
        0
    }
}

impl Drop for TerminalObserver {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.session.remove_output_callback(id);
        }
    }
}
