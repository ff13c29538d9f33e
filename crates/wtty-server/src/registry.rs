//! Name service and lifetime arbiter for terminal sessions.
//!
//! The registry is the single writer of the id → session map. A session is
//! evicted only once its child has exited and its last client has detached.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rand::RngCore;
use tracing::info;
use wtty_core::WttyResult;

use crate::config::Settings;
use crate::logger::SessionLogger;
use crate::pty::SpawnOptions;
use crate::session::TerminalSession;

/// Per-connection parameters for session creation. Ignored when the
/// requested id resolves to an existing session: the command and size are
/// fixed at creation.
#[derive(Debug, Clone, Default)]
pub struct CreateParams {
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub cmd: Option<String>,
}

/// One row of `list()` output.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub created: DateTime<Utc>,
    pub clients: usize,
    pub alive: bool,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<TerminalSession>>>,
    settings: Settings,
}

impl SessionRegistry {
    pub fn new(settings: Settings) -> Arc<Self> {
        Arc::new(Self { sessions: Mutex::new(HashMap::new()), settings })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Return the session for `requested_id`, or create a fresh one when the
    /// id is absent or does not resolve. The boolean is true for a fresh
    /// session.
    pub fn resolve_or_create(
        self: &Arc<Self>,
        requested_id: Option<&str>,
        params: &CreateParams,
    ) -> WttyResult<(Arc<TerminalSession>, bool)> {
        if let Some(id) = requested_id.filter(|id| !id.is_empty()) {
            if let Some(session) = self.get(id) {
                return Ok((session, false));
            }
        }
        Ok((self.create(params)?, true))
    }

    fn create(self: &Arc<Self>, params: &CreateParams) -> WttyResult<Arc<TerminalSession>> {
        let id = self.fresh_id();

        // Per-session command wins over the globally configured one.
        let command = params
            .cmd
            .clone()
            .filter(|c| !c.trim().is_empty())
            .or_else(|| self.settings.cmd.clone());
        let opts = SpawnOptions {
            command,
            shell: self.settings.shell.clone(),
            term: self.settings.term.clone(),
            cols: params.cols.unwrap_or(self.settings.default_cols),
            rows: params.rows.unwrap_or(self.settings.default_rows),
        };

        let (session, output_rx) =
            TerminalSession::spawn(id.clone(), &opts, self.settings.history_size)?;

        let logger = self
            .settings
            .log_enabled
            .then(|| SessionLogger::new(self.settings.log_dir.clone(), id.clone()));

        // Register before the pump starts: a command that exits immediately
        // with no clients must still find its entry to evict.
        self.lock().insert(id.clone(), session.clone());

        let registry = Arc::clone(self);
        tokio::spawn(session.clone().run_pump(output_rx, logger, move |sid| {
            registry.remove_if_drained(sid);
        }));

        info!(session_id = %id, command = ?session.command(), "session created");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.lock().get(id).cloned()
    }

    /// Enumerate sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut rows: Vec<SessionInfo> = self
            .lock()
            .values()
            .map(|s| SessionInfo {
                id: s.id().to_string(),
                created: s.created_at(),
                clients: s.client_count(),
                alive: s.is_alive(),
            })
            .collect();
        rows.sort_by_key(|r| r.created);
        rows
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Evict the session if it has fully drained (child dead, no clients).
    /// Called by connection handlers after a detach and by the pump when a
    /// session exits with nobody attached.
    pub fn remove_if_drained(&self, id: &str) {
        let mut sessions = self.lock();
        let drained = sessions.get(id).is_some_and(|s| s.is_drained());
        if drained {
            sessions.remove(id);
            info!(session_id = %id, remaining = sessions.len(), "session removed");
        }
    }

    /// Terminate every session (process shutdown). The pumps finish the
    /// per-session teardown.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<TerminalSession>> = self.lock().values().cloned().collect();
        info!(count = sessions.len(), "shutting down sessions");
        for session in sessions {
            session.close().await;
        }
    }

    /// A fresh id: 8 random bytes, hex-encoded.
    fn fresh_id(&self) -> String {
        loop {
            let mut bytes = [0u8; 8];
            rand::thread_rng().fill_bytes(&mut bytes);
            let id = hex::encode(bytes);
            if !self.lock().contains_key(&id) {
                return id;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<TerminalSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
