//! A terminal session: one PTY shared by any number of clients.
//!
//! A single output pump drains the PTY capture channel. For every chunk it
//! writes the session log, appends to the replay history, and enqueues the
//! chunk onto each attached client's bounded queue — all under one short
//! lock, which is the same lock `attach` takes to snapshot history and
//! register. That ordering is what makes the replay a gapless prefix of the
//! live stream.
//!
//! A client whose queue is full is dropped on the spot: a slow viewer must
//! never stall the pump, the child process, or the other viewers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wtty_core::ControlMsg;
use wtty_core::WttyResult;

use crate::history::HistoryBuffer;
use crate::logger::SessionLogger;
use crate::pty::{PtyProcess, SpawnOptions};

/// Per-client outbound queue depth, in chunks.
const CLIENT_QUEUE_CAPACITY: usize = 128;

/// Items delivered to an attached client, in order.
#[derive(Debug)]
pub enum Outbound {
    /// Raw terminal bytes (a binary frame on the wire).
    Data(Vec<u8>),
    /// A control message (a text frame on the wire).
    Control(ControlMsg),
    /// The server is done with this client; close after sending.
    Shutdown,
}

/// Session lifecycle. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Exec in flight, pump not yet running.
    Starting,
    /// Pump active, child running.
    Running,
    /// Child reaped, pump drained.
    Exited,
    /// Exited with no clients left; eligible for registry eviction.
    Drained,
}

struct ClientAttachment {
    tx: mpsc::Sender<Outbound>,
    attached_at: Instant,
}

struct SessionInner {
    clients: HashMap<u64, ClientAttachment>,
    history: HistoryBuffer,
    state: SessionState,
    next_client_id: u64,
}

pub struct TerminalSession {
    id: String,
    created: DateTime<Utc>,
    command: Option<String>,
    pty: PtyProcess,
    inner: Mutex<SessionInner>,
}

impl TerminalSession {
    /// Spawn the PTY and build the session. The caller must hand the
    /// returned receiver to [`TerminalSession::run_pump`].
    pub fn spawn(
        id: String,
        opts: &SpawnOptions,
        history_size: usize,
    ) -> WttyResult<(std::sync::Arc<Self>, mpsc::Receiver<Vec<u8>>)> {
        let (pty, output_rx) = PtyProcess::spawn(opts)?;
        let session = std::sync::Arc::new(Self {
            id,
            created: Utc::now(),
            command: opts.command.clone(),
            pty,
            inner: Mutex::new(SessionInner {
                clients: HashMap::new(),
                history: HistoryBuffer::new(history_size),
                state: SessionState::Starting,
                next_client_id: 0,
            }),
        });
        Ok((session, output_rx))
    }

    /// The output pump. Runs until the PTY reports EOF, then reaps the
    /// child, closes the log, and notifies every client. `on_drained` fires
    /// if the session has no clients left at that point; later detaches
    /// fire it through the connection handlers.
    pub async fn run_pump(
        self: std::sync::Arc<Self>,
        mut output_rx: mpsc::Receiver<Vec<u8>>,
        mut logger: Option<SessionLogger>,
        on_drained: impl FnOnce(&str),
    ) {
        if let Some(l) = logger.as_mut() {
            l.open().await;
        }
        self.lock().state = SessionState::Running;
        info!(session_id = %self.id, pid = self.pty.pid(), "session running");

        while let Some(chunk) = output_rx.recv().await {
            if let Some(l) = logger.as_mut() {
                l.write(&chunk).await;
            }
            self.broadcast(chunk);
        }

        // EOF on the master: the child is gone. Reap it here so fd state
        // and process state stay in step.
        self.pty.terminate().await;
        if let Some(l) = logger.as_mut() {
            l.close().await;
        }
        if self.mark_exited() {
            on_drained(&self.id);
        }
    }

    /// Register a client. The first queued item is the history snapshot;
    /// everything after is live output in PTY order. Attaching to an
    /// already-exited session also queues the exit notice and a close.
    pub fn attach(&self) -> (u64, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        let mut inner = self.lock();

        let snapshot = inner.history.snapshot();
        if !snapshot.is_empty() {
            let _ = tx.try_send(Outbound::Data(snapshot));
        }
        if matches!(inner.state, SessionState::Exited | SessionState::Drained) {
            let _ = tx.try_send(Outbound::Control(ControlMsg::Exit));
            let _ = tx.try_send(Outbound::Shutdown);
        }

        let client_id = inner.next_client_id;
        inner.next_client_id += 1;
        inner.clients.insert(client_id, ClientAttachment { tx, attached_at: Instant::now() });
        debug!(session_id = %self.id, client_id, total = inner.clients.len(), "client attached");
        (client_id, rx)
    }

    /// Remove a client; queued-but-unsent output to it is dropped.
    /// Idempotent. Returns true if this detach drained the session.
    pub fn detach(&self, client_id: u64) -> bool {
        let mut inner = self.lock();
        if let Some(client) = inner.clients.remove(&client_id) {
            debug!(
                session_id = %self.id,
                client_id,
                connected_secs = client.attached_at.elapsed().as_secs(),
                total = inner.clients.len(),
                "client detached"
            );
        }
        if inner.state == SessionState::Exited && inner.clients.is_empty() {
            inner.state = SessionState::Drained;
            return true;
        }
        false
    }

    /// Forward client input to the PTY.
    pub async fn send_input(&self, data: &[u8]) {
        self.pty.write(data).await;
    }

    /// Apply a window-size request. Last writer wins; there is no
    /// arbitration between competing clients.
    pub fn request_resize(&self, cols: u16, rows: u16) {
        self.pty.resize(cols, rows);
    }

    /// Terminate the child process (used at server shutdown). The pump
    /// observes the resulting EOF and finishes the session normally.
    pub async fn close(&self) {
        self.pty.terminate().await;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn is_alive(&self) -> bool {
        self.pty.is_alive()
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_drained(&self) -> bool {
        self.lock().state == SessionState::Drained
    }

    /// Fan one output chunk out to every client. Clients whose queue is
    /// full are disconnected rather than awaited.
    fn broadcast(&self, chunk: Vec<u8>) {
        let mut inner = self.lock();
        inner.history.append(&chunk);

        let mut dropped = Vec::new();
        for (&client_id, client) in &inner.clients {
            match client.tx.try_send(Outbound::Data(chunk.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session_id = %self.id, client_id, "slow client, dropping connection");
                    dropped.push(client_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(client_id),
            }
        }
        for client_id in dropped {
            inner.clients.remove(&client_id);
        }
    }

    /// Enter Exited: notify every client and tell them to close. Returns
    /// true if the session is already drained.
    fn mark_exited(&self) -> bool {
        let mut inner = self.lock();
        inner.state = SessionState::Exited;
        info!(session_id = %self.id, status = ?self.pty.exit_status(), "session exited");

        let mut dropped = Vec::new();
        for (&client_id, client) in &inner.clients {
            if client.tx.try_send(Outbound::Control(ControlMsg::Exit)).is_err()
                || client.tx.try_send(Outbound::Shutdown).is_err()
            {
                dropped.push(client_id);
            }
        }
        for client_id in dropped {
            inner.clients.remove(&client_id);
        }

        if inner.clients.is_empty() {
            inner.state = SessionState::Drained;
            true
        } else {
            false
        }
    }

    // A poisoned lock only means another thread panicked mid-update of
    // plain collections; the data itself stays coherent.
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
