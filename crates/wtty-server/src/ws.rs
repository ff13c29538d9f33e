//! WebSocket bridge: one connection, one attachment, one session.
//!
//! Frame contract (shared with the browser client):
//!   - binary client→server: raw terminal input
//!   - text client→server: JSON control (`resize`, `ping`)
//!   - binary server→client: raw terminal output
//!   - text server→client: JSON control (`session`, `exit`, `pong`)

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};
use wtty_core::ControlMsg;

use crate::motd;
use crate::registry::{CreateParams, SessionRegistry};
use crate::session::{Outbound, TerminalSession};

#[derive(Debug, Deserialize)]
pub struct AttachQuery {
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub cmd: Option<String>,
}

/// `GET /ws` — create a fresh session and attach to it.
pub async fn attach_new(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<SessionRegistry>>,
    Query(query): Query<AttachQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(registry, None, query, addr, socket))
}

/// `GET /ws/{session_id}` — attach to an existing session, or create a new
/// one when the id does not resolve.
pub async fn attach_existing(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<SessionRegistry>>,
    Path(session_id): Path<String>,
    Query(query): Query<AttachQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(registry, Some(session_id), query, addr, socket))
}

async fn handle_socket(
    registry: Arc<SessionRegistry>,
    requested_id: Option<String>,
    query: AttachQuery,
    addr: SocketAddr,
    socket: WebSocket,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let params = CreateParams { cols: query.cols, rows: query.rows, cmd: query.cmd };
    let (session, created) = match registry.resolve_or_create(requested_id.as_deref(), &params) {
        Ok(resolved) => resolved,
        Err(e) => {
            // The session never ran; tell the client it is over and hang up.
            warn!(error = %e, "session creation failed");
            if let Ok(text) = ControlMsg::Exit.encode() {
                let _ = ws_tx.send(Message::Text(text)).await;
            }
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };

    if created {
        // Let the client put the session id in its URL for reconnects.
        if let Ok(text) = (ControlMsg::Session { id: session.id().to_string() }).encode() {
            if ws_tx.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        let banner = motd::render(registry.settings(), &addr.to_string());
        if !banner.is_empty() && ws_tx.send(Message::Binary(banner)).await.is_err() {
            return;
        }
    }

    let (client_id, mut outbound_rx) = session.attach();
    debug!(session_id = %session.id(), client_id, remote = %addr, created, "bridge open");

    loop {
        tokio::select! {
            item = outbound_rx.recv() => {
                if !forward_outbound(&mut ws_tx, item).await {
                    break;
                }
            }
            msg = ws_rx.next() => {
                if !handle_incoming(&session, &mut ws_tx, msg).await {
                    break;
                }
            }
        }
    }

    session.detach(client_id);
    registry.remove_if_drained(session.id());
    debug!(session_id = %session.id(), client_id, "bridge closed");
}

/// Deliver one queued item to the client. Returns false when the loop
/// should end (send error, shutdown marker, or queue gone).
async fn forward_outbound(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    item: Option<Outbound>,
) -> bool {
    match item {
        Some(Outbound::Data(bytes)) => ws_tx.send(Message::Binary(bytes)).await.is_ok(),
        Some(Outbound::Control(msg)) => match msg.encode() {
            Ok(text) => ws_tx.send(Message::Text(text)).await.is_ok(),
            Err(_) => true,
        },
        Some(Outbound::Shutdown) => {
            let _ = ws_tx.send(Message::Close(None)).await;
            false
        }
        // Queue dropped: the session decided we are too slow, or is gone.
        None => false,
    }
}

/// Process one frame from the client. Returns false when the connection is
/// finished.
async fn handle_incoming(
    session: &Arc<TerminalSession>,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    msg: Option<Result<Message, axum::Error>>,
) -> bool {
    match msg {
        Some(Ok(Message::Binary(input))) => {
            session.send_input(&input).await;
            true
        }
        Some(Ok(Message::Text(text))) => {
            match ControlMsg::decode(&text) {
                Some(ControlMsg::Resize { cols, rows }) if cols > 0 && rows > 0 => {
                    session.request_resize(cols, rows);
                }
                Some(ControlMsg::Ping) => {
                    if let Ok(pong) = ControlMsg::Pong.encode() {
                        let _ = ws_tx.send(Message::Text(pong)).await;
                    }
                }
                // Zero-sized resizes, unknown types, and malformed JSON are
                // all dropped for forward compatibility.
                _ => {}
            }
            true
        }
        Some(Ok(Message::Ping(_) | Message::Pong(_))) => true,
        Some(Ok(Message::Close(_))) | None => false,
        Some(Err(e)) => {
            debug!(error = %e, "websocket receive error");
            false
        }
    }
}
