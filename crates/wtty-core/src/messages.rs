//! Control messages carried on the WebSocket text channel.
//!
//! Binary frames carry raw terminal bytes and never go through this module.
//! Text frames are JSON objects with a `type` discriminator. Unknown or
//! malformed messages are dropped by the receiver so that newer clients can
//! talk to older servers and vice versa.

use serde::{Deserialize, Serialize};

use crate::error::{WttyError, WttyResult};

/// A typed control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMsg {
    /// Server → client: the session id this connection is attached to.
    Session { id: String },
    /// Server → client: the session's child process has exited.
    Exit,
    /// Client → server: resize the terminal window.
    Resize { cols: u16, rows: u16 },
    /// Client → server keepalive.
    Ping,
    /// Server → client keepalive reply.
    Pong,
}

impl ControlMsg {
    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> WttyResult<String> {
        serde_json::to_string(self).map_err(|e| WttyError::Codec(e.to_string()))
    }

    /// Parse a received text frame.
    ///
    /// Returns `None` for anything that is not a known control message;
    /// callers ignore those frames.
    pub fn decode(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}
