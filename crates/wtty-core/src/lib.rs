//! wtty-core: shared protocol library for the wtty web terminal.
//!
//! Provides the error taxonomy used across the server and the JSON control
//! messages exchanged with browser clients over the WebSocket text channel.

pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use error::{WttyError, WttyResult};
pub use messages::ControlMsg;
