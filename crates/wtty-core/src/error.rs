use thiserror::Error;

/// Errors produced by the wtty session engine.
#[derive(Debug, Error)]
pub enum WttyError {
    #[error("failed to spawn child process: {0}")]
    Spawn(String),

    #[error("pty i/o error: {0}")]
    PtyIo(String),

    #[error("client connection error: {0}")]
    Client(String),

    #[error("malformed control message: {0}")]
    Codec(String),

    #[error("session log error: {0}")]
    Logger(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type WttyResult<T> = Result<T, WttyError>;
