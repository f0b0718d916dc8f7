use thiserror::Error;

/// Errors raised by transport adapters and the send path.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open the channel: {0}")]
    ConnectFailed(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors surfaced to a scope-fetch caller.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The server replied with `result = false`.
    #[error("scope fetch rejected: {message} (code {code})")]
    Rejected { code: i64, message: String },

    #[error("connection lost before the reply arrived")]
    ConnectionLost,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors surfaced by top-level client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is closed")]
    Closed,

    #[error("no active session")]
    NoSession,

    #[error(transparent)]
    Fetch(#[from] FetchError),
}
