use thiserror::Error;

/// Failures decoding a client frame. Always recoverable: the connection
/// reports them as an `error` event and keeps reading.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("Unsupported frame: {0}")]
    Unsupported(&'static str),
}
