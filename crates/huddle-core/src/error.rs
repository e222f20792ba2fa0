use thiserror::Error;

/// Envelope decoding and encoding failures. A decode failure is a protocol
/// violation: the frame is logged and dropped by the caller.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid envelope json: {0}")]
    Json(#[source] serde_json::Error),
    #[error("envelope has no type tag")]
    MissingType,
    #[error("malformed {kind} envelope: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} envelope carries an empty identity")]
    EmptyIdentity { kind: &'static str },
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("signaling channel is not open")]
    NotOpen,
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("signaling setup failed: {0}")]
    Setup(String),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// Failures reported by the negotiable-connection capability.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,
    #[error("description rejected: {0}")]
    Description(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("unsupported by connection backend: {0}")]
    Unsupported(String),
    #[error("connection backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("local media unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("already in a call")]
    AlreadyInCall,
    #[error("call task stopped")]
    Stopped,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Media(#[from] MediaError),
}
