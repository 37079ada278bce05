//! Error types for the wire codec and address parsing.

/// Errors raised while framing or decoding a ring message.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds the {1} byte limit")]
    TooLarge(usize, usize),

    #[error("malformed message: {0}")]
    Malformed(String),

    /// The message decoded as JSON but its type tag is not one we know.
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AddressParseError {
    #[error("expected host:port, got {0:?}")]
    MissingPort(String),

    #[error("invalid port in {0:?}")]
    InvalidPort(String),
}
