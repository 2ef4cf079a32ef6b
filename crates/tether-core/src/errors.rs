//! Error types for the wire layer and command dispatch.
//!
//! The protocol loop distinguishes ignorable faults (malformed text,
//! unsupported frame kinds) from session-fatal ones (transport I/O,
//! binary corruption, handler failures). The ignorable cases never
//! surface as `WireError` — they are converted to protocol-level
//! error responses or dropped before reaching this type.

/// Faults in framing, codec, or transport I/O. All of these end the
/// session when they escape the protocol loop.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("json codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("gzip: {0}")]
    Compression(#[from] std::io::Error),

    #[error("transport: {0}")]
    Transport(String),

    /// The remote peer closed, or the socket is no longer writable.
    #[error("connection closed")]
    Closed,

    /// Shutdown fired mid-operation.
    #[error("cancelled")]
    Cancelled,
}

impl WireError {
    /// True for the terminations that are part of normal lifecycle
    /// rather than faults worth a warning.
    pub fn is_expected_shutdown(&self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled)
    }
}

/// Failure raised by command handler execution. Deliberately not
/// caught by the router — it propagates to the protocol loop, which
/// tears the connection down.
#[derive(Debug, thiserror::Error)]
#[error("command handler failed: {0}")]
pub struct CommandError(pub String);

impl CommandError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}
