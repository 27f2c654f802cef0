//! Error types for ESL operations

use thiserror::Error;

use crate::response::RawResponse;

/// Result alias used throughout the crate.
pub type EslResult<T> = Result<T, EslError>;

/// Main error type for the crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EslError {
    /// The connection has been torn down; response sinks are gone.
    ///
    /// Any `send_command` waiting for a reply when teardown runs resolves
    /// to this, as does any operation attempted after close.
    #[error("connection closed")]
    ConnectionClosed,

    /// A bounded exchange (auth, connect, exit, or a caller-applied
    /// command timeout) did not complete in time. The connection itself
    /// remains usable unless the caller closes it.
    #[error("timed out after {timeout_ms}ms")]
    Timeout {
        /// Milliseconds waited before giving up.
        timeout_ms: u64,
    },

    /// FreeSWITCH rejected our `auth` command.
    #[error("failed to auth {response:?}")]
    AuthFailed {
        /// The reply that was not `+OK`.
        response: RawResponse,
    },

    /// Malformed record: bad MIME header line, invalid Content-Length,
    /// non-UTF-8 payload, or an unsupported frame kind on a message
    /// transport.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the violation.
        message: String,
    },

    /// A record arrived whose Content-Type matches no response sink.
    #[error("no response sink for Content-Type: {content_type}")]
    UnknownContentType {
        /// The unrecognized Content-Type value.
        content_type: String,
    },

    /// IO error from the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON event body failed to parse.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// XML event body failed to parse.
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
}

impl EslError {
    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a timeout error from a duration.
    pub fn timeout(waited: std::time::Duration) -> Self {
        Self::Timeout {
            timeout_ms: waited.as_millis() as u64,
        }
    }

    /// Returns `true` if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
