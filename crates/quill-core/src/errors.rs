use std::time::Duration;

/// Failures of the foundation-model endpoint.
/// All of them are fatal to the current request; the engine never retries.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model unavailable: {0}")]
    Unavailable(String),
    #[error("model timed out after {0:?}")]
    Timeout(Duration),
    #[error("generation cancelled")]
    Cancelled,
}

impl ModelError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "model_unavailable",
            Self::Timeout(_) => "model_timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status code returned by a model endpoint.
    pub fn from_status(status: u16, body: String, timeout: Duration) -> Self {
        match status {
            408 | 504 => Self::Timeout(timeout),
            _ => Self::Unavailable(format!("status {status}: {body}")),
        }
    }
}

/// Failures of the outbound connection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("response metadata already sent")]
    AlreadyOpen,
    #[error("write before response metadata was sent")]
    NotOpen,
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("transport io error: {0}")]
    Io(String),
}

impl TransportError {
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

/// Failures of the external conversation store.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("conversation not found: {0}")]
    NotFound(String),
    #[error("conversation store error: {0}")]
    Backend(String),
}
