/// Failure taxonomy for the ingestion pipeline.
///
/// Only `BadRequest` is ever visible to the peer (as an HTTP 400). Everything
/// else is handled inside the session and reported through logs and metrics.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("transport aborted: {0}")]
    TransportAborted(String),

    #[error("persistence failed: {0}")]
    PersistenceFailure(String),

    #[error("decode failed: {0}")]
    DecodeFailure(String),
}

impl IngestError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::TransportAborted(_) => "transport_aborted",
            Self::PersistenceFailure(_) => "persistence_failure",
            Self::DecodeFailure(_) => "decode_failure",
        }
    }
}

/// Errors surfaced by a transport half.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection reset: {0}")]
    Reset(String),

    #[error("connection closed")]
    Closed,
}

impl From<TransportError> for IngestError {
    fn from(e: TransportError) -> Self {
        IngestError::TransportAborted(e.to_string())
    }
}

/// Diagnostic decode failure. Never affects durability.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated input at byte {offset}")]
    Truncated { offset: usize },

    #[error("malformed input at byte {offset}: {detail}")]
    Malformed { offset: usize, detail: String },

    #[error("decoder panicked: {0}")]
    Panicked(String),
}

impl From<DecodeError> for IngestError {
    fn from(e: DecodeError) -> Self {
        IngestError::DecodeFailure(e.to_string())
    }
}
