/// Errors from the durable stream backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Backing store unreachable or closed. Transient; callers retry.
    #[error("stream backend unavailable")]
    Unavailable,

    /// Read against a consumer group that was never created.
    #[error("consumer group '{0}' does not exist")]
    UnknownGroup(String),
}

/// Errors from the persistence port.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Backend unreachable. Transient; the entry stays pending and is
    /// retried on redelivery.
    #[error("position store unavailable")]
    Unavailable,

    /// The backend refused the row.
    #[error("position rejected: {0}")]
    Rejected(String),
}

/// A stream entry that does not decode into a position report.
/// Never retried with backoff, never dead-lettered: the entry stays
/// pending and each occurrence is logged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing or empty field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' is not {expected}: {got}")]
    BadField {
        field: &'static str,
        expected: &'static str,
        got: String,
    },
}
