use thiserror::Error;

/// Convenience alias for fallible engine operations.
pub type NetResult<T> = Result<T, NetError>;

/// Error taxonomy of the engine.
///
/// Every variant is recoverable: the operation that produced it leaves the
/// net in the consistent state it had before the call.
#[derive(Debug, Error)]
pub enum NetError {
    /// A request contradicts the declared shape of the net: unknown node
    /// type, unknown gate or slot for a type, malformed parameter value.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Backing arrays could not be grown to the requested size.
    #[error("capacity error: {0}")]
    Capacity(String),

    /// Malformed uid, or a uid that does not name a live allocation.
    #[error("identifier error: {0}")]
    Identifier(String),

    /// Forbidden regardless of arguments, such as deleting the root
    /// nodespace.
    #[error("illegal operation: {0}")]
    Illegal(String),

    /// Saving or loading failed; in-memory state is unchanged.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> Self {
        NetError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for NetError {
    fn from(e: serde_json::Error) -> Self {
        NetError::Persistence(e.to_string())
    }
}

impl From<std::collections::TryReserveError> for NetError {
    fn from(e: std::collections::TryReserveError) -> Self {
        NetError::Capacity(e.to_string())
    }
}
