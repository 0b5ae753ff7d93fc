use thiserror::Error;

/// Failure to turn raw register words into a physical value. Always scoped to
/// a single field; the rest of the poll carries on.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("expected {expected} register word(s), got {got}")]
    WordCount { expected: usize, got: usize },

    #[error("invalid scale factor {0}")]
    InvalidScale(f64),
}

/// Errors from the remote store, split by how far they reach.
///
/// `Connection` means the store cannot be used at all (unreachable, no
/// credentials, credentials refused) and aborts a whole sync pass.
/// `Rejected` is specific to one row and only skips that row.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote store unavailable: {0}")]
    Connection(String),

    #[error("remote store rejected row: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_connection(&self) -> bool {
        matches!(self, RemoteError::Connection(_))
    }
}
