//! Network error types

use std::io;

use crate::protocol::ErrorKind;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Storage error: {0}")]
    Storage(#[from] platewise_core::Error),

    #[error("Request timed out")]
    Timeout,

    /// An authorized call was attempted without a session token
    #[error("Not signed in")]
    NotSignedIn,

    /// The server answered with an error reply
    #[error("Server error ({kind:?}): {message}")]
    Remote { kind: ErrorKind, message: String },
}

impl Error {
    /// Rejected for a missing or expired session
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Error::Remote {
                kind: ErrorKind::Unauthorized,
                ..
            }
        )
    }
}
