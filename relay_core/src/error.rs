//! Relay error types.

use std::fmt;

use thiserror::Error;

/// One of the two roles attached to a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Party {
    Sender,
    Receiver,
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::Sender => f.write_str("sender"),
            Party::Receiver => f.write_str("receiver"),
        }
    }
}

/// Errors reported to the caller of a relay operation.
///
/// The terminal outcome of a transfer is recorded on the session and handed
/// to both parties, so this type is `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// Freshly issued token collided with a live session
    #[error("token already in use")]
    DuplicateToken,

    /// Token was never issued or its transfer already concluded
    #[error("unknown token")]
    UnknownToken,

    /// The role was already taken on this token
    #[error("{0} already attached")]
    AlreadyAttached(Party),

    /// I/O failure while copying, on either side
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// A party disconnected before the transfer concluded
    #[error("{0} disconnected")]
    Cancelled(Party),

    /// Session was evicted after sitting idle past the configured lifetime
    #[error("session expired")]
    Expired,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            RelayError::AlreadyAttached(Party::Sender).to_string(),
            "sender already attached"
        );
        assert_eq!(
            RelayError::Cancelled(Party::Receiver).to_string(),
            "receiver disconnected"
        );
        assert_eq!(
            RelayError::TransferFailed("receiver sink: broken pipe".into()).to_string(),
            "transfer failed: receiver sink: broken pipe"
        );
    }
}
