// Error taxonomy shared by every layer of the peer client

use crate::consensus::ValidationError;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Buffer too short, bad varint, bad checksum or otherwise undecodable bytes.
    #[error("malformed encoding: {0}")]
    MalformedEncoding(String),

    /// Well-formed but semantically invalid data, e.g. an oversized address list.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Could not connect or complete the handshake. Retry later.
    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    /// The connection failed while the read loop was running. Retry later.
    #[error("peer disconnected: {0}")]
    PeerDisconnected(String),

    /// No wallet key controls the output an input spends.
    #[error("no key in wallet for public key hash {0}")]
    KeyNotFound(String),

    /// API misuse, e.g. signing an input whose script is already set.
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    /// A decoded block failed structural checks.
    #[error("block validation failed: {0}")]
    BlockValidationFailure(#[from] ValidationError),

    #[error("block store error: {0}")]
    BlockStore(String),

    #[error("insufficient funds: have {available}, need {needed}")]
    InsufficientFunds { available: u64, needed: u64 },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("wallet file error: {0}")]
    WalletFile(String),
}

impl Error {
    /// Errors confined to a single inbound message. The read loop logs these and keeps going.
    pub fn is_message_local(&self) -> bool {
        matches!(
            self,
            Error::MalformedEncoding(_) | Error::ProtocolViolation(_) | Error::BlockValidationFailure(_)
        )
    }

    /// Transport-level conditions the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::PeerUnavailable(_) | Error::PeerDisconnected(_))
    }

    pub(crate) fn malformed(what: impl Into<String>) -> Self {
        Error::MalformedEncoding(what.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::malformed("short").is_message_local());
        assert!(Error::ProtocolViolation("big".into()).is_message_local());
        assert!(Error::from(ValidationError::NoTransactions).is_message_local());
        assert!(!Error::PeerDisconnected("eof".into()).is_message_local());

        assert!(Error::PeerUnavailable("refused".into()).is_retryable());
        assert!(!Error::KeyNotFound("00".into()).is_retryable());
    }
}
