//! Error types for the AS2 gateway

use thiserror::Error;

use crate::as2::TransportError;
use crate::crypto::CryptoError;

/// Errors that can occur in the gateway
#[derive(Error, Debug)]
pub enum As2Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Signing, encryption or key failure
    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    /// Algorithm outside the configured allow-list
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Corrupt compressed content
    #[error("compression error: {0}")]
    Compression(String),

    /// Partner endpoint failure (non-2xx or connection)
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// Partner did not answer before the deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// MDN could not be verified
    #[error("MDN verification failed: {0}")]
    MdnVerification(String),

    /// Invalid input
    #[error("validation error: {0}")]
    Validation(String),

    /// Partner or certificate setup prevents the operation
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("partner not found: {0}")]
    PartnerNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("certificate not found: {0}")]
    CertificateNotFound(String),

    /// Unique key (AS2 id, certificate serial or fingerprint) already taken
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Transition outside the state graph
    #[error("invalid state transition for message {message_id}: {from} -> {to}")]
    InvalidStateTransition {
        message_id: String,
        from: String,
        to: String,
    },

    /// Persisted state changed underneath a compare-and-set
    #[error("concurrent modification of message {message_id}: expected state {expected}")]
    ConcurrentModification {
        message_id: String,
        expected: String,
    },

    /// Another task is already working on the message
    #[error("message busy: {0}")]
    MessageBusy(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl As2Error {
    /// Whether the failure may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            As2Error::Transport(_) | As2Error::Timeout(_) | As2Error::MdnVerification(_)
        )
    }

    /// Whether the failure sends a message straight to `failed`
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            As2Error::Crypto(_)
                | As2Error::UnsupportedAlgorithm(_)
                | As2Error::Compression(_)
                | As2Error::Configuration(_)
        )
    }
}

impl From<CryptoError> for As2Error {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::UnsupportedAlgorithm(msg) => As2Error::UnsupportedAlgorithm(msg),
            CryptoError::Compression(msg) => As2Error::Compression(msg),
            other => As2Error::Crypto(other),
        }
    }
}

impl From<TransportError> for As2Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(after) => {
                As2Error::Timeout(format!("no response after {}s", after.as_secs()))
            }
            other => As2Error::Transport(other),
        }
    }
}

impl From<serde_json::Error> for As2Error {
    fn from(err: serde_json::Error) -> Self {
        As2Error::Internal(err.to_string())
    }
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, As2Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn retry_taxonomy() {
        assert!(As2Error::from(TransportError::Timeout(Duration::from_secs(5))).is_retryable());
        assert!(As2Error::from(TransportError::Http {
            status: 503,
            body: String::new()
        })
        .is_retryable());
        assert!(As2Error::MdnVerification("malformed".into()).is_retryable());

        let crypto = As2Error::from(CryptoError::Decryption("bad".into()));
        assert!(crypto.is_fatal());
        assert!(!crypto.is_retryable());

        assert!(matches!(
            As2Error::from(CryptoError::UnsupportedAlgorithm("md5".into())),
            As2Error::UnsupportedAlgorithm(_)
        ));
        assert!(As2Error::Configuration("no cert".into()).is_fatal());
        assert!(!As2Error::MessageBusy("m".into()).is_fatal());
    }
}
