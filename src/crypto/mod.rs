//! Cryptographic building blocks for AS2 envelopes
//!
//! Provides:
//! - MIC computation and `Received-Content-MIC` rendering
//! - Ed25519 signing keys and X25519 (HPKE) encryption keys
//! - The sign-then-encrypt envelope codec

mod envelope;
mod keys;
mod mic;

pub use envelope::*;
pub use keys::*;
pub use mic::*;

/// Errors raised while building or opening envelopes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("envelope addressed to {actual}, expected {expected}")]
    WrongRecipient { expected: String, actual: String },

    #[error("signature error: {0}")]
    Signature(String),

    #[error("MIC mismatch: signed {signed}, computed {computed}")]
    MicMismatch { signed: String, computed: String },

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("no private key for certificate {0}")]
    KeyNotFound(String),
}

impl CryptoError {
    /// AS2 disposition modifier reported back to the sender
    pub fn disposition_modifier(&self) -> &'static str {
        match self {
            CryptoError::Decryption(_) | CryptoError::WrongRecipient { .. } => "decryption-failed",
            CryptoError::Signature(_) => "authentication-failed",
            CryptoError::MicMismatch { .. } => "integrity-check-failed",
            CryptoError::UnsupportedAlgorithm(_) => "insufficient-message-security",
            CryptoError::Compression(_) => "decompression-failed",
            CryptoError::Encryption(_)
            | CryptoError::Malformed(_)
            | CryptoError::InvalidKey(_)
            | CryptoError::KeyNotFound(_) => "unexpected-processing-error",
        }
    }
}

/// Encode a u32 as 4 bytes big-endian
#[inline]
pub fn u32_be(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

/// Length-prefixed string encoding used in signing preimages
pub fn encode_string(s: &str) -> Vec<u8> {
    encode_bytes(s.as_bytes())
}

/// Length-prefixed byte encoding used in signing preimages
pub fn encode_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(4 + bytes.len());
    result.extend_from_slice(&u32_be(bytes.len() as u32));
    result.extend_from_slice(bytes);
    result
}

/// Encode bytes as base64url without padding
pub fn base64_url_encode(data: &[u8]) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, data)
}

/// Decode base64url (with or without padding)
pub fn base64_url_decode(s: &str) -> Result<Vec<u8>, CryptoError> {
    base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, s)
        .or_else(|_| base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE, s))
        .map_err(|e| CryptoError::Malformed(format!("invalid base64url: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefix_is_big_endian() {
        assert_eq!(encode_string("ab"), vec![0, 0, 0, 2, b'a', b'b']);
        assert_eq!(encode_bytes(&[]), vec![0, 0, 0, 0]);
    }

    #[test]
    fn base64url_accepts_padding() {
        let data = b"hello world";
        let encoded = base64_url_encode(data);
        assert!(!encoded.contains('='));
        assert_eq!(base64_url_decode(&encoded).unwrap(), data);
        assert_eq!(base64_url_decode("aGk=").unwrap(), b"hi");
    }

    #[test]
    fn dispositions_cover_error_taxonomy() {
        assert_eq!(
            CryptoError::Decryption("x".into()).disposition_modifier(),
            "decryption-failed"
        );
        assert_eq!(
            CryptoError::UnsupportedAlgorithm("md5".into()).disposition_modifier(),
            "insufficient-message-security"
        );
        assert_eq!(
            CryptoError::Malformed("x".into()).disposition_modifier(),
            "unexpected-processing-error"
        );
    }
}
