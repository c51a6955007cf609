//! Key material and the private key store
//!
//! Signing keys are Ed25519; encryption keys are X25519 used as the HPKE KEM.
//! Certificates hold only the public halves; private keys are looked up by
//! certificate serial through a [`KeyStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hpke::{kem::X25519HkdfSha256, Deserializable, Kem, Serializable};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

#[cfg(test)]
use mockall::automock;

use super::{encode_bytes, CryptoError};
use crate::domain::{Certificate, CertificateOwner, CertificateUsage};

type HpkeKem = X25519HkdfSha256;

/// Domain prefix for certificate fingerprints
pub const DOMAIN_CERT_FINGERPRINT: &[u8] = b"AS2_CERT_FINGERPRINT_V1";

/// Ed25519 signing key
#[derive(Clone)]
pub struct SigningKeyPair {
    signing_key: SigningKey,
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

/// X25519 key pair used to unwrap content-encryption keys
#[derive(Clone)]
pub struct EncryptionKeyPair {
    private_key: [u8; 32],
    public_key: [u8; 32],
}

impl EncryptionKeyPair {
    pub fn generate() -> Self {
        let (sk, pk) = HpkeKem::gen_keypair(&mut OsRng);
        let mut private_key = [0u8; 32];
        let mut public_key = [0u8; 32];
        private_key.copy_from_slice(&sk.to_bytes());
        public_key.copy_from_slice(&pk.to_bytes());
        Self {
            private_key,
            public_key,
        }
    }

    pub fn from_bytes(private_key: &[u8; 32]) -> Result<Self, CryptoError> {
        let sk = <HpkeKem as Kem>::PrivateKey::from_bytes(private_key)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid X25519 private key: {e:?}")))?;
        let pk = HpkeKem::sk_to_pk(&sk);
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&pk.to_bytes());
        Ok(Self {
            private_key: *private_key,
            public_key,
        })
    }

    pub fn private_key(&self) -> &[u8; 32] {
        &self.private_key
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public_key
    }
}

impl std::fmt::Debug for EncryptionKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKeyPair")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature with a hex-encoded public key
pub fn verify_signature(
    public_key_hex: &str,
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let key = decode_public_key(public_key_hex)?;
    let verifying_key = VerifyingKey::from_bytes(&key)
        .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".to_string()))?;
    let signature = Signature::from_slice(signature)
        .map_err(|_| CryptoError::Signature("invalid signature encoding".to_string()))?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::Signature("signature verification failed".to_string()))
}

/// Decode a hex public key into 32 bytes
pub fn decode_public_key(hex_str: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = hex::decode(hex_str.trim().trim_start_matches("0x"))
        .map_err(|e| CryptoError::InvalidKey(format!("public key is not hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("public key must be 32 bytes".to_string()))
}

/// Compute a certificate fingerprint over its public key material
pub fn certificate_fingerprint(
    encryption_public_key: Option<&[u8]>,
    signing_public_key: Option<&[u8]>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_CERT_FINGERPRINT);
    hasher.update(encode_bytes(encryption_public_key.unwrap_or_default()));
    hasher.update(encode_bytes(signing_public_key.unwrap_or_default()));
    hex::encode(hasher.finalize())
}

/// Parse a 32-byte key from hex (optionally `0x`-prefixed) or base64
pub fn parse_32_byte_key(s: &str) -> Result<[u8; 32], CryptoError> {
    let trimmed = s.trim();
    let hex_str = trimmed.strip_prefix("0x").unwrap_or(trimmed);

    if hex_str.len() == 64 && hex_str.chars().all(|c| c.is_ascii_hexdigit()) {
        let bytes =
            hex::decode(hex_str).map_err(|e| CryptoError::InvalidKey(format!("invalid hex: {e}")))?;
        return bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("key must be 32 bytes".to_string()));
    }

    let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, trimmed)
        .or_else(|_| {
            base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, trimmed)
        })
        .map_err(|e| CryptoError::InvalidKey(format!("invalid base64: {e}")))?;

    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("key must be 32 bytes".to_string()))
}

/// Private key lookup by certificate serial
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn signing_key(&self, serial: &str) -> Result<SigningKeyPair, CryptoError>;
    async fn encryption_key(&self, serial: &str) -> Result<EncryptionKeyPair, CryptoError>;
}

/// Process-local key store, used in tests and by the env loader
#[derive(Default)]
pub struct InMemoryKeyStore {
    signing: RwLock<HashMap<String, SigningKeyPair>>,
    encryption: RwLock<HashMap<String, EncryptionKeyPair>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_signing(&self, serial: impl Into<String>, key: SigningKeyPair) {
        self.signing.write().await.insert(serial.into(), key);
    }

    pub async fn insert_encryption(&self, serial: impl Into<String>, key: EncryptionKeyPair) {
        self.encryption.write().await.insert(serial.into(), key);
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn signing_key(&self, serial: &str) -> Result<SigningKeyPair, CryptoError> {
        self.signing
            .read()
            .await
            .get(serial)
            .cloned()
            .ok_or_else(|| CryptoError::KeyNotFound(serial.to_string()))
    }

    async fn encryption_key(&self, serial: &str) -> Result<EncryptionKeyPair, CryptoError> {
        self.encryption
            .read()
            .await
            .get(serial)
            .cloned()
            .ok_or_else(|| CryptoError::KeyNotFound(serial.to_string()))
    }
}

/// Key store populated from `AS2_SIGNING_KEY` / `AS2_ENCRYPTION_KEY`
pub struct EnvKeyStore {
    signing_serial: String,
    signing: SigningKeyPair,
    encryption_serial: String,
    encryption: EncryptionKeyPair,
}

impl EnvKeyStore {
    pub fn new(
        signing_serial: impl Into<String>,
        signing: SigningKeyPair,
        encryption_serial: impl Into<String>,
        encryption: EncryptionKeyPair,
    ) -> Self {
        Self {
            signing_serial: signing_serial.into(),
            signing,
            encryption_serial: encryption_serial.into(),
            encryption,
        }
    }

    /// Load both private keys and the serials they belong to from the environment
    pub fn from_env() -> Result<Self, CryptoError> {
        let var = |name: &str| {
            std::env::var(name).map_err(|_| CryptoError::InvalidKey(format!("{name} is not set")))
        };

        let signing = SigningKeyPair::from_bytes(&parse_32_byte_key(&var("AS2_SIGNING_KEY")?)?);
        let encryption =
            EncryptionKeyPair::from_bytes(&parse_32_byte_key(&var("AS2_ENCRYPTION_KEY")?)?)?;

        Ok(Self::new(
            var("AS2_SIGNING_CERT_SERIAL")?,
            signing,
            var("AS2_ENCRYPTION_CERT_SERIAL")?,
            encryption,
        ))
    }
}

#[async_trait]
impl KeyStore for EnvKeyStore {
    async fn signing_key(&self, serial: &str) -> Result<SigningKeyPair, CryptoError> {
        if serial == self.signing_serial {
            Ok(self.signing.clone())
        } else {
            Err(CryptoError::KeyNotFound(serial.to_string()))
        }
    }

    async fn encryption_key(&self, serial: &str) -> Result<EncryptionKeyPair, CryptoError> {
        if serial == self.encryption_serial {
            Ok(self.encryption.clone())
        } else {
            Err(CryptoError::KeyNotFound(serial.to_string()))
        }
    }
}

/// Parameters for minting a certificate record from local key material
#[derive(Debug, Clone)]
pub struct CertificateTemplate {
    pub serial: String,
    pub subject_dn: String,
    pub issuer_dn: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub owner: CertificateOwner,
}

/// Build a certificate record carrying the public halves of the given keys
pub fn issue_certificate(
    template: CertificateTemplate,
    encryption: Option<&EncryptionKeyPair>,
    signing: Option<&SigningKeyPair>,
    now: DateTime<Utc>,
) -> Result<Certificate, CryptoError> {
    let usage = match (encryption.is_some(), signing.is_some()) {
        (true, true) => CertificateUsage::Both,
        (true, false) => CertificateUsage::Encryption,
        (false, true) => CertificateUsage::Signing,
        (false, false) => {
            return Err(CryptoError::InvalidKey(
                "certificate needs at least one public key".to_string(),
            ))
        }
    };

    let enc_pk = encryption.map(|k| k.public_key_bytes());
    let sig_pk = signing.map(|k| k.public_key_bytes());

    Ok(Certificate {
        serial: template.serial,
        subject_dn: template.subject_dn,
        issuer_dn: template.issuer_dn,
        valid_from: template.valid_from,
        valid_to: template.valid_to,
        fingerprint: certificate_fingerprint(
            enc_pk.as_ref().map(|k| k.as_slice()),
            sig_pk.as_ref().map(|k| k.as_slice()),
        ),
        key_size_bits: 256,
        owner: template.owner,
        usage,
        encryption_public_key: enc_pk.map(hex::encode),
        signing_public_key: sig_pk.map(hex::encode),
        status_override: None,
        created_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_key_hex_and_base64() {
        let key = [7u8; 32];
        assert_eq!(parse_32_byte_key(&hex::encode(key)).unwrap(), key);
        assert_eq!(
            parse_32_byte_key(&format!("0x{}", hex::encode(key))).unwrap(),
            key
        );
        let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, key);
        assert_eq!(parse_32_byte_key(&b64).unwrap(), key);
        assert!(parse_32_byte_key("abcd").is_err());
    }

    #[test]
    fn sign_and_verify() {
        let key = SigningKeyPair::generate();
        let sig = key.sign(b"message");
        let pk = hex::encode(key.public_key_bytes());
        assert!(verify_signature(&pk, b"message", &sig).is_ok());
        assert!(matches!(
            verify_signature(&pk, b"tampered", &sig),
            Err(CryptoError::Signature(_))
        ));
    }

    #[test]
    fn encryption_key_round_trips_through_bytes() {
        let key = EncryptionKeyPair::generate();
        let restored = EncryptionKeyPair::from_bytes(key.private_key()).unwrap();
        assert_eq!(restored.public_key_bytes(), key.public_key_bytes());
    }

    #[test]
    fn fingerprint_depends_on_both_keys() {
        let a = certificate_fingerprint(Some(&[1u8; 32]), Some(&[2u8; 32]));
        let b = certificate_fingerprint(Some(&[1u8; 32]), None);
        let c = certificate_fingerprint(None, Some(&[1u8; 32]));
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn in_memory_store_lookup() {
        let store = InMemoryKeyStore::new();
        store.insert_signing("01", SigningKeyPair::generate()).await;
        assert!(store.signing_key("01").await.is_ok());
        assert!(matches!(
            store.encryption_key("01").await,
            Err(CryptoError::KeyNotFound(_))
        ));
    }

    #[test]
    fn issue_certificate_sets_usage() {
        let now = Utc::now();
        let template = CertificateTemplate {
            serial: "01".to_string(),
            subject_dn: "CN=us".to_string(),
            issuer_dn: "CN=us".to_string(),
            valid_from: now,
            valid_to: now + chrono::Duration::days(365),
            owner: CertificateOwner::Own,
        };
        let enc = EncryptionKeyPair::generate();
        let cert = issue_certificate(template.clone(), Some(&enc), None, now).unwrap();
        assert_eq!(cert.usage, CertificateUsage::Encryption);
        assert!(cert.signing_public_key.is_none());
        assert!(issue_certificate(template, None, None, now).is_err());
    }
}
