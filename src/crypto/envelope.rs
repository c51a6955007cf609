//! Sign-then-encrypt AS2 envelope codec
//!
//! Encoding pipeline:
//! 1. Optional ZLIB compression of the payload
//! 2. MIC over the (possibly compressed) body
//! 3. Ed25519 signature over a domain-separated preimage of the signed entity
//! 4. AES-GCM content encryption with a random DEK, the DEK wrapped to the
//!    recipient with HPKE (DHKEM X25519-HKDF-SHA256, HKDF-SHA256, AES-256-GCM)
//!
//! The AEAD associated data binds the envelope version, the recipient
//! certificate fingerprint and the negotiated cipher, so an envelope cannot
//! be re-labelled for another recipient or downgraded.

use std::io::{Read, Write};

use aes_gcm::aead::{generic_array::GenericArray, Aead, KeyInit, Payload};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use hpke::{
    aead::AesGcm256, kdf::HkdfSha256, kem::X25519HkdfSha256, Deserializable, Kem, OpModeR, OpModeS,
    Serializable,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{
    base64_url_decode, base64_url_encode, compute_mic, decode_public_key, encode_bytes,
    encode_string, u32_be, verify_signature, CryptoError, EncryptionKeyPair, SigningKeyPair,
};
use crate::domain::{
    Certificate, CertificateUsage, EncryptionAlgorithm, MicAlgorithm, PartnerCryptoConfig,
};

type HpkeKem = X25519HkdfSha256;
type HpkeKdf = HkdfSha256;
type HpkeAead = AesGcm256;

/// Envelope wire format version
pub const ENVELOPE_VERSION: u32 = 1;

/// Domain prefix for the signed entity preimage
pub const DOMAIN_SIGNED_ENTITY: &[u8] = b"AS2_SIGNED_ENTITY_V1";

/// Domain prefix for the content-encryption AAD
pub const DOMAIN_ENVELOPE_AAD: &[u8] = b"AS2_ENVELOPE_AAD_V1";

/// Nonce size for AES-GCM (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// HPKE encapsulated key size for X25519
pub const HPKE_ENC_SIZE: usize = 32;

/// Upper bound on decompressed payload size
pub const MAX_DECOMPRESSED_SIZE: u64 = 64 * 1024 * 1024;

/// Ciphers and MIC algorithms this gateway will produce or accept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmPolicy {
    ciphers: Vec<EncryptionAlgorithm>,
    mic_algorithms: Vec<MicAlgorithm>,
}

impl Default for AlgorithmPolicy {
    fn default() -> Self {
        Self {
            ciphers: EncryptionAlgorithm::ALL.to_vec(),
            mic_algorithms: MicAlgorithm::ALL.to_vec(),
        }
    }
}

impl AlgorithmPolicy {
    pub fn new(ciphers: Vec<EncryptionAlgorithm>, mic_algorithms: Vec<MicAlgorithm>) -> Self {
        Self {
            ciphers,
            mic_algorithms,
        }
    }

    /// Parse comma-separated allow lists (`AS2_ALLOWED_CIPHERS`, `AS2_ALLOWED_MIC_ALGS`)
    pub fn parse(ciphers: &str, mic_algorithms: &str) -> Result<Self, CryptoError> {
        let ciphers = ciphers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<EncryptionAlgorithm>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CryptoError::UnsupportedAlgorithm(e.to_string()))?;
        let mic_algorithms = mic_algorithms
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<MicAlgorithm>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CryptoError::UnsupportedAlgorithm(e.to_string()))?;

        if ciphers.is_empty() || mic_algorithms.is_empty() {
            return Err(CryptoError::UnsupportedAlgorithm(
                "allow lists must not be empty".to_string(),
            ));
        }
        Ok(Self::new(ciphers, mic_algorithms))
    }

    pub fn allows_cipher(&self, cipher: EncryptionAlgorithm) -> bool {
        self.ciphers.contains(&cipher)
    }

    pub fn allows_mic(&self, alg: MicAlgorithm) -> bool {
        self.mic_algorithms.contains(&alg)
    }

    pub fn check_cipher(&self, cipher: EncryptionAlgorithm) -> Result<(), CryptoError> {
        if self.allows_cipher(cipher) {
            Ok(())
        } else {
            Err(CryptoError::UnsupportedAlgorithm(format!(
                "cipher {cipher} is not allowed"
            )))
        }
    }

    pub fn check_mic(&self, alg: MicAlgorithm) -> Result<(), CryptoError> {
        if self.allows_mic(alg) {
            Ok(())
        } else {
            Err(CryptoError::UnsupportedAlgorithm(format!(
                "MIC algorithm {alg} is not allowed"
            )))
        }
    }
}

/// Algorithm choices for one encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    pub cipher: EncryptionAlgorithm,
    pub mic_algorithm: MicAlgorithm,
    pub compress: bool,
}

impl From<&PartnerCryptoConfig> for EncodeOptions {
    fn from(config: &PartnerCryptoConfig) -> Self {
        Self {
            cipher: config.encryption,
            mic_algorithm: config.mic_algorithm,
            compress: config.compress,
        }
    }
}

/// Our signing identity: private key plus the fingerprint of its certificate
#[derive(Debug, Clone)]
pub struct SenderIdentity {
    pub signing_key: SigningKeyPair,
    pub certificate_fingerprint: String,
}

/// Our decryption identity: private key plus the fingerprint of its certificate
#[derive(Debug, Clone)]
pub struct RecipientIdentity {
    pub encryption_key: EncryptionKeyPair,
    pub certificate_fingerprint: String,
}

/// Result of encoding a payload
#[derive(Debug, Clone)]
pub struct EncodedEnvelope {
    pub bytes: Vec<u8>,
    /// Base64 MIC over the signed body
    pub mic: String,
    pub mic_algorithm: MicAlgorithm,
    pub compressed: bool,
    /// Serial of the recipient certificate the envelope was built for
    pub recipient_serial: String,
}

/// Result of opening an envelope
#[derive(Debug, Clone)]
pub struct DecodedPayload {
    pub payload: Vec<u8>,
    pub content_type: String,
    pub compressed: bool,
    pub mic: String,
    pub mic_algorithm: MicAlgorithm,
    /// Exact bytes the MIC was computed over
    pub signed_body: Vec<u8>,
    pub signer_fingerprint: String,
}

/// Encrypted envelope as carried on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeDocument {
    pub version: u32,
    pub cipher: String,
    pub recipient_fingerprint: String,
    /// HPKE encapsulated key (base64url)
    pub enc: String,
    /// HPKE-sealed DEK (base64url)
    pub wrapped_dek: String,
    pub nonce: String,
    pub ciphertext: String,
}

/// Signed inner entity
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignedEntity {
    content_type: String,
    compressed: bool,
    mic_algorithm: MicAlgorithm,
    mic: String,
    signer_fingerprint: String,
    body: String,
    signature: String,
}

/// Sign and encrypt `payload` for `recipient`.
///
/// Fails with `UnsupportedAlgorithm` when the options fall outside `policy`
/// and with `InvalidKey` when the recipient certificate has no usable
/// encryption key.
pub fn encode(
    payload: &[u8],
    content_type: &str,
    options: EncodeOptions,
    sender: &SenderIdentity,
    recipient: &Certificate,
    policy: &AlgorithmPolicy,
) -> Result<EncodedEnvelope, CryptoError> {
    policy.check_cipher(options.cipher)?;
    policy.check_mic(options.mic_algorithm)?;

    if !recipient.usage.covers(CertificateUsage::Encryption) {
        return Err(CryptoError::InvalidKey(format!(
            "certificate {} is not an encryption certificate",
            recipient.serial
        )));
    }
    let recipient_pk = recipient
        .encryption_public_key
        .as_deref()
        .ok_or_else(|| {
            CryptoError::InvalidKey(format!(
                "certificate {} has no encryption key",
                recipient.serial
            ))
        })
        .and_then(decode_public_key)?;

    let body = if options.compress {
        compress(payload)?
    } else {
        payload.to_vec()
    };
    let mic = compute_mic(options.mic_algorithm, &body);

    let entity = sign_entity(
        content_type,
        options.compress,
        options.mic_algorithm,
        &mic,
        &body,
        sender,
    );
    let entity_json =
        serde_json::to_vec(&entity).map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let document = seal(
        &entity_json,
        options.cipher,
        &recipient.fingerprint,
        &recipient_pk,
    )?;
    let bytes =
        serde_json::to_vec(&document).map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok(EncodedEnvelope {
        bytes,
        mic,
        mic_algorithm: options.mic_algorithm,
        compressed: options.compress,
        recipient_serial: recipient.serial.clone(),
    })
}

/// Decrypt, verify and decompress an envelope.
///
/// `signer` is the partner's signing certificate; the signed entity must name
/// its fingerprint and verify under its key.
pub fn decode(
    bytes: &[u8],
    recipient: &RecipientIdentity,
    signer: &Certificate,
    policy: &AlgorithmPolicy,
) -> Result<DecodedPayload, CryptoError> {
    let document: EnvelopeDocument = serde_json::from_slice(bytes)
        .map_err(|e| CryptoError::Malformed(format!("envelope is not a valid document: {e}")))?;

    if document.version != ENVELOPE_VERSION {
        return Err(CryptoError::Malformed(format!(
            "unsupported envelope version {}",
            document.version
        )));
    }

    let cipher = document
        .cipher
        .parse::<EncryptionAlgorithm>()
        .map_err(|e| CryptoError::UnsupportedAlgorithm(e.to_string()))?;
    policy.check_cipher(cipher)?;

    if document.recipient_fingerprint != recipient.certificate_fingerprint {
        return Err(CryptoError::WrongRecipient {
            expected: recipient.certificate_fingerprint.clone(),
            actual: document.recipient_fingerprint.clone(),
        });
    }

    let entity_json = open(&document, cipher, recipient)?;
    let entity: SignedEntity = serde_json::from_slice(&entity_json)
        .map_err(|e| CryptoError::Malformed(format!("signed entity: {e}")))?;

    policy.check_mic(entity.mic_algorithm)?;
    let body = base64_url_decode(&entity.body)?;

    if entity.signer_fingerprint != signer.fingerprint {
        return Err(CryptoError::Signature(format!(
            "signed by unexpected certificate {}",
            entity.signer_fingerprint
        )));
    }
    let signer_pk = signer.signing_public_key.as_deref().ok_or_else(|| {
        CryptoError::Signature(format!("certificate {} has no signing key", signer.serial))
    })?;
    let signature = base64_url_decode(&entity.signature)?;
    let preimage = signing_preimage(
        &entity.content_type,
        entity.compressed,
        entity.mic_algorithm,
        &entity.signer_fingerprint,
        &body,
    );
    verify_signature(signer_pk, &preimage, &signature)?;

    let computed = compute_mic(entity.mic_algorithm, &body);
    if computed != entity.mic {
        return Err(CryptoError::MicMismatch {
            signed: entity.mic,
            computed,
        });
    }

    let payload = if entity.compressed {
        decompress(&body)?
    } else {
        body.clone()
    };

    Ok(DecodedPayload {
        payload,
        content_type: entity.content_type,
        compressed: entity.compressed,
        mic: computed,
        mic_algorithm: entity.mic_algorithm,
        signed_body: body,
        signer_fingerprint: entity.signer_fingerprint,
    })
}

fn signing_preimage(
    content_type: &str,
    compressed: bool,
    mic_algorithm: MicAlgorithm,
    signer_fingerprint: &str,
    body: &[u8],
) -> Vec<u8> {
    let mut preimage = Vec::with_capacity(body.len() + 128);
    preimage.extend_from_slice(DOMAIN_SIGNED_ENTITY);
    preimage.extend_from_slice(&encode_string(content_type));
    preimage.push(u8::from(compressed));
    preimage.extend_from_slice(&encode_string(mic_algorithm.as_str()));
    preimage.extend_from_slice(&encode_string(signer_fingerprint));
    preimage.extend_from_slice(&encode_bytes(body));
    preimage
}

fn sign_entity(
    content_type: &str,
    compressed: bool,
    mic_algorithm: MicAlgorithm,
    mic: &str,
    body: &[u8],
    sender: &SenderIdentity,
) -> SignedEntity {
    let preimage = signing_preimage(
        content_type,
        compressed,
        mic_algorithm,
        &sender.certificate_fingerprint,
        body,
    );
    let signature = sender.signing_key.sign(&preimage);

    SignedEntity {
        content_type: content_type.to_string(),
        compressed,
        mic_algorithm,
        mic: mic.to_string(),
        signer_fingerprint: sender.certificate_fingerprint.clone(),
        body: base64_url_encode(body),
        signature: base64_url_encode(&signature),
    }
}

fn envelope_aad(recipient_fingerprint: &str, cipher: EncryptionAlgorithm) -> Vec<u8> {
    let mut aad = Vec::with_capacity(96);
    aad.extend_from_slice(DOMAIN_ENVELOPE_AAD);
    aad.extend_from_slice(&u32_be(ENVELOPE_VERSION));
    aad.extend_from_slice(&encode_string(recipient_fingerprint));
    aad.extend_from_slice(&encode_string(cipher.as_str()));
    aad
}

fn seal(
    plaintext: &[u8],
    cipher: EncryptionAlgorithm,
    recipient_fingerprint: &str,
    recipient_pk: &[u8; 32],
) -> Result<EnvelopeDocument, CryptoError> {
    let aad = envelope_aad(recipient_fingerprint, cipher);
    let info: [u8; 32] = Sha256::digest(&aad).into();

    let mut dek = vec![0u8; cipher.key_len()];
    OsRng.fill_bytes(&mut dek);
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = match cipher {
        EncryptionAlgorithm::Aes128Gcm => {
            aead_seal::<aes_gcm::Aes128Gcm>(&dek, &nonce, plaintext, &aad)?
        }
        EncryptionAlgorithm::Aes256Gcm => {
            aead_seal::<aes_gcm::Aes256Gcm>(&dek, &nonce, plaintext, &aad)?
        }
    };
    let (enc, wrapped_dek) = wrap_dek(&dek, recipient_pk, &info)?;

    Ok(EnvelopeDocument {
        version: ENVELOPE_VERSION,
        cipher: cipher.as_str().to_string(),
        recipient_fingerprint: recipient_fingerprint.to_string(),
        enc: base64_url_encode(&enc),
        wrapped_dek: base64_url_encode(&wrapped_dek),
        nonce: base64_url_encode(&nonce),
        ciphertext: base64_url_encode(&ciphertext),
    })
}

fn open(
    document: &EnvelopeDocument,
    cipher: EncryptionAlgorithm,
    recipient: &RecipientIdentity,
) -> Result<Vec<u8>, CryptoError> {
    let aad = envelope_aad(&document.recipient_fingerprint, cipher);
    let info: [u8; 32] = Sha256::digest(&aad).into();

    let enc = base64_url_decode(&document.enc)?;
    let wrapped_dek = base64_url_decode(&document.wrapped_dek)?;
    let nonce = base64_url_decode(&document.nonce)?;
    let ciphertext = base64_url_decode(&document.ciphertext)?;

    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::Malformed(format!(
            "invalid nonce size: {}",
            nonce.len()
        )));
    }

    let dek = unwrap_dek(
        &enc,
        &wrapped_dek,
        recipient.encryption_key.private_key(),
        &info,
    )?;
    if dek.len() != cipher.key_len() {
        return Err(CryptoError::Decryption(format!(
            "content key is {} bytes, {} expects {}",
            dek.len(),
            cipher,
            cipher.key_len()
        )));
    }

    match cipher {
        EncryptionAlgorithm::Aes128Gcm => {
            aead_open::<aes_gcm::Aes128Gcm>(&dek, &nonce, &ciphertext, &aad)
        }
        EncryptionAlgorithm::Aes256Gcm => {
            aead_open::<aes_gcm::Aes256Gcm>(&dek, &nonce, &ciphertext, &aad)
        }
    }
}

fn aead_seal<C: Aead + KeyInit>(
    key: &[u8],
    nonce: &[u8],
    msg: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = C::new_from_slice(key)
        .map_err(|_| CryptoError::Encryption("invalid content key length".to_string()))?;
    cipher
        .encrypt(GenericArray::from_slice(nonce), Payload { msg, aad })
        .map_err(|e| CryptoError::Encryption(e.to_string()))
}

fn aead_open<C: Aead + KeyInit>(
    key: &[u8],
    nonce: &[u8],
    msg: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = C::new_from_slice(key)
        .map_err(|_| CryptoError::Decryption("invalid content key length".to_string()))?;
    cipher
        .decrypt(GenericArray::from_slice(nonce), Payload { msg, aad })
        .map_err(|_| CryptoError::Decryption("content authentication failed".to_string()))
}

/// Wrap the DEK to the recipient's X25519 key; returns `(enc, sealed_dek)`
fn wrap_dek(
    dek: &[u8],
    recipient_pk: &[u8; 32],
    info: &[u8; 32],
) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let pk = <HpkeKem as Kem>::PublicKey::from_bytes(recipient_pk)
        .map_err(|e| CryptoError::InvalidKey(format!("invalid recipient public key: {e:?}")))?;

    let (enc, mut sender_ctx) =
        hpke::setup_sender::<HpkeAead, HpkeKdf, HpkeKem, _>(&OpModeS::Base, &pk, info, &mut OsRng)
            .map_err(|e| CryptoError::Encryption(format!("HPKE setup failed: {e:?}")))?;

    let sealed = sender_ctx
        .seal(dek, b"")
        .map_err(|e| CryptoError::Encryption(format!("HPKE seal failed: {e:?}")))?;

    Ok((enc.to_bytes().to_vec(), sealed))
}

fn unwrap_dek(
    enc: &[u8],
    sealed: &[u8],
    recipient_sk: &[u8; 32],
    info: &[u8; 32],
) -> Result<Vec<u8>, CryptoError> {
    if enc.len() != HPKE_ENC_SIZE {
        return Err(CryptoError::Malformed(format!(
            "invalid enc size: expected {}, got {}",
            HPKE_ENC_SIZE,
            enc.len()
        )));
    }

    let enc_key = <HpkeKem as Kem>::EncappedKey::from_bytes(enc)
        .map_err(|e| CryptoError::Decryption(format!("invalid encapped key: {e:?}")))?;
    let sk = <HpkeKem as Kem>::PrivateKey::from_bytes(recipient_sk)
        .map_err(|e| CryptoError::InvalidKey(format!("invalid private key: {e:?}")))?;

    let mut receiver_ctx =
        hpke::setup_receiver::<HpkeAead, HpkeKdf, HpkeKem>(&OpModeR::Base, &sk, &enc_key, info)
            .map_err(|e| CryptoError::Decryption(format!("HPKE receiver setup failed: {e:?}")))?;

    receiver_ctx
        .open(sealed, b"")
        .map_err(|_| CryptoError::Decryption("content key unwrap failed".to_string()))
}

fn compress(data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CryptoError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CryptoError::Compression(e.to_string()))
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .take(MAX_DECOMPRESSED_SIZE + 1)
        .read_to_end(&mut out)
        .map_err(|e| CryptoError::Compression(e.to_string()))?;
    if out.len() as u64 > MAX_DECOMPRESSED_SIZE {
        return Err(CryptoError::Compression(
            "decompressed payload exceeds size limit".to_string(),
        ));
    }
    Ok(out)
}
