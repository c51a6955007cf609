//! MDN verification against the original transmission

use super::mdn::{parse_mdn, signature_preimage, Disposition, Mdn};
use crate::crypto::{digest_for, verify_signature};
use crate::domain::{Certificate, MicAlgorithm};

/// What the sender expects the MDN to confirm
#[derive(Debug, Clone, Copy)]
pub struct MdnExpectation<'a> {
    /// AS2 `Message-ID` of the original message
    pub message_id: &'a str,
    /// MIC recorded at first encoding
    pub sent_mic: &'a str,
    pub mic_algorithm: MicAlgorithm,
    /// Partner signing certificate
    pub signer: Option<&'a Certificate>,
    /// Reject unsigned MDNs
    pub require_signature: bool,
}

/// Verification outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MdnVerification {
    /// Unparseable, or for a different message
    Malformed { reason: String },
    /// Missing, unexpected or bad signature; the MDN is discarded
    SignatureInvalid { reason: String },
    /// The partner reported a failure
    NegativeDisposition {
        mdn: Mdn,
        signature_verified: bool,
    },
    /// Positive disposition but the MIC differs from what was sent
    VerifiedMismatch {
        mdn: Mdn,
        received_mic: Option<String>,
        signature_verified: bool,
    },
    VerifiedSuccess {
        mdn: Mdn,
        /// Bare base64 digest, comparable byte for byte with the sent MIC
        received_mic: String,
        signature_verified: bool,
    },
}

impl MdnVerification {
    pub fn label(&self) -> &'static str {
        match self {
            MdnVerification::Malformed { .. } => "malformed",
            MdnVerification::SignatureInvalid { .. } => "signature_invalid",
            MdnVerification::NegativeDisposition { .. } => "negative_disposition",
            MdnVerification::VerifiedMismatch { .. } => "verified_mismatch",
            MdnVerification::VerifiedSuccess { .. } => "verified_success",
        }
    }

    pub fn disposition(&self) -> Option<&Disposition> {
        match self {
            MdnVerification::NegativeDisposition { mdn, .. }
            | MdnVerification::VerifiedMismatch { mdn, .. }
            | MdnVerification::VerifiedSuccess { mdn, .. } => Some(&mdn.disposition),
            _ => None,
        }
    }
}

/// Verify an MDN for the message described by `expected`
pub fn verify_mdn(bytes: &[u8], expected: &MdnExpectation<'_>) -> MdnVerification {
    let parsed = match parse_mdn(bytes) {
        Ok(parsed) => parsed,
        Err(e) => {
            return MdnVerification::Malformed {
                reason: e.to_string(),
            }
        }
    };

    if parsed.mdn.original_message_id != expected.message_id {
        return MdnVerification::Malformed {
            reason: format!(
                "MDN refers to {}, expected {}",
                parsed.mdn.original_message_id, expected.message_id
            ),
        };
    }

    let signature_verified = match (&parsed.signature, expected.signer) {
        (Some(sig), Some(signer)) => {
            if sig.fingerprint != signer.fingerprint {
                return MdnVerification::SignatureInvalid {
                    reason: format!("MDN signed by unexpected certificate {}", sig.fingerprint),
                };
            }
            let Some(public_key) = signer.signing_public_key.as_deref() else {
                return MdnVerification::SignatureInvalid {
                    reason: format!("certificate {} has no signing key", signer.serial),
                };
            };
            if let Err(e) = verify_signature(
                public_key,
                &signature_preimage(&parsed.signed_block),
                &sig.signature,
            ) {
                return MdnVerification::SignatureInvalid {
                    reason: e.to_string(),
                };
            }
            true
        }
        (Some(_), None) => {
            return MdnVerification::SignatureInvalid {
                reason: "no signing certificate to verify MDN".to_string(),
            }
        }
        (None, _) if expected.require_signature => {
            return MdnVerification::SignatureInvalid {
                reason: "signed MDN requested but MDN is unsigned".to_string(),
            }
        }
        (None, _) => false,
    };

    let mdn = parsed.mdn;
    if !mdn.disposition.is_positive() {
        return MdnVerification::NegativeDisposition {
            mdn,
            signature_verified,
        };
    }

    let digest = mdn
        .received_content_mic
        .as_deref()
        .and_then(|rendered| digest_for(rendered, expected.mic_algorithm));
    match digest {
        Some(digest) if digest == expected.sent_mic => MdnVerification::VerifiedSuccess {
            mdn,
            received_mic: digest,
            signature_verified,
        },
        _ => MdnVerification::VerifiedMismatch {
            received_mic: mdn.received_content_mic.clone(),
            mdn,
            signature_verified,
        },
    }
}
