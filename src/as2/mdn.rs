//! Message Disposition Notification model
//!
//! An MDN is carried as a `message/disposition-notification` field block:
//!
//! ```text
//! Message-ID: <mdn-uuid@receiver>
//! Reporting-UA: as2-gateway
//! Original-Recipient: rfc822; RECEIVER
//! Final-Recipient: rfc822; RECEIVER
//! Original-Message-ID: <uuid@sender>
//! Received-Content-MIC: 3q2+7w==, sha-256
//! Disposition: automatic-action/MDN-sent-automatically; processed
//! Signature-Fingerprint: 5f1c...
//! Signature: base64...
//! ```
//!
//! The two `Signature*` lines are present only on signed MDNs; the Ed25519
//! signature covers the canonical (CRLF-terminated) field block above them.

use std::fmt;
use std::str::FromStr;

use base64::Engine;

use crate::crypto::SigningKeyPair;

/// Domain prefix for MDN signatures
pub const DOMAIN_MDN_SIGNATURE: &[u8] = b"AS2_MDN_SIGNATURE_V1";

const ACTION_MODE: &str = "automatic-action/MDN-sent-automatically";
const FIELD_SIGNATURE_FINGERPRINT: &str = "Signature-Fingerprint";
const FIELD_SIGNATURE: &str = "Signature";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MdnParseError {
    #[error("MDN is not valid UTF-8")]
    Encoding,

    #[error("malformed MDN line: {0}")]
    Line(String),

    #[error("MDN missing field {0}")]
    MissingField(&'static str),

    #[error("invalid disposition: {0}")]
    Disposition(String),

    #[error("invalid signature encoding")]
    SignatureEncoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispositionType {
    Processed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifierKind {
    Error,
    Warning,
    Failure,
}

impl ModifierKind {
    fn as_str(&self) -> &'static str {
        match self {
            ModifierKind::Error => "error",
            ModifierKind::Warning => "warning",
            ModifierKind::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispositionModifier {
    pub kind: ModifierKind,
    pub description: String,
}

/// The `Disposition` field of an MDN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disposition {
    pub kind: DispositionType,
    pub modifier: Option<DispositionModifier>,
}

impl Disposition {
    pub fn processed() -> Self {
        Self {
            kind: DispositionType::Processed,
            modifier: None,
        }
    }

    pub fn processed_with_error(description: impl Into<String>) -> Self {
        Self {
            kind: DispositionType::Processed,
            modifier: Some(DispositionModifier {
                kind: ModifierKind::Error,
                description: description.into(),
            }),
        }
    }

    pub fn processed_with_warning(description: impl Into<String>) -> Self {
        Self {
            kind: DispositionType::Processed,
            modifier: Some(DispositionModifier {
                kind: ModifierKind::Warning,
                description: description.into(),
            }),
        }
    }

    pub fn failed(description: impl Into<String>) -> Self {
        Self {
            kind: DispositionType::Failed,
            modifier: Some(DispositionModifier {
                kind: ModifierKind::Failure,
                description: description.into(),
            }),
        }
    }

    /// `processed` without an error or failure modifier
    pub fn is_positive(&self) -> bool {
        self.kind == DispositionType::Processed
            && self
                .modifier
                .as_ref()
                .map(|m| m.kind == ModifierKind::Warning)
                .unwrap_or(true)
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DispositionType::Processed => "processed",
            DispositionType::Failed => "failed",
        };
        write!(f, "{ACTION_MODE}; {kind}")?;
        if let Some(modifier) = &self.modifier {
            write!(f, "/{}: {}", modifier.kind.as_str(), modifier.description)?;
        }
        Ok(())
    }
}

impl FromStr for Disposition {
    type Err = MdnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || MdnParseError::Disposition(s.to_string());

        let (_, outcome) = s.split_once(';').ok_or_else(err)?;
        let outcome = outcome.trim();
        let (kind, modifier) = match outcome.split_once('/') {
            Some((kind, modifier)) => (kind.trim(), Some(modifier.trim())),
            None => (outcome, None),
        };

        let kind = match kind.to_ascii_lowercase().as_str() {
            "processed" => DispositionType::Processed,
            "failed" => DispositionType::Failed,
            _ => return Err(err()),
        };

        let modifier = match modifier {
            None => None,
            Some(m) => {
                let (mod_kind, description) = m.split_once(':').ok_or_else(err)?;
                let mod_kind = match mod_kind.trim().to_ascii_lowercase().as_str() {
                    "error" => ModifierKind::Error,
                    "warning" => ModifierKind::Warning,
                    "failure" => ModifierKind::Failure,
                    _ => return Err(err()),
                };
                Some(DispositionModifier {
                    kind: mod_kind,
                    description: description.trim().to_string(),
                })
            }
        };

        Ok(Self { kind, modifier })
    }
}

/// A disposition notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mdn {
    /// The MDN's own message id
    pub message_id: Option<String>,
    pub reporting_ua: String,
    pub original_recipient: Option<String>,
    pub final_recipient: String,
    pub original_message_id: String,
    /// Rendered MIC, `"<base64>, <alg>"`
    pub received_content_mic: Option<String>,
    pub disposition: Disposition,
}

/// Signature trailer of a signed MDN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdnSignature {
    pub fingerprint: String,
    pub signature: Vec<u8>,
}

/// An MDN parsed from the wire, with the bytes its signature covers
#[derive(Debug, Clone)]
pub struct ParsedMdn {
    pub mdn: Mdn,
    pub signed_block: Vec<u8>,
    pub signature: Option<MdnSignature>,
}

impl Mdn {
    fn fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = Vec::with_capacity(7);
        if let Some(id) = &self.message_id {
            fields.push(("Message-ID", id.clone()));
        }
        fields.push(("Reporting-UA", self.reporting_ua.clone()));
        if let Some(recipient) = &self.original_recipient {
            fields.push(("Original-Recipient", format!("rfc822; {recipient}")));
        }
        fields.push(("Final-Recipient", format!("rfc822; {}", self.final_recipient)));
        fields.push(("Original-Message-ID", self.original_message_id.clone()));
        if let Some(mic) = &self.received_content_mic {
            fields.push(("Received-Content-MIC", mic.clone()));
        }
        fields.push(("Disposition", self.disposition.to_string()));
        fields
    }

    /// Canonical field block (the signed portion)
    pub fn field_block(&self) -> Vec<u8> {
        let mut out = String::new();
        for (name, value) in self.fields() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(&value);
            out.push_str("\r\n");
        }
        out.into_bytes()
    }

    /// Render without a signature
    pub fn render(&self) -> Vec<u8> {
        self.field_block()
    }

    /// Render with an Ed25519 signature by `key`, identified by `fingerprint`
    pub fn render_signed(&self, key: &SigningKeyPair, fingerprint: &str) -> Vec<u8> {
        let mut block = self.field_block();
        let signature = key.sign(&signature_preimage(&block));
        block.extend_from_slice(
            format!(
                "{FIELD_SIGNATURE_FINGERPRINT}: {fingerprint}\r\n{FIELD_SIGNATURE}: {}\r\n",
                base64::engine::general_purpose::STANDARD.encode(signature)
            )
            .as_bytes(),
        );
        block
    }
}

/// Bytes an MDN signature is computed over
pub fn signature_preimage(field_block: &[u8]) -> Vec<u8> {
    let mut preimage = Vec::with_capacity(DOMAIN_MDN_SIGNATURE.len() + field_block.len());
    preimage.extend_from_slice(DOMAIN_MDN_SIGNATURE);
    preimage.extend_from_slice(field_block);
    preimage
}

fn strip_address_type(value: &str) -> String {
    value
        .split_once(';')
        .map(|(_, addr)| addr.trim())
        .unwrap_or(value)
        .to_string()
}

/// Parse a rendered MDN
pub fn parse_mdn(bytes: &[u8]) -> Result<ParsedMdn, MdnParseError> {
    let text = std::str::from_utf8(bytes).map_err(|_| MdnParseError::Encoding)?;

    let mut signed_block = String::new();
    let mut fields: Vec<(String, String)> = Vec::new();
    let mut fingerprint = None;
    let mut signature = None;

    for line in text.lines().map(|l| l.trim_end_matches('\r')) {
        if line.trim().is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| MdnParseError::Line(line.to_string()))?;
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case(FIELD_SIGNATURE_FINGERPRINT) {
            fingerprint = Some(value.to_string());
        } else if name.eq_ignore_ascii_case(FIELD_SIGNATURE) {
            signature = Some(
                base64::engine::general_purpose::STANDARD
                    .decode(value)
                    .map_err(|_| MdnParseError::SignatureEncoding)?,
            );
        } else {
            signed_block.push_str(line);
            signed_block.push_str("\r\n");
            fields.push((name.to_ascii_lowercase(), value.to_string()));
        }
    }

    let get = |name: &str| {
        fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };
    let required = |name: &'static str| {
        get(&name.to_ascii_lowercase()).ok_or(MdnParseError::MissingField(name))
    };

    let mdn = Mdn {
        message_id: get("message-id"),
        reporting_ua: get("reporting-ua").unwrap_or_default(),
        original_recipient: get("original-recipient").map(|v| strip_address_type(&v)),
        final_recipient: strip_address_type(&required("Final-Recipient")?),
        original_message_id: required("Original-Message-ID")?,
        received_content_mic: get("received-content-mic"),
        disposition: required("Disposition")?.parse()?,
    };

    let signature = match (fingerprint, signature) {
        (Some(fingerprint), Some(signature)) => Some(MdnSignature {
            fingerprint,
            signature,
        }),
        (None, None) => None,
        _ => return Err(MdnParseError::SignatureEncoding),
    };

    Ok(ParsedMdn {
        mdn,
        signed_block: signed_block.into_bytes(),
        signature,
    })
}
