//! Core type definitions for the AS2 gateway
//!
//! Identifiers and the algorithm vocabulary negotiated with trading partners.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// AS2 protocol version advertised in the `AS2-Version` header
pub const AS2_VERSION: &str = "1.2";

/// Partner identifier (internal, stable across AS2 id renames)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartnerId(pub uuid::Uuid);

impl PartnerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }
}

impl Default for PartnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PartnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound message identifier (row id; the AS2 `Message-ID` is separate)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inbound message identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InboundId(pub uuid::Uuid);

impl InboundId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }
}

impl Default for InboundId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InboundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generate an RFC 5322 style AS2 `Message-ID` (`<uuid@host>`)
pub fn generate_as2_message_id(host: &str) -> String {
    format!("<{}@{}>", uuid::Uuid::new_v4(), host)
}

/// Error returned when an algorithm or mode name is not recognised
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Digest algorithm used for the Message Integrity Check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MicAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl MicAlgorithm {
    pub const ALL: [MicAlgorithm; 4] = [
        MicAlgorithm::Sha1,
        MicAlgorithm::Sha256,
        MicAlgorithm::Sha384,
        MicAlgorithm::Sha512,
    ];

    /// Stable storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            MicAlgorithm::Sha1 => "sha1",
            MicAlgorithm::Sha256 => "sha256",
            MicAlgorithm::Sha384 => "sha384",
            MicAlgorithm::Sha512 => "sha512",
        }
    }

    /// Name used in `Received-Content-MIC` and `signed-receipt-micalg`
    pub fn as2_name(&self) -> &'static str {
        match self {
            MicAlgorithm::Sha1 => "sha1",
            MicAlgorithm::Sha256 => "sha-256",
            MicAlgorithm::Sha384 => "sha-384",
            MicAlgorithm::Sha512 => "sha-512",
        }
    }
}

impl fmt::Display for MicAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MicAlgorithm {
    type Err = UnknownVariant;

    /// Accepts both storage names and the hyphenated AS2 names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha1" | "sha-1" => Ok(MicAlgorithm::Sha1),
            "sha256" | "sha-256" => Ok(MicAlgorithm::Sha256),
            "sha384" | "sha-384" => Ok(MicAlgorithm::Sha384),
            "sha512" | "sha-512" => Ok(MicAlgorithm::Sha512),
            other => Err(UnknownVariant {
                kind: "mic algorithm",
                value: other.to_string(),
            }),
        }
    }
}

/// Content encryption cipher negotiated with a partner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionAlgorithm {
    #[serde(rename = "aes128-gcm")]
    Aes128Gcm,
    #[serde(rename = "aes256-gcm")]
    Aes256Gcm,
}

impl EncryptionAlgorithm {
    pub const ALL: [EncryptionAlgorithm; 2] =
        [EncryptionAlgorithm::Aes128Gcm, EncryptionAlgorithm::Aes256Gcm];

    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionAlgorithm::Aes128Gcm => "aes128-gcm",
            EncryptionAlgorithm::Aes256Gcm => "aes256-gcm",
        }
    }

    /// Content-encryption key length in bytes
    pub fn key_len(&self) -> usize {
        match self {
            EncryptionAlgorithm::Aes128Gcm => 16,
            EncryptionAlgorithm::Aes256Gcm => 32,
        }
    }
}

impl fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EncryptionAlgorithm {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes128-gcm" | "aes128" => Ok(EncryptionAlgorithm::Aes128Gcm),
            "aes256-gcm" | "aes256" => Ok(EncryptionAlgorithm::Aes256Gcm),
            other => Err(UnknownVariant {
                kind: "encryption algorithm",
                value: other.to_string(),
            }),
        }
    }
}

/// How the partner returns its MDN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MdnMode {
    Sync,
    Async,
}

impl MdnMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MdnMode::Sync => "sync",
            MdnMode::Async => "async",
        }
    }
}

impl fmt::Display for MdnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MdnMode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" => Ok(MdnMode::Sync),
            "async" => Ok(MdnMode::Async),
            other => Err(UnknownVariant {
                kind: "mdn mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Operator-assigned priority of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl FromStr for Priority {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(UnknownVariant {
                kind: "priority",
                value: other.to_string(),
            }),
        }
    }
}

/// Page request for list endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: u32,
    pub offset: u32,
}

impl PageRequest {
    pub const MAX_LIMIT: u32 = 500;

    pub fn new(limit: u32, offset: u32) -> Self {
        Self {
            limit: limit.clamp(1, Self::MAX_LIMIT),
            offset,
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// One page of results plus the total row count
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}
