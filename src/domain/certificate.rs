//! Certificate records and lifecycle status
//!
//! Certificates carry public key material only. Private keys are addressed by
//! serial through [`crate::crypto::KeyStore`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use super::{PartnerId, UnknownVariant};

/// Default window before `valid_to` in which a certificate reports `expiring`
pub const DEFAULT_EXPIRING_WINDOW_DAYS: i64 = 30;

/// Who a certificate belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertificateOwner {
    /// Our own certificate (we hold the private key)
    Own,
    /// A trading partner's certificate
    Partner(PartnerId),
}

impl fmt::Display for CertificateOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateOwner::Own => write!(f, "self"),
            CertificateOwner::Partner(id) => write!(f, "partner:{}", id),
        }
    }
}

impl FromStr for CertificateOwner {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "self" {
            return Ok(CertificateOwner::Own);
        }
        s.strip_prefix("partner:")
            .and_then(|id| uuid::Uuid::parse_str(id).ok())
            .map(|id| CertificateOwner::Partner(PartnerId::from_uuid(id)))
            .ok_or_else(|| UnknownVariant {
                kind: "certificate owner",
                value: s.to_string(),
            })
    }
}

impl Serialize for CertificateOwner {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CertificateOwner {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// What a certificate may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateUsage {
    Encryption,
    Signing,
    Both,
}

impl CertificateUsage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateUsage::Encryption => "encryption",
            CertificateUsage::Signing => "signing",
            CertificateUsage::Both => "both",
        }
    }

    /// Whether a certificate with this usage can serve `wanted`
    pub fn covers(&self, wanted: CertificateUsage) -> bool {
        *self == CertificateUsage::Both || *self == wanted
    }
}

impl FromStr for CertificateUsage {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "encryption" => Ok(CertificateUsage::Encryption),
            "signing" => Ok(CertificateUsage::Signing),
            "both" => Ok(CertificateUsage::Both),
            other => Err(UnknownVariant {
                kind: "certificate usage",
                value: other.to_string(),
            }),
        }
    }
}

/// Operator-set status that overrides the date-derived one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateOverride {
    Archived,
    Revoked,
}

impl CertificateOverride {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateOverride::Archived => "archived",
            CertificateOverride::Revoked => "revoked",
        }
    }
}

impl FromStr for CertificateOverride {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "archived" => Ok(CertificateOverride::Archived),
            "revoked" => Ok(CertificateOverride::Revoked),
            other => Err(UnknownVariant {
                kind: "certificate override",
                value: other.to_string(),
            }),
        }
    }
}

/// Effective certificate status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateStatus {
    Active,
    Expiring,
    Expired,
    Archived,
    Revoked,
}

impl CertificateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateStatus::Active => "active",
            CertificateStatus::Expiring => "expiring",
            CertificateStatus::Expired => "expired",
            CertificateStatus::Archived => "archived",
            CertificateStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the effective status of a certificate.
///
/// An override wins over dates; otherwise `expired` after `valid_to`,
/// `expiring` within `expiring_window` of it, and `active` before that.
pub fn certificate_status(
    valid_to: DateTime<Utc>,
    status_override: Option<CertificateOverride>,
    now: DateTime<Utc>,
    expiring_window: Duration,
) -> CertificateStatus {
    match status_override {
        Some(CertificateOverride::Archived) => CertificateStatus::Archived,
        Some(CertificateOverride::Revoked) => CertificateStatus::Revoked,
        None if now > valid_to => CertificateStatus::Expired,
        None if valid_to - now <= expiring_window => CertificateStatus::Expiring,
        None => CertificateStatus::Active,
    }
}

/// A stored certificate (public half only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub serial: String,
    pub subject_dn: String,
    pub issuer_dn: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    /// SHA-256 hex over the public key material
    pub fingerprint: String,
    pub key_size_bits: u32,
    pub owner: CertificateOwner,
    pub usage: CertificateUsage,
    /// X25519 public key, hex
    pub encryption_public_key: Option<String>,
    /// Ed25519 verifying key, hex
    pub signing_public_key: Option<String>,
    pub status_override: Option<CertificateOverride>,
    pub created_at: DateTime<Utc>,
}

impl Certificate {
    pub fn status(&self, now: DateTime<Utc>, expiring_window: Duration) -> CertificateStatus {
        certificate_status(self.valid_to, self.status_override, now, expiring_window)
    }

    /// Whether new envelopes may be built with this certificate
    pub fn is_usable(&self, now: DateTime<Utc>, expiring_window: Duration) -> bool {
        self.valid_from <= now
            && matches!(
                self.status(now, expiring_window),
                CertificateStatus::Active | CertificateStatus::Expiring
            )
    }

    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.valid_to - now).num_days()
    }
}
