//! Trading partner configuration
//!
//! A partner is created by an administrator, edited when its endpoint or
//! negotiated algorithms change, and re-pointed at new certificates on
//! rotation. Partners are soft-archived, never deleted, so the audit trail
//! and message history keep resolving.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EncryptionAlgorithm, MdnMode, MicAlgorithm, PartnerId};

/// Upper bound accepted for `RetryPolicy::max_retries`
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Longest AS2 identifier accepted (RFC 4130 section 6.2)
pub const MAX_AS2_ID_LEN: usize = 128;

/// Algorithms and options negotiated with a partner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartnerCryptoConfig {
    pub encryption: EncryptionAlgorithm,
    pub mic_algorithm: MicAlgorithm,
    pub compress: bool,
    pub request_signed_mdn: bool,
}

impl Default for PartnerCryptoConfig {
    fn default() -> Self {
        Self {
            encryption: EncryptionAlgorithm::Aes256Gcm,
            mic_algorithm: MicAlgorithm::Sha256,
            compress: true,
            request_signed_mdn: true,
        }
    }
}

/// Retry bounds applied after MDN timeouts and transport failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_interval_minutes: u32,
}

impl RetryPolicy {
    pub fn retry_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.retry_interval_minutes))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval_minutes: 5,
        }
    }
}

/// A configured AS2 trading partner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partner {
    pub id: PartnerId,
    /// AS2 identifier exchanged in `AS2-From` / `AS2-To` (unique)
    pub as2_id: String,
    pub name: String,
    /// Partner's AS2 receiving URL
    pub endpoint_url: String,
    /// Serial of the partner certificate used to encrypt to them
    pub encryption_cert_serial: String,
    /// Serial of the partner certificate used to verify their signatures
    pub signing_cert_serial: String,
    pub crypto: PartnerCryptoConfig,
    pub mdn_mode: MdnMode,
    pub mdn_timeout_secs: u32,
    pub retry_policy: RetryPolicy,
    pub business_ack_expected: bool,
    pub business_ack_sla_minutes: u32,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Partner {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn mdn_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.mdn_timeout_secs))
    }

    pub fn business_ack_sla(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.business_ack_sla_minutes))
    }
}

/// Fields supplied when creating or editing a partner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerSpec {
    pub as2_id: String,
    pub name: String,
    pub endpoint_url: String,
    pub encryption_cert_serial: String,
    pub signing_cert_serial: String,
    #[serde(default)]
    pub crypto: PartnerCryptoConfig,
    pub mdn_mode: MdnMode,
    #[serde(default = "default_mdn_timeout_secs")]
    pub mdn_timeout_secs: u32,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub business_ack_expected: bool,
    #[serde(default = "default_business_ack_sla_minutes")]
    pub business_ack_sla_minutes: u32,
}

fn default_mdn_timeout_secs() -> u32 {
    300
}

fn default_business_ack_sla_minutes() -> u32 {
    24 * 60
}

impl PartnerSpec {
    /// Reject partner settings the engine cannot operate with.
    ///
    /// Returns a human-readable description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        validate_as2_id(&self.as2_id)?;

        if self.name.trim().is_empty() {
            return Err("partner name must not be empty".to_string());
        }

        let lower = self.endpoint_url.to_ascii_lowercase();
        let rest = lower
            .strip_prefix("https://")
            .or_else(|| lower.strip_prefix("http://"))
            .ok_or_else(|| format!("endpoint url must be http(s): {}", self.endpoint_url))?;
        if rest.is_empty() || rest.starts_with('/') {
            return Err(format!("endpoint url has no host: {}", self.endpoint_url));
        }

        if self.encryption_cert_serial.trim().is_empty() {
            return Err("encryption certificate serial is required".to_string());
        }
        if self.signing_cert_serial.trim().is_empty() {
            return Err("signing certificate serial is required".to_string());
        }
        if self.mdn_timeout_secs == 0 {
            return Err("mdn timeout must be greater than zero".to_string());
        }
        if self.retry_policy.retry_interval_minutes == 0 {
            return Err("retry interval must be greater than zero".to_string());
        }
        if self.retry_policy.max_retries > MAX_RETRIES_LIMIT {
            return Err(format!(
                "max retries {} exceeds limit {}",
                self.retry_policy.max_retries, MAX_RETRIES_LIMIT
            ));
        }

        Ok(())
    }

    /// Materialize a new partner from this spec
    pub fn into_partner(self, now: DateTime<Utc>) -> Partner {
        Partner {
            id: PartnerId::new(),
            as2_id: self.as2_id,
            name: self.name,
            endpoint_url: self.endpoint_url,
            encryption_cert_serial: self.encryption_cert_serial,
            signing_cert_serial: self.signing_cert_serial,
            crypto: self.crypto,
            mdn_mode: self.mdn_mode,
            mdn_timeout_secs: self.mdn_timeout_secs,
            retry_policy: self.retry_policy,
            business_ack_expected: self.business_ack_expected,
            business_ack_sla_minutes: self.business_ack_sla_minutes,
            archived_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply this spec onto an existing partner, keeping identity and history
    pub fn apply_to(self, partner: &mut Partner, now: DateTime<Utc>) {
        partner.as2_id = self.as2_id;
        partner.name = self.name;
        partner.endpoint_url = self.endpoint_url;
        partner.encryption_cert_serial = self.encryption_cert_serial;
        partner.signing_cert_serial = self.signing_cert_serial;
        partner.crypto = self.crypto;
        partner.mdn_mode = self.mdn_mode;
        partner.mdn_timeout_secs = self.mdn_timeout_secs;
        partner.retry_policy = self.retry_policy;
        partner.business_ack_expected = self.business_ack_expected;
        partner.business_ack_sla_minutes = self.business_ack_sla_minutes;
        partner.updated_at = now;
    }
}

/// Validate an AS2 identifier (`AS2-From` / `AS2-To` value)
pub fn validate_as2_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("AS2 id must not be empty".to_string());
    }
    if id.len() > MAX_AS2_ID_LEN {
        return Err(format!("AS2 id longer than {MAX_AS2_ID_LEN} characters"));
    }
    if !id.chars().all(|c| c.is_ascii_graphic()) {
        return Err(format!("AS2 id must be printable ASCII without spaces: {id:?}"));
    }
    Ok(())
}
