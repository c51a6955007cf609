//! Trait definitions for the gateway's external collaborators

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::domain::{Certificate, CertificateOwner, CertificateUsage, ValidationOutcome};

use super::{AuditLogEntry, Result};

/// Certificate lookup used by the envelope codec and MDN verifier.
///
/// Partner certificates are resolved through the partner's current
/// reference, which is re-read for every new encoding.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// The certificate currently referenced for `owner` and `usage`
    async fn get_active_certificate(
        &self,
        owner: CertificateOwner,
        usage: CertificateUsage,
    ) -> Result<Option<Certificate>>;

    async fn get_certificate_by_serial(&self, serial: &str) -> Result<Option<Certificate>>;
}

/// Business validation of inbound payloads (schemas live elsewhere).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ValidationEngine: Send + Sync {
    async fn validate(
        &self,
        payload: &[u8],
        content_type: &str,
        schema_version: Option<String>,
    ) -> ValidationOutcome;
}

/// Delivers validated inbound payloads to internal destinations.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Router: Send + Sync {
    /// Route `payload` of `message_type` to `destination`; returns a result label
    async fn route(
        &self,
        payload: &[u8],
        message_type: &str,
        destination: &str,
    ) -> std::result::Result<String, String>;
}

/// Append-only audit trail.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditLogEntry) -> Result<()>;
}

/// Validator that accepts every payload
#[derive(Debug, Clone, Default)]
pub struct AcceptAllValidator;

#[async_trait]
impl ValidationEngine for AcceptAllValidator {
    async fn validate(
        &self,
        _payload: &[u8],
        _content_type: &str,
        schema_version: Option<String>,
    ) -> ValidationOutcome {
        ValidationOutcome {
            passed: true,
            errors: Vec::new(),
            schema_version,
        }
    }
}

/// Router that only logs the delivery
#[derive(Debug, Clone, Default)]
pub struct LoggingRouter;

#[async_trait]
impl Router for LoggingRouter {
    async fn route(
        &self,
        payload: &[u8],
        message_type: &str,
        destination: &str,
    ) -> std::result::Result<String, String> {
        tracing::info!(
            message_type,
            destination,
            bytes = payload.len(),
            "Routed inbound payload"
        );
        Ok("delivered".to_string())
    }
}
