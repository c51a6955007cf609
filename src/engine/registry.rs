//! Partner and certificate lifecycle
//!
//! Administrative changes to trading partners and their certificates. Every
//! mutation is audited; partners are archived rather than deleted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::clock::{Clock, SystemClock};
use super::state_machine::actor_type;
use crate::crypto::{certificate_fingerprint, decode_public_key};
use crate::domain::{
    Certificate, CertificateOverride, CertificateOwner, CertificateStatus, CertificateUsage, Page,
    PageRequest, Partner, PartnerId, PartnerSpec, DEFAULT_EXPIRING_WINDOW_DAYS,
};
use crate::infra::{As2Error, AuditAction, AuditLogBuilder, AuditLogEntry, AuditSink, Result, SqliteStore};

/// Public certificate material supplied by an operator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateSpec {
    pub serial: String,
    pub subject_dn: String,
    pub issuer_dn: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub owner: CertificateOwner,
    /// X25519 public key, hex
    #[serde(default)]
    pub encryption_public_key: Option<String>,
    /// Ed25519 verifying key, hex
    #[serde(default)]
    pub signing_public_key: Option<String>,
}

impl CertificateSpec {
    /// Build the stored record; usage follows from which keys are present
    pub fn into_certificate(self, now: DateTime<Utc>) -> Result<Certificate> {
        if self.serial.trim().is_empty() {
            return Err(As2Error::Validation("certificate serial is required".to_string()));
        }
        if self.valid_to <= self.valid_from {
            return Err(As2Error::Validation(format!(
                "certificate {} has valid_to before valid_from",
                self.serial
            )));
        }

        let enc = self
            .encryption_public_key
            .as_deref()
            .map(decode_public_key)
            .transpose()?;
        let sig = self
            .signing_public_key
            .as_deref()
            .map(decode_public_key)
            .transpose()?;

        let usage = match (enc.is_some(), sig.is_some()) {
            (true, true) => CertificateUsage::Both,
            (true, false) => CertificateUsage::Encryption,
            (false, true) => CertificateUsage::Signing,
            (false, false) => {
                return Err(As2Error::Validation(format!(
                    "certificate {} carries no public key",
                    self.serial
                )))
            }
        };

        Ok(Certificate {
            fingerprint: certificate_fingerprint(
                enc.as_ref().map(|k| k.as_slice()),
                sig.as_ref().map(|k| k.as_slice()),
            ),
            serial: self.serial,
            subject_dn: self.subject_dn,
            issuer_dn: self.issuer_dn,
            valid_from: self.valid_from,
            valid_to: self.valid_to,
            key_size_bits: 256,
            owner: self.owner,
            usage,
            encryption_public_key: enc.map(hex::encode),
            signing_public_key: sig.map(hex::encode),
            status_override: None,
            created_at: now,
        })
    }
}

/// A certificate with its status evaluated at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct CertificateView {
    #[serde(flatten)]
    pub certificate: Certificate,
    pub status: CertificateStatus,
    pub days_until_expiry: i64,
    pub usable: bool,
}

/// Partner and certificate administration
pub struct PartnerRegistry {
    store: SqliteStore,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    expiring_window: chrono::Duration,
}

impl PartnerRegistry {
    pub fn new(store: SqliteStore, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            store,
            audit,
            clock: Arc::new(SystemClock),
            expiring_window: chrono::Duration::days(DEFAULT_EXPIRING_WINDOW_DAYS),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_expiring_window(mut self, window: chrono::Duration) -> Self {
        self.expiring_window = window;
        self
    }

    // =========================================================================
    // Partners
    // =========================================================================

    pub async fn create_partner(&self, spec: PartnerSpec, actor: &str) -> Result<Partner> {
        spec.validate().map_err(As2Error::Validation)?;
        let partner = spec.into_partner(self.clock.now());
        self.store.insert_partner(&partner).await?;

        info!(partner = %partner.as2_id, id = %partner.id, "Partner created");
        self.record_audit(
            AuditLogBuilder::new(AuditAction::PartnerCreated, actor, actor_type(actor))
                .resource("partner", partner.id.to_string())
                .details(json!({
                    "as2_id": partner.as2_id,
                    "endpoint_url": partner.endpoint_url,
                    "mdn_mode": partner.mdn_mode,
                }))
                .at(partner.created_at)
                .build(),
        )
        .await;

        Ok(partner)
    }

    pub async fn update_partner(
        &self,
        id: PartnerId,
        spec: PartnerSpec,
        actor: &str,
    ) -> Result<Partner> {
        spec.validate().map_err(As2Error::Validation)?;
        let mut partner = self.partner(id).await?;
        if partner.is_archived() {
            return Err(As2Error::Configuration(format!(
                "partner {} is archived",
                partner.as2_id
            )));
        }

        let before = partner.clone();
        spec.apply_to(&mut partner, self.clock.now());
        self.store.update_partner(&partner).await?;

        info!(partner = %partner.as2_id, id = %partner.id, "Partner updated");
        self.record_audit(
            AuditLogBuilder::new(AuditAction::PartnerUpdated, actor, actor_type(actor))
                .resource("partner", partner.id.to_string())
                .details(json!({ "changed": changed_fields(&before, &partner) }))
                .at(partner.updated_at)
                .build(),
        )
        .await;

        Ok(partner)
    }

    /// Archived partners keep their history but accept no new traffic
    pub async fn archive_partner(&self, id: PartnerId, actor: &str) -> Result<Partner> {
        let partner = self.store.archive_partner(id, self.clock.now()).await?;

        info!(partner = %partner.as2_id, id = %partner.id, "Partner archived");
        self.record_audit(
            AuditLogBuilder::new(AuditAction::PartnerArchived, actor, actor_type(actor))
                .resource("partner", partner.id.to_string())
                .details(json!({ "as2_id": partner.as2_id }))
                .at(self.clock.now())
                .build(),
        )
        .await;

        Ok(partner)
    }

    pub async fn partner(&self, id: PartnerId) -> Result<Partner> {
        self.store
            .get_partner(id)
            .await?
            .ok_or_else(|| As2Error::PartnerNotFound(id.to_string()))
    }

    pub async fn list_partners(
        &self,
        include_archived: bool,
        page: PageRequest,
    ) -> Result<Page<Partner>> {
        self.store.list_partners(include_archived, page).await
    }

    // =========================================================================
    // Certificates
    // =========================================================================

    pub async fn add_certificate(&self, spec: CertificateSpec, actor: &str) -> Result<CertificateView> {
        if let CertificateOwner::Partner(partner_id) = spec.owner {
            self.partner(partner_id).await?;
        }
        let now = self.clock.now();
        let cert = spec.into_certificate(now)?;
        self.store.insert_certificate(&cert).await?;

        info!(serial = %cert.serial, owner = %cert.owner, usage = cert.usage.as_str(), "Certificate added");
        self.record_audit(
            AuditLogBuilder::new(AuditAction::CertificateAdded, actor, actor_type(actor))
                .resource("certificate", cert.serial.clone())
                .details(json!({
                    "owner": cert.owner,
                    "usage": cert.usage,
                    "fingerprint": cert.fingerprint,
                    "valid_to": cert.valid_to,
                }))
                .at(now)
                .build(),
        )
        .await;

        Ok(self.view(cert, now))
    }

    /// Register a new partner certificate and switch the partner to it.
    ///
    /// Messages whose envelope was built for the old serial are re-encoded
    /// on their next attempt.
    pub async fn rotate_partner_certificate(
        &self,
        partner_id: PartnerId,
        spec: CertificateSpec,
        actor: &str,
    ) -> Result<Partner> {
        let before = self.partner(partner_id).await?;
        if before.is_archived() {
            return Err(As2Error::Configuration(format!(
                "partner {} is archived",
                before.as2_id
            )));
        }

        let now = self.clock.now();
        let cert = spec.into_certificate(now)?;
        let partner = self
            .store
            .rotate_partner_certificate(partner_id, &cert, now)
            .await?;

        info!(
            partner = %partner.as2_id,
            serial = %cert.serial,
            previous_encryption = %before.encryption_cert_serial,
            previous_signing = %before.signing_cert_serial,
            "Partner certificate rotated"
        );
        self.record_audit(
            AuditLogBuilder::new(AuditAction::CertificateRotated, actor, actor_type(actor))
                .resource("partner", partner.id.to_string())
                .details(json!({
                    "serial": cert.serial,
                    "usage": cert.usage,
                    "previous_encryption_cert_serial": before.encryption_cert_serial,
                    "previous_signing_cert_serial": before.signing_cert_serial,
                }))
                .at(now)
                .build(),
        )
        .await;

        Ok(partner)
    }

    pub async fn revoke_certificate(&self, serial: &str, actor: &str) -> Result<CertificateView> {
        self.override_certificate(serial, CertificateOverride::Revoked, AuditAction::CertificateRevoked, actor)
            .await
    }

    pub async fn archive_certificate(&self, serial: &str, actor: &str) -> Result<CertificateView> {
        self.override_certificate(serial, CertificateOverride::Archived, AuditAction::CertificateArchived, actor)
            .await
    }

    pub async fn certificate(&self, serial: &str) -> Result<CertificateView> {
        let cert = self
            .store
            .get_certificate(serial)
            .await?
            .ok_or_else(|| As2Error::CertificateNotFound(serial.to_string()))?;
        Ok(self.view(cert, self.clock.now()))
    }

    pub async fn list_certificates(
        &self,
        owner: Option<CertificateOwner>,
        page: PageRequest,
    ) -> Result<Page<CertificateView>> {
        let now = self.clock.now();
        let page = self.store.list_certificates(owner, page).await?;
        Ok(Page {
            items: page.items.into_iter().map(|c| self.view(c, now)).collect(),
            total: page.total,
            limit: page.limit,
            offset: page.offset,
        })
    }

    /// Certificates that are expiring or expired and not yet retired
    pub async fn attention_required(&self) -> Result<Vec<CertificateView>> {
        let now = self.clock.now();
        let mut flagged = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .store
                .list_certificates(None, PageRequest::new(PageRequest::MAX_LIMIT, offset))
                .await?;
            let fetched = page.items.len() as u32;
            flagged.extend(page.items.into_iter().map(|c| self.view(c, now)).filter(|v| {
                matches!(v.status, CertificateStatus::Expiring | CertificateStatus::Expired)
            }));
            offset += fetched;
            if fetched == 0 || u64::from(offset) >= page.total {
                break;
            }
        }
        Ok(flagged)
    }

    async fn override_certificate(
        &self,
        serial: &str,
        status: CertificateOverride,
        action: AuditAction,
        actor: &str,
    ) -> Result<CertificateView> {
        let now = self.clock.now();
        let cert = self.store.set_certificate_override(serial, status).await?;

        if let CertificateOwner::Partner(partner_id) = cert.owner {
            if let Some(partner) = self.store.get_partner(partner_id).await? {
                if partner.encryption_cert_serial == cert.serial
                    || partner.signing_cert_serial == cert.serial
                {
                    warn!(
                        partner = %partner.as2_id,
                        serial = %cert.serial,
                        status = status.as_str(),
                        "Partner still references a retired certificate; sends will fail until rotated"
                    );
                }
            }
        }

        info!(serial = %cert.serial, status = status.as_str(), "Certificate retired");
        self.record_audit(
            AuditLogBuilder::new(action, actor, actor_type(actor))
                .resource("certificate", cert.serial.clone())
                .details(json!({ "owner": cert.owner, "status": status }))
                .at(now)
                .build(),
        )
        .await;

        Ok(self.view(cert, now))
    }

    fn view(&self, certificate: Certificate, now: DateTime<Utc>) -> CertificateView {
        CertificateView {
            status: certificate.status(now, self.expiring_window),
            days_until_expiry: certificate.days_until_expiry(now),
            usable: certificate.is_usable(now, self.expiring_window),
            certificate,
        }
    }

    async fn record_audit(&self, entry: AuditLogEntry) {
        let action = entry.action.to_string();
        if let Err(e) = self.audit.record(entry).await {
            warn!(%action, error = %e, "Failed to write audit record");
        }
    }
}

fn changed_fields(before: &Partner, after: &Partner) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if before.as2_id != after.as2_id {
        changed.push("as2_id");
    }
    if before.name != after.name {
        changed.push("name");
    }
    if before.endpoint_url != after.endpoint_url {
        changed.push("endpoint_url");
    }
    if before.encryption_cert_serial != after.encryption_cert_serial {
        changed.push("encryption_cert_serial");
    }
    if before.signing_cert_serial != after.signing_cert_serial {
        changed.push("signing_cert_serial");
    }
    if before.crypto != after.crypto {
        changed.push("crypto");
    }
    if before.mdn_mode != after.mdn_mode {
        changed.push("mdn_mode");
    }
    if before.mdn_timeout_secs != after.mdn_timeout_secs {
        changed.push("mdn_timeout_secs");
    }
    if before.retry_policy != after.retry_policy {
        changed.push("retry_policy");
    }
    if before.business_ack_expected != after.business_ack_expected
        || before.business_ack_sla_minutes != after.business_ack_sla_minutes
    {
        changed.push("business_ack");
    }
    changed
}
