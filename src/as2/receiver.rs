//! Inbound AS2 receiver
//!
//! Accepts a POSTed AS2 request, opens the envelope, validates and routes
//! the payload, and answers with an MDN (inline for sync, queued for async).
//! Every request that carries parseable headers is persisted exactly once
//! per `(AS2-From, Message-ID)`; a repeat replays the stored MDN.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::headers::As2Headers;
use super::mdn::{Disposition, Mdn};
use crate::crypto::{
    compute_mic, decode, format_mic, AlgorithmPolicy, CryptoError, DecodedPayload, KeyStore,
    RecipientIdentity,
};
use crate::domain::{
    generate_as2_message_id, ArtifactKind, CertificateOwner, CertificateUsage, InboundId,
    InboundMessage, InboundStatus, MdnMode, Partner, RawArtifact, RoutingOutcome,
    ValidationOutcome,
};
use crate::engine::{Clock, SystemClock};
use crate::infra::{
    As2Error, AuditAction, AuditLogBuilder, AuditSink, CertificateStore, Result, Router,
    SqliteStore, ValidationEngine,
};

const REPORTING_UA: &str = "as2-gateway";

/// Selects an internal destination by content type or subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Message type passed to the router, e.g. `x12-850`
    pub message_type: String,
    pub destination: String,
    /// Case-insensitive prefix of the `Content-Type` media type
    #[serde(default)]
    pub content_type: Option<String>,
    /// Case-insensitive substring of the `Subject`
    #[serde(default)]
    pub subject_contains: Option<String>,
    #[serde(default)]
    pub schema_version: Option<String>,
}

impl RoutingRule {
    fn matches(&self, content_type: Option<&str>, subject: Option<&str>) -> bool {
        if self.content_type.is_none() && self.subject_contains.is_none() {
            return false;
        }
        let content_ok = match &self.content_type {
            Some(wanted) => content_type
                .map(|ct| {
                    ct.trim()
                        .to_ascii_lowercase()
                        .starts_with(&wanted.to_ascii_lowercase())
                })
                .unwrap_or(false),
            None => true,
        };
        let subject_ok = match &self.subject_contains {
            Some(wanted) => subject
                .map(|s| s.to_lowercase().contains(&wanted.to_lowercase()))
                .unwrap_or(false),
            None => true,
        };
        content_ok && subject_ok
    }
}

/// Ordered routing rules; the first match wins
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingTable {
    pub rules: Vec<RoutingRule>,
    /// Used when no rule matches
    #[serde(default)]
    pub default_destination: Option<String>,
}

impl RoutingTable {
    pub fn new(rules: Vec<RoutingRule>) -> Self {
        Self {
            rules,
            default_destination: None,
        }
    }

    pub fn with_default(mut self, destination: impl Into<String>) -> Self {
        self.default_destination = Some(destination.into());
        self
    }

    /// Load from the JSON in `AS2_ROUTING_RULES`, empty when unset
    pub fn from_env() -> Result<Self> {
        match std::env::var("AS2_ROUTING_RULES") {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .map_err(|e| As2Error::Configuration(format!("invalid AS2_ROUTING_RULES: {e}"))),
            _ => Ok(Self::default()),
        }
    }

    /// Resolve the rule for a message; the default destination yields a
    /// synthetic `unclassified` rule
    pub fn resolve(&self, content_type: Option<&str>, subject: Option<&str>) -> Option<RoutingRule> {
        self.rules
            .iter()
            .find(|rule| rule.matches(content_type, subject))
            .cloned()
            .or_else(|| {
                self.default_destination.as_ref().map(|destination| RoutingRule {
                    message_type: "unclassified".to_string(),
                    destination: destination.clone(),
                    content_type: None,
                    subject_contains: None,
                    schema_version: None,
                })
            })
    }
}

/// What to send back to the HTTP client
#[derive(Debug, Clone)]
pub struct InboundOutcome {
    pub http_status: u16,
    /// Inline MDN for synchronous requests
    pub mdn_body: Option<Vec<u8>>,
    /// Persisted record; `None` when the headers could not be parsed
    pub inbound: Option<InboundMessage>,
    /// A repeat of an already received message
    pub duplicate: bool,
}

impl InboundOutcome {
    fn bad_request() -> Self {
        Self {
            http_status: 400,
            mdn_body: None,
            inbound: None,
            duplicate: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub own_as2_id: String,
    pub message_id_host: String,
    pub policy: AlgorithmPolicy,
}

/// Processes inbound AS2 requests
pub struct InboundReceiver {
    store: SqliteStore,
    certificates: Arc<dyn CertificateStore>,
    keys: Arc<dyn KeyStore>,
    validator: Arc<dyn ValidationEngine>,
    router: Arc<dyn Router>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    routes: RoutingTable,
    config: ReceiverConfig,
}

/// Result of opening and processing the body
struct Processed {
    status: InboundStatus,
    status_reason: Option<String>,
    disposition: Disposition,
    decoded: Option<DecodedPayload>,
    validation: Option<ValidationOutcome>,
    routing: Option<RoutingOutcome>,
}

impl Processed {
    fn rejected(disposition: Disposition, reason: String) -> Self {
        Self {
            status: InboundStatus::Rejected,
            status_reason: Some(reason),
            disposition,
            decoded: None,
            validation: None,
            routing: None,
        }
    }
}

impl InboundReceiver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: SqliteStore,
        certificates: Arc<dyn CertificateStore>,
        keys: Arc<dyn KeyStore>,
        validator: Arc<dyn ValidationEngine>,
        router: Arc<dyn Router>,
        audit: Arc<dyn AuditSink>,
        routes: RoutingTable,
        config: ReceiverConfig,
    ) -> Self {
        Self {
            store,
            certificates,
            keys,
            validator,
            router,
            audit,
            clock: Arc::new(SystemClock),
            routes,
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Handle one POST to the AS2 endpoint
    pub async fn receive<'a, I>(&self, header_pairs: I, body: &[u8]) -> Result<InboundOutcome>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let headers = match As2Headers::from_pairs(header_pairs) {
            Ok(headers) => headers,
            Err(e) => {
                warn!(error = %e, "Rejecting AS2 request with bad headers");
                return Ok(InboundOutcome::bad_request());
            }
        };
        let now = self.clock.now();

        // Replays never re-route.
        if let Some(existing) = self
            .store
            .find_inbound(&headers.as2_from, &headers.message_id)
            .await?
        {
            info!(
                message_id = %headers.message_id,
                as2_from = %headers.as2_from,
                "Duplicate inbound message, replaying MDN"
            );
            return Ok(self.replay(existing));
        }

        let partner = self.authenticate(&headers).await?;
        let processed = match &partner {
            Ok(partner) => self.process(&headers, partner, body).await,
            Err(reason) => Processed::rejected(
                Disposition::processed_with_error("authentication-failed"),
                reason.clone(),
            ),
        };
        let partner = partner.ok();

        let mic = self.receipt_mic(&headers, processed.decoded.as_ref());
        let mdn_requested = headers.mdn_mode().is_some();
        let mdn_mode = headers.mdn_mode().unwrap_or(MdnMode::Sync);
        let mdn_body = if mdn_requested {
            Some(self.build_mdn(&headers, mic.clone(), &processed.disposition, now).await)
        } else {
            None
        };

        let inbound = InboundMessage {
            id: InboundId::new(),
            message_id: headers.message_id.clone(),
            partner_id: partner.as_ref().map(|p| p.id),
            as2_from: headers.as2_from.clone(),
            as2_to: headers.as2_to.clone(),
            subject: headers.subject.clone(),
            content_type: processed.decoded.as_ref().map(|d| d.content_type.clone()),
            payload: processed.decoded.as_ref().map(|d| d.payload.clone()),
            received_at: now,
            mic: mic.clone(),
            status: processed.status,
            status_reason: processed.status_reason.clone(),
            validation: processed.validation.clone(),
            routing: processed.routing.clone(),
            mdn_mode,
            mdn_disposition: mdn_body.as_ref().map(|_| processed.disposition.to_string()),
            mdn_body: mdn_body.clone(),
            mdn_url: match mdn_mode {
                MdnMode::Async => async_mdn_url(&headers),
                MdnMode::Sync => None,
            },
            mdn_sent_at: None,
            mdn_attempts: 0,
        };

        if !self.store.insert_inbound(&inbound).await? {
            // Lost a race with a concurrent copy of the same message.
            let existing = self
                .store
                .find_inbound(&headers.as2_from, &headers.message_id)
                .await?
                .ok_or_else(|| As2Error::Internal("duplicate inbound row vanished".to_string()))?;
            return Ok(self.replay(existing));
        }

        self.record_artifact(&inbound, ArtifactKind::InboundRequest, body.to_vec(), now)
            .await?;
        if let Some(mdn) = &mdn_body {
            self.record_artifact(&inbound, ArtifactKind::InboundMdn, mdn.clone(), now)
                .await?;
        }

        info!(
            message_id = %inbound.message_id,
            as2_from = %inbound.as2_from,
            status = %inbound.status,
            disposition = %processed.disposition,
            mdn_mode = %mdn_mode,
            "Inbound message received"
        );
        let mut audit = AuditLogBuilder::new(AuditAction::InboundReceived, &inbound.as2_from, "partner")
            .resource("inbound_message", inbound.id.to_string())
            .details(json!({
                "message_id": inbound.message_id,
                "status": inbound.status.as_str(),
                "disposition": inbound.mdn_disposition,
            }))
            .at(now);
        if let Some(reason) = &inbound.status_reason {
            if inbound.status != InboundStatus::Routed {
                audit = audit.failed(reason.clone());
            }
        }
        if let Err(e) = self.audit.record(audit.build()).await {
            warn!(error = %e, "Failed to write audit record");
        }

        Ok(InboundOutcome {
            http_status: 200,
            mdn_body: match mdn_mode {
                MdnMode::Sync => mdn_body,
                MdnMode::Async => None,
            },
            inbound: Some(inbound),
            duplicate: false,
        })
    }

    /// Check `AS2-To` and resolve the sending partner.
    ///
    /// The inner `Err` is a rejection reason, not a processing error.
    async fn authenticate(&self, headers: &As2Headers) -> Result<std::result::Result<Partner, String>> {
        if headers.as2_to != self.config.own_as2_id {
            return Ok(Err(format!(
                "addressed to {}, not {}",
                headers.as2_to, self.config.own_as2_id
            )));
        }
        match self.store.get_partner_by_as2_id(&headers.as2_from).await? {
            None => Ok(Err(format!("unknown partner {}", headers.as2_from))),
            Some(partner) if partner.is_archived() => {
                Ok(Err(format!("partner {} is archived", partner.as2_id)))
            }
            Some(partner) => Ok(Ok(partner)),
        }
    }

    async fn process(&self, headers: &As2Headers, partner: &Partner, body: &[u8]) -> Processed {
        let decoded = match self.open(partner, body).await {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    message_id = %headers.message_id,
                    partner = %partner.as2_id,
                    error = %e,
                    "Failed to open inbound envelope"
                );
                let disposition = match &e {
                    CryptoError::Malformed(_) => Disposition::failed(e.disposition_modifier()),
                    _ => Disposition::processed_with_error(e.disposition_modifier()),
                };
                return Processed::rejected(disposition, e.to_string());
            }
        };

        let rule = self
            .routes
            .resolve(Some(&decoded.content_type), headers.subject.as_deref());
        let validation = self
            .validator
            .validate(
                &decoded.payload,
                &decoded.content_type,
                rule.as_ref().and_then(|r| r.schema_version.clone()),
            )
            .await;

        if !validation.passed {
            debug!(message_id = %headers.message_id, errors = ?validation.errors, "Validation failed");
            return Processed {
                status: InboundStatus::ValidationFailed,
                status_reason: Some(validation.errors.join("; ")),
                disposition: Disposition::processed(),
                decoded: Some(decoded),
                validation: Some(validation),
                routing: None,
            };
        }

        let Some(rule) = rule else {
            return Processed {
                status: InboundStatus::RoutingFailed,
                status_reason: Some("no routing rule matches".to_string()),
                disposition: Disposition::processed(),
                decoded: Some(decoded),
                validation: Some(validation),
                routing: None,
            };
        };

        let (status, reason, routing) = match self
            .router
            .route(&decoded.payload, &rule.message_type, &rule.destination)
            .await
        {
            Ok(result) => (
                InboundStatus::Routed,
                None,
                RoutingOutcome {
                    destination: rule.destination.clone(),
                    result,
                    detail: None,
                },
            ),
            Err(e) => (
                InboundStatus::RoutingFailed,
                Some(format!("routing to {} failed: {e}", rule.destination)),
                RoutingOutcome {
                    destination: rule.destination.clone(),
                    result: "failed".to_string(),
                    detail: Some(e),
                },
            ),
        };

        Processed {
            status,
            status_reason: reason,
            disposition: Disposition::processed(),
            decoded: Some(decoded),
            validation: Some(validation),
            routing: Some(routing),
        }
    }

    async fn open(&self, partner: &Partner, body: &[u8]) -> std::result::Result<DecodedPayload, CryptoError> {
        let lookup = |e: As2Error| CryptoError::KeyNotFound(e.to_string());

        let own = self
            .certificates
            .get_active_certificate(CertificateOwner::Own, CertificateUsage::Encryption)
            .await
            .map_err(lookup)?
            .ok_or_else(|| CryptoError::KeyNotFound("own encryption certificate".to_string()))?;
        let encryption_key = self.keys.encryption_key(&own.serial).await?;

        let signer = self
            .certificates
            .get_active_certificate(CertificateOwner::Partner(partner.id), CertificateUsage::Signing)
            .await
            .map_err(lookup)?
            .ok_or_else(|| {
                CryptoError::Signature(format!(
                    "no signing certificate for partner {}",
                    partner.as2_id
                ))
            })?;

        decode(
            body,
            &RecipientIdentity {
                encryption_key,
                certificate_fingerprint: own.fingerprint,
            },
            &signer,
            &self.config.policy,
        )
    }

    /// `Received-Content-MIC`, over the signed body, in the first requested
    /// algorithm we allow (else the sender's)
    fn receipt_mic(&self, headers: &As2Headers, decoded: Option<&DecodedPayload>) -> Option<String> {
        let decoded = decoded?;
        let requested = headers
            .disposition_options
            .as_ref()
            .and_then(|o| o.preferred_mic(&self.config.policy));

        Some(match requested {
            Some(alg) if alg != decoded.mic_algorithm => {
                format_mic(&compute_mic(alg, &decoded.signed_body), alg)
            }
            _ => format_mic(&decoded.mic, decoded.mic_algorithm),
        })
    }

    async fn build_mdn(
        &self,
        headers: &As2Headers,
        mic: Option<String>,
        disposition: &Disposition,
        now: DateTime<Utc>,
    ) -> Vec<u8> {
        let mdn = Mdn {
            message_id: Some(generate_as2_message_id(&self.config.message_id_host)),
            reporting_ua: REPORTING_UA.to_string(),
            original_recipient: Some(headers.as2_to.clone()),
            final_recipient: self.config.own_as2_id.clone(),
            original_message_id: headers.message_id.clone(),
            received_content_mic: mic,
            disposition: disposition.clone(),
        };

        if !headers.wants_signed_mdn() {
            return mdn.render();
        }
        match self.signing_identity(now).await {
            Ok((key, fingerprint)) => mdn.render_signed(&key, &fingerprint),
            Err(e) => {
                warn!(message_id = %headers.message_id, error = %e, "Cannot sign MDN, sending unsigned");
                mdn.render()
            }
        }
    }

    async fn signing_identity(&self, now: DateTime<Utc>) -> Result<(crate::crypto::SigningKeyPair, String)> {
        let cert = self
            .certificates
            .get_active_certificate(CertificateOwner::Own, CertificateUsage::Signing)
            .await?
            .filter(|c| c.valid_from <= now && now <= c.valid_to)
            .ok_or_else(|| As2Error::Configuration("no usable own signing certificate".to_string()))?;
        let key = self.keys.signing_key(&cert.serial).await?;
        Ok((key, cert.fingerprint))
    }

    fn replay(&self, existing: InboundMessage) -> InboundOutcome {
        InboundOutcome {
            http_status: 200,
            mdn_body: match existing.mdn_mode {
                MdnMode::Sync => existing.mdn_body.clone(),
                MdnMode::Async => None,
            },
            inbound: Some(existing),
            duplicate: true,
        }
    }

    async fn record_artifact(
        &self,
        inbound: &InboundMessage,
        kind: ArtifactKind,
        bytes: Vec<u8>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.store
            .record_artifact(&RawArtifact {
                owner_id: inbound.id.0,
                kind,
                bytes,
                recorded_at: at,
            })
            .await
    }
}

/// Where an async MDN goes: `Receipt-Delivery-Option`, else an http(s)
/// `Disposition-Notification-To`
fn async_mdn_url(headers: &As2Headers) -> Option<String> {
    headers.receipt_delivery_option.clone().or_else(|| {
        headers
            .disposition_notification_to
            .clone()
            .filter(|to| to.starts_with("http://") || to.starts_with("https://"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::as2::parse_mdn;
    use crate::crypto::{
        encode, issue_certificate, CertificateTemplate, EncodeOptions, EncryptionKeyPair,
        InMemoryKeyStore, SenderIdentity, SigningKeyPair,
    };
    use crate::infra::sqlite::fixtures;
    use crate::domain::MicAlgorithm;
    use crate::infra::{MockAuditSink, MockRouter, MockValidationEngine};

    fn rule(message_type: &str, content_type: Option<&str>, subject: Option<&str>) -> RoutingRule {
        RoutingRule {
            message_type: message_type.to_string(),
            destination: format!("queue://{message_type}"),
            content_type: content_type.map(str::to_string),
            subject_contains: subject.map(str::to_string),
            schema_version: None,
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let table = RoutingTable::new(vec![
            rule("x12-850", Some("application/edi-x12"), Some("purchase order")),
            rule("x12", Some("application/edi-x12"), None),
            rule("invoice", None, Some("invoice")),
        ]);

        let hit = |ct: &str, subject: &str| {
            table
                .resolve(Some(ct), Some(subject))
                .map(|r| r.message_type)
        };
        assert_eq!(
            hit("application/EDI-X12; charset=us-ascii", "Purchase Order 7"),
            Some("x12-850".to_string())
        );
        assert_eq!(hit("application/edi-x12", "Invoice 9"), Some("x12".to_string()));
        assert_eq!(hit("application/xml", "INVOICE 9"), Some("invoice".to_string()));
        assert_eq!(hit("application/xml", "ship notice"), None);
    }

    #[test]
    fn default_destination_catches_the_rest() {
        let table = RoutingTable::default().with_default("queue://inbox");
        let rule = table.resolve(None, None).unwrap();
        assert_eq!(rule.destination, "queue://inbox");
        assert_eq!(rule.message_type, "unclassified");
    }

    #[test]
    fn routing_rules_parse_from_json() {
        let table: RoutingTable = serde_json::from_str(
            r#"{"rules":[{"message_type":"x12","destination":"erp","content_type":"application/edi-x12"}]}"#,
        )
        .unwrap();
        assert_eq!(table.rules.len(), 1);
        assert!(table.default_destination.is_none());
    }

    #[test]
    fn async_url_prefers_receipt_delivery_option() {
        let mut headers = As2Headers::from_pairs([
            ("AS2-From", "A"),
            ("AS2-To", "B"),
            ("Message-ID", "<m@a>"),
            ("Disposition-Notification-To", "https://a.example/mdn"),
        ])
        .unwrap();
        assert_eq!(
            async_mdn_url(&headers).as_deref(),
            Some("https://a.example/mdn")
        );

        headers.receipt_delivery_option = Some("https://a.example/rdo".to_string());
        assert_eq!(
            async_mdn_url(&headers).as_deref(),
            Some("https://a.example/rdo")
        );

        headers.receipt_delivery_option = None;
        headers.disposition_notification_to = Some("mdn@a.example".to_string());
        assert_eq!(async_mdn_url(&headers), None);
    }

    #[tokio::test]
    async fn failed_validation_still_acknowledges_receipt() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();
        let keys = InMemoryKeyStore::new();

        let own_encryption = EncryptionKeyPair::generate();
        let own_signing = SigningKeyPair::generate();
        let own = issue_certificate(
            CertificateTemplate {
                serial: "SELF-1".to_string(),
                subject_dn: "CN=gateway".to_string(),
                issuer_dn: "CN=gateway".to_string(),
                valid_from: now - chrono::Duration::days(1),
                valid_to: now + chrono::Duration::days(365),
                owner: CertificateOwner::Own,
            },
            Some(&own_encryption),
            Some(&own_signing),
            now,
        )
        .unwrap();
        store.insert_certificate(&own).await.unwrap();
        keys.insert_encryption("SELF-1", own_encryption).await;
        keys.insert_signing("SELF-1", own_signing).await;

        let mut partner = fixtures::partner("ACME", now);
        let partner_signing = SigningKeyPair::generate();
        let partner_cert = issue_certificate(
            CertificateTemplate {
                serial: "ACME-SIG-1".to_string(),
                subject_dn: "CN=acme".to_string(),
                issuer_dn: "CN=acme".to_string(),
                valid_from: now - chrono::Duration::days(1),
                valid_to: now + chrono::Duration::days(365),
                owner: CertificateOwner::Partner(partner.id),
            },
            None,
            Some(&partner_signing),
            now,
        )
        .unwrap();
        partner.signing_cert_serial = partner_cert.serial.clone();
        store.insert_certificate(&partner_cert).await.unwrap();
        store.insert_partner(&partner).await.unwrap();

        let policy = AlgorithmPolicy::default();
        let envelope = encode(
            b"ISA*00*~IEA*1~",
            "application/edi-x12",
            EncodeOptions {
                cipher: partner.crypto.encryption,
                mic_algorithm: MicAlgorithm::Sha256,
                compress: false,
            },
            &SenderIdentity {
                signing_key: partner_signing,
                certificate_fingerprint: partner_cert.fingerprint.clone(),
            },
            &own,
            &policy,
        )
        .unwrap();

        let mut validator = MockValidationEngine::new();
        validator.expect_validate().times(1).returning(|_, _, _| ValidationOutcome {
            passed: false,
            errors: vec!["segment count mismatch".to_string()],
            schema_version: None,
        });
        let mut router = MockRouter::new();
        router.expect_route().never();
        let mut audit = MockAuditSink::new();
        audit.expect_record().returning(|_| Ok(()));

        let receiver = InboundReceiver::new(
            store.clone(),
            Arc::new(store.clone()),
            Arc::new(keys),
            Arc::new(validator),
            Arc::new(router),
            Arc::new(audit),
            RoutingTable::default().with_default("queue://inbox"),
            ReceiverConfig {
                own_as2_id: "GATEWAY".to_string(),
                message_id_host: "gateway.test".to_string(),
                policy,
            },
        );

        let outcome = receiver
            .receive(
                [
                    ("AS2-From", "ACME"),
                    ("AS2-To", "GATEWAY"),
                    ("Message-ID", "<inv-1@acme>"),
                    ("Subject", "Invoice 1"),
                    ("Disposition-Notification-To", "edi@acme.example"),
                ],
                &envelope.bytes,
            )
            .await
            .unwrap();

        assert_eq!(outcome.http_status, 200);
        let inbound = outcome.inbound.unwrap();
        assert_eq!(inbound.status, InboundStatus::ValidationFailed);
        assert_eq!(inbound.status_reason.as_deref(), Some("segment count mismatch"));
        assert!(inbound.routing.is_none());

        let mdn = parse_mdn(&outcome.mdn_body.unwrap()).unwrap().mdn;
        assert_eq!(mdn.disposition, Disposition::processed());
        assert_eq!(mdn.original_message_id, "<inv-1@acme>");
        assert_eq!(
            mdn.received_content_mic,
            Some(format_mic(&envelope.mic, MicAlgorithm::Sha256))
        );
    }
}
