//! Outbound transmission state machine
//!
//! Drives a message from `queued` through sending and MDN reconciliation to
//! a terminal state. Every state change is a compare-and-set in the store,
//! appended to the message timeline and published on a broadcast channel.
//!
//! Failure routing:
//! - transport timeout: `sending -> awaiting_mdn -> mdn_timeout`, then retry
//! - other transport errors: `sending -> send_failed`, then retry
//! - malformed MDN: `awaiting_mdn -> mdn_timeout`, then retry
//! - crypto, algorithm and configuration errors: straight to `failed`

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::locks::MessageLocks;
use super::scheduler::{retry_decision, RetryDecision};
use crate::as2::{
    parse_mdn, verify_mdn, As2Headers, As2Transport, DispositionOptions, MdnExpectation,
    MdnVerification, OutboundRequest, TransportError, TransportResult, CONTENT_TYPE_ENVELOPE,
};
use crate::crypto::{self, AlgorithmPolicy, CryptoError, EncodeOptions, KeyStore, SenderIdentity};
use crate::domain::{
    generate_as2_message_id, ArtifactKind, BusinessAck, BusinessAckStatus, Certificate,
    CertificateOwner, CertificateUsage, MdnMetadata, MdnMode, MessageId, OutboundMessage,
    PageRequest, Partner, PartnerId, RawArtifact, StateTransition, SubmitRequest,
    TransmissionEvent, TransmissionState, AS2_VERSION,
};
use crate::infra::{
    As2Error, AuditAction, AuditLogBuilder, AuditLogEntry, AuditSink, CertificateStore,
    MessageFilter, MessageUpdate, Result, SqliteStore,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Engine settings shared by every transmission
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Our AS2 identifier (`AS2-From` on outbound messages)
    pub own_as2_id: String,
    /// Host part of generated `Message-ID`s
    pub message_id_host: String,
    /// Where partners POST async MDNs back to us
    pub async_mdn_url: Option<String>,
    pub policy: AlgorithmPolicy,
    /// Certificates this close to expiry are reported `expiring`
    pub expiring_window: chrono::Duration,
}

impl EngineConfig {
    pub fn new(own_as2_id: impl Into<String>) -> Self {
        let own_as2_id = own_as2_id.into();
        Self {
            message_id_host: own_as2_id.to_ascii_lowercase(),
            own_as2_id,
            async_mdn_url: None,
            policy: AlgorithmPolicy::default(),
            expiring_window: chrono::Duration::days(30),
        }
    }

    /// Load configuration from environment
    pub fn from_env() -> std::result::Result<Self, CryptoError> {
        let own_as2_id = std::env::var("AS2_OWN_ID").unwrap_or_else(|_| "AS2GATEWAY".to_string());
        let mut config = Self::new(own_as2_id);

        if let Ok(host) = std::env::var("AS2_MESSAGE_ID_HOST") {
            config.message_id_host = host;
        }
        config.async_mdn_url = std::env::var("AS2_MDN_URL").ok().filter(|s| !s.is_empty());

        let ciphers = std::env::var("AS2_ALLOWED_CIPHERS").ok();
        let mics = std::env::var("AS2_ALLOWED_MIC_ALGS").ok();
        if ciphers.is_some() || mics.is_some() {
            config.policy = AlgorithmPolicy::parse(
                ciphers.as_deref().unwrap_or("aes128-gcm,aes256-gcm"),
                mics.as_deref().unwrap_or("sha1,sha256,sha384,sha512"),
            )?;
        }

        config.expiring_window = std::env::var("AS2_CERT_EXPIRING_DAYS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(chrono::Duration::days)
            .unwrap_or(config.expiring_window);

        Ok(config)
    }
}

/// Result of an operator cancel
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The message is now `cancelled`
    Cancelled(OutboundMessage),
    /// An attempt is in flight; the cancel is honoured at the next retry decision
    Requested,
    /// Already past the point where cancelling has any effect
    NoOp { state: TransmissionState },
}

/// Result of handling an MDN
#[derive(Debug, Clone)]
pub struct MdnReceipt {
    pub message: OutboundMessage,
    /// Verification outcome label, e.g. `verified_success`
    pub verification: &'static str,
}

/// Drives outbound transmissions through their lifecycle
pub struct TransmissionEngine {
    store: SqliteStore,
    certificates: Arc<dyn CertificateStore>,
    keys: Arc<dyn KeyStore>,
    transport: Arc<dyn As2Transport>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    locks: MessageLocks,
    events: broadcast::Sender<TransmissionEvent>,
    config: EngineConfig,
}

impl TransmissionEngine {
    pub fn new(
        store: SqliteStore,
        certificates: Arc<dyn CertificateStore>,
        keys: Arc<dyn KeyStore>,
        transport: Arc<dyn As2Transport>,
        audit: Arc<dyn AuditSink>,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            certificates,
            keys,
            transport,
            audit,
            clock: Arc::new(SystemClock),
            locks: MessageLocks::new(),
            events,
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Committed transitions, in commit order per message
    pub fn subscribe(&self) -> broadcast::Receiver<TransmissionEvent> {
        self.events.subscribe()
    }

    /// Queue a new message for `request.partner_id`.
    ///
    /// The partner must be active and reference usable encryption and
    /// signing certificates.
    pub async fn submit(&self, request: SubmitRequest, actor: &str) -> Result<OutboundMessage> {
        if request.payload.is_empty() {
            return Err(As2Error::Validation("payload must not be empty".to_string()));
        }
        if request.content_type.trim().is_empty() {
            return Err(As2Error::Validation("content type is required".to_string()));
        }

        let partner = self.partner(request.partner_id).await?;
        let now = self.clock.now();

        if partner.is_archived() {
            return Err(As2Error::Configuration(format!(
                "partner {} is archived",
                partner.as2_id
            )));
        }
        self.config
            .policy
            .check_cipher(partner.crypto.encryption)
            .and_then(|_| self.config.policy.check_mic(partner.crypto.mic_algorithm))
            .map_err(|e| As2Error::Configuration(e.to_string()))?;
        self.usable_partner_certificate(&partner, CertificateUsage::Encryption, now)
            .await?;
        self.usable_partner_certificate(&partner, CertificateUsage::Signing, now)
            .await?;

        let msg = OutboundMessage {
            id: MessageId::new(),
            message_id: generate_as2_message_id(&self.config.message_id_host),
            partner_id: partner.id,
            payload: request.payload,
            content_type: request.content_type,
            subject: request.subject,
            priority: request.priority,
            created_at: now,
            state: TransmissionState::Queued,
            state_reason: None,
            sent_mic: None,
            received_mic: None,
            mic_algorithm: None,
            compressed: None,
            envelope: None,
            envelope_cert_serial: None,
            mdn: None,
            business_ack: None,
            retry_count: 0,
            next_attempt_at: Some(now),
            mdn_deadline: None,
            cancel_requested: false,
            review_required: false,
            business_ack_overdue_warned: false,
            updated_at: now,
        };
        self.store.insert_outbound(&msg).await?;

        info!(
            message_id = %msg.message_id,
            partner = %partner.as2_id,
            priority = msg.priority.as_str(),
            bytes = msg.payload.len(),
            "Message queued"
        );
        self.record_audit(
            AuditLogBuilder::new(AuditAction::MessageSubmitted, actor, actor_type(actor))
                .resource("outbound_message", msg.id.to_string())
                .details(json!({
                    "message_id": msg.message_id,
                    "partner": partner.as2_id,
                    "content_type": msg.content_type,
                }))
                .at(now)
                .build(),
        )
        .await;

        Ok(msg)
    }

    /// One send attempt for a `queued`, `send_failed` or `mdn_timeout` message
    pub async fn dispatch(&self, id: MessageId) -> Result<OutboundMessage> {
        let _guard = self.locks.try_lock(id)?;
        let msg = self.message(id).await?;

        if !msg.state.is_dispatchable() {
            return Err(As2Error::InvalidStateTransition {
                message_id: id.to_string(),
                from: msg.state.to_string(),
                to: TransmissionState::Sending.to_string(),
            });
        }
        if msg.cancel_requested {
            return self.cancel_now(&msg, "system").await;
        }

        let partner = self.partner(msg.partner_id).await?;
        let msg = self
            .transition(
                &msg,
                TransmissionState::Sending,
                None,
                MessageUpdate {
                    next_attempt_at: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        match self.attempt(&msg, &partner).await {
            Ok(msg) => Ok(msg),
            Err(e) => self.settle_failed_attempt(msg.id, &partner, e).await,
        }
    }

    /// Encode, send and classify one attempt for a message in `sending`
    async fn attempt(&self, msg: &OutboundMessage, partner: &Partner) -> Result<OutboundMessage> {
        let (msg, body) = match self.prepare_envelope(msg, partner).await {
            Ok(prepared) => prepared,
            Err(e) if e.is_fatal() => return self.fail(msg, &e.to_string()).await,
            Err(e) => return Err(e),
        };
        let request = match self.build_request(&msg, partner, body) {
            Ok(request) => request,
            Err(e) => return self.fail(&msg, &e.to_string()).await,
        };

        info!(
            message_id = %msg.message_id,
            partner = %partner.as2_id,
            attempt = msg.retry_count + 1,
            mdn_mode = %partner.mdn_mode,
            "Sending message"
        );

        match self.transport.send(request, partner.mdn_timeout()).await {
            Ok(TransportResult::SyncMdn { status, body }) => {
                debug!(message_id = %msg.message_id, status, "Synchronous MDN returned");
                let awaiting = self
                    .transition(
                        &msg,
                        TransmissionState::AwaitingMdn,
                        None,
                        MessageUpdate {
                            mdn_deadline: Some(Some(self.mdn_deadline(partner))),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.record_artifact(msg.id.0, ArtifactKind::SyncMdn, body.clone())
                    .await?;
                Ok(self.apply_mdn(awaiting, partner, &body).await?.message)
            }
            Ok(TransportResult::PendingAsync { status }) => {
                let deadline = self.mdn_deadline(partner);
                debug!(message_id = %msg.message_id, status, %deadline, "Awaiting asynchronous MDN");
                self.transition(
                    &msg,
                    TransmissionState::AwaitingMdn,
                    None,
                    MessageUpdate {
                        mdn_deadline: Some(Some(deadline)),
                        ..Default::default()
                    },
                )
                .await
            }
            Err(TransportError::Timeout(after)) => {
                let reason = format!("no MDN within {}s", after.as_secs());
                warn!(message_id = %msg.message_id, partner = %partner.as2_id, %reason, "Send timed out");
                let awaiting = self
                    .transition(&msg, TransmissionState::AwaitingMdn, None, MessageUpdate::default())
                    .await?;
                let timed_out = self
                    .transition(
                        &awaiting,
                        TransmissionState::MdnTimeout,
                        Some(reason.clone()),
                        MessageUpdate::default(),
                    )
                    .await?;
                self.after_retryable_failure(timed_out, partner, &reason).await
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(message_id = %msg.message_id, partner = %partner.as2_id, error = %reason, "Send failed");
                let failed = self
                    .transition(
                        &msg,
                        TransmissionState::SendFailed,
                        Some(reason.clone()),
                        MessageUpdate::default(),
                    )
                    .await?;
                self.after_retryable_failure(failed, partner, &reason).await
            }
        }
    }

    /// Put a message an attempt errored out on back on the retry schedule.
    ///
    /// A message still in `sending` goes to `send_failed`. One already in
    /// `awaiting_mdn` carries a deadline and is left to the deadline sweep.
    async fn settle_failed_attempt(
        &self,
        id: MessageId,
        partner: &Partner,
        error: As2Error,
    ) -> Result<OutboundMessage> {
        let current = match self.message(id).await {
            Ok(current) if current.state == TransmissionState::Sending => current,
            _ => return Err(error),
        };

        let reason = format!("attempt aborted: {error}");
        warn!(message_id = %current.message_id, partner = %partner.as2_id, %reason, "Send attempt errored");
        let settled = match self
            .transition(
                &current,
                TransmissionState::SendFailed,
                Some(reason.clone()),
                MessageUpdate::default(),
            )
            .await
        {
            Ok(failed) => self.after_retryable_failure(failed, partner, &reason).await,
            Err(e) => Err(e),
        };
        settled.map_err(|e| {
            warn!(message_id = %current.message_id, error = %e, "Could not reschedule errored attempt");
            error
        })
    }

    fn mdn_deadline(&self, partner: &Partner) -> DateTime<Utc> {
        self.clock.now() + chrono::Duration::seconds(i64::from(partner.mdn_timeout_secs))
    }

    /// Handle an MDN POSTed to our callback URL
    pub async fn receive_async_mdn(&self, bytes: &[u8]) -> Result<MdnReceipt> {
        let parsed = parse_mdn(bytes)
            .map_err(|e| As2Error::MdnVerification(format!("unreadable MDN: {e}")))?;
        let original = parsed.mdn.original_message_id;

        let msg = self
            .store
            .get_outbound_by_message_id(&original)
            .await?
            .ok_or_else(|| As2Error::MessageNotFound(original.clone()))?;
        self.record_artifact(msg.id.0, ArtifactKind::AsyncMdn, bytes.to_vec())
            .await?;

        let _guard = self.locks.try_lock(msg.id)?;
        let msg = self.message(msg.id).await?;
        if msg.state != TransmissionState::AwaitingMdn {
            info!(
                message_id = %msg.message_id,
                state = %msg.state,
                "MDN arrived for a message that is not awaiting one"
            );
            return Err(As2Error::InvalidStateTransition {
                message_id: msg.id.to_string(),
                from: msg.state.to_string(),
                to: TransmissionState::MdnVerified.to_string(),
            });
        }

        let partner = self.partner(msg.partner_id).await?;
        self.apply_mdn(msg, &partner, bytes).await
    }

    /// Time out every `awaiting_mdn` message whose deadline has passed.
    ///
    /// Returns the number of messages moved to `mdn_timeout`.
    pub async fn expire_mdn_deadlines(&self) -> Result<usize> {
        let now = self.clock.now();
        let expired = self.store.expired_mdn_deadlines(now).await?;
        let mut count = 0;

        for candidate in expired {
            let Ok(_guard) = self.locks.try_lock(candidate.id) else {
                debug!(message_id = %candidate.message_id, "Skipping busy message in deadline sweep");
                continue;
            };
            let msg = self.message(candidate.id).await?;
            let Some(deadline) = msg.mdn_deadline else {
                continue;
            };
            if msg.state != TransmissionState::AwaitingMdn || deadline > now {
                continue;
            }

            let partner = self.partner(msg.partner_id).await?;
            let reason = format!("no MDN received by {}", deadline.to_rfc3339());
            warn!(message_id = %msg.message_id, partner = %partner.as2_id, "MDN deadline passed");
            let timed_out = self
                .transition(
                    &msg,
                    TransmissionState::MdnTimeout,
                    Some(reason.clone()),
                    MessageUpdate {
                        mdn_deadline: Some(None),
                        ..Default::default()
                    },
                )
                .await?;
            self.after_retryable_failure(timed_out, &partner, &reason)
                .await?;
            count += 1;
        }

        Ok(count)
    }

    /// Log, once per message, business acks that are past the partner's SLA
    pub async fn warn_overdue_business_acks(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut warned = 0;

        for msg in self.store.unwarned_business_acks().await? {
            let partner = self.partner(msg.partner_id).await?;
            let since = msg
                .mdn
                .as_ref()
                .map(|m| m.received_at)
                .unwrap_or(msg.updated_at);
            if now <= since + partner.business_ack_sla() {
                continue;
            }

            warn!(
                message_id = %msg.message_id,
                partner = %partner.as2_id,
                sla_minutes = partner.business_ack_sla_minutes,
                "business_ack_overdue"
            );
            match self
                .store
                .update_outbound(
                    msg.id,
                    TransmissionState::AwaitingBusinessAck,
                    MessageUpdate {
                        business_ack_overdue_warned: Some(true),
                        ..Default::default()
                    },
                    now,
                )
                .await
            {
                Ok(_) => warned += 1,
                Err(As2Error::ConcurrentModification { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(warned)
    }

    /// Record the receiver's application-level acknowledgment
    pub async fn record_business_ack(
        &self,
        id: MessageId,
        accepted: bool,
        detail: Option<String>,
        actor: &str,
    ) -> Result<OutboundMessage> {
        let _guard = self.locks.try_lock(id)?;
        let msg = self.message(id).await?;
        let now = self.clock.now();

        let (status, to, reason) = if accepted {
            (BusinessAckStatus::Accepted, TransmissionState::Complete, None)
        } else {
            (
                BusinessAckStatus::Rejected,
                TransmissionState::BusinessAckRejected,
                Some(format!(
                    "business acknowledgment rejected{}",
                    detail
                        .as_deref()
                        .map(|d| format!(": {d}"))
                        .unwrap_or_default()
                )),
            )
        };

        let updated = self
            .transition(
                &msg,
                to,
                reason,
                MessageUpdate {
                    business_ack: Some(BusinessAck {
                        status,
                        received_at: now,
                        detail: detail.clone(),
                    }),
                    ..Default::default()
                },
            )
            .await?;

        self.record_audit(
            AuditLogBuilder::new(AuditAction::BusinessAckRecorded, actor, actor_type(actor))
                .resource("outbound_message", id.to_string())
                .details(json!({
                    "message_id": msg.message_id,
                    "status": status.as_str(),
                    "detail": detail,
                }))
                .at(now)
                .build(),
        )
        .await;

        Ok(updated)
    }

    /// Operator cancel.
    ///
    /// Waiting states are cancelled at once; in-flight states get a
    /// `cancel_requested` flag; later states are left alone.
    pub async fn cancel(&self, id: MessageId, actor: &str) -> Result<CancelOutcome> {
        let now = self.clock.now();
        let guard = match self.locks.try_lock(id) {
            Ok(guard) => guard,
            Err(As2Error::MessageBusy(_)) => {
                // An attempt is running; leave a note for its retry decision.
                return if self.store.request_cancel(id, now).await? {
                    info!(%id, "Cancel requested for in-flight message");
                    self.audit_cancel_request(id, actor, now).await;
                    Ok(CancelOutcome::Requested)
                } else {
                    let msg = self.message(id).await?;
                    info!(%id, state = %msg.state, "Cancel ignored");
                    Ok(CancelOutcome::NoOp { state: msg.state })
                };
            }
            Err(e) => return Err(e),
        };

        let msg = self.message(id).await?;
        let outcome = match msg.state {
            TransmissionState::Queued
            | TransmissionState::SendFailed
            | TransmissionState::MdnTimeout => {
                CancelOutcome::Cancelled(self.cancel_now(&msg, actor).await?)
            }
            TransmissionState::Sending | TransmissionState::AwaitingMdn => {
                self.store
                    .update_outbound(
                        id,
                        msg.state,
                        MessageUpdate {
                            cancel_requested: Some(true),
                            ..Default::default()
                        },
                        now,
                    )
                    .await?;
                info!(message_id = %msg.message_id, state = %msg.state, "Cancel requested");
                self.audit_cancel_request(id, actor, now).await;
                CancelOutcome::Requested
            }
            state => {
                info!(message_id = %msg.message_id, %state, "Cancel ignored");
                CancelOutcome::NoOp { state }
            }
        };
        drop(guard);

        Ok(outcome)
    }

    pub async fn timeline(&self, id: MessageId) -> Result<Vec<StateTransition>> {
        self.message(id).await?;
        self.store.timeline(id).await
    }

    /// Move messages left in `sending` by a previous process to `send_failed`
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let stuck = self
            .store
            .list_outbound(
                &MessageFilter {
                    state: Some(TransmissionState::Sending),
                    partner_id: None,
                },
                PageRequest::new(PageRequest::MAX_LIMIT, 0),
            )
            .await?;

        let mut recovered = 0;
        for msg in stuck.items {
            let Ok(_guard) = self.locks.try_lock(msg.id) else {
                continue;
            };
            let partner = self.partner(msg.partner_id).await?;
            let reason = "attempt interrupted by restart".to_string();
            let failed = self
                .transition(
                    &msg,
                    TransmissionState::SendFailed,
                    Some(reason.clone()),
                    MessageUpdate::default(),
                )
                .await?;
            self.after_retryable_failure(failed, &partner, &reason)
                .await?;
            recovered += 1;
        }

        if recovered > 0 {
            info!(recovered, "Recovered interrupted send attempts");
        }
        Ok(recovered)
    }

    async fn apply_mdn(
        &self,
        msg: OutboundMessage,
        partner: &Partner,
        bytes: &[u8],
    ) -> Result<MdnReceipt> {
        let now = self.clock.now();
        let (Some(sent_mic), Some(mic_algorithm)) = (msg.sent_mic.clone(), msg.mic_algorithm)
        else {
            return Err(As2Error::Internal(format!(
                "message {} has no sent MIC",
                msg.message_id
            )));
        };
        let signer = self
            .certificates
            .get_active_certificate(CertificateOwner::Partner(partner.id), CertificateUsage::Signing)
            .await?;

        let verification = verify_mdn(
            bytes,
            &MdnExpectation {
                message_id: &msg.message_id,
                sent_mic: &sent_mic,
                mic_algorithm,
                signer: signer.as_ref(),
                require_signature: partner.crypto.request_signed_mdn,
            },
        );
        let label = verification.label();
        info!(
            message_id = %msg.message_id,
            partner = %partner.as2_id,
            verification = label,
            "MDN evaluated"
        );

        let mut audit = AuditLogBuilder::system(AuditAction::MdnReceived)
            .resource("outbound_message", msg.id.to_string())
            .details(json!({
                "message_id": msg.message_id,
                "verification": label,
                "disposition": verification.disposition().map(|d| d.to_string()),
            }))
            .at(now);

        let message = match verification {
            MdnVerification::Malformed { reason } => {
                audit = audit.failed(reason.clone());
                let reason = format!("malformed MDN: {reason}");
                let timed_out = self
                    .transition(
                        &msg,
                        TransmissionState::MdnTimeout,
                        Some(reason.clone()),
                        MessageUpdate {
                            mdn_deadline: Some(None),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.after_retryable_failure(timed_out, partner, &reason)
                    .await?
            }
            MdnVerification::SignatureInvalid { reason } => {
                // Discarded; the message keeps waiting until its deadline.
                warn!(message_id = %msg.message_id, %reason, "Discarding MDN with invalid signature");
                audit = audit.failed(reason);
                if msg.mdn_deadline.is_some() {
                    msg
                } else {
                    self.store
                        .update_outbound(
                            msg.id,
                            TransmissionState::AwaitingMdn,
                            MessageUpdate {
                                mdn_deadline: Some(Some(self.mdn_deadline(partner))),
                                ..Default::default()
                            },
                            now,
                        )
                        .await?
                }
            }
            MdnVerification::NegativeDisposition {
                mdn,
                signature_verified,
            } => {
                let reason = format!("partner reported {}", mdn.disposition);
                self.transition(
                    &msg,
                    TransmissionState::MdnRejected,
                    Some(reason),
                    MessageUpdate {
                        mdn: Some(MdnMetadata {
                            disposition: mdn.disposition.to_string(),
                            signature_verified,
                            mdn_message_id: mdn.message_id,
                            received_at: now,
                        }),
                        mdn_deadline: Some(None),
                        ..Default::default()
                    },
                )
                .await?
            }
            MdnVerification::VerifiedMismatch {
                mdn,
                received_mic,
                signature_verified,
            } => {
                let reason = format!(
                    "MIC mismatch: sent {}, partner reported {}",
                    sent_mic,
                    received_mic.as_deref().unwrap_or("none")
                );
                warn!(message_id = %msg.message_id, %reason, "Holding message for manual review");
                self.transition(
                    &msg,
                    TransmissionState::MdnRejected,
                    Some(reason),
                    MessageUpdate {
                        mdn: Some(MdnMetadata {
                            disposition: mdn.disposition.to_string(),
                            signature_verified,
                            mdn_message_id: mdn.message_id,
                            received_at: now,
                        }),
                        review_required: Some(true),
                        mdn_deadline: Some(None),
                        ..Default::default()
                    },
                )
                .await?
            }
            MdnVerification::VerifiedSuccess {
                mdn,
                received_mic,
                signature_verified,
            } => {
                let verified = self
                    .transition(
                        &msg,
                        TransmissionState::MdnVerified,
                        None,
                        MessageUpdate {
                            // Only a verified signature vouches for the partner's MIC.
                            received_mic: signature_verified.then_some(received_mic),
                            mdn: Some(MdnMetadata {
                                disposition: mdn.disposition.to_string(),
                                signature_verified,
                                mdn_message_id: mdn.message_id,
                                received_at: now,
                            }),
                            mdn_deadline: Some(None),
                            ..Default::default()
                        },
                    )
                    .await?;
                let next = if partner.business_ack_expected {
                    TransmissionState::AwaitingBusinessAck
                } else {
                    TransmissionState::Complete
                };
                self.transition(&verified, next, None, MessageUpdate::default())
                    .await?
            }
        };

        self.record_audit(audit.build()).await;
        Ok(MdnReceipt {
            message,
            verification: label,
        })
    }

    /// Apply the retry decision to a message in `send_failed` or `mdn_timeout`
    async fn after_retryable_failure(
        &self,
        msg: OutboundMessage,
        partner: &Partner,
        last_error: &str,
    ) -> Result<OutboundMessage> {
        let now = self.clock.now();
        match retry_decision(&msg, &partner.retry_policy, now, last_error) {
            RetryDecision::Cancel => self.cancel_now(&msg, "system").await,
            RetryDecision::Retry {
                retry_count,
                next_attempt_at,
            } => {
                info!(
                    message_id = %msg.message_id,
                    partner = %partner.as2_id,
                    retry = retry_count,
                    max_retries = partner.retry_policy.max_retries,
                    %next_attempt_at,
                    "Retry scheduled"
                );
                self.store
                    .update_outbound(
                        msg.id,
                        msg.state,
                        MessageUpdate {
                            retry_count: Some(retry_count),
                            next_attempt_at: Some(Some(next_attempt_at)),
                            ..Default::default()
                        },
                        now,
                    )
                    .await
            }
            RetryDecision::Exhausted { reason } => self.fail(&msg, &reason).await,
        }
    }

    /// Terminal failure with an audit record
    async fn fail(&self, msg: &OutboundMessage, reason: &str) -> Result<OutboundMessage> {
        warn!(message_id = %msg.message_id, state = %msg.state, %reason, "Message failed");
        let failed = self
            .transition(
                msg,
                TransmissionState::Failed,
                Some(reason.to_string()),
                MessageUpdate {
                    next_attempt_at: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        self.record_audit(
            AuditLogBuilder::system(AuditAction::MessageFailed)
                .resource("outbound_message", msg.id.to_string())
                .details(json!({
                    "message_id": msg.message_id,
                    "retry_count": msg.retry_count,
                }))
                .failed(reason)
                .at(self.clock.now())
                .build(),
        )
        .await;
        Ok(failed)
    }

    async fn cancel_now(&self, msg: &OutboundMessage, actor: &str) -> Result<OutboundMessage> {
        let cancelled = self
            .transition(
                msg,
                TransmissionState::Cancelled,
                Some(format!("cancelled by {actor}")),
                MessageUpdate {
                    next_attempt_at: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        self.record_audit(
            AuditLogBuilder::new(AuditAction::MessageCancelled, actor, actor_type(actor))
                .resource("outbound_message", msg.id.to_string())
                .details(json!({ "message_id": msg.message_id, "from": msg.state }))
                .at(self.clock.now())
                .build(),
        )
        .await;
        Ok(cancelled)
    }

    async fn audit_cancel_request(&self, id: MessageId, actor: &str, at: DateTime<Utc>) {
        self.record_audit(
            AuditLogBuilder::new(AuditAction::CancelRequested, actor, actor_type(actor))
                .resource("outbound_message", id.to_string())
                .at(at)
                .build(),
        )
        .await;
    }

    /// Reuse the stored envelope, or encode a new one.
    ///
    /// The stored envelope is reused while it targets the partner's current
    /// encryption certificate. A rebuild must reproduce the sent MIC.
    async fn prepare_envelope(
        &self,
        msg: &OutboundMessage,
        partner: &Partner,
    ) -> Result<(OutboundMessage, Vec<u8>)> {
        let now = self.clock.now();
        let recipient = self
            .certificates
            .get_active_certificate(
                CertificateOwner::Partner(partner.id),
                CertificateUsage::Encryption,
            )
            .await?
            .ok_or_else(|| {
                As2Error::Configuration(format!(
                    "partner {} has no encryption certificate",
                    partner.as2_id
                ))
            })?;

        if let (Some(bytes), Some(serial)) = (&msg.envelope, &msg.envelope_cert_serial) {
            if *serial == recipient.serial {
                debug!(message_id = %msg.message_id, %serial, "Reusing stored envelope");
                return Ok((msg.clone(), bytes.clone()));
            }
            info!(
                message_id = %msg.message_id,
                old_serial = %serial,
                new_serial = %recipient.serial,
                "Encryption certificate rotated; rebuilding envelope"
            );
        }

        if !recipient.is_usable(now, self.config.expiring_window) {
            return Err(As2Error::Configuration(format!(
                "encryption certificate {} is {}",
                recipient.serial,
                recipient.status(now, self.config.expiring_window)
            )));
        }

        let options = EncodeOptions {
            cipher: partner.crypto.encryption,
            mic_algorithm: msg.mic_algorithm.unwrap_or(partner.crypto.mic_algorithm),
            compress: msg.compressed.unwrap_or(partner.crypto.compress),
        };
        let sender = self.sender_identity(now).await?;
        let encoded = crypto::encode(
            &msg.payload,
            &msg.content_type,
            options,
            &sender,
            &recipient,
            &self.config.policy,
        )?;

        if let Some(sent) = &msg.sent_mic {
            if *sent != encoded.mic {
                return Err(CryptoError::MicMismatch {
                    signed: sent.clone(),
                    computed: encoded.mic,
                }
                .into());
            }
        }

        let updated = self
            .store
            .update_outbound(
                msg.id,
                msg.state,
                MessageUpdate {
                    sent_mic: Some(encoded.mic.clone()),
                    mic_algorithm: Some(encoded.mic_algorithm),
                    compressed: Some(encoded.compressed),
                    envelope: Some((encoded.bytes.clone(), encoded.recipient_serial.clone())),
                    ..Default::default()
                },
                now,
            )
            .await?;
        self.record_artifact(msg.id.0, ArtifactKind::OutboundEnvelope, encoded.bytes.clone())
            .await?;

        Ok((updated, encoded.bytes))
    }

    fn build_request(
        &self,
        msg: &OutboundMessage,
        partner: &Partner,
        body: Vec<u8>,
    ) -> Result<OutboundRequest> {
        let receipt_delivery_option = match partner.mdn_mode {
            MdnMode::Sync => None,
            MdnMode::Async => Some(self.config.async_mdn_url.clone().ok_or_else(|| {
                As2Error::Configuration(
                    "partner expects async MDNs but no MDN callback URL is configured".to_string(),
                )
            })?),
        };
        let mic_algorithm = msg.mic_algorithm.unwrap_or(partner.crypto.mic_algorithm);

        Ok(OutboundRequest {
            url: partner.endpoint_url.clone(),
            headers: As2Headers {
                as2_version: AS2_VERSION.to_string(),
                as2_from: self.config.own_as2_id.clone(),
                as2_to: partner.as2_id.clone(),
                message_id: msg.message_id.clone(),
                subject: Some(msg.subject.clone()),
                content_type: Some(CONTENT_TYPE_ENVELOPE.to_string()),
                disposition_notification_to: Some(self.config.own_as2_id.clone()),
                disposition_options: Some(DispositionOptions {
                    signed_receipt: partner.crypto.request_signed_mdn,
                    mic_algorithms: vec![mic_algorithm],
                }),
                receipt_delivery_option,
            },
            body,
        })
    }

    async fn sender_identity(&self, now: DateTime<Utc>) -> Result<SenderIdentity> {
        let cert = self
            .certificates
            .get_active_certificate(CertificateOwner::Own, CertificateUsage::Signing)
            .await?
            .ok_or_else(|| As2Error::Configuration("no own signing certificate".to_string()))?;
        if !cert.is_usable(now, self.config.expiring_window) {
            return Err(As2Error::Configuration(format!(
                "own signing certificate {} is {}",
                cert.serial,
                cert.status(now, self.config.expiring_window)
            )));
        }
        let signing_key = self.keys.signing_key(&cert.serial).await?;

        Ok(SenderIdentity {
            signing_key,
            certificate_fingerprint: cert.fingerprint,
        })
    }

    async fn usable_partner_certificate(
        &self,
        partner: &Partner,
        usage: CertificateUsage,
        now: DateTime<Utc>,
    ) -> Result<Certificate> {
        let cert = self
            .certificates
            .get_active_certificate(CertificateOwner::Partner(partner.id), usage)
            .await?
            .ok_or_else(|| {
                As2Error::Configuration(format!(
                    "partner {} has no {} certificate",
                    partner.as2_id,
                    usage.as_str()
                ))
            })?;

        if !cert.is_usable(now, self.config.expiring_window) {
            return Err(As2Error::Configuration(format!(
                "{} certificate {} for partner {} is not usable ({})",
                usage.as_str(),
                cert.serial,
                partner.as2_id,
                cert.status(now, self.config.expiring_window)
            )));
        }
        Ok(cert)
    }

    async fn transition(
        &self,
        msg: &OutboundMessage,
        to: TransmissionState,
        reason: Option<String>,
        update: MessageUpdate,
    ) -> Result<OutboundMessage> {
        let at = self.clock.now();
        let updated = self
            .store
            .transition(msg.id, msg.state, to, reason.clone(), update, at)
            .await?;

        info!(
            message_id = %msg.message_id,
            partner = %msg.partner_id,
            from = %msg.state,
            to = %to,
            reason = reason.as_deref().unwrap_or(""),
            "State transition"
        );
        // No subscribers is fine.
        let _ = self.events.send(TransmissionEvent {
            id: msg.id,
            message_id: msg.message_id.clone(),
            partner_id: msg.partner_id,
            from: msg.state,
            to,
            reason,
            at,
        });

        Ok(updated)
    }

    async fn message(&self, id: MessageId) -> Result<OutboundMessage> {
        self.store
            .get_outbound(id)
            .await?
            .ok_or_else(|| As2Error::MessageNotFound(id.to_string()))
    }

    async fn partner(&self, id: PartnerId) -> Result<Partner> {
        self.store
            .get_partner(id)
            .await?
            .ok_or_else(|| As2Error::PartnerNotFound(id.to_string()))
    }

    async fn record_artifact(
        &self,
        owner_id: uuid::Uuid,
        kind: ArtifactKind,
        bytes: Vec<u8>,
    ) -> Result<()> {
        self.store
            .record_artifact(&RawArtifact {
                owner_id,
                kind,
                bytes,
                recorded_at: self.clock.now(),
            })
            .await
    }

    async fn record_audit(&self, entry: AuditLogEntry) {
        let action = entry.action.to_string();
        if let Err(e) = self.audit.record(entry).await {
            warn!(%action, error = %e, "Failed to write audit record");
        }
    }
}

pub(crate) fn actor_type(actor: &str) -> &'static str {
    if actor == "system" {
        "system"
    } else {
        "operator"
    }
}
