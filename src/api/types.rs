//! Shared request and response types for REST API handlers.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    BusinessAck, InboundMessage, InboundStatus, MdnMetadata, MdnMode, MicAlgorithm,
    OutboundMessage, PageRequest, Priority, RoutingOutcome, StateTransition, TransmissionState,
    ValidationOutcome,
};

/// Page request from optional `limit` / `offset` query parameters
pub fn page(limit: Option<u32>, offset: Option<u32>) -> PageRequest {
    let default = PageRequest::default();
    PageRequest::new(limit.unwrap_or(default.limit), offset.unwrap_or(default.offset))
}

// ============================================================================
// Outbound messages
// ============================================================================

/// Request body for submitting an outbound message.
///
/// Exactly one of `payload` (UTF-8 text) or `payload_base64` must be given.
#[derive(Debug, Deserialize)]
pub struct SubmitMessageRequest {
    pub partner_id: Uuid,
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub payload_base64: Option<String>,
    pub content_type: String,
    pub subject: String,
    #[serde(default)]
    pub priority: Priority,
}

impl SubmitMessageRequest {
    pub fn payload_bytes(&self) -> Result<Vec<u8>, String> {
        match (&self.payload, &self.payload_base64) {
            (Some(text), None) => Ok(text.as_bytes().to_vec()),
            (None, Some(encoded)) => base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| format!("payload_base64 is not valid base64: {e}")),
            (Some(_), Some(_)) => Err("give either payload or payload_base64, not both".to_string()),
            (None, None) => Err("payload or payload_base64 is required".to_string()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MessageListQuery {
    pub state: Option<TransmissionState>,
    pub partner_id: Option<Uuid>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Outbound message without payload or envelope bytes
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub message_id: String,
    pub partner_id: Uuid,
    pub content_type: String,
    pub subject: String,
    pub priority: Priority,
    pub payload_size: usize,
    pub state: TransmissionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_reason: Option<String>,
    pub sent_mic: Option<String>,
    pub received_mic: Option<String>,
    pub mic_algorithm: Option<MicAlgorithm>,
    pub compressed: Option<bool>,
    pub envelope_cert_serial: Option<String>,
    pub mdn: Option<MdnMetadata>,
    pub business_ack: Option<BusinessAck>,
    pub retry_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub mdn_deadline: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub review_required: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<OutboundMessage> for MessageResponse {
    fn from(m: OutboundMessage) -> Self {
        Self {
            id: m.id.0,
            message_id: m.message_id,
            partner_id: m.partner_id.0,
            content_type: m.content_type,
            subject: m.subject,
            priority: m.priority,
            payload_size: m.payload.len(),
            state: m.state,
            state_reason: m.state_reason,
            sent_mic: m.sent_mic,
            received_mic: m.received_mic,
            mic_algorithm: m.mic_algorithm,
            compressed: m.compressed,
            envelope_cert_serial: m.envelope_cert_serial,
            mdn: m.mdn,
            business_ack: m.business_ack,
            retry_count: m.retry_count,
            next_attempt_at: m.next_attempt_at,
            mdn_deadline: m.mdn_deadline,
            cancel_requested: m.cancel_requested,
            review_required: m.review_required,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageDetailResponse {
    #[serde(flatten)]
    pub message: MessageResponse,
    pub timeline: Vec<StateTransition>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelStatus {
    Cancelled,
    Requested,
    NoOp,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub status: CancelStatus,
    pub state: TransmissionState,
}

#[derive(Debug, Deserialize)]
pub struct BusinessAckRequest {
    pub accepted: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

// ============================================================================
// Inbound messages
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct InboundListQuery {
    pub status: Option<InboundStatus>,
    pub partner_id: Option<Uuid>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct InboundResponse {
    pub id: Uuid,
    pub message_id: String,
    pub partner_id: Option<Uuid>,
    pub as2_from: String,
    pub as2_to: String,
    pub subject: Option<String>,
    pub content_type: Option<String>,
    pub payload_size: Option<usize>,
    pub received_at: DateTime<Utc>,
    pub mic: Option<String>,
    pub status: InboundStatus,
    pub status_reason: Option<String>,
    pub validation: Option<ValidationOutcome>,
    pub routing: Option<RoutingOutcome>,
    pub mdn_mode: MdnMode,
    pub mdn_disposition: Option<String>,
    pub mdn_sent_at: Option<DateTime<Utc>>,
    pub mdn_attempts: u32,
}

impl From<InboundMessage> for InboundResponse {
    fn from(m: InboundMessage) -> Self {
        Self {
            id: m.id.0,
            message_id: m.message_id,
            partner_id: m.partner_id.map(|p| p.0),
            as2_from: m.as2_from,
            as2_to: m.as2_to,
            subject: m.subject,
            content_type: m.content_type,
            payload_size: m.payload.as_ref().map(Vec::len),
            received_at: m.received_at,
            mic: m.mic,
            status: m.status,
            status_reason: m.status_reason,
            validation: m.validation,
            routing: m.routing,
            mdn_mode: m.mdn_mode,
            mdn_disposition: m.mdn_disposition,
            mdn_sent_at: m.mdn_sent_at,
            mdn_attempts: m.mdn_attempts,
        }
    }
}

/// Inbound message including the decrypted payload and the MDN we returned
#[derive(Debug, Serialize)]
pub struct InboundDetailResponse {
    #[serde(flatten)]
    pub message: InboundResponse,
    pub payload_base64: Option<String>,
    pub mdn: Option<String>,
}

impl From<InboundMessage> for InboundDetailResponse {
    fn from(mut m: InboundMessage) -> Self {
        let payload_base64 = m
            .payload
            .as_deref()
            .map(|p| base64::engine::general_purpose::STANDARD.encode(p));
        let mdn = m
            .mdn_body
            .take()
            .map(|b| String::from_utf8_lossy(&b).into_owned());
        Self {
            message: m.into(),
            payload_base64,
            mdn,
        }
    }
}

// ============================================================================
// Partners and certificates
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct PartnerListQuery {
    #[serde(default)]
    pub include_archived: bool,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CertificateListQuery {
    /// `self` or `partner:<uuid>`
    pub owner: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

// ============================================================================
// Audit
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub actor: Option<String>,
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}
