//! Outbound and inbound message records
//!
//! The outbound transmission lifecycle is a closed state graph; every
//! persisted timeline is a path through it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{InboundId, MdnMode, MessageId, MicAlgorithm, PartnerId, Priority, UnknownVariant};

/// Lifecycle state of an outbound transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmissionState {
    Queued,
    Sending,
    AwaitingMdn,
    MdnVerified,
    AwaitingBusinessAck,
    Complete,
    SendFailed,
    MdnTimeout,
    MdnRejected,
    BusinessAckRejected,
    Failed,
    Cancelled,
}

impl TransmissionState {
    pub const ALL: [TransmissionState; 12] = [
        TransmissionState::Queued,
        TransmissionState::Sending,
        TransmissionState::AwaitingMdn,
        TransmissionState::MdnVerified,
        TransmissionState::AwaitingBusinessAck,
        TransmissionState::Complete,
        TransmissionState::SendFailed,
        TransmissionState::MdnTimeout,
        TransmissionState::MdnRejected,
        TransmissionState::BusinessAckRejected,
        TransmissionState::Failed,
        TransmissionState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransmissionState::Queued => "queued",
            TransmissionState::Sending => "sending",
            TransmissionState::AwaitingMdn => "awaiting_mdn",
            TransmissionState::MdnVerified => "mdn_verified",
            TransmissionState::AwaitingBusinessAck => "awaiting_business_ack",
            TransmissionState::Complete => "complete",
            TransmissionState::SendFailed => "send_failed",
            TransmissionState::MdnTimeout => "mdn_timeout",
            TransmissionState::MdnRejected => "mdn_rejected",
            TransmissionState::BusinessAckRejected => "business_ack_rejected",
            TransmissionState::Failed => "failed",
            TransmissionState::Cancelled => "cancelled",
        }
    }

    /// States reachable in one step from `self`
    pub fn successors(&self) -> &'static [TransmissionState] {
        use TransmissionState::*;
        match self {
            Queued => &[Sending, Cancelled, Failed],
            Sending => &[AwaitingMdn, SendFailed, Failed],
            AwaitingMdn => &[MdnVerified, MdnTimeout, MdnRejected],
            MdnVerified => &[AwaitingBusinessAck, Complete, BusinessAckRejected],
            AwaitingBusinessAck => &[Complete, BusinessAckRejected],
            SendFailed => &[Sending, Failed, Cancelled],
            MdnTimeout => &[Sending, Failed, Cancelled],
            Complete | Failed | Cancelled | MdnRejected | BusinessAckRejected => &[],
        }
    }

    pub fn can_transition_to(&self, to: TransmissionState) -> bool {
        self.successors().contains(&to)
    }

    pub fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }

    /// Failure states that the retry scheduler may re-dispatch from
    pub fn is_retry_eligible(&self) -> bool {
        matches!(
            self,
            TransmissionState::SendFailed | TransmissionState::MdnTimeout
        )
    }

    /// States the worker picks up when `next_attempt_at` is due
    pub fn is_dispatchable(&self) -> bool {
        *self == TransmissionState::Queued || self.is_retry_eligible()
    }
}

impl fmt::Display for TransmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransmissionState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "transmission state",
                value: s.to_string(),
            })
    }
}

/// Metadata captured from the partner's MDN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdnMetadata {
    /// Rendered disposition, e.g. `automatic-action/MDN-sent-automatically; processed`
    pub disposition: String,
    pub signature_verified: bool,
    pub mdn_message_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusinessAckStatus {
    Accepted,
    Rejected,
}

impl BusinessAckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusinessAckStatus::Accepted => "accepted",
            BusinessAckStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for BusinessAckStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(BusinessAckStatus::Accepted),
            "rejected" => Ok(BusinessAckStatus::Rejected),
            other => Err(UnknownVariant {
                kind: "business ack status",
                value: other.to_string(),
            }),
        }
    }
}

/// Receiver's application-level acknowledgment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessAck {
    pub status: BusinessAckStatus,
    pub received_at: DateTime<Utc>,
    pub detail: Option<String>,
}

/// An outbound AS2 transmission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: MessageId,
    /// AS2 `Message-ID` header value (`<uuid@host>`)
    pub message_id: String,
    pub partner_id: PartnerId,
    #[serde(skip_serializing)]
    pub payload: Vec<u8>,
    pub content_type: String,
    pub subject: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub state: TransmissionState,
    pub state_reason: Option<String>,
    /// MIC computed at first encoding; never changes afterwards
    pub sent_mic: Option<String>,
    pub received_mic: Option<String>,
    pub mic_algorithm: Option<MicAlgorithm>,
    pub compressed: Option<bool>,
    #[serde(skip_serializing)]
    pub envelope: Option<Vec<u8>>,
    pub envelope_cert_serial: Option<String>,
    pub mdn: Option<MdnMetadata>,
    pub business_ack: Option<BusinessAck>,
    pub retry_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub mdn_deadline: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub review_required: bool,
    pub business_ack_overdue_warned: bool,
    pub updated_at: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Parameters for submitting a new outbound message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub partner_id: PartnerId,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub subject: String,
    #[serde(default)]
    pub priority: Priority,
}

/// One step of a message's timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub message_id: MessageId,
    /// `None` for the initial `queued` entry
    pub from_state: Option<TransmissionState>,
    pub to_state: TransmissionState,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Processing status of an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundStatus {
    Received,
    Rejected,
    ValidationFailed,
    Routed,
    RoutingFailed,
}

impl InboundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboundStatus::Received => "received",
            InboundStatus::Rejected => "rejected",
            InboundStatus::ValidationFailed => "validation_failed",
            InboundStatus::Routed => "routed",
            InboundStatus::RoutingFailed => "routing_failed",
        }
    }
}

impl fmt::Display for InboundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InboundStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(InboundStatus::Received),
            "rejected" => Ok(InboundStatus::Rejected),
            "validation_failed" => Ok(InboundStatus::ValidationFailed),
            "routed" => Ok(InboundStatus::Routed),
            "routing_failed" => Ok(InboundStatus::RoutingFailed),
            other => Err(UnknownVariant {
                kind: "inbound status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub passed: bool,
    pub errors: Vec<String>,
    pub schema_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingOutcome {
    pub destination: String,
    pub result: String,
    pub detail: Option<String>,
}

/// A message received from a partner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: InboundId,
    pub message_id: String,
    pub partner_id: Option<PartnerId>,
    pub as2_from: String,
    pub as2_to: String,
    pub subject: Option<String>,
    pub content_type: Option<String>,
    #[serde(skip_serializing)]
    pub payload: Option<Vec<u8>>,
    pub received_at: DateTime<Utc>,
    pub mic: Option<String>,
    pub status: InboundStatus,
    pub status_reason: Option<String>,
    pub validation: Option<ValidationOutcome>,
    pub routing: Option<RoutingOutcome>,
    pub mdn_mode: MdnMode,
    pub mdn_disposition: Option<String>,
    #[serde(skip_serializing)]
    pub mdn_body: Option<Vec<u8>>,
    /// Async MDN target (`Receipt-Delivery-Option`)
    pub mdn_url: Option<String>,
    pub mdn_sent_at: Option<DateTime<Utc>>,
    pub mdn_attempts: u32,
}

/// Kinds of raw bytes kept for forensic replay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    OutboundEnvelope,
    SyncMdn,
    AsyncMdn,
    InboundRequest,
    InboundMdn,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::OutboundEnvelope => "outbound_envelope",
            ArtifactKind::SyncMdn => "sync_mdn",
            ArtifactKind::AsyncMdn => "async_mdn",
            ArtifactKind::InboundRequest => "inbound_request",
            ArtifactKind::InboundMdn => "inbound_mdn",
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "outbound_envelope" => Ok(ArtifactKind::OutboundEnvelope),
            "sync_mdn" => Ok(ArtifactKind::SyncMdn),
            "async_mdn" => Ok(ArtifactKind::AsyncMdn),
            "inbound_request" => Ok(ArtifactKind::InboundRequest),
            "inbound_mdn" => Ok(ArtifactKind::InboundMdn),
            other => Err(UnknownVariant {
                kind: "artifact kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Raw bytes recorded around a send or receive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawArtifact {
    /// Outbound or inbound row id the bytes belong to
    pub owner_id: uuid::Uuid,
    pub kind: ArtifactKind,
    #[serde(skip_serializing)]
    pub bytes: Vec<u8>,
    pub recorded_at: DateTime<Utc>,
}

/// Published on every committed transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmissionEvent {
    pub id: MessageId,
    pub message_id: String,
    pub partner_id: PartnerId,
    pub from: TransmissionState,
    pub to: TransmissionState,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}
