//! AS2 Gateway Library
//!
//! Reliable B2B message exchange over AS2: signed and encrypted envelopes,
//! MDN receipts, retry scheduling and partner/certificate administration.
//!
//! ## Modules
//!
//! - [`domain`] - Core domain types (partners, certificates, transmissions)
//! - [`crypto`] - MIC computation, key handling and the envelope codec
//! - [`as2`] - AS2 headers, transport, MDNs and the inbound receiver
//! - [`engine`] - Outbound state machine, retry worker and partner registry
//! - [`infra`] - Persistence (SQLite), audit logging and shared errors
//! - [`api`] - REST and AS2 wire routes
//! - [`server`] - Process bootstrap

pub mod api;
pub mod as2;
pub mod crypto;
pub mod domain;
pub mod engine;
pub mod infra;
pub mod migrations;
pub mod server;

// Re-export commonly used types
pub use domain::{
    Certificate, CertificateOwner, InboundMessage, MessageId, OutboundMessage, Partner, PartnerId,
    TransmissionState,
};

pub use engine::{PartnerRegistry, TransmissionEngine};
pub use infra::{As2Error, Result};
