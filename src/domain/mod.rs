//! Domain models for the AS2 gateway
//!
//! Partners, certificates, outbound transmissions and inbound receipts.

mod certificate;
mod message;
mod partner;
mod types;

pub use certificate::*;
pub use message::*;
pub use partner::*;
pub use types::*;
