//! AS2 protocol layer
//!
//! Headers, the HTTP transport, MDN rendering and verification, and the
//! inbound side (receiver plus async MDN delivery).

mod async_mdn;
pub mod headers;
mod mdn;
mod receiver;
mod transport;
mod verifier;

pub use async_mdn::{AsyncMdnConfig, AsyncMdnDispatcher};
pub use headers::{
    As2Headers, DispositionOptions, HeaderError, CONTENT_TYPE_ENVELOPE, CONTENT_TYPE_MDN,
};
pub use mdn::{
    parse_mdn, Disposition, DispositionModifier, DispositionType, Mdn, MdnParseError,
    MdnSignature, ModifierKind, ParsedMdn,
};
pub use receiver::{InboundOutcome, InboundReceiver, ReceiverConfig, RoutingRule, RoutingTable};
pub use transport::{
    classify_response, As2Transport, OutboundRequest, ReqwestTransport, TransportError,
    TransportResult,
};
pub use verifier::{verify_mdn, MdnExpectation, MdnVerification};

#[cfg(test)]
pub use transport::MockAs2Transport;
