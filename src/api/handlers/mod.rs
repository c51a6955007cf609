//! REST API handlers organized by domain.

pub mod as2;
pub mod audit;
pub mod certificates;
pub mod health;
pub mod inbound;
pub mod messages;
pub mod partners;

pub use as2::*;
pub use audit::*;
pub use certificates::*;
pub use health::*;
pub use inbound::*;
pub use messages::*;
pub use partners::*;

use axum::http::HeaderMap;

/// Header naming the operator behind an admin call
pub const ACTOR_HEADER: &str = "x-actor";

/// Actor recorded in the audit trail for an admin request
pub(crate) fn actor(headers: &HeaderMap) -> String {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && *v != "system")
        .unwrap_or("operator")
        .to_string()
}
