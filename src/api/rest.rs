//! REST routes for the AS2 gateway.

use axum::routing::{get, post};
use axum::Router;

use super::handlers::*;
use crate::server::AppState;

/// Build the `/api` router.
pub fn router() -> Router<AppState> {
    Router::new()
        // Outbound messages
        .route("/v1/messages", post(submit_message).get(list_messages))
        .route("/v1/messages/:id", get(get_message))
        .route("/v1/messages/:id/cancel", post(cancel_message))
        .route("/v1/messages/:id/business-ack", post(record_business_ack))
        // Inbound messages
        .route("/v1/inbound", get(list_inbound))
        .route("/v1/inbound/:id", get(get_inbound))
        // Partners
        .route("/v1/partners", post(create_partner).get(list_partners))
        .route("/v1/partners/:id", get(get_partner).put(update_partner))
        .route("/v1/partners/:id/archive", post(archive_partner))
        .route(
            "/v1/partners/:id/certificates/rotate",
            post(rotate_partner_certificate),
        )
        // Certificates
        .route("/v1/certificates", post(add_certificate).get(list_certificates))
        .route("/v1/certificates/:serial", get(get_certificate))
        .route("/v1/certificates/:serial/revoke", post(revoke_certificate))
        .route("/v1/certificates/:serial/archive", post(archive_certificate))
        // Audit
        .route("/v1/audit", get(query_audit))
}

/// Build the AS2 wire router (`/as2`).
pub fn as2_router() -> Router<AppState> {
    Router::new()
        .route("/", post(receive_as2))
        .route("/mdn", post(receive_async_mdn))
}
