//! AS2 wire endpoints: inbound messages and async MDN callbacks.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{info, warn};

use crate::api::error::ApiError;
use crate::as2::CONTENT_TYPE_MDN;
use crate::domain::{TransmissionState, AS2_VERSION};
use crate::infra::As2Error;
use crate::server::AppState;

const AS2_VERSION_HEADER: HeaderName = HeaderName::from_static("as2-version");
const AS2_FROM: HeaderName = HeaderName::from_static("as2-from");
const AS2_TO: HeaderName = HeaderName::from_static("as2-to");

/// POST /as2 - Receive an AS2 message from a partner.
///
/// Synchronous MDNs are returned as the response body; async ones are
/// queued and the request is answered with an empty 200.
pub async fn receive_as2(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let pairs = headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)));
    let outcome = state.receiver.receive(pairs, &body).await?;

    let status = StatusCode::from_u16(outcome.http_status).unwrap_or(StatusCode::OK);
    let Some(mdn) = outcome.mdn_body else {
        return Ok(status.into_response());
    };

    let mut response = (status, mdn).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_MDN));
    response_headers.insert(AS2_VERSION_HEADER, HeaderValue::from_static(AS2_VERSION));
    if let Some(inbound) = &outcome.inbound {
        if let Ok(from) = HeaderValue::from_str(&inbound.as2_to) {
            response_headers.insert(AS2_FROM, from);
        }
        if let Ok(to) = HeaderValue::from_str(&inbound.as2_from) {
            response_headers.insert(AS2_TO, to);
        }
    }
    Ok(response)
}

#[derive(Debug, Serialize)]
pub struct MdnAccepted {
    pub message_id: String,
    pub state: TransmissionState,
    pub verification: &'static str,
}

/// POST /as2/mdn - Async MDN callback for messages we sent.
pub async fn receive_async_mdn(State(state): State<AppState>, body: Bytes) -> Response {
    match state.engine.receive_async_mdn(&body).await {
        Ok(receipt) => {
            info!(
                message_id = %receipt.message.message_id,
                verification = receipt.verification,
                "Async MDN accepted"
            );
            Json(MdnAccepted {
                message_id: receipt.message.message_id,
                state: receipt.message.state,
                verification: receipt.verification,
            })
            .into_response()
        }
        // Another task holds the message; ask the partner to resend.
        Err(As2Error::MessageBusy(id)) => {
            warn!(%id, "Async MDN arrived while message is busy");
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("5"));
            response
        }
        Err(e) => {
            warn!(error = %e, "Async MDN rejected");
            ApiError::from(e).into_response()
        }
    }
}
