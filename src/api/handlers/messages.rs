//! Outbound message handlers.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use uuid::Uuid;

use super::actor;
use crate::api::error::{validation_error, ApiError};
use crate::api::types::{
    page, BusinessAckRequest, CancelResponse, CancelStatus, MessageDetailResponse,
    MessageListQuery, MessageResponse, SubmitMessageRequest,
};
use crate::domain::{MessageId, Page, PartnerId, SubmitRequest};
use crate::engine::{CancelOutcome, WorkerMessage};
use crate::infra::{As2Error, MessageFilter};
use crate::server::AppState;

/// POST /api/v1/messages - Queue a message for a partner.
pub async fn submit_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubmitMessageRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let payload = request
        .payload_bytes()
        .map_err(|e| validation_error("payload", e))?;
    if payload.is_empty() {
        return Err(validation_error("payload", "payload must not be empty"));
    }
    if request.content_type.trim().is_empty() {
        return Err(validation_error("content_type", "content_type is required"));
    }

    let message = state
        .engine
        .submit(
            SubmitRequest {
                partner_id: PartnerId::from_uuid(request.partner_id),
                payload,
                content_type: request.content_type,
                subject: request.subject,
                priority: request.priority,
            },
            &actor(&headers),
        )
        .await?;

    // Dispatch now rather than on the next tick.
    if let Some(worker) = &state.worker {
        let _ = worker.try_send(WorkerMessage::Kick);
    }

    Ok((StatusCode::CREATED, Json(message.into())))
}

/// GET /api/v1/messages - List outbound messages, newest first.
pub async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<MessageListQuery>,
) -> Result<Json<Page<MessageResponse>>, ApiError> {
    let filter = MessageFilter {
        state: query.state,
        partner_id: query.partner_id.map(PartnerId::from_uuid),
    };
    let result = state
        .store
        .list_outbound(&filter, page(query.limit, query.offset))
        .await?;

    Ok(Json(Page {
        items: result.items.into_iter().map(MessageResponse::from).collect(),
        total: result.total,
        limit: result.limit,
        offset: result.offset,
    }))
}

/// GET /api/v1/messages/:id - Message detail with its state timeline.
pub async fn get_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageDetailResponse>, ApiError> {
    let id = MessageId::from_uuid(id);
    let message = state
        .store
        .get_outbound(id)
        .await?
        .ok_or_else(|| As2Error::MessageNotFound(id.to_string()))?;
    let timeline = state.engine.timeline(id).await?;

    Ok(Json(MessageDetailResponse {
        message: message.into(),
        timeline,
    }))
}

/// POST /api/v1/messages/:id/cancel
pub async fn cancel_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    let id = MessageId::from_uuid(id);
    let outcome = state.engine.cancel(id, &actor(&headers)).await?;

    let response = match outcome {
        CancelOutcome::Cancelled(message) => (
            StatusCode::OK,
            CancelResponse {
                status: CancelStatus::Cancelled,
                state: message.state,
            },
        ),
        CancelOutcome::Requested => {
            let message = state
                .store
                .get_outbound(id)
                .await?
                .ok_or_else(|| As2Error::MessageNotFound(id.to_string()))?;
            (
                StatusCode::ACCEPTED,
                CancelResponse {
                    status: CancelStatus::Requested,
                    state: message.state,
                },
            )
        }
        CancelOutcome::NoOp { state } => (
            StatusCode::OK,
            CancelResponse {
                status: CancelStatus::NoOp,
                state,
            },
        ),
    };

    Ok((response.0, Json(response.1)))
}

/// POST /api/v1/messages/:id/business-ack - Record the partner's business acknowledgment.
pub async fn record_business_ack(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<BusinessAckRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let message = state
        .engine
        .record_business_ack(
            MessageId::from_uuid(id),
            request.accepted,
            request.detail,
            &actor(&headers),
        )
        .await?;
    Ok(Json(message.into()))
}
