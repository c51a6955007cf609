//! Inbound message handlers.

use axum::extract::{Path, Query, State};
use axum::Json;
use uuid::Uuid;

use crate::api::error::{not_found, ApiError};
use crate::api::types::{page, InboundDetailResponse, InboundListQuery, InboundResponse};
use crate::domain::{InboundId, Page, PartnerId};
use crate::infra::InboundFilter;
use crate::server::AppState;

/// GET /api/v1/inbound - List received messages, newest first.
pub async fn list_inbound(
    State(state): State<AppState>,
    Query(query): Query<InboundListQuery>,
) -> Result<Json<Page<InboundResponse>>, ApiError> {
    let filter = InboundFilter {
        status: query.status,
        partner_id: query.partner_id.map(PartnerId::from_uuid),
    };
    let result = state
        .store
        .list_inbound(&filter, page(query.limit, query.offset))
        .await?;

    Ok(Json(Page {
        items: result.items.into_iter().map(InboundResponse::from).collect(),
        total: result.total,
        limit: result.limit,
        offset: result.offset,
    }))
}

/// GET /api/v1/inbound/:id
pub async fn get_inbound(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<InboundDetailResponse>, ApiError> {
    let inbound = state
        .store
        .get_inbound(InboundId::from_uuid(id))
        .await?
        .ok_or_else(|| not_found("Inbound message", id))?;
    Ok(Json(inbound.into()))
}
