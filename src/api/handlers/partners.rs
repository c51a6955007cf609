//! Trading partner handlers.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use uuid::Uuid;

use super::actor;
use crate::api::error::ApiError;
use crate::api::types::{page, PartnerListQuery};
use crate::domain::{Page, Partner, PartnerId, PartnerSpec};
use crate::engine::CertificateSpec;
use crate::server::AppState;

/// POST /api/v1/partners
pub async fn create_partner(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(spec): Json<PartnerSpec>,
) -> Result<(StatusCode, Json<Partner>), ApiError> {
    let partner = state.registry.create_partner(spec, &actor(&headers)).await?;
    Ok((StatusCode::CREATED, Json(partner)))
}

/// GET /api/v1/partners
pub async fn list_partners(
    State(state): State<AppState>,
    Query(query): Query<PartnerListQuery>,
) -> Result<Json<Page<Partner>>, ApiError> {
    let partners = state
        .registry
        .list_partners(query.include_archived, page(query.limit, query.offset))
        .await?;
    Ok(Json(partners))
}

/// GET /api/v1/partners/:id
pub async fn get_partner(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Partner>, ApiError> {
    Ok(Json(state.registry.partner(PartnerId::from_uuid(id)).await?))
}

/// PUT /api/v1/partners/:id - Replace the partner's editable configuration.
pub async fn update_partner(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(spec): Json<PartnerSpec>,
) -> Result<Json<Partner>, ApiError> {
    let partner = state
        .registry
        .update_partner(PartnerId::from_uuid(id), spec, &actor(&headers))
        .await?;
    Ok(Json(partner))
}

/// POST /api/v1/partners/:id/archive
pub async fn archive_partner(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Partner>, ApiError> {
    let partner = state
        .registry
        .archive_partner(PartnerId::from_uuid(id), &actor(&headers))
        .await?;
    Ok(Json(partner))
}

/// POST /api/v1/partners/:id/certificates/rotate - Switch the partner to a new certificate.
pub async fn rotate_partner_certificate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(spec): Json<CertificateSpec>,
) -> Result<Json<Partner>, ApiError> {
    let partner = state
        .registry
        .rotate_partner_certificate(PartnerId::from_uuid(id), spec, &actor(&headers))
        .await?;
    Ok(Json(partner))
}
