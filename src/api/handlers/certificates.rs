//! Certificate handlers.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;

use super::actor;
use crate::api::error::{validation_error, ApiError};
use crate::api::types::{page, CertificateListQuery};
use crate::domain::{CertificateOwner, Page};
use crate::engine::{CertificateSpec, CertificateView};
use crate::server::AppState;

/// POST /api/v1/certificates
pub async fn add_certificate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(spec): Json<CertificateSpec>,
) -> Result<(StatusCode, Json<CertificateView>), ApiError> {
    let view = state.registry.add_certificate(spec, &actor(&headers)).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// GET /api/v1/certificates - Certificates ordered by expiry, with effective status.
pub async fn list_certificates(
    State(state): State<AppState>,
    Query(query): Query<CertificateListQuery>,
) -> Result<Json<Page<CertificateView>>, ApiError> {
    let owner = query
        .owner
        .as_deref()
        .map(str::parse::<CertificateOwner>)
        .transpose()
        .map_err(|e| validation_error("owner", e.to_string()))?;

    let certificates = state
        .registry
        .list_certificates(owner, page(query.limit, query.offset))
        .await?;
    Ok(Json(certificates))
}

/// GET /api/v1/certificates/:serial
pub async fn get_certificate(
    State(state): State<AppState>,
    Path(serial): Path<String>,
) -> Result<Json<CertificateView>, ApiError> {
    Ok(Json(state.registry.certificate(&serial).await?))
}

/// POST /api/v1/certificates/:serial/revoke
pub async fn revoke_certificate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(serial): Path<String>,
) -> Result<Json<CertificateView>, ApiError> {
    let view = state
        .registry
        .revoke_certificate(&serial, &actor(&headers))
        .await?;
    Ok(Json(view))
}

/// POST /api/v1/certificates/:serial/archive
pub async fn archive_certificate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(serial): Path<String>,
) -> Result<Json<CertificateView>, ApiError> {
    let view = state
        .registry
        .archive_certificate(&serial, &actor(&headers))
        .await?;
    Ok(Json(view))
}
