//! Audit trail query handler.

use axum::extract::{Query, State};
use axum::Json;

use crate::api::error::ApiError;
use crate::api::types::{page, AuditQuery};
use crate::domain::Page;
use crate::infra::{parse_audit_action, AuditLogEntry, AuditQueryFilters};
use crate::server::AppState;

/// GET /api/v1/audit - Query audit entries, newest first.
pub async fn query_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Page<AuditLogEntry>>, ApiError> {
    let filters = AuditQueryFilters {
        actor: query.actor,
        action: query.action.as_deref().map(parse_audit_action),
        resource_type: query.resource_type,
        resource_id: query.resource_id,
        from: query.from,
        to: query.to,
        success: query.success,
    };

    let entries = state
        .audit_log
        .query(&filters, page(query.limit, query.offset))
        .await?;
    Ok(Json(entries))
}
