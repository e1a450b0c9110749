//! Axum HTTP handlers for the admin gateway.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use upstream::{HealthReport, MetricsTotals};

use crate::{
    audit::AuditEntry,
    auth::AdminIdentity,
    error::GatewayError,
    models::{HealthQuery, Liveness, ReportQuery},
    reports::UserReport,
    state::AppState,
};

// ------------------------------------------------------------------ //
//  GET /healthz                                                       //
// ------------------------------------------------------------------ //

pub async fn healthz() -> Json<Liveness> {
    Json(Liveness { status: "ok" })
}

// ------------------------------------------------------------------ //
//  Aggregates                                                         //
// ------------------------------------------------------------------ //

/// GET /api/v1/admin/health?verbose=bool
pub async fn admin_health(
    _admin: AdminIdentity,
    State(state): State<Arc<AppState>>,
    Query(query): Query<HealthQuery>,
) -> Result<Json<HealthReport>, GatewayError> {
    let report = state.gateway.health_report(query.verbose).await?;
    Ok(Json(report))
}

/// GET /api/v1/admin/metrics/totals
pub async fn metrics_totals(
    _admin: AdminIdentity,
    State(state): State<Arc<AppState>>,
) -> Result<Json<MetricsTotals>, GatewayError> {
    Ok(Json(state.gateway.metrics_totals().await?))
}

/// GET /api/v1/admin/reports/users?lang=xx
pub async fn user_report(
    _admin: AdminIdentity,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportQuery>,
) -> Result<Json<UserReport>, GatewayError> {
    Ok(Json(state.gateway.user_report(&query.lang).await?))
}

// ------------------------------------------------------------------ //
//  PUT /api/v1/admin/users/:user_id                                   //
// ------------------------------------------------------------------ //

/// Forward a partial user update and return the upstream's body.
pub async fn update_user(
    AdminIdentity(admin): AdminIdentity,
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(fields): Json<Map<String, Value>>,
) -> Result<Json<Value>, GatewayError> {
    let outcome = state.gateway.update_user(&user_id, fields).await?;
    info!(
        user_id,
        admin_id = admin.id,
        attempts = outcome.tried.len(),
        "user updated"
    );

    let entry = AuditEntry::new(&admin.id, "update_user", &user_id);
    if let Err(e) = state.audit.record(&entry).await {
        warn!(error = %e, audit_id = %entry.id, "audit write failed");
    }

    Ok(Json(outcome.body.to_value().unwrap_or_else(|| json!({}))))
}
