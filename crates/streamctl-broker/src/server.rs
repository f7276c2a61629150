// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface in the Open Service Broker style.
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | GET | `/v2/catalog` | offered services and plans |
//! | GET | `/v2/service_instances` | list instances |
//! | PUT | `/v2/service_instances/{id}` | provision (202, or 200 on replay) |
//! | PATCH | `/v2/service_instances/{id}` | update parameters |
//! | GET | `/v2/service_instances/{id}` | instance with operation history |
//! | DELETE | `/v2/service_instances/{id}` | deprovision (410 if unknown) |
//! | GET | `/v2/service_instances/{id}/last_operation` | poll the latest operation |
//! | GET | `/admin/cleanup_jobs` | list cleanup jobs |
//! | POST | `/admin/cleanup_jobs/{id}/retry` | re-queue a failed job |
//! | GET | `/admin/providers` | provider validation report |
//! | GET | `/admin/metrics` | operation outcome counters |
//! | GET | `/health` | store reachability |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use streamctl_core::{
    CleanupJobFilter, CleanupJobState, InstanceFilter, LifecycleState, OperationType,
    ProviderKind, ProvisionRequest,
};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::cleanup_scheduler::requeue_failed_job;
use crate::engine::{LifecycleEngine, OperationHandle};
use crate::error::{Error, Result};

const DEFAULT_PAGE: i64 = 100;
const MAX_PAGE: i64 = 1000;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    engine: LifecycleEngine,
    catalog: Arc<Catalog>,
    default_provider: ProviderKind,
}

impl AppState {
    pub fn new(engine: LifecycleEngine, catalog: Catalog, default_provider: ProviderKind) -> Self {
        Self {
            engine,
            catalog: Arc::new(catalog),
            default_provider,
        }
    }

    pub fn engine(&self) -> &LifecycleEngine {
        &self.engine
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Broker endpoints
        .route("/v2/catalog", get(get_catalog))
        .route("/v2/service_instances", get(list_instances))
        .route(
            "/v2/service_instances/{instance_id}",
            put(provision_instance)
                .patch(update_instance)
                .get(get_instance)
                .delete(deprovision_instance),
        )
        .route(
            "/v2/service_instances/{instance_id}/last_operation",
            get(last_operation),
        )
        // Operator endpoints
        .route("/admin/cleanup_jobs", get(list_cleanup_jobs))
        .route("/admin/cleanup_jobs/{job_id}/retry", post(retry_cleanup_job))
        .route("/admin/providers", get(validate_providers))
        .route("/admin/metrics", get(get_metrics))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` is notified.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: Arc<Notify>,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

/// Bind `addr` and serve until `shutdown` is notified.
pub async fn bind_and_serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: Arc<Notify>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state, shutdown).await
}

// ============================================================================
// Request and response bodies
// ============================================================================

#[derive(Debug, Deserialize)]
struct ProvisionBody {
    service_id: String,
    plan_id: String,
    #[serde(default)]
    provider: Option<ProviderKind>,
    #[serde(default)]
    parameters: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct UpdateBody {
    #[serde(default)]
    plan_id: Option<String>,
    parameters: Value,
}

#[derive(Debug, Serialize)]
struct AcceptedBody {
    operation: String,
    operation_type: OperationType,
    state: LifecycleState,
}

#[derive(Debug, Serialize)]
struct LastOperationBody {
    state: LifecycleState,
    operation: String,
    operation_type: OperationType,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    connection_info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    probe: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct InstanceQuery {
    provider: Option<ProviderKind>,
    state: Option<LifecycleState>,
    #[serde(default)]
    include_deleted: bool,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct CleanupJobQuery {
    state: Option<CleanupJobState>,
    resource_id: Option<String>,
    limit: Option<i64>,
}

fn page_size(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
}

fn json_body<T>(body: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    body.map(|Json(value)| value)
        .map_err(|rejection| Error::InvalidRequest(rejection.body_text()))
}

fn accepted(handle: OperationHandle) -> Response {
    let status = if handle.replayed {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    let body = AcceptedBody {
        operation: handle.operation_id,
        operation_type: handle.operation_type,
        state: handle.state,
    };
    (status, Json(body)).into_response()
}

// ============================================================================
// Broker handlers
// ============================================================================

async fn get_catalog(State(state): State<AppState>) -> Json<Catalog> {
    Json(state.catalog.as_ref().clone())
}

async fn list_instances(
    State(state): State<AppState>,
    Query(query): Query<InstanceQuery>,
) -> Result<Json<Value>> {
    let filter = InstanceFilter {
        provider: query.provider,
        state: query.state,
        include_deleted: query.include_deleted,
        limit: page_size(query.limit),
        offset: query.offset.unwrap_or(0).max(0),
    };
    let instances = state.engine.list_instances(&filter).await?;
    Ok(Json(json!({ "instances": instances })))
}

async fn provision_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    body: std::result::Result<Json<ProvisionBody>, JsonRejection>,
) -> Result<Response> {
    let body = json_body(body)?;
    let provider = body.provider.unwrap_or(state.default_provider);
    state
        .catalog
        .check(&body.service_id, &body.plan_id, provider)?;

    debug!(instance_id = %instance_id, provider = %provider, "Provision request");
    let handle = state
        .engine
        .provision(ProvisionRequest {
            instance_id,
            service_id: body.service_id,
            plan_id: body.plan_id,
            provider,
            parameters: body.parameters.unwrap_or_else(|| json!({})),
        })
        .await?;
    Ok(accepted(handle))
}

async fn update_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    body: std::result::Result<Json<UpdateBody>, JsonRejection>,
) -> Result<Response> {
    let body = json_body(body)?;
    if let Some(plan_id) = body.plan_id.as_deref() {
        let details = state.engine.instance(&instance_id).await?;
        if details.instance.plan_id != plan_id {
            return Err(Error::InvalidRequest(format!(
                "plan changes are not supported (instance is on '{}')",
                details.instance.plan_id
            )));
        }
    }

    let handle = state.engine.update(&instance_id, body.parameters).await?;
    Ok(accepted(handle))
}

async fn get_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<Response> {
    let details = state.engine.instance(&instance_id).await?;
    Ok(Json(details).into_response())
}

async fn deprovision_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<Response> {
    match state.engine.deprovision(&instance_id).await {
        Ok(handle) => Ok(accepted(handle)),
        Err(Error::NotFound(_)) => Ok((StatusCode::GONE, Json(json!({}))).into_response()),
        Err(e) => Err(e),
    }
}

async fn last_operation(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<Json<LastOperationBody>> {
    let status = state.engine.last_operation(&instance_id).await?;
    let operation = status.operation;
    Ok(Json(LastOperationBody {
        state: operation.state,
        operation: operation.operation_id,
        operation_type: operation.operation_type,
        description: operation.description,
        error_message: operation.error_message,
        connection_info: status.connection_info,
        probe: status.probe,
    }))
}

// ============================================================================
// Operator handlers
// ============================================================================

async fn list_cleanup_jobs(
    State(state): State<AppState>,
    Query(query): Query<CleanupJobQuery>,
) -> Result<Json<Value>> {
    let filter = CleanupJobFilter {
        state: query.state,
        resource_id: query.resource_id,
        limit: page_size(query.limit),
    };
    let jobs = state
        .engine
        .tracker()
        .persistence()
        .list_cleanup_jobs(&filter)
        .await?;
    Ok(Json(json!({ "jobs": jobs })))
}

async fn retry_cleanup_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response> {
    let job = requeue_failed_job(&state.engine, &job_id).await?;
    Ok(Json(job).into_response())
}

async fn validate_providers(State(state): State<AppState>) -> Json<Value> {
    let providers = state.engine.registry().validate_all().await;
    let unavailable = providers.iter().filter(|p| !p.available).count();
    if unavailable > 0 {
        warn!(unavailable, "Provider validation found unavailable backends");
    }
    Json(json!({ "providers": providers }))
}

async fn get_metrics(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "operations": state.engine.metrics().snapshot(),
        "active_supervisors": state.engine.active_supervisors(),
    }))
}

async fn health(State(state): State<AppState>) -> Response {
    match state.engine.tracker().persistence().health_check().await {
        Ok(true) => Json(json!({
            "status": "healthy",
            "active_supervisors": state.engine.active_supervisors(),
        }))
        .into_response(),
        Ok(false) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy" })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy", "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_bounds() {
        assert_eq!(page_size(None), DEFAULT_PAGE);
        assert_eq!(page_size(Some(0)), 1);
        assert_eq!(page_size(Some(5000)), MAX_PAGE);
        assert_eq!(page_size(Some(25)), 25);
    }
}
