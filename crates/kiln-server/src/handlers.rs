// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! API handlers.
//!
//! Thin wire layer over the kiln-core services: deserialize the request,
//! call the service, serialize the result. All domain decisions live in
//! kiln-core; the handlers only translate between HTTP and service calls.

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use kiln_core::CoreError;
use kiln_core::model::{GitCommit, RuntimeParameters, TriggerMaterial, TriggerRequest, WebhookEvent};
use kiln_core::retrigger::StatusEvent;

use crate::error::ApiResult;
use crate::state::AppState;

// ============================================================================
// Wire types
// ============================================================================

/// Material pin inside a manual trigger body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MaterialPin {
    /// Pipeline material ID.
    pub id: i32,
    /// Commit to build. An empty commit with no webhook data means latest.
    pub git_commit: GitCommit,
}

/// Body of `POST /ci-pipeline/trigger`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerBody {
    /// Pipeline to trigger.
    pub pipeline_id: i32,
    /// Material pins. Unlisted materials resolve to their latest commit.
    pub ci_pipeline_material: Vec<MaterialPin>,
    /// User starting the build.
    pub triggered_by: i32,
    /// Display name or email of the triggering user.
    pub trigger_author: String,
    /// Skip the build cache for this run.
    pub invalidate_cache: bool,
    /// Environment override for job pipelines.
    pub environment_id: i32,
    /// Extra environment variables injected into the build.
    pub extra_environment_variables: BTreeMap<String, String>,
}

impl TriggerBody {
    /// Convert the wire body into a service-level trigger request.
    pub fn into_request(self) -> TriggerRequest {
        let materials = self
            .ci_pipeline_material
            .into_iter()
            .map(|pin| TriggerMaterial {
                material_id: pin.id,
                commit_hash: pin.git_commit.commit,
                webhook_data_id: pin
                    .git_commit
                    .webhook_data
                    .map(|data| data.id)
                    .unwrap_or(0),
            })
            .collect();
        TriggerRequest {
            pipeline_id: self.pipeline_id,
            materials,
            triggered_by: self.triggered_by,
            trigger_author: self.trigger_author,
            invalidate_cache: self.invalidate_cache,
            environment_id: self.environment_id,
            runtime_params: RuntimeParameters {
                env_variables: self.extra_environment_variables,
            },
        }
    }
}

/// Response carrying the ID of the affected workflow.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowIdResponse {
    /// The workflow row ID.
    pub workflow_id: i32,
}

/// Response of the webhook intake endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    /// ID of the triggered workflow, absent when the event was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<i32>,
    /// Explanation when no build was started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Response of the executor status endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// ID of the replayed workflow, absent when no replay was warranted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retriggered_workflow_id: Option<i32>,
}

/// Query parameters of the cancel endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct CancelQuery {
    /// Mark the workflow even when the executor no longer knows it.
    #[serde(default, rename = "forceAbort")]
    pub force_abort: bool,
}

/// Query parameters of the log endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    /// Keep the stream open and tail the running build.
    #[serde(default)]
    pub follow: bool,
}

/// Health and version report.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always "healthy" when the server answers.
    pub status: &'static str,
    /// Server version.
    pub version: String,
    /// Seconds since the server started.
    pub uptime_seconds: u64,
}

// ============================================================================
// Handlers
// ============================================================================

/// `POST /ci-pipeline/trigger` - start a build manually.
pub async fn handle_trigger(
    State(state): State<AppState>,
    Json(body): Json<TriggerBody>,
) -> ApiResult<Json<WorkflowIdResponse>> {
    info!(
        pipeline_id = body.pipeline_id,
        triggered_by = body.triggered_by,
        "manual trigger"
    );
    let workflow_id = state.trigger.trigger(body.into_request()).await?;
    Ok(Json(WorkflowIdResponse { workflow_id }))
}

/// `POST /webhook/ci/{secret}` - git-sensor commit notification.
///
/// Transport authentication is handled upstream; the secret segment is
/// accepted but not interpreted here.
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(_secret): Path<String>,
    Json(event): Json<WebhookEvent>,
) -> ApiResult<Json<WebhookResponse>> {
    info!(
        material_id = event.pipeline_material_id,
        commit = %event.git_commit.commit,
        "webhook event"
    );
    match state.trigger.trigger_from_webhook(event).await {
        Ok(Some(workflow_id)) => Ok(Json(WebhookResponse {
            workflow_id: Some(workflow_id),
            message: None,
        })),
        Ok(None) => Ok(Json(WebhookResponse {
            workflow_id: None,
            message: Some("pipeline not eligible for automatic trigger".to_string()),
        })),
        // An out-of-order notification for a commit older than the one
        // already building is acknowledged, not an error.
        Err(CoreError::StaleCommit { .. }) => Ok(Json(WebhookResponse {
            workflow_id: None,
            message: Some(
                "commit is older than the commit already building, nothing to do".to_string(),
            ),
        })),
        Err(err) => Err(err.into()),
    }
}

/// `POST /ci-pipeline/{workflowId}/cancel` - stop a running build.
pub async fn handle_cancel(
    State(state): State<AppState>,
    Path(workflow_id): Path<i32>,
    Query(query): Query<CancelQuery>,
) -> ApiResult<Json<WorkflowIdResponse>> {
    let workflow_id = state.cancel.cancel(workflow_id, query.force_abort).await?;
    Ok(Json(WorkflowIdResponse { workflow_id }))
}

/// `GET /ci-pipeline/workflow/{workflowId}/logs` - stream build logs.
pub async fn handle_logs(
    State(state): State<AppState>,
    Path(workflow_id): Path<i32>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Response> {
    let stream = state.logs.stream_logs(workflow_id, query.follow).await?;
    let response = (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response();
    Ok(response)
}

/// `GET /ci-pipeline/{pipelineId}/workflow/{workflowId}/artifact` - download
/// the build artifact archive.
pub async fn handle_artifact(
    State(state): State<AppState>,
    Path((pipeline_id, workflow_id)): Path<(i32, i32)>,
) -> ApiResult<Response> {
    let download = state.logs.download_artifact(pipeline_id, workflow_id).await?;
    let disposition = format!("attachment; filename=\"{}\"", download.file_name);
    let response = (
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        download.content,
    )
        .into_response();
    Ok(response)
}

/// `POST /ci-workflow/status` - executor status report, may replay the build.
pub async fn handle_status(
    State(state): State<AppState>,
    Json(event): Json<StatusEvent>,
) -> ApiResult<Json<StatusResponse>> {
    let retriggered_workflow_id = state.retrigger.maybe_retrigger(&event).await?;
    Ok(Json(StatusResponse {
        retriggered_workflow_id,
    }))
}

/// `GET /health` - liveness check.
pub async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: state.version.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}
