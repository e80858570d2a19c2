// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kiln Server - HTTP API for the CI trigger engine
//!
//! Exposes the inbound surface of kiln-core over axum:
//!
//! - `POST /ci-pipeline/trigger` - start a build manually
//! - `POST /webhook/ci/{secret}` - git-sensor commit notification
//! - `POST /ci-pipeline/{workflowId}/cancel?forceAbort=` - stop a build
//! - `GET  /ci-pipeline/workflow/{workflowId}/logs?follow=` - stream logs
//! - `GET  /ci-pipeline/{pipelineId}/workflow/{workflowId}/artifact` - download
//! - `POST /ci-workflow/status` - executor status report (retrigger intake)
//! - `GET  /health` - liveness check
//!
//! The binary entrypoint loads configuration from the environment, runs the
//! embedded migrations, and wires the kiln-core service graph over Postgres.

#![deny(missing_docs)]

pub mod error;
pub mod handlers;
pub mod state;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Build the API router over the given state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::handle_health))
        .route("/ci-pipeline/trigger", post(handlers::handle_trigger))
        .route("/webhook/ci/{secret}", post(handlers::handle_webhook))
        .route(
            "/ci-pipeline/{workflow_id}/cancel",
            post(handlers::handle_cancel),
        )
        .route(
            "/ci-pipeline/workflow/{workflow_id}/logs",
            get(handlers::handle_logs),
        )
        .route(
            "/ci-pipeline/{pipeline_id}/workflow/{workflow_id}/artifact",
            get(handlers::handle_artifact),
        )
        .route("/ci-workflow/status", post(handlers::handle_status))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
