// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP error responses.
//!
//! [`CoreError`] already knows its status code and error code; this module
//! only turns that into an axum response body.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kiln_core::CoreError;
use serde::Serialize;

/// Error returned by API handlers.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

/// Handler result alias.
pub type ApiResult<T> = Result<T, ApiError>;

/// Error body served to callers.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Stable machine-readable error code.
    pub code: &'static str,
    /// Human-readable message.
    pub message: String,
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(code = self.0.error_code(), error = %self.0, "request failed");
        }
        let body = ErrorBody {
            code: self.0.error_code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_code_come_from_the_core_error() {
        let response = ApiError(CoreError::WorkflowNotFound { workflow_id: 7 }).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ApiError(CoreError::ImagePathInUse {
            image_path: "quay.io/acme/app:v1".to_string(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = ApiError(CoreError::StaleCommit {
            pipeline_id: 1,
            material_id: 2,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    }
}
