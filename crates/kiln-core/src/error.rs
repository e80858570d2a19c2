// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for kiln-core.
//!
//! Provides a unified error type that maps to HTTP error responses.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur during trigger processing.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Pipeline was not found in the database.
    PipelineNotFound {
        /// The pipeline ID that was not found.
        pipeline_id: i32,
    },

    /// Workflow was not found in the database.
    WorkflowNotFound {
        /// The workflow ID that was not found.
        workflow_id: i32,
    },

    /// Pipeline has no active git materials configured.
    NoMaterialsConfigured {
        /// The pipeline ID.
        pipeline_id: i32,
    },

    /// Job pipeline has no pre-build tasks to run.
    NoTasksConfigured {
        /// The pipeline ID.
        pipeline_id: i32,
    },

    /// The requested image path is already reserved or built.
    ImagePathInUse {
        /// The fully qualified image path.
        image_path: String,
    },

    /// New commits are older than the commits of an in-flight build.
    StaleCommit {
        /// The pipeline ID.
        pipeline_id: i32,
        /// The material ID carrying the stale commit.
        material_id: i32,
    },

    /// A material's git TLS configuration is internally inconsistent.
    TlsConfigInvalid {
        /// The material ID carrying the broken TLS config.
        material_id: i32,
        /// What is inconsistent about it.
        reason: String,
    },

    /// A referenced artifact failed validation.
    ArtifactRejected {
        /// The image the caller supplied.
        image: String,
        /// Why the artifact was rejected.
        reason: String,
    },

    /// Logs were requested but no blob storage is configured to serve them.
    LogsNotStored {
        /// The workflow ID.
        workflow_id: i32,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// A call to the git sensor failed.
    GitSensorError {
        /// Error details.
        details: String,
    },

    /// A call to the workflow executor failed.
    ExecutorError {
        /// Error details.
        details: String,
    },

    /// A call to the container registry failed.
    RegistryError {
        /// Error details.
        details: String,
    },

    /// A blob storage operation failed.
    BlobStorageError {
        /// Error details.
        details: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::PipelineNotFound { .. } => "PIPELINE_NOT_FOUND",
            Self::WorkflowNotFound { .. } => "WORKFLOW_NOT_FOUND",
            Self::NoMaterialsConfigured { .. } => "NO_MATERIALS_CONFIGURED",
            Self::NoTasksConfigured { .. } => "NO_TASKS_CONFIGURED",
            Self::ImagePathInUse { .. } => "IMAGE_PATH_IN_USE",
            Self::StaleCommit { .. } => "STALE_COMMIT",
            Self::TlsConfigInvalid { .. } => "TLS_CONFIG_INVALID",
            Self::ArtifactRejected { .. } => "ARTIFACT_REJECTED",
            Self::LogsNotStored { .. } => "LOGS_NOT_STORED",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::GitSensorError { .. } => "GIT_SENSOR_ERROR",
            Self::ExecutorError { .. } => "EXECUTOR_ERROR",
            Self::RegistryError { .. } => "REGISTRY_ERROR",
            Self::BlobStorageError { .. } => "BLOB_STORAGE_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// HTTP status code this error maps to at the API boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::PipelineNotFound { .. }
            | Self::WorkflowNotFound { .. }
            | Self::NoTasksConfigured { .. } => 404,
            Self::NoMaterialsConfigured { .. } | Self::ValidationError { .. } => 400,
            Self::ImagePathInUse { .. } => 409,
            Self::StaleCommit { .. } | Self::TlsConfigInvalid { .. } => 412,
            Self::ArtifactRejected { .. } => 400,
            Self::LogsNotStored { .. } => 400,
            Self::GitSensorError { .. }
            | Self::ExecutorError { .. }
            | Self::RegistryError { .. }
            | Self::BlobStorageError { .. } => 502,
            Self::DatabaseError { .. } => 500,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PipelineNotFound { pipeline_id } => {
                write!(f, "Pipeline '{}' not found", pipeline_id)
            }
            Self::WorkflowNotFound { workflow_id } => {
                write!(f, "Workflow '{}' not found", workflow_id)
            }
            Self::NoMaterialsConfigured { pipeline_id } => {
                write!(f, "Pipeline '{}' has no active git materials", pipeline_id)
            }
            Self::NoTasksConfigured { pipeline_id } => {
                write!(f, "Pipeline '{}' has no pre-build tasks to run", pipeline_id)
            }
            Self::ImagePathInUse { image_path } => {
                write!(f, "Image path '{}' is already in use", image_path)
            }
            Self::StaleCommit {
                pipeline_id,
                material_id,
            } => {
                write!(
                    f,
                    "Material '{}' of pipeline '{}' carries a commit older than the build in progress",
                    material_id, pipeline_id
                )
            }
            Self::TlsConfigInvalid {
                material_id,
                reason,
            } => {
                write!(
                    f,
                    "TLS configuration of material '{}' is inconsistent: {}",
                    material_id, reason
                )
            }
            Self::ArtifactRejected { image, reason } => {
                write!(f, "Artifact '{}' rejected: {}", image, reason)
            }
            Self::LogsNotStored { workflow_id } => {
                write!(
                    f,
                    "Logs for workflow '{}' are not stored: blob storage is not configured",
                    workflow_id
                )
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::GitSensorError { details } => {
                write!(f, "Git sensor call failed: {}", details)
            }
            Self::ExecutorError { details } => {
                write!(f, "Workflow executor call failed: {}", details)
            }
            Self::RegistryError { details } => {
                write!(f, "Container registry call failed: {}", details)
            }
            Self::BlobStorageError { details } => {
                write!(f, "Blob storage call failed: {}", details)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
