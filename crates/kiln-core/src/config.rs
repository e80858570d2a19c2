// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use crate::model::{BlobProvider, ExecutorType};

/// Kiln trigger engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace builds run in when the pipeline has no environment override
    pub default_namespace: String,
    /// Executor used for newly triggered workflows
    pub workflow_executor: ExecutorType,
    /// How many times a failed workflow may be re-triggered from its snapshot
    pub max_workflow_retries: u32,
    /// Push retry count handed to the build runner
    pub image_retry_count: u32,
    /// Seconds between push retries
    pub image_retry_interval_seconds: u32,
    /// Hard timeout for a single build, in seconds
    pub build_timeout_seconds: u64,
    /// Build cache size ceiling, in bytes
    pub cache_limit_bytes: i64,
    /// Global default for workflow-level build caching
    pub workflow_cache_enabled: bool,
    /// For tag-push triggers, use the git tag itself as the image tag
    pub use_image_tag_from_git_provider: bool,
    /// Skip docker layer cache push and pull entirely
    pub ignore_docker_cache: bool,
    /// Build images through buildx instead of plain `docker build`
    pub use_buildx: bool,
    /// Platform applied to buildx builds whose template names none
    pub default_target_platform: String,
    /// Buildx `--provenance` mode, empty to leave provenance off
    pub buildx_provenance_mode: String,
    /// Raw JSON list of node selector maps for the buildx k8s driver
    pub buildx_k8s_driver_options: String,
    /// Export the buildx layer cache in `min` mode
    pub buildx_cache_mode_min: bool,
    /// Export the buildx layer cache after the build, off the critical path
    pub async_buildx_cache_export: bool,
    /// Restarts allowed when a buildx build is interrupted
    pub buildx_interruption_max_retry: u32,
    /// Retry budget for image scan submissions
    pub image_scan_max_retries: u32,
    /// Whether image scans execute through an external scan tool
    pub image_scan_medium_external: bool,
    /// Orchestrator callback host handed to the runner
    pub orchestrator_host: String,
    /// Orchestrator callback token handed to the runner
    pub orchestrator_token: String,
    /// Blob storage settings, absent when blob storage is disabled
    pub blob: Option<BlobConfig>,
    /// ConfigMap name carrying blob credentials in external clusters
    pub external_blob_config_map: String,
    /// Secret name carrying blob credentials in external clusters
    pub external_blob_secret: String,
    /// Key prefix for build logs in the logs bucket
    pub default_log_key_prefix: String,
    /// Key prefix for build artifacts in the artifact bucket
    pub default_artifact_key_prefix: String,
}

/// Blob storage settings shared by logs, artifacts, and the build cache.
#[derive(Debug, Clone)]
pub struct BlobConfig {
    /// Which provider the buckets live on
    pub provider: BlobProvider,
    /// Bucket for build logs
    pub logs_bucket: String,
    /// Bucket for build artifacts
    pub artifact_bucket: String,
    /// Bucket for the docker layer cache
    pub cache_bucket: String,
    /// Bucket region, empty for providers that do not need one
    pub region: String,
    /// Custom S3 endpoint for S3-compatible stores, empty for AWS
    pub s3_endpoint: String,
    /// S3 access key, empty when IAM credentials apply
    pub s3_access_key: String,
    /// S3 secret key, empty when IAM credentials apply
    pub s3_secret_key: String,
    /// GCP service account credentials JSON
    pub gcp_credentials_json: String,
    /// Azure storage account name
    pub azure_account_name: String,
    /// Azure storage account key
    pub azure_account_key: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional with defaults, except that enabling blob
    /// storage makes the provider and logs bucket required:
    /// - `KILN_DEFAULT_NAMESPACE`: build namespace (default: kiln-ci)
    /// - `KILN_WORKFLOW_EXECUTOR`: `AWF` or `SYSTEM` (default: AWF)
    /// - `KILN_MAX_CI_WORKFLOW_RETRIES`: snapshot re-trigger budget (default: 3)
    /// - `KILN_IMAGE_RETRY_COUNT` / `KILN_IMAGE_RETRY_INTERVAL`: push retries (default: 0 / 5)
    /// - `KILN_BUILD_TIMEOUT`: build timeout seconds (default: 3600)
    /// - `KILN_CACHE_LIMIT`: cache ceiling bytes (default: 5000000000)
    /// - `KILN_WORKFLOW_CACHE_ENABLED`: global cache default (default: true)
    /// - `KILN_USE_IMAGE_TAG_FROM_GIT_PROVIDER`: tag-based image tags (default: false)
    /// - `KILN_IGNORE_DOCKER_CACHE`: skip layer cache (default: false)
    /// - `KILN_USE_BUILDX`: build through buildx (default: false)
    /// - `KILN_DEFAULT_TARGET_PLATFORM`: buildx fallback platform (default: empty)
    /// - `KILN_BUILDX_PROVENANCE_MODE`: buildx provenance mode (default: empty)
    /// - `KILN_BUILDX_K8S_DRIVER_OPTIONS`: JSON list of builder node selector
    ///   maps (default: empty)
    /// - `KILN_BUILDX_CACHE_MODE_MIN`: min-mode cache export (default: false)
    /// - `KILN_ASYNC_BUILDX_CACHE_EXPORT`: post-build cache export (default: false)
    /// - `KILN_BUILDX_INTERRUPTION_MAX_RETRY`: buildx restart budget (default: 3)
    /// - `KILN_IMAGE_SCAN_MAX_RETRIES`: scan submission retries (default: 3)
    /// - `KILN_IMAGE_SCAN_MEDIUM_EXTERNAL`: scans run through an external
    ///   scan tool (default: false)
    /// - `KILN_ORCHESTRATOR_HOST` / `KILN_ORCHESTRATOR_TOKEN`: callback endpoint (default: empty)
    /// - `KILN_BLOB_STORAGE_ENABLED`: master switch (default: false)
    /// - `KILN_BLOB_PROVIDER`: `S3`, `GCP`, or `AZURE` (required when enabled)
    /// - `KILN_LOGS_BUCKET`: logs bucket (required when enabled)
    /// - `KILN_ARTIFACT_BUCKET` / `KILN_CACHE_BUCKET`: default to the logs bucket
    /// - `KILN_BLOB_REGION`, `KILN_S3_ENDPOINT`, `KILN_S3_ACCESS_KEY`,
    ///   `KILN_S3_SECRET_KEY`, `KILN_GCP_CREDENTIALS_JSON`,
    ///   `KILN_AZURE_ACCOUNT_NAME`, `KILN_AZURE_ACCOUNT_KEY`: provider details
    /// - `KILN_EXTERNAL_BLOB_CM` / `KILN_EXTERNAL_BLOB_SECRET`: credential object
    ///   names in external clusters (default: blob-storage-cm / blob-storage-secret)
    /// - `KILN_DEFAULT_LOG_KEY_PREFIX` / `KILN_DEFAULT_ARTIFACT_KEY_PREFIX`:
    ///   bucket key prefixes (default: ci-logs / ci-artifacts)
    pub fn from_env() -> Result<Self, ConfigError> {
        let default_namespace =
            std::env::var("KILN_DEFAULT_NAMESPACE").unwrap_or_else(|_| "kiln-ci".to_string());

        let workflow_executor = match std::env::var("KILN_WORKFLOW_EXECUTOR")
            .unwrap_or_else(|_| "AWF".to_string())
            .as_str()
        {
            "AWF" => ExecutorType::ArgoWorkflow,
            "SYSTEM" => ExecutorType::System,
            _ => {
                return Err(ConfigError::Invalid(
                    "KILN_WORKFLOW_EXECUTOR",
                    "must be AWF or SYSTEM",
                ));
            }
        };

        let max_workflow_retries: u32 = std::env::var("KILN_MAX_CI_WORKFLOW_RETRIES")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("KILN_MAX_CI_WORKFLOW_RETRIES", "must be a positive integer")
            })?;

        let image_retry_count: u32 = std::env::var("KILN_IMAGE_RETRY_COUNT")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("KILN_IMAGE_RETRY_COUNT", "must be a positive integer")
            })?;

        let image_retry_interval_seconds: u32 = std::env::var("KILN_IMAGE_RETRY_INTERVAL")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("KILN_IMAGE_RETRY_INTERVAL", "must be a positive integer")
            })?;

        let build_timeout_seconds: u64 = std::env::var("KILN_BUILD_TIMEOUT")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("KILN_BUILD_TIMEOUT", "must be a positive integer"))?;

        let cache_limit_bytes: i64 = std::env::var("KILN_CACHE_LIMIT")
            .unwrap_or_else(|_| "5000000000".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("KILN_CACHE_LIMIT", "must be a positive integer"))?;

        let workflow_cache_enabled = parse_bool("KILN_WORKFLOW_CACHE_ENABLED", true)?;
        let use_image_tag_from_git_provider =
            parse_bool("KILN_USE_IMAGE_TAG_FROM_GIT_PROVIDER", false)?;
        let ignore_docker_cache = parse_bool("KILN_IGNORE_DOCKER_CACHE", false)?;

        let use_buildx = parse_bool("KILN_USE_BUILDX", false)?;
        let buildx_cache_mode_min = parse_bool("KILN_BUILDX_CACHE_MODE_MIN", false)?;
        let async_buildx_cache_export = parse_bool("KILN_ASYNC_BUILDX_CACHE_EXPORT", false)?;
        let buildx_interruption_max_retry: u32 = std::env::var("KILN_BUILDX_INTERRUPTION_MAX_RETRY")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "KILN_BUILDX_INTERRUPTION_MAX_RETRY",
                    "must be a positive integer",
                )
            })?;

        let image_scan_max_retries: u32 = std::env::var("KILN_IMAGE_SCAN_MAX_RETRIES")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("KILN_IMAGE_SCAN_MAX_RETRIES", "must be a positive integer")
            })?;
        let image_scan_medium_external = parse_bool("KILN_IMAGE_SCAN_MEDIUM_EXTERNAL", false)?;

        let orchestrator_host = std::env::var("KILN_ORCHESTRATOR_HOST").unwrap_or_default();
        let orchestrator_token = std::env::var("KILN_ORCHESTRATOR_TOKEN").unwrap_or_default();

        let blob = if parse_bool("KILN_BLOB_STORAGE_ENABLED", false)? {
            let provider = match std::env::var("KILN_BLOB_PROVIDER") {
                Ok(v) => match v.as_str() {
                    "S3" => BlobProvider::S3,
                    "GCP" => BlobProvider::Gcp,
                    "AZURE" => BlobProvider::Azure,
                    _ => {
                        return Err(ConfigError::Invalid(
                            "KILN_BLOB_PROVIDER",
                            "must be S3, GCP, or AZURE",
                        ));
                    }
                },
                Err(_) => return Err(ConfigError::Missing("KILN_BLOB_PROVIDER")),
            };

            let logs_bucket = std::env::var("KILN_LOGS_BUCKET")
                .map_err(|_| ConfigError::Missing("KILN_LOGS_BUCKET"))?;
            let artifact_bucket =
                std::env::var("KILN_ARTIFACT_BUCKET").unwrap_or_else(|_| logs_bucket.clone());
            let cache_bucket =
                std::env::var("KILN_CACHE_BUCKET").unwrap_or_else(|_| logs_bucket.clone());

            Some(BlobConfig {
                provider,
                logs_bucket,
                artifact_bucket,
                cache_bucket,
                region: std::env::var("KILN_BLOB_REGION").unwrap_or_default(),
                s3_endpoint: std::env::var("KILN_S3_ENDPOINT").unwrap_or_default(),
                s3_access_key: std::env::var("KILN_S3_ACCESS_KEY").unwrap_or_default(),
                s3_secret_key: std::env::var("KILN_S3_SECRET_KEY").unwrap_or_default(),
                gcp_credentials_json: std::env::var("KILN_GCP_CREDENTIALS_JSON")
                    .unwrap_or_default(),
                azure_account_name: std::env::var("KILN_AZURE_ACCOUNT_NAME").unwrap_or_default(),
                azure_account_key: std::env::var("KILN_AZURE_ACCOUNT_KEY").unwrap_or_default(),
            })
        } else {
            None
        };

        Ok(Self {
            default_namespace,
            workflow_executor,
            max_workflow_retries,
            image_retry_count,
            image_retry_interval_seconds,
            build_timeout_seconds,
            cache_limit_bytes,
            workflow_cache_enabled,
            use_image_tag_from_git_provider,
            ignore_docker_cache,
            use_buildx,
            default_target_platform: std::env::var("KILN_DEFAULT_TARGET_PLATFORM")
                .unwrap_or_default(),
            buildx_provenance_mode: std::env::var("KILN_BUILDX_PROVENANCE_MODE")
                .unwrap_or_default(),
            buildx_k8s_driver_options: std::env::var("KILN_BUILDX_K8S_DRIVER_OPTIONS")
                .unwrap_or_default(),
            buildx_cache_mode_min,
            async_buildx_cache_export,
            buildx_interruption_max_retry,
            image_scan_max_retries,
            image_scan_medium_external,
            orchestrator_host,
            orchestrator_token,
            blob,
            external_blob_config_map: std::env::var("KILN_EXTERNAL_BLOB_CM")
                .unwrap_or_else(|_| "blob-storage-cm".to_string()),
            external_blob_secret: std::env::var("KILN_EXTERNAL_BLOB_SECRET")
                .unwrap_or_else(|_| "blob-storage-secret".to_string()),
            default_log_key_prefix: std::env::var("KILN_DEFAULT_LOG_KEY_PREFIX")
                .unwrap_or_else(|_| "ci-logs".to_string()),
            default_artifact_key_prefix: std::env::var("KILN_DEFAULT_ARTIFACT_KEY_PREFIX")
                .unwrap_or_else(|_| "ci-artifacts".to_string()),
        })
    }
}

impl Default for Config {
    /// The same values `from_env` falls back to with an empty environment.
    fn default() -> Self {
        Self {
            default_namespace: "kiln-ci".to_string(),
            workflow_executor: ExecutorType::ArgoWorkflow,
            max_workflow_retries: 3,
            image_retry_count: 0,
            image_retry_interval_seconds: 5,
            build_timeout_seconds: 3600,
            cache_limit_bytes: 5_000_000_000,
            workflow_cache_enabled: true,
            use_image_tag_from_git_provider: false,
            ignore_docker_cache: false,
            use_buildx: false,
            default_target_platform: String::new(),
            buildx_provenance_mode: String::new(),
            buildx_k8s_driver_options: String::new(),
            buildx_cache_mode_min: false,
            async_buildx_cache_export: false,
            buildx_interruption_max_retry: 3,
            image_scan_max_retries: 3,
            image_scan_medium_external: false,
            orchestrator_host: String::new(),
            orchestrator_token: String::new(),
            blob: None,
            external_blob_config_map: "blob-storage-cm".to_string(),
            external_blob_secret: "blob-storage-secret".to_string(),
            default_log_key_prefix: "ci-logs".to_string(),
            default_artifact_key_prefix: "ci-artifacts".to_string(),
        }
    }
}

fn parse_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(v) => match v.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(ConfigError::Invalid(key, "must be true or false")),
        },
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
