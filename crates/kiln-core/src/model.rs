// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared domain types: pipeline and workflow enums, trigger payloads, and the
//! workflow request handed to the build executor.
//!
//! The workflow request is serialized once at submit time and persisted as the
//! trigger snapshot, so every field type here must round-trip through JSON.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Workflow type tag for build workflows, used as the snapshot key discriminator.
pub const WORKFLOW_TYPE_CI: &str = "CI";

/// Message recorded on a workflow cancelled through the normal path.
pub const TERMINATED_MESSAGE: &str = "TERMINATED";

/// Message recorded when a force abort hits a workflow the executor no longer knows.
pub const FORCE_ABORT_MESSAGE: &str = "FORCE_ABORT_AFTER_STARTING";

/// Pod status recorded for failed or terminated pods.
pub const POD_STATUS_FAILED: &str = "Failed";

/// Pod status while the pod has not started producing logs yet.
pub const POD_STATUS_PENDING: &str = "Pending";

/// Webhook event action for merged pull requests.
pub const WEBHOOK_EVENT_MERGED: &str = "merged";

/// Webhook payload selector carrying the target branch head commit.
pub const WEBHOOK_SELECTOR_TARGET_CHECKOUT: &str = "target checkout";

/// Webhook payload selector carrying the source branch head commit.
pub const WEBHOOK_SELECTOR_SOURCE_CHECKOUT: &str = "source checkout";

/// Display name of the image copy plugin.
pub const COPY_CONTAINER_IMAGE_PLUGIN: &str = "Copy container image";

/// Display name of the image scanning plugin injected for external scans.
pub const IMAGE_SCANNING_PLUGIN: &str = "Image Scanning";

/// App label mounting a PVC for every pipeline of the app.
pub const PVC_ALL_LABEL: &str = "devtron.ai/ci-pvc-all";

/// App label prefix mounting a PVC for one named pipeline.
pub const PVC_PIPELINE_LABEL_PREFIX: &str = "devtron.ai/ci-pvc";

/// Input variable of the image copy plugin listing destination registries and repos.
pub const DESTINATION_INFO_VARIABLE: &str = "DESTINATION_INFO";

/// Runtime parameter key carrying an externally built artifact for job pipelines.
pub const EXTERNAL_CI_ARTIFACT_KEY: &str = "externalCiArtifact";

/// Runtime parameter key carrying the digest of an externally built artifact.
pub const IMAGE_DIGEST_KEY: &str = "imageDigest";

/// User ID recorded on workflows the system triggers on its own behalf.
pub const SYSTEM_USER_ID: i32 = 1;

/// Hook stage for steps and plugin artifacts running before the build.
pub const STAGE_PRE_CI: &str = "pre_ci";

/// Hook stage for steps and plugin artifacts running after the build.
pub const STAGE_POST_CI: &str = "post_ci";

// ============================================================================
// Pipeline and workflow enums
// ============================================================================

/// How a pipeline produces its artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineType {
    /// Builds an image from source in this installation.
    #[serde(rename = "CI_BUILD")]
    CiBuild,
    /// Reuses the artifacts of another build pipeline.
    #[serde(rename = "LINKED")]
    Linked,
    /// Receives artifacts from an external CI system.
    #[serde(rename = "EXTERNAL")]
    External,
    /// Runs job tasks without producing an image of its own.
    #[serde(rename = "CI_JOB")]
    CiJob,
    /// Deploy-only pipeline chained to another pipeline's artifacts.
    #[serde(rename = "LINKED_CD")]
    LinkedCd,
}

impl PipelineType {
    /// Whether webhook-driven automatic triggers apply to this pipeline type.
    pub fn accepts_webhook_triggers(&self) -> bool {
        !matches!(self, Self::Linked | Self::External | Self::LinkedCd)
    }
}

/// Where a material's build revision comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    /// A fixed branch name.
    #[serde(rename = "SOURCE_TYPE_BRANCH_FIXED")]
    BranchFixed,
    /// A branch name pattern resolved at trigger time.
    #[serde(rename = "SOURCE_TYPE_BRANCH_REGEX")]
    BranchRegex,
    /// Any pushed tag.
    #[serde(rename = "SOURCE_TYPE_TAG_ANY")]
    TagAny,
    /// Commits delivered by provider webhooks, including pull request events.
    #[serde(rename = "WEBHOOK")]
    Webhook,
}

/// Which backend runs the build workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorType {
    /// Argo Workflows controller.
    #[default]
    #[serde(rename = "AWF")]
    ArgoWorkflow,
    /// Plain pod managed directly by the orchestrator.
    #[serde(rename = "SYSTEM")]
    System,
}

/// Build workflow lifecycle status.
///
/// `Starting` and `Running` are the only non-terminal statuses. A terminal
/// workflow never transitions again; late status writes are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    /// Accepted and submitted, pod not yet running.
    Starting,
    /// Build pod is running.
    Running,
    /// Build finished and artifacts were published.
    Succeeded,
    /// Build failed.
    Failed,
    /// Cancelled by a user.
    Cancelled,
    /// Aborted by the system, e.g. superseded by a newer trigger.
    Aborted,
}

impl WorkflowStatus {
    /// Whether this status is final.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Starting | Self::Running)
    }

    /// Parse from the stored string form. Case-insensitive, since executor
    /// callbacks historically reported upper-cased statuses.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    /// The canonical stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
            Self::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the image itself is produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CiBuildType {
    /// Dockerfile checked into the repository.
    #[default]
    #[serde(rename = "self-dockerfile-build")]
    SelfDockerfile,
    /// Dockerfile content managed in pipeline configuration.
    #[serde(rename = "managed-dockerfile-build")]
    ManagedDockerfile,
    /// Cloud-native buildpacks.
    #[serde(rename = "buildpack-build")]
    Buildpack,
    /// No image build, job tasks only.
    #[serde(rename = "skip-build")]
    SkipBuild,
}

/// Kind of application a pipeline belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppType {
    /// Deployable application.
    #[serde(rename = "APP")]
    Application,
    /// Standalone job.
    #[serde(rename = "JOB")]
    Job,
}

/// Supported blob storage providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobProvider {
    /// AWS S3 or any S3-compatible store.
    #[serde(rename = "S3")]
    S3,
    /// Google Cloud Storage.
    #[serde(rename = "GCP")]
    Gcp,
    /// Azure Blob Storage.
    #[serde(rename = "AZURE")]
    Azure,
}

/// Container registry flavors, driving credential handling at build time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryType {
    /// Any plain docker v2 registry.
    #[default]
    #[serde(rename = "docker-hub")]
    DockerHub,
    /// AWS Elastic Container Registry.
    #[serde(rename = "ecr")]
    Ecr,
    /// Google Artifact Registry or GCR.
    #[serde(rename = "artifact-registry")]
    ArtifactRegistry,
    /// Azure Container Registry.
    #[serde(rename = "acr")]
    Acr,
    /// Self-hosted or other OCI registries.
    #[serde(rename = "other")]
    Other,
}

// ============================================================================
// Stored-form conversions
//
// Enums are stored as their wire names in TEXT columns. TryFrom<String> lets
// sqlx decode them straight into records via #[sqlx(try_from = "String")].
// ============================================================================

macro_rules! stored_enum {
    ($ty:ty { $($variant:path => $text:literal),+ $(,)? }) => {
        impl $ty {
            /// The canonical stored string form.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($variant => $text),+
                }
            }
        }

        impl TryFrom<String> for $ty {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                match value.as_str() {
                    $($text => Ok($variant)),+,
                    other => Err(format!(
                        "unknown {} value: {}",
                        stringify!($ty),
                        other
                    )),
                }
            }
        }
    };
}

stored_enum!(PipelineType {
    PipelineType::CiBuild => "CI_BUILD",
    PipelineType::Linked => "LINKED",
    PipelineType::External => "EXTERNAL",
    PipelineType::CiJob => "CI_JOB",
    PipelineType::LinkedCd => "LINKED_CD",
});

stored_enum!(SourceType {
    SourceType::BranchFixed => "SOURCE_TYPE_BRANCH_FIXED",
    SourceType::BranchRegex => "SOURCE_TYPE_BRANCH_REGEX",
    SourceType::TagAny => "SOURCE_TYPE_TAG_ANY",
    SourceType::Webhook => "WEBHOOK",
});

stored_enum!(ExecutorType {
    ExecutorType::ArgoWorkflow => "AWF",
    ExecutorType::System => "SYSTEM",
});

stored_enum!(AppType {
    AppType::Application => "APP",
    AppType::Job => "JOB",
});

stored_enum!(CiBuildType {
    CiBuildType::SelfDockerfile => "self-dockerfile-build",
    CiBuildType::ManagedDockerfile => "managed-dockerfile-build",
    CiBuildType::Buildpack => "buildpack-build",
    CiBuildType::SkipBuild => "skip-build",
});

stored_enum!(RegistryType {
    RegistryType::DockerHub => "docker-hub",
    RegistryType::Ecr => "ecr",
    RegistryType::ArtifactRegistry => "artifact-registry",
    RegistryType::Acr => "acr",
    RegistryType::Other => "other",
});

impl TryFrom<String> for WorkflowStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown WorkflowStatus value: {}", value))
    }
}

// ============================================================================
// Git payloads
// ============================================================================

/// A resolved commit for one pipeline material.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GitCommit {
    /// Commit hash.
    pub commit: String,
    /// Commit author.
    pub author: String,
    /// Commit timestamp.
    pub date: Option<DateTime<Utc>>,
    /// Commit message.
    pub message: String,
    /// Changed file paths, when the sensor provides them.
    pub changes: Vec<String>,
    /// Tag name for tag-based triggers, empty otherwise.
    pub git_tag: String,
    /// Webhook payload for webhook-sourced materials.
    pub webhook_data: Option<WebhookData>,
}

/// Parsed webhook event attached to a commit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookData {
    /// Sensor-side identifier of the parsed event.
    pub id: i32,
    /// Event action, e.g. `merged` for merged pull requests.
    pub event_action_type: String,
    /// Selector name to value map extracted from the provider payload.
    pub data: BTreeMap<String, String>,
}

// ============================================================================
// Trigger payloads
// ============================================================================

/// One material pin inside a trigger request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerMaterial {
    /// Pipeline material ID.
    pub material_id: i32,
    /// Commit hash to build. Empty means latest for the configured source.
    pub commit_hash: String,
    /// Parsed webhook event to build from, for webhook-sourced materials.
    pub webhook_data_id: i32,
}

/// Runtime parameters attached to a manual trigger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeParameters {
    /// Extra environment variables injected into the build.
    pub env_variables: BTreeMap<String, String>,
}

impl RuntimeParameters {
    /// Externally built artifact reference, for job pipelines.
    pub fn external_ci_artifact(&self) -> Option<&str> {
        self.env_variables
            .get(EXTERNAL_CI_ARTIFACT_KEY)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Digest accompanying an externally built artifact.
    pub fn image_digest(&self) -> Option<&str> {
        self.env_variables
            .get(IMAGE_DIGEST_KEY)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// A request to start one build workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerRequest {
    /// Pipeline to trigger.
    pub pipeline_id: i32,
    /// Material pins. Materials not listed resolve to their latest commit.
    pub materials: Vec<TriggerMaterial>,
    /// User starting the build.
    pub triggered_by: i32,
    /// Display name or email of the triggering user.
    pub trigger_author: String,
    /// Skip the build cache for this run.
    pub invalidate_cache: bool,
    /// Environment override for job pipelines, 0 for none.
    pub environment_id: i32,
    /// Runtime parameters.
    pub runtime_params: RuntimeParameters,
}

/// A new-commit notification from the git sensor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookEvent {
    /// Pipeline material the commit arrived on.
    pub pipeline_material_id: i32,
    /// The new head commit.
    pub git_commit: GitCommit,
}

// ============================================================================
// Workflow request wire types
// ============================================================================

/// Everything the build runner needs for one workflow execution.
///
/// Serialized as JSON at submit time, persisted as the trigger snapshot, and
/// replayed verbatim on re-trigger with only identity fields rewritten.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowRequest {
    /// Workflow object name prefix, `{workflowId}-{workflowName}`.
    pub workflow_name_prefix: String,
    /// Pipeline name.
    pub pipeline_name: String,
    /// Pipeline ID.
    pub pipeline_id: i32,
    /// Application ID.
    pub app_id: i32,
    /// Application name.
    pub app_name: String,
    /// Workflow row ID.
    pub workflow_id: i32,
    /// Triggering user ID.
    pub triggered_by: i32,
    /// Triggering user display name.
    pub trigger_by_author: String,
    /// Namespace the workflow runs in.
    pub namespace: String,
    /// Workflow type discriminator, `CI` for builds.
    #[serde(rename = "type")]
    pub workflow_type: String,
    /// Per-material checkout details.
    pub ci_project_details: Vec<CiProjectDetails>,
    /// Image tag for the build output.
    pub docker_image_tag: String,
    /// Registry account ID.
    pub docker_registry_id: String,
    /// Registry flavor.
    pub docker_registry_type: RegistryType,
    /// Registry base URL.
    pub docker_registry_url: String,
    /// Repository within the registry.
    pub docker_repository: String,
    /// Registry connection mode, `secure` or `insecure`.
    pub docker_connection: String,
    /// CA certificate for secure-with-cert registries.
    pub docker_cert: String,
    /// Registry username.
    pub docker_username: String,
    /// Registry password.
    pub docker_password: String,
    /// ECR region.
    pub aws_region: String,
    /// ECR access key.
    pub access_key: String,
    /// ECR secret key.
    pub secret_key: String,
    /// Checkout path of the material carrying the build context.
    pub checkout_path: String,
    /// Build configuration, absent for pure job workflows.
    pub ci_build_config: Option<BuildConfig>,
    /// Whether image scanning runs after the build.
    pub scan_enabled: bool,
    /// Scan tasks injected for externally mediated scans, empty otherwise.
    pub image_scanning_steps: Vec<StepObject>,
    /// Retry budget for the scan submission.
    pub image_scan_max_retries: u32,
    /// Skip cache download for this run.
    pub cache_invalidate: bool,
    /// Whether workflow-level caching applies to this run.
    pub workflow_cache_enabled: bool,
    /// Cache archive name, `{pipelineId}.tar.gz`.
    pub ci_cache_file_name: String,
    /// Cache bucket or container.
    pub ci_cache_location: String,
    /// Cache bucket region.
    pub ci_cache_region: String,
    /// Cache ceiling in bytes.
    pub cache_limit: i64,
    /// Whether any blob storage is configured for this run.
    pub blob_storage_configured: bool,
    /// S3 settings, when the provider is S3.
    pub blob_storage_s3_config: Option<S3BlobConfig>,
    /// GCP settings, when the provider is GCP.
    pub gcp_blob_config: Option<GcpBlobConfig>,
    /// Azure settings, when the provider is Azure.
    pub azure_blob_config: Option<AzureBlobConfig>,
    /// Provider tag, `S3`, `GCP`, or `AZURE`.
    pub cloud_provider: String,
    /// Key the runner uploads the artifact archive under.
    pub ci_artifact_location: String,
    /// Artifact bucket.
    pub ci_artifact_bucket: String,
    /// Artifact archive file name.
    pub ci_artifact_file_name: String,
    /// Tasks before the image build.
    pub pre_ci_steps: Vec<StepObject>,
    /// Tasks after the image build.
    pub post_ci_steps: Vec<StepObject>,
    /// Plugin step bodies referenced by `REF_PLUGIN` steps.
    pub ref_plugins: Vec<RefPluginObject>,
    /// Hard deadline in seconds.
    pub active_deadline_seconds: u64,
    /// Push retry count.
    pub image_retry_count: u32,
    /// Seconds between push retries.
    pub image_retry_interval: u32,
    /// Executor backend for this workflow.
    pub workflow_executor: ExecutorType,
    /// Skip layer cache upload.
    pub ignore_docker_cache_push: bool,
    /// Skip layer cache download.
    pub ignore_docker_cache_pull: bool,
    /// Export the buildx layer cache in `min` mode instead of `max`.
    pub buildx_cache_mode_min: bool,
    /// Export the buildx layer cache after the build finishes, off the
    /// critical path.
    pub async_buildx_cache_export: bool,
    /// Restarts allowed when a buildx build is interrupted.
    pub buildx_interruption_max_retry: u32,
    /// Orchestrator callback host.
    pub orchestrator_host: String,
    /// Public host URL builds report links against.
    pub host_url: String,
    /// Orchestrator callback token.
    pub orchestrator_token: String,
    /// Extra environment for the runner.
    pub system_environment_variables: BTreeMap<String, String>,
    /// Application labels forwarded to job pods.
    pub app_labels: BTreeMap<String, String>,
    /// Environment override for job workflows, 0 for none.
    pub environment_id: i32,
    /// Whether this run replays a snapshot.
    pub is_re_trigger: bool,
    /// Original workflow a re-trigger descends from, 0 for first runs.
    pub reference_ci_workflow_id: i32,
    /// Registry ID to destination image list, for the image copy plugin.
    pub registry_destination_image_map: BTreeMap<String, Vec<String>>,
    /// Registry ID to credentials, for the image copy plugin.
    pub registry_credential_map: BTreeMap<String, RegistryCredentials>,
    /// Which hook stage produces the final artifact, `pre_ci` or `post_ci`.
    pub plugin_artifact_stage: String,
}

impl WorkflowRequest {
    /// The fully qualified image this workflow builds, empty for job workflows.
    pub fn build_image(&self) -> String {
        if self.docker_repository.is_empty() || self.docker_image_tag.is_empty() {
            return String::new();
        }
        format!(
            "{}/{}:{}",
            self.docker_registry_url.trim_end_matches('/'),
            self.docker_repository,
            self.docker_image_tag
        )
    }
}

/// Checkout details for one git material.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CiProjectDetails {
    /// Clone URL.
    pub git_repository: String,
    /// Material display name.
    pub material_name: String,
    /// Path the repository is checked out at.
    pub checkout_path: String,
    /// Whether submodules are fetched.
    pub fetch_submodules: bool,
    /// Commit to check out.
    pub commit_hash: String,
    /// Tag to check out, for tag-based triggers.
    pub git_tag: String,
    /// Commit timestamp.
    pub commit_time: Option<DateTime<Utc>>,
    /// Source type of the material.
    pub source_type: Option<SourceType>,
    /// Branch name, regex, or webhook source value.
    pub source_value: String,
    /// Commit author.
    pub author: String,
    /// Commit message.
    pub message: String,
    /// Webhook payload for webhook-sourced materials.
    pub webhook_data: Option<WebhookData>,
    /// Clone credentials.
    pub git_options: GitOptions,
}

/// Clone credentials for one material.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GitOptions {
    /// Username for HTTP auth.
    pub user_name: String,
    /// Password or token for HTTP auth.
    pub password: String,
    /// Private key for SSH auth.
    pub ssh_private_key: String,
    /// Access token for token auth.
    pub access_token: String,
    /// Auth mode, e.g. `USERNAME_PASSWORD`, `SSH`, `ANONYMOUS`.
    pub auth_mode: String,
    /// TLS material for clones over mutual TLS.
    pub tls: GitTlsConfig,
}

/// TLS material for one git host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GitTlsConfig {
    /// Whether TLS verification is enabled for this host.
    pub enabled: bool,
    /// Client TLS key, PEM.
    pub tls_key: String,
    /// Client TLS certificate, PEM.
    pub tls_cert: String,
    /// CA certificate chain, PEM.
    pub ca_cert: String,
}

/// Build configuration resolved from the template and pipeline override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildConfig {
    /// Build flavor.
    pub ci_build_type: CiBuildType,
    /// Dockerfile path relative to the build context material.
    pub dockerfile_path: String,
    /// Managed dockerfile content, for managed builds.
    pub dockerfile_content: String,
    /// Build args.
    pub args: BTreeMap<String, String>,
    /// Extra `docker build` options.
    pub docker_build_options: BTreeMap<String, String>,
    /// Target platforms, comma separated, empty for the node platform.
    pub target_platform: String,
    /// Build context path relative to the context material.
    pub build_context: String,
    /// Material the build context lives in, 0 for the dockerfile material.
    pub build_context_git_material_id: i32,
    /// Use the repository root as context regardless of `build_context`.
    pub use_root_build_context: bool,
    /// Project path for buildpack builds.
    pub buildpack_project_path: String,
    /// Builder image for buildpack builds.
    pub buildpack_builder_id: String,
    /// Language hint for buildpack builds.
    pub buildpack_language: String,
    /// Build through buildx rather than plain `docker build`.
    pub use_buildx: bool,
    /// Buildx `--provenance` mode, empty to leave provenance off.
    pub buildx_provenance_mode: String,
    /// Node selectors and tolerations for the buildx Kubernetes driver,
    /// one map per builder node.
    pub buildx_k8s_driver_options: Vec<BTreeMap<String, String>>,
}

/// One task in a hook stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StepObject {
    /// Step name.
    pub name: String,
    /// Execution order within the stage, 1-based.
    pub index: i32,
    /// `INLINE` or `REF_PLUGIN`.
    pub step_type: String,
    /// Plugin this step references, 0 for inline steps.
    pub ref_plugin_id: i32,
    /// Script body for inline steps.
    pub script: String,
    /// Input variables with resolved values.
    pub input_vars: Vec<StepVariable>,
    /// Output variables the step publishes.
    pub output_vars: Vec<StepVariable>,
    /// Paths collected as step artifacts.
    pub artifact_paths: Vec<String>,
    /// Directories exposed to later steps.
    pub output_directory_path: Vec<String>,
}

/// A step input or output variable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StepVariable {
    /// Variable name.
    pub name: String,
    /// Value format, e.g. `STRING`, `NUMBER`, `BOOL`.
    pub format: String,
    /// Resolved value.
    pub value: String,
    /// Where the value comes from: `FIXED`, `RUNTIME`, or `GLOBAL`. Runtime
    /// variables are resolved against the trigger's runtime parameters at
    /// assembly time; global variables are resolved by the runner.
    pub value_type: String,
}

/// Steps of a plugin referenced from a hook stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RefPluginObject {
    /// Plugin version ID.
    pub id: i32,
    /// The plugin's own steps.
    pub steps: Vec<StepObject>,
}

/// Registry credentials handed to the runner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryCredentials {
    /// Registry flavor.
    pub registry_type: RegistryType,
    /// Registry base URL.
    pub registry_url: String,
    /// Username.
    pub username: String,
    /// Password or token.
    pub password: String,
    /// ECR region.
    pub aws_region: String,
    /// ECR access key.
    pub access_key: String,
    /// ECR secret key.
    pub secret_key: String,
    /// Connection mode, `secure` or `insecure`.
    pub connection: String,
    /// CA certificate for secure-with-cert registries.
    pub cert: String,
}

/// S3 blob settings handed to the runner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct S3BlobConfig {
    /// Access key, empty when IAM credentials apply.
    pub access_key: String,
    /// Secret key, empty when IAM credentials apply.
    pub secret_key: String,
    /// Custom endpoint for S3-compatible stores.
    pub endpoint_url: String,
    /// Bucket region.
    pub region: String,
    /// Logs bucket.
    pub ci_log_bucket_name: String,
    /// Cache bucket.
    pub ci_cache_bucket_name: String,
    /// Artifact bucket.
    pub ci_artifact_bucket_name: String,
}

/// GCP blob settings handed to the runner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GcpBlobConfig {
    /// Service account credentials JSON.
    pub credential_file_json_data: String,
    /// Logs bucket.
    pub log_bucket_name: String,
    /// Cache bucket.
    pub cache_bucket_name: String,
    /// Artifact bucket.
    pub artifact_bucket_name: String,
}

/// Azure blob settings handed to the runner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AzureBlobConfig {
    /// Storage account name.
    pub account_name: String,
    /// Storage account key.
    pub account_key: String,
    /// Container for logs.
    pub blob_container_ci_log: String,
    /// Container for the cache.
    pub blob_container_ci_cache: String,
    /// Container for artifacts.
    pub blob_container_artifact: String,
}
