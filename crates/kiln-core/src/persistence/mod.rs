// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence layer: record types and the storage trait.
//!
//! Two backends implement [`Persistence`]: [`postgres::PostgresPersistence`]
//! for production and [`memory::InMemoryPersistence`] for tests and embedded
//! use. All trigger-path state goes through this trait so services stay
//! backend-agnostic.

pub mod memory;
pub mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::Result;
use crate::model::{
    AppType, CiBuildType, ExecutorType, GitCommit, GitOptions, PipelineType, SourceType,
    StepObject, StepVariable, WorkflowRequest, WorkflowStatus,
};

// ============================================================================
// Records
// ============================================================================

/// A build pipeline.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PipelineRecord {
    /// Pipeline ID.
    pub id: i32,
    /// Application the pipeline belongs to.
    pub app_id: i32,
    /// Pipeline name.
    pub name: String,
    /// How this pipeline produces its artifact.
    #[sqlx(try_from = "String")]
    pub pipeline_type: PipelineType,
    /// Manual pipelines never fire from webhooks.
    pub is_manual: bool,
    /// Whether image scanning runs after builds.
    pub scan_enabled: bool,
    /// Whether a newer trigger aborts in-flight builds of this pipeline.
    pub auto_abort_previous_builds: bool,
    /// Pipeline-level override of the global workflow cache default.
    #[sqlx(default)]
    pub workflow_cache_overridden: Option<bool>,
    /// Whether the pipeline overrides the app-level build template.
    pub is_docker_config_overridden: bool,
    /// Soft-delete flag.
    pub deleted: bool,
}

/// An application or job owning pipelines.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AppRecord {
    /// Application ID.
    pub id: i32,
    /// Application name.
    pub name: String,
    /// Application kind.
    #[sqlx(try_from = "String")]
    pub app_type: AppType,
    /// Labels forwarded to job pods.
    #[sqlx(json)]
    pub labels: BTreeMap<String, String>,
}

/// A pipeline's bond to one git repository, joined with the repository row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MaterialRecord {
    /// Pipeline material ID.
    pub id: i32,
    /// Owning pipeline.
    pub pipeline_id: i32,
    /// Underlying git repository ID.
    pub git_material_id: i32,
    /// Where build revisions come from.
    #[sqlx(try_from = "String")]
    pub source_type: SourceType,
    /// Branch name, regex, or webhook source value.
    pub source_value: String,
    /// Inactive materials are skipped at trigger time.
    pub active: bool,
    /// Repository display name.
    pub git_material_name: String,
    /// Clone URL.
    pub git_repo_url: String,
    /// Checkout path inside the build workspace.
    pub checkout_path: String,
    /// Whether submodules are fetched.
    pub fetch_submodules: bool,
    /// Clone credentials.
    #[sqlx(json)]
    pub git_options: GitOptions,
    /// Last head commit seen by the sensor, denormalized for webhook triggers.
    pub last_seen_hash: String,
    /// When the last head was seen.
    #[sqlx(default)]
    pub last_seen_date: Option<DateTime<Utc>>,
}

/// Build template at the app level, or a pipeline-level override of it.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BuildTemplateRecord {
    /// Application the template belongs to.
    pub app_id: i32,
    /// Registry account the image is pushed to.
    pub docker_registry_id: String,
    /// Repository within the registry.
    pub docker_repository: String,
    /// Git repository carrying the dockerfile and default build context.
    pub git_material_id: i32,
    /// Build flavor and options.
    #[sqlx(json)]
    pub build_config: crate::model::BuildConfig,
}

/// A deployment environment jobs may run in.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    /// Environment ID.
    pub id: i32,
    /// Environment name.
    pub name: String,
    /// Namespace workloads run in.
    pub namespace: String,
    /// Cluster the environment lives on.
    pub cluster_id: i32,
    /// Cluster display name.
    pub cluster_name: String,
}

/// One build workflow execution.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorkflowRecord {
    /// Workflow ID. Ignored on save.
    pub id: i32,
    /// Workflow name, `{pipelineName}-{pipelineId}`.
    pub name: String,
    /// Owning pipeline.
    pub ci_pipeline_id: i32,
    /// Lifecycle status.
    #[sqlx(try_from = "String")]
    pub status: WorkflowStatus,
    /// Last reported pod status.
    pub pod_status: String,
    /// Operator-facing detail message.
    pub message: String,
    /// Trigger time.
    pub started_on: DateTime<Utc>,
    /// Completion time, absent while in flight.
    #[sqlx(default)]
    pub finished_on: Option<DateTime<Utc>>,
    /// Namespace the workflow runs in.
    pub namespace: String,
    /// Blob key of the build log, empty until known.
    pub log_location: String,
    /// Triggering user.
    pub triggered_by: i32,
    /// Executor backend.
    #[sqlx(try_from = "String")]
    pub executor_type: ExecutorType,
    /// Pod name once scheduled.
    pub pod_name: String,
    /// Build flavor, denormalized for display.
    #[sqlx(try_from = "String")]
    pub ci_build_type: CiBuildType,
    /// Environment override for jobs, 0 for none.
    pub environment_id: i32,
    /// Original workflow a re-trigger descends from, 0 for first runs.
    pub reference_ci_workflow_id: i32,
    /// Commit per material at trigger time.
    #[sqlx(json)]
    pub git_triggers: BTreeMap<i32, GitCommit>,
    /// Image path reservations held by this run.
    #[sqlx(json)]
    pub image_path_reservation_ids: Vec<i32>,
    /// Whether blob storage was configured when this ran.
    pub blob_storage_enabled: bool,
    /// Blob key of the artifact archive.
    pub ci_artifact_location: String,
}

/// An image produced by a finished build.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Artifact ID.
    pub id: i32,
    /// Pipeline that produced or received the image.
    pub pipeline_id: i32,
    /// Fully qualified image path.
    pub image: String,
    /// Image digest, empty when unknown.
    pub image_digest: String,
    /// Workflow that produced the image, 0 for external artifacts.
    pub workflow_id: i32,
}

/// A user-defined tag pattern for one pipeline.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CustomTagRecord {
    /// Custom tag ID.
    pub id: i32,
    /// Entity kind the tag applies to.
    pub entity_key: i32,
    /// Entity ID as a string, the pipeline ID for build pipelines.
    pub entity_value: String,
    /// Pattern with an `{x}` placeholder for the counter.
    pub tag_pattern: String,
    /// Next counter value.
    pub auto_increasing_number: i32,
    /// Disabled tags fall back to the deterministic tag.
    pub enabled: bool,
}

/// An active claim on a fully qualified image path.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ReservationRecord {
    /// Reservation ID.
    pub id: i32,
    /// Custom tag the reservation was made under, 0 for plugin destinations.
    pub custom_tag_id: i32,
    /// The reserved image path.
    pub image_path: String,
    /// Released reservations stay as audit rows.
    pub active: bool,
}

/// One configured task of a pipeline hook stage.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step ID.
    pub id: i32,
    /// Owning pipeline.
    pub pipeline_id: i32,
    /// Hook stage, `pre_ci` or `post_ci`.
    pub stage: String,
    /// Execution order within the stage, 1-based.
    #[sqlx(rename = "step_index")]
    pub index: i32,
    /// Step name.
    pub name: String,
    /// `INLINE` or `REF_PLUGIN`.
    pub step_type: String,
    /// Plugin version for `REF_PLUGIN` steps, 0 otherwise.
    pub ref_plugin_id: i32,
    /// Script body for inline steps.
    pub script: String,
    /// Input variable definitions.
    #[sqlx(json)]
    pub input_vars: Vec<StepVariable>,
    /// Output variable definitions.
    #[sqlx(json)]
    pub output_vars: Vec<StepVariable>,
    /// Directories exposed to later steps.
    #[sqlx(json)]
    pub output_directory_paths: Vec<String>,
    /// Soft-delete flag.
    pub deleted: bool,
}

/// A published plugin version with its step bodies.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PluginVersionRecord {
    /// Plugin version ID.
    pub id: i32,
    /// Plugin display name.
    pub name: String,
    /// Version string.
    pub version: String,
    /// The plugin's steps.
    #[sqlx(json)]
    pub steps: Vec<StepObject>,
    /// Soft-delete flag.
    pub deleted: bool,
}

/// A legacy shell script hook predating structured stage steps.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ScriptRecord {
    /// Script ID.
    pub id: i32,
    /// Owning pipeline.
    pub pipeline_id: i32,
    /// `BEFORE_DOCKER_BUILD` or `AFTER_DOCKER_BUILD`.
    pub stage: String,
    /// Execution order within the stage, 1-based.
    #[sqlx(rename = "script_index")]
    pub index: i32,
    /// Script name.
    pub name: String,
    /// Script body.
    pub script: String,
    /// Directory whose contents are collected after the script runs.
    pub output_location: String,
}

// ============================================================================
// Persistence trait
// ============================================================================

/// Storage operations the trigger engine needs.
///
/// Implementations must be safe to share across tasks. Methods return
/// `Ok(None)` for missing rows; only genuine storage failures are errors.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ---- pipelines and apps ----

    /// Fetch a pipeline by ID. Deleted pipelines are not returned.
    async fn find_pipeline(&self, pipeline_id: i32) -> Result<Option<PipelineRecord>>;

    /// Fetch the pipeline owning a pipeline material.
    async fn find_pipeline_by_material(&self, material_id: i32)
    -> Result<Option<PipelineRecord>>;

    /// Fetch an application by ID.
    async fn find_app(&self, app_id: i32) -> Result<Option<AppRecord>>;

    /// Fetch the app-level build template.
    async fn find_build_template(&self, app_id: i32) -> Result<Option<BuildTemplateRecord>>;

    /// Fetch the pipeline-level build template override, if any.
    async fn find_build_template_override(
        &self,
        pipeline_id: i32,
    ) -> Result<Option<BuildTemplateRecord>>;

    /// Fetch an environment by ID.
    async fn find_environment(&self, environment_id: i32) -> Result<Option<EnvironmentRecord>>;

    // ---- materials ----

    /// Fetch a pipeline material by ID, active or not.
    async fn find_material(&self, material_id: i32) -> Result<Option<MaterialRecord>>;

    /// Fetch the active materials of a pipeline, ordered by ID.
    async fn find_materials_for_pipeline(&self, pipeline_id: i32)
    -> Result<Vec<MaterialRecord>>;

    /// Record the latest head commit seen for a material.
    async fn update_material_head(&self, material_id: i32, commit: &GitCommit) -> Result<()>;

    /// Checkout path of a git repository, from any pipeline material bound to it.
    async fn find_checkout_path(&self, git_material_id: i32) -> Result<Option<String>>;

    // ---- workflows ----

    /// Insert a workflow and return its ID. The record's own ID is ignored.
    async fn save_workflow(&self, workflow: &WorkflowRecord) -> Result<i32>;

    /// Fetch a workflow by ID.
    async fn find_workflow(&self, workflow_id: i32) -> Result<Option<WorkflowRecord>>;

    /// Overwrite a workflow row.
    async fn update_workflow(&self, workflow: &WorkflowRecord) -> Result<()>;

    /// Set status, pod status, and message unless the row is already terminal.
    ///
    /// Returns whether the row changed. Terminal rows are left untouched so a
    /// late failure report never overwrites a completed build.
    async fn mark_workflow_if_not_terminal(
        &self,
        workflow_id: i32,
        status: WorkflowStatus,
        pod_status: &str,
        message: &str,
    ) -> Result<bool>;

    /// The most recently triggered workflow of a pipeline.
    async fn find_last_triggered_workflow(
        &self,
        pipeline_id: i32,
    ) -> Result<Option<WorkflowRecord>>;

    /// All non-terminal workflows of a pipeline, oldest first.
    async fn find_unfinished_workflows(&self, pipeline_id: i32) -> Result<Vec<WorkflowRecord>>;

    /// How many re-triggers descend from a workflow.
    async fn count_retries(&self, reference_workflow_id: i32) -> Result<u32>;

    /// Set the artifact archive location of a workflow.
    async fn update_artifact_location(&self, workflow_id: i32, location: &str) -> Result<()>;

    /// Set the build log location of a workflow.
    async fn update_log_location(&self, workflow_id: i32, location: &str) -> Result<()>;

    // ---- artifacts ----

    /// Which of the given image paths already exist as artifacts.
    async fn find_artifacts_by_image_paths(&self, paths: &[String]) -> Result<Vec<String>>;

    /// Whether an artifact with this exact image exists for the pipeline.
    async fn artifact_exists_for_image(&self, pipeline_id: i32, image: &str) -> Result<bool>;

    /// Whether an artifact with this digest and image exists for the pipeline.
    async fn artifact_exists_for_digest(
        &self,
        pipeline_id: i32,
        image_digest: &str,
        image: &str,
    ) -> Result<bool>;

    // ---- custom tags and reservations ----

    /// Fetch the enabled custom tag for an entity, if configured.
    async fn find_custom_tag(
        &self,
        entity_key: i32,
        entity_value: &str,
    ) -> Result<Option<CustomTagRecord>>;

    /// Claim and return the next counter value of a custom tag.
    async fn next_custom_tag_value(&self, custom_tag_id: i32) -> Result<i32>;

    /// Reserve an image path.
    ///
    /// Fails with [`crate::error::CoreError::ImagePathInUse`] when an active
    /// reservation for the same path exists. Pass `custom_tag_id` 0 for
    /// reservations not backed by a custom tag.
    async fn reserve_image_path(&self, custom_tag_id: i32, image_path: &str) -> Result<i32>;

    /// Release reservations. Unknown IDs are ignored.
    async fn deactivate_reservations(&self, reservation_ids: &[i32]) -> Result<()>;

    // ---- stage steps and plugins ----

    /// Configured steps of a hook stage, ordered by index.
    async fn find_stage_steps(&self, pipeline_id: i32, stage: &str) -> Result<Vec<StepRecord>>;

    /// Fetch a plugin version by ID.
    async fn find_plugin_version(
        &self,
        plugin_version_id: i32,
    ) -> Result<Option<PluginVersionRecord>>;

    /// All versions of a plugin by display name.
    async fn find_plugin_versions_by_name(&self, name: &str)
    -> Result<Vec<PluginVersionRecord>>;

    /// Legacy script hooks of a pipeline, ordered by index.
    async fn find_legacy_scripts(&self, pipeline_id: i32) -> Result<Vec<ScriptRecord>>;

    // ---- snapshots and audit ----

    /// Persist the submitted workflow request, keyed by workflow and type.
    ///
    /// Saving again for the same key overwrites, so a failed save can be
    /// retried without a conflict.
    async fn save_trigger_snapshot(
        &self,
        workflow_id: i32,
        workflow_type: &str,
        request: &WorkflowRequest,
    ) -> Result<()>;

    /// Fetch the snapshot saved for a workflow.
    async fn find_trigger_snapshot(
        &self,
        workflow_id: i32,
        workflow_type: &str,
    ) -> Result<Option<WorkflowRequest>>;

    /// Record the resolved runtime variables of a trigger for audit.
    async fn save_variable_snapshot(
        &self,
        workflow_id: i32,
        triggered_by: i32,
        variables: &BTreeMap<String, String>,
    ) -> Result<()>;

    // ---- misc ----

    /// Fetch a host attribute, e.g. the public host URL.
    async fn find_attribute(&self, key: &str) -> Result<Option<String>>;

    /// Bump and return the trigger counter of an app and pipeline pair.
    async fn increment_trigger_counter(&self, app_id: i32, pipeline_id: i32) -> Result<i64>;
}
