// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence backend.
//!
//! Schema lives in `migrations/postgresql/` and is applied through
//! [`crate::migrations::run_postgres`]. Queries are plain runtime queries so
//! no database is needed at compile time.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;

use super::{
    AppRecord, BuildTemplateRecord, CustomTagRecord, EnvironmentRecord, MaterialRecord,
    Persistence, PipelineRecord, PluginVersionRecord, ScriptRecord, StepRecord, WorkflowRecord,
};
use crate::error::{CoreError, Result};
use crate::model::{GitCommit, WorkflowRequest, WorkflowStatus};

/// Postgres unique violation code, used to translate reservation conflicts.
const UNIQUE_VIOLATION: &str = "23505";

/// [`Persistence`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool, e.g. for migrations.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION)
    )
}

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn find_pipeline(&self, pipeline_id: i32) -> Result<Option<PipelineRecord>> {
        let row = sqlx::query_as::<_, PipelineRecord>(
            r#"
            SELECT id, app_id, name, pipeline_type, is_manual, scan_enabled,
                   auto_abort_previous_builds, workflow_cache_overridden,
                   is_docker_config_overridden, deleted
            FROM ci_pipeline
            WHERE id = $1 AND deleted = FALSE
            "#,
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_pipeline_by_material(
        &self,
        material_id: i32,
    ) -> Result<Option<PipelineRecord>> {
        let row = sqlx::query_as::<_, PipelineRecord>(
            r#"
            SELECT p.id, p.app_id, p.name, p.pipeline_type, p.is_manual, p.scan_enabled,
                   p.auto_abort_previous_builds, p.workflow_cache_overridden,
                   p.is_docker_config_overridden, p.deleted
            FROM ci_pipeline p
            JOIN ci_pipeline_material m ON m.pipeline_id = p.id
            WHERE m.id = $1 AND p.deleted = FALSE
            "#,
        )
        .bind(material_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_app(&self, app_id: i32) -> Result<Option<AppRecord>> {
        let row = sqlx::query_as::<_, AppRecord>(
            r#"
            SELECT id, name, app_type, labels
            FROM app
            WHERE id = $1
            "#,
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_build_template(&self, app_id: i32) -> Result<Option<BuildTemplateRecord>> {
        let row = sqlx::query_as::<_, BuildTemplateRecord>(
            r#"
            SELECT app_id, docker_registry_id, docker_repository, git_material_id, build_config
            FROM ci_build_template
            WHERE app_id = $1
            "#,
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_build_template_override(
        &self,
        pipeline_id: i32,
    ) -> Result<Option<BuildTemplateRecord>> {
        let row = sqlx::query_as::<_, BuildTemplateRecord>(
            r#"
            SELECT app_id, docker_registry_id, docker_repository, git_material_id, build_config
            FROM ci_build_template_override
            WHERE pipeline_id = $1
            "#,
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_environment(&self, environment_id: i32) -> Result<Option<EnvironmentRecord>> {
        let row = sqlx::query_as::<_, EnvironmentRecord>(
            r#"
            SELECT id, name, namespace, cluster_id, cluster_name
            FROM environment
            WHERE id = $1
            "#,
        )
        .bind(environment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_material(&self, material_id: i32) -> Result<Option<MaterialRecord>> {
        let row = sqlx::query_as::<_, MaterialRecord>(
            r#"
            SELECT id, pipeline_id, git_material_id, source_type, source_value, active,
                   git_material_name, git_repo_url, checkout_path, fetch_submodules,
                   git_options, last_seen_hash, last_seen_date
            FROM ci_pipeline_material
            WHERE id = $1
            "#,
        )
        .bind(material_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_materials_for_pipeline(
        &self,
        pipeline_id: i32,
    ) -> Result<Vec<MaterialRecord>> {
        let rows = sqlx::query_as::<_, MaterialRecord>(
            r#"
            SELECT id, pipeline_id, git_material_id, source_type, source_value, active,
                   git_material_name, git_repo_url, checkout_path, fetch_submodules,
                   git_options, last_seen_hash, last_seen_date
            FROM ci_pipeline_material
            WHERE pipeline_id = $1 AND active = TRUE
            ORDER BY id
            "#,
        )
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_material_head(&self, material_id: i32, commit: &GitCommit) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ci_pipeline_material
            SET last_seen_hash = $2, last_seen_date = $3
            WHERE id = $1
            "#,
        )
        .bind(material_id)
        .bind(&commit.commit)
        .bind(commit.date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_checkout_path(&self, git_material_id: i32) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT checkout_path
            FROM ci_pipeline_material
            WHERE git_material_id = $1
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(git_material_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(path,)| path))
    }

    async fn save_workflow(&self, workflow: &WorkflowRecord) -> Result<i32> {
        let row: (i32,) = sqlx::query_as(
            r#"
            INSERT INTO ci_workflow (
                name, ci_pipeline_id, status, pod_status, message, started_on, finished_on,
                namespace, log_location, triggered_by, executor_type, pod_name, ci_build_type,
                environment_id, reference_ci_workflow_id, git_triggers,
                image_path_reservation_ids, blob_storage_enabled, ci_artifact_location
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19)
            RETURNING id
            "#,
        )
        .bind(&workflow.name)
        .bind(workflow.ci_pipeline_id)
        .bind(workflow.status.as_str())
        .bind(&workflow.pod_status)
        .bind(&workflow.message)
        .bind(workflow.started_on)
        .bind(workflow.finished_on)
        .bind(&workflow.namespace)
        .bind(&workflow.log_location)
        .bind(workflow.triggered_by)
        .bind(workflow.executor_type.as_str())
        .bind(&workflow.pod_name)
        .bind(workflow.ci_build_type.as_str())
        .bind(workflow.environment_id)
        .bind(workflow.reference_ci_workflow_id)
        .bind(Json(&workflow.git_triggers))
        .bind(Json(&workflow.image_path_reservation_ids))
        .bind(workflow.blob_storage_enabled)
        .bind(&workflow.ci_artifact_location)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn find_workflow(&self, workflow_id: i32) -> Result<Option<WorkflowRecord>> {
        let row = sqlx::query_as::<_, WorkflowRecord>(
            r#"
            SELECT id, name, ci_pipeline_id, status, pod_status, message, started_on,
                   finished_on, namespace, log_location, triggered_by, executor_type,
                   pod_name, ci_build_type, environment_id, reference_ci_workflow_id,
                   git_triggers, image_path_reservation_ids, blob_storage_enabled,
                   ci_artifact_location
            FROM ci_workflow
            WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_workflow(&self, workflow: &WorkflowRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE ci_workflow
            SET name = $2, ci_pipeline_id = $3, status = $4, pod_status = $5, message = $6,
                started_on = $7, finished_on = $8, namespace = $9, log_location = $10,
                triggered_by = $11, executor_type = $12, pod_name = $13, ci_build_type = $14,
                environment_id = $15, reference_ci_workflow_id = $16, git_triggers = $17,
                image_path_reservation_ids = $18, blob_storage_enabled = $19,
                ci_artifact_location = $20
            WHERE id = $1
            "#,
        )
        .bind(workflow.id)
        .bind(&workflow.name)
        .bind(workflow.ci_pipeline_id)
        .bind(workflow.status.as_str())
        .bind(&workflow.pod_status)
        .bind(&workflow.message)
        .bind(workflow.started_on)
        .bind(workflow.finished_on)
        .bind(&workflow.namespace)
        .bind(&workflow.log_location)
        .bind(workflow.triggered_by)
        .bind(workflow.executor_type.as_str())
        .bind(&workflow.pod_name)
        .bind(workflow.ci_build_type.as_str())
        .bind(workflow.environment_id)
        .bind(workflow.reference_ci_workflow_id)
        .bind(Json(&workflow.git_triggers))
        .bind(Json(&workflow.image_path_reservation_ids))
        .bind(workflow.blob_storage_enabled)
        .bind(&workflow.ci_artifact_location)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::WorkflowNotFound {
                workflow_id: workflow.id,
            });
        }
        Ok(())
    }

    async fn mark_workflow_if_not_terminal(
        &self,
        workflow_id: i32,
        status: WorkflowStatus,
        pod_status: &str,
        message: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ci_workflow
            SET status = $2, pod_status = $3, message = $4,
                finished_on = CASE WHEN $5 THEN NOW() ELSE finished_on END
            WHERE id = $1 AND status IN ('Starting', 'Running')
            "#,
        )
        .bind(workflow_id)
        .bind(status.as_str())
        .bind(pod_status)
        .bind(message)
        .bind(status.is_terminal())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_last_triggered_workflow(
        &self,
        pipeline_id: i32,
    ) -> Result<Option<WorkflowRecord>> {
        let row = sqlx::query_as::<_, WorkflowRecord>(
            r#"
            SELECT id, name, ci_pipeline_id, status, pod_status, message, started_on,
                   finished_on, namespace, log_location, triggered_by, executor_type,
                   pod_name, ci_build_type, environment_id, reference_ci_workflow_id,
                   git_triggers, image_path_reservation_ids, blob_storage_enabled,
                   ci_artifact_location
            FROM ci_workflow
            WHERE ci_pipeline_id = $1
            ORDER BY started_on DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_unfinished_workflows(&self, pipeline_id: i32) -> Result<Vec<WorkflowRecord>> {
        let rows = sqlx::query_as::<_, WorkflowRecord>(
            r#"
            SELECT id, name, ci_pipeline_id, status, pod_status, message, started_on,
                   finished_on, namespace, log_location, triggered_by, executor_type,
                   pod_name, ci_build_type, environment_id, reference_ci_workflow_id,
                   git_triggers, image_path_reservation_ids, blob_storage_enabled,
                   ci_artifact_location
            FROM ci_workflow
            WHERE ci_pipeline_id = $1 AND status IN ('Starting', 'Running')
            ORDER BY id
            "#,
        )
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn count_retries(&self, reference_workflow_id: i32) -> Result<u32> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM ci_workflow
            WHERE reference_ci_workflow_id = $1
            "#,
        )
        .bind(reference_workflow_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 as u32)
    }

    async fn update_artifact_location(&self, workflow_id: i32, location: &str) -> Result<()> {
        let result = sqlx::query(
            r#"UPDATE ci_workflow SET ci_artifact_location = $2 WHERE id = $1"#,
        )
        .bind(workflow_id)
        .bind(location)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::WorkflowNotFound { workflow_id });
        }
        Ok(())
    }

    async fn update_log_location(&self, workflow_id: i32, location: &str) -> Result<()> {
        let result = sqlx::query(r#"UPDATE ci_workflow SET log_location = $2 WHERE id = $1"#)
            .bind(workflow_id)
            .bind(location)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::WorkflowNotFound { workflow_id });
        }
        Ok(())
    }

    async fn find_artifacts_by_image_paths(&self, paths: &[String]) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT image
            FROM ci_artifact
            WHERE image = ANY($1)
            "#,
        )
        .bind(paths)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(image,)| image).collect())
    }

    async fn artifact_exists_for_image(&self, pipeline_id: i32, image: &str) -> Result<bool> {
        let row: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM ci_artifact WHERE pipeline_id = $1 AND image = $2
            )
            "#,
        )
        .bind(pipeline_id)
        .bind(image)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn artifact_exists_for_digest(
        &self,
        pipeline_id: i32,
        image_digest: &str,
        image: &str,
    ) -> Result<bool> {
        let row: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM ci_artifact
                WHERE pipeline_id = $1 AND image_digest = $2 AND image = $3
            )
            "#,
        )
        .bind(pipeline_id)
        .bind(image_digest)
        .bind(image)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn find_custom_tag(
        &self,
        entity_key: i32,
        entity_value: &str,
    ) -> Result<Option<CustomTagRecord>> {
        let row = sqlx::query_as::<_, CustomTagRecord>(
            r#"
            SELECT id, entity_key, entity_value, tag_pattern, auto_increasing_number, enabled
            FROM custom_tag
            WHERE entity_key = $1 AND entity_value = $2 AND enabled = TRUE
            "#,
        )
        .bind(entity_key)
        .bind(entity_value)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn next_custom_tag_value(&self, custom_tag_id: i32) -> Result<i32> {
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE custom_tag
            SET auto_increasing_number = auto_increasing_number + 1
            WHERE id = $1
            RETURNING auto_increasing_number - 1
            "#,
        )
        .bind(custom_tag_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some((value,)) => Ok(value),
            None => Err(CoreError::DatabaseError {
                operation: "next_custom_tag_value".to_string(),
                details: format!("custom tag {} not found", custom_tag_id),
            }),
        }
    }

    async fn reserve_image_path(&self, custom_tag_id: i32, image_path: &str) -> Result<i32> {
        let result: std::result::Result<(i32,), sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO image_path_reservation (custom_tag_id, image_path, active)
            VALUES ($1, $2, TRUE)
            RETURNING id
            "#,
        )
        .bind(custom_tag_id)
        .bind(image_path)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok((id,)) => Ok(id),
            Err(err) if is_unique_violation(&err) => Err(CoreError::ImagePathInUse {
                image_path: image_path.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn deactivate_reservations(&self, reservation_ids: &[i32]) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE image_path_reservation
            SET active = FALSE
            WHERE id = ANY($1)
            "#,
        )
        .bind(reservation_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_stage_steps(&self, pipeline_id: i32, stage: &str) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query_as::<_, StepRecord>(
            r#"
            SELECT id, pipeline_id, stage, step_index, name, step_type, ref_plugin_id,
                   script, input_vars, output_vars, output_directory_paths, deleted
            FROM pipeline_stage_step
            WHERE pipeline_id = $1 AND stage = $2 AND deleted = FALSE
            ORDER BY step_index
            "#,
        )
        .bind(pipeline_id)
        .bind(stage)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_plugin_version(
        &self,
        plugin_version_id: i32,
    ) -> Result<Option<PluginVersionRecord>> {
        let row = sqlx::query_as::<_, PluginVersionRecord>(
            r#"
            SELECT id, name, version, steps, deleted
            FROM plugin_metadata
            WHERE id = $1 AND deleted = FALSE
            "#,
        )
        .bind(plugin_version_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_plugin_versions_by_name(
        &self,
        name: &str,
    ) -> Result<Vec<PluginVersionRecord>> {
        let rows = sqlx::query_as::<_, PluginVersionRecord>(
            r#"
            SELECT id, name, version, steps, deleted
            FROM plugin_metadata
            WHERE name = $1 AND deleted = FALSE
            ORDER BY id
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_legacy_scripts(&self, pipeline_id: i32) -> Result<Vec<ScriptRecord>> {
        let rows = sqlx::query_as::<_, ScriptRecord>(
            r#"
            SELECT id, pipeline_id, stage, script_index, name, script, output_location
            FROM ci_pipeline_script
            WHERE pipeline_id = $1
            ORDER BY script_index
            "#,
        )
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn save_trigger_snapshot(
        &self,
        workflow_id: i32,
        workflow_type: &str,
        request: &WorkflowRequest,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_config_snapshot (workflow_id, workflow_type, request)
            VALUES ($1, $2, $3)
            ON CONFLICT (workflow_id, workflow_type)
            DO UPDATE SET request = EXCLUDED.request
            "#,
        )
        .bind(workflow_id)
        .bind(workflow_type)
        .bind(Json(request))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_trigger_snapshot(
        &self,
        workflow_id: i32,
        workflow_type: &str,
    ) -> Result<Option<WorkflowRequest>> {
        let row: Option<(Json<WorkflowRequest>,)> = sqlx::query_as(
            r#"
            SELECT request
            FROM workflow_config_snapshot
            WHERE workflow_id = $1 AND workflow_type = $2
            "#,
        )
        .bind(workflow_id)
        .bind(workflow_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(Json(request),)| request))
    }

    async fn save_variable_snapshot(
        &self,
        workflow_id: i32,
        triggered_by: i32,
        variables: &BTreeMap<String, String>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO variable_snapshot_history (workflow_id, triggered_by, variables)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(workflow_id)
        .bind(triggered_by)
        .bind(Json(variables))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_attribute(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"SELECT value FROM attributes WHERE key = $1"#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn increment_trigger_counter(&self, app_id: i32, pipeline_id: i32) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO trigger_counter (app_id, pipeline_id, count)
            VALUES ($1, $2, 1)
            ON CONFLICT (app_id, pipeline_id)
            DO UPDATE SET count = trigger_counter.count + 1
            RETURNING count
            "#,
        )
        .bind(app_id)
        .bind(pipeline_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}
