// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence backend.
//!
//! Fully functional implementation of [`Persistence`] over process memory.
//! Used by unit and service tests; also handy for embedded experiments where
//! no database is available. State is lost on drop.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{
    AppRecord, ArtifactRecord, BuildTemplateRecord, CustomTagRecord, EnvironmentRecord,
    MaterialRecord, Persistence, PipelineRecord, PluginVersionRecord, ReservationRecord,
    ScriptRecord, StepRecord, WorkflowRecord,
};
use crate::error::{CoreError, Result};
use crate::model::{GitCommit, WorkflowRequest, WorkflowStatus};

#[derive(Default)]
struct Store {
    pipelines: HashMap<i32, PipelineRecord>,
    apps: HashMap<i32, AppRecord>,
    templates: HashMap<i32, BuildTemplateRecord>,
    template_overrides: HashMap<i32, BuildTemplateRecord>,
    environments: HashMap<i32, EnvironmentRecord>,
    materials: HashMap<i32, MaterialRecord>,
    workflows: HashMap<i32, WorkflowRecord>,
    artifacts: Vec<ArtifactRecord>,
    custom_tags: HashMap<i32, CustomTagRecord>,
    reservations: HashMap<i32, ReservationRecord>,
    steps: Vec<StepRecord>,
    plugins: HashMap<i32, PluginVersionRecord>,
    scripts: Vec<ScriptRecord>,
    snapshots: HashMap<(i32, String), WorkflowRequest>,
    variable_snapshots: Vec<(i32, i32, BTreeMap<String, String>)>,
    attributes: HashMap<String, String>,
    trigger_counters: HashMap<(i32, i32), i64>,
    next_workflow_id: i32,
    next_reservation_id: i32,
}

/// [`Persistence`] backed by process memory.
pub struct InMemoryPersistence {
    store: Mutex<Store>,
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            store: Mutex::new(Store {
                next_workflow_id: 1,
                next_reservation_id: 1,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        // Lock poisoning only happens when a test panicked mid-write.
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a pipeline.
    pub fn insert_pipeline(&self, pipeline: PipelineRecord) {
        self.lock().pipelines.insert(pipeline.id, pipeline);
    }

    /// Seed an application.
    pub fn insert_app(&self, app: AppRecord) {
        self.lock().apps.insert(app.id, app);
    }

    /// Seed an app-level build template.
    pub fn insert_build_template(&self, template: BuildTemplateRecord) {
        self.lock().templates.insert(template.app_id, template);
    }

    /// Seed a pipeline-level build template override.
    pub fn insert_build_template_override(&self, pipeline_id: i32, template: BuildTemplateRecord) {
        self.lock().template_overrides.insert(pipeline_id, template);
    }

    /// Seed an environment.
    pub fn insert_environment(&self, environment: EnvironmentRecord) {
        self.lock().environments.insert(environment.id, environment);
    }

    /// Seed a pipeline material.
    pub fn insert_material(&self, material: MaterialRecord) {
        self.lock().materials.insert(material.id, material);
    }

    /// Seed an artifact.
    pub fn insert_artifact(&self, artifact: ArtifactRecord) {
        self.lock().artifacts.push(artifact);
    }

    /// Seed a custom tag.
    pub fn insert_custom_tag(&self, tag: CustomTagRecord) {
        self.lock().custom_tags.insert(tag.id, tag);
    }

    /// Seed a hook stage step.
    pub fn insert_step(&self, step: StepRecord) {
        self.lock().steps.push(step);
    }

    /// Seed a plugin version.
    pub fn insert_plugin_version(&self, plugin: PluginVersionRecord) {
        self.lock().plugins.insert(plugin.id, plugin);
    }

    /// Seed a legacy script hook.
    pub fn insert_legacy_script(&self, script: ScriptRecord) {
        self.lock().scripts.push(script);
    }

    /// Seed a host attribute.
    pub fn set_attribute(&self, key: &str, value: &str) {
        self.lock()
            .attributes
            .insert(key.to_string(), value.to_string());
    }

    /// All reservations, for assertions.
    pub fn reservations(&self) -> Vec<ReservationRecord> {
        self.lock().reservations.values().cloned().collect()
    }

    /// All variable snapshot audit rows, for assertions.
    pub fn variable_snapshots(&self) -> Vec<(i32, i32, BTreeMap<String, String>)> {
        self.lock().variable_snapshots.clone()
    }

    /// All workflows, for assertions.
    pub fn workflows(&self) -> Vec<WorkflowRecord> {
        let mut rows: Vec<_> = self.lock().workflows.values().cloned().collect();
        rows.sort_by_key(|w| w.id);
        rows
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn find_pipeline(&self, pipeline_id: i32) -> Result<Option<PipelineRecord>> {
        Ok(self
            .lock()
            .pipelines
            .get(&pipeline_id)
            .filter(|p| !p.deleted)
            .cloned())
    }

    async fn find_pipeline_by_material(
        &self,
        material_id: i32,
    ) -> Result<Option<PipelineRecord>> {
        let store = self.lock();
        let Some(material) = store.materials.get(&material_id) else {
            return Ok(None);
        };
        Ok(store
            .pipelines
            .get(&material.pipeline_id)
            .filter(|p| !p.deleted)
            .cloned())
    }

    async fn find_app(&self, app_id: i32) -> Result<Option<AppRecord>> {
        Ok(self.lock().apps.get(&app_id).cloned())
    }

    async fn find_build_template(&self, app_id: i32) -> Result<Option<BuildTemplateRecord>> {
        Ok(self.lock().templates.get(&app_id).cloned())
    }

    async fn find_build_template_override(
        &self,
        pipeline_id: i32,
    ) -> Result<Option<BuildTemplateRecord>> {
        Ok(self.lock().template_overrides.get(&pipeline_id).cloned())
    }

    async fn find_environment(&self, environment_id: i32) -> Result<Option<EnvironmentRecord>> {
        Ok(self.lock().environments.get(&environment_id).cloned())
    }

    async fn find_material(&self, material_id: i32) -> Result<Option<MaterialRecord>> {
        Ok(self.lock().materials.get(&material_id).cloned())
    }

    async fn find_materials_for_pipeline(
        &self,
        pipeline_id: i32,
    ) -> Result<Vec<MaterialRecord>> {
        let mut rows: Vec<_> = self
            .lock()
            .materials
            .values()
            .filter(|m| m.pipeline_id == pipeline_id && m.active)
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.id);
        Ok(rows)
    }

    async fn update_material_head(&self, material_id: i32, commit: &GitCommit) -> Result<()> {
        let mut store = self.lock();
        if let Some(material) = store.materials.get_mut(&material_id) {
            material.last_seen_hash = commit.commit.clone();
            material.last_seen_date = commit.date;
        }
        Ok(())
    }

    async fn find_checkout_path(&self, git_material_id: i32) -> Result<Option<String>> {
        Ok(self
            .lock()
            .materials
            .values()
            .find(|m| m.git_material_id == git_material_id)
            .map(|m| m.checkout_path.clone()))
    }

    async fn save_workflow(&self, workflow: &WorkflowRecord) -> Result<i32> {
        let mut store = self.lock();
        let id = store.next_workflow_id;
        store.next_workflow_id += 1;
        let mut row = workflow.clone();
        row.id = id;
        store.workflows.insert(id, row);
        Ok(id)
    }

    async fn find_workflow(&self, workflow_id: i32) -> Result<Option<WorkflowRecord>> {
        Ok(self.lock().workflows.get(&workflow_id).cloned())
    }

    async fn update_workflow(&self, workflow: &WorkflowRecord) -> Result<()> {
        let mut store = self.lock();
        if !store.workflows.contains_key(&workflow.id) {
            return Err(CoreError::WorkflowNotFound {
                workflow_id: workflow.id,
            });
        }
        store.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn mark_workflow_if_not_terminal(
        &self,
        workflow_id: i32,
        status: WorkflowStatus,
        pod_status: &str,
        message: &str,
    ) -> Result<bool> {
        let mut store = self.lock();
        let Some(row) = store.workflows.get_mut(&workflow_id) else {
            return Err(CoreError::WorkflowNotFound { workflow_id });
        };
        if row.status.is_terminal() {
            return Ok(false);
        }
        row.status = status;
        row.pod_status = pod_status.to_string();
        row.message = message.to_string();
        if status.is_terminal() {
            row.finished_on = Some(Utc::now());
        }
        Ok(true)
    }

    async fn find_last_triggered_workflow(
        &self,
        pipeline_id: i32,
    ) -> Result<Option<WorkflowRecord>> {
        Ok(self
            .lock()
            .workflows
            .values()
            .filter(|w| w.ci_pipeline_id == pipeline_id)
            .max_by_key(|w| (w.started_on, w.id))
            .cloned())
    }

    async fn find_unfinished_workflows(&self, pipeline_id: i32) -> Result<Vec<WorkflowRecord>> {
        let mut rows: Vec<_> = self
            .lock()
            .workflows
            .values()
            .filter(|w| w.ci_pipeline_id == pipeline_id && !w.status.is_terminal())
            .cloned()
            .collect();
        rows.sort_by_key(|w| w.id);
        Ok(rows)
    }

    async fn count_retries(&self, reference_workflow_id: i32) -> Result<u32> {
        Ok(self
            .lock()
            .workflows
            .values()
            .filter(|w| w.reference_ci_workflow_id == reference_workflow_id)
            .count() as u32)
    }

    async fn update_artifact_location(&self, workflow_id: i32, location: &str) -> Result<()> {
        let mut store = self.lock();
        let Some(row) = store.workflows.get_mut(&workflow_id) else {
            return Err(CoreError::WorkflowNotFound { workflow_id });
        };
        row.ci_artifact_location = location.to_string();
        Ok(())
    }

    async fn update_log_location(&self, workflow_id: i32, location: &str) -> Result<()> {
        let mut store = self.lock();
        let Some(row) = store.workflows.get_mut(&workflow_id) else {
            return Err(CoreError::WorkflowNotFound { workflow_id });
        };
        row.log_location = location.to_string();
        Ok(())
    }

    async fn find_artifacts_by_image_paths(&self, paths: &[String]) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .artifacts
            .iter()
            .filter(|a| paths.contains(&a.image))
            .map(|a| a.image.clone())
            .collect())
    }

    async fn artifact_exists_for_image(&self, pipeline_id: i32, image: &str) -> Result<bool> {
        Ok(self
            .lock()
            .artifacts
            .iter()
            .any(|a| a.pipeline_id == pipeline_id && a.image == image))
    }

    async fn artifact_exists_for_digest(
        &self,
        pipeline_id: i32,
        image_digest: &str,
        image: &str,
    ) -> Result<bool> {
        Ok(self.lock().artifacts.iter().any(|a| {
            a.pipeline_id == pipeline_id && a.image_digest == image_digest && a.image == image
        }))
    }

    async fn find_custom_tag(
        &self,
        entity_key: i32,
        entity_value: &str,
    ) -> Result<Option<CustomTagRecord>> {
        Ok(self
            .lock()
            .custom_tags
            .values()
            .find(|t| t.entity_key == entity_key && t.entity_value == entity_value && t.enabled)
            .cloned())
    }

    async fn next_custom_tag_value(&self, custom_tag_id: i32) -> Result<i32> {
        let mut store = self.lock();
        let Some(tag) = store.custom_tags.get_mut(&custom_tag_id) else {
            return Err(CoreError::DatabaseError {
                operation: "next_custom_tag_value".to_string(),
                details: format!("custom tag {} not found", custom_tag_id),
            });
        };
        let value = tag.auto_increasing_number;
        tag.auto_increasing_number += 1;
        Ok(value)
    }

    async fn reserve_image_path(&self, custom_tag_id: i32, image_path: &str) -> Result<i32> {
        let mut store = self.lock();
        if store
            .reservations
            .values()
            .any(|r| r.active && r.image_path == image_path)
        {
            return Err(CoreError::ImagePathInUse {
                image_path: image_path.to_string(),
            });
        }
        let id = store.next_reservation_id;
        store.next_reservation_id += 1;
        store.reservations.insert(
            id,
            ReservationRecord {
                id,
                custom_tag_id,
                image_path: image_path.to_string(),
                active: true,
            },
        );
        Ok(id)
    }

    async fn deactivate_reservations(&self, reservation_ids: &[i32]) -> Result<()> {
        let mut store = self.lock();
        for id in reservation_ids {
            if let Some(reservation) = store.reservations.get_mut(id) {
                reservation.active = false;
            }
        }
        Ok(())
    }

    async fn find_stage_steps(&self, pipeline_id: i32, stage: &str) -> Result<Vec<StepRecord>> {
        let mut rows: Vec<_> = self
            .lock()
            .steps
            .iter()
            .filter(|s| s.pipeline_id == pipeline_id && s.stage == stage && !s.deleted)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.index);
        Ok(rows)
    }

    async fn find_plugin_version(
        &self,
        plugin_version_id: i32,
    ) -> Result<Option<PluginVersionRecord>> {
        Ok(self
            .lock()
            .plugins
            .get(&plugin_version_id)
            .filter(|p| !p.deleted)
            .cloned())
    }

    async fn find_plugin_versions_by_name(
        &self,
        name: &str,
    ) -> Result<Vec<PluginVersionRecord>> {
        let mut rows: Vec<_> = self
            .lock()
            .plugins
            .values()
            .filter(|p| p.name == name && !p.deleted)
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.id);
        Ok(rows)
    }

    async fn find_legacy_scripts(&self, pipeline_id: i32) -> Result<Vec<ScriptRecord>> {
        let mut rows: Vec<_> = self
            .lock()
            .scripts
            .iter()
            .filter(|s| s.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.index);
        Ok(rows)
    }

    async fn save_trigger_snapshot(
        &self,
        workflow_id: i32,
        workflow_type: &str,
        request: &WorkflowRequest,
    ) -> Result<()> {
        self.lock()
            .snapshots
            .insert((workflow_id, workflow_type.to_string()), request.clone());
        Ok(())
    }

    async fn find_trigger_snapshot(
        &self,
        workflow_id: i32,
        workflow_type: &str,
    ) -> Result<Option<WorkflowRequest>> {
        Ok(self
            .lock()
            .snapshots
            .get(&(workflow_id, workflow_type.to_string()))
            .cloned())
    }

    async fn save_variable_snapshot(
        &self,
        workflow_id: i32,
        triggered_by: i32,
        variables: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.lock()
            .variable_snapshots
            .push((workflow_id, triggered_by, variables.clone()));
        Ok(())
    }

    async fn find_attribute(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().attributes.get(key).cloned())
    }

    async fn increment_trigger_counter(&self, app_id: i32, pipeline_id: i32) -> Result<i64> {
        let mut store = self.lock();
        let counter = store
            .trigger_counters
            .entry((app_id, pipeline_id))
            .or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExecutorType;
    use crate::test_support::{sample_pipeline, sample_workflow};

    #[tokio::test]
    async fn test_save_and_find_workflow() {
        let store = InMemoryPersistence::new();
        let id = store.save_workflow(&sample_workflow(0, 7)).await.unwrap();
        assert_eq!(id, 1);

        let row = store.find_workflow(id).await.unwrap().unwrap();
        assert_eq!(row.ci_pipeline_id, 7);
        assert_eq!(row.status, WorkflowStatus::Starting);
        assert_eq!(row.executor_type, ExecutorType::ArgoWorkflow);
    }

    #[tokio::test]
    async fn test_terminal_workflow_is_not_overwritten() {
        let store = InMemoryPersistence::new();
        let id = store.save_workflow(&sample_workflow(0, 7)).await.unwrap();

        let changed = store
            .mark_workflow_if_not_terminal(id, WorkflowStatus::Succeeded, "", "done")
            .await
            .unwrap();
        assert!(changed);

        // A late failure report must not overwrite the completed build.
        let changed = store
            .mark_workflow_if_not_terminal(id, WorkflowStatus::Failed, "Failed", "late report")
            .await
            .unwrap();
        assert!(!changed);

        let row = store.find_workflow(id).await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowStatus::Succeeded);
        assert!(row.finished_on.is_some());
    }

    #[tokio::test]
    async fn test_reserve_image_path_conflict() {
        let store = InMemoryPersistence::new();
        let path = "registry.example.com/team/app:v1";

        let first = store.reserve_image_path(3, path).await.unwrap();
        let err = store.reserve_image_path(3, path).await.unwrap_err();
        assert_eq!(err.error_code(), "IMAGE_PATH_IN_USE");

        // Releasing the reservation frees the path.
        store.deactivate_reservations(&[first]).await.unwrap();
        store.reserve_image_path(3, path).await.unwrap();
    }

    #[tokio::test]
    async fn test_custom_tag_counter_increments() {
        let store = InMemoryPersistence::new();
        store.insert_custom_tag(CustomTagRecord {
            id: 5,
            entity_key: 1,
            entity_value: "7".to_string(),
            tag_pattern: "release-{x}".to_string(),
            auto_increasing_number: 10,
            enabled: true,
        });

        assert_eq!(store.next_custom_tag_value(5).await.unwrap(), 10);
        assert_eq!(store.next_custom_tag_value(5).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_disabled_custom_tag_not_found() {
        let store = InMemoryPersistence::new();
        store.insert_custom_tag(CustomTagRecord {
            id: 5,
            entity_key: 1,
            entity_value: "7".to_string(),
            tag_pattern: "release-{x}".to_string(),
            auto_increasing_number: 0,
            enabled: false,
        });

        assert!(store.find_custom_tag(1, "7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_count_retries() {
        let store = InMemoryPersistence::new();
        let original = store.save_workflow(&sample_workflow(0, 7)).await.unwrap();

        let mut retry = sample_workflow(0, 7);
        retry.reference_ci_workflow_id = original;
        store.save_workflow(&retry).await.unwrap();
        store.save_workflow(&retry).await.unwrap();

        assert_eq!(store.count_retries(original).await.unwrap(), 2);
        assert_eq!(store.count_retries(9999).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deleted_pipeline_hidden() {
        let store = InMemoryPersistence::new();
        let mut pipeline = sample_pipeline(7, 3);
        pipeline.deleted = true;
        store.insert_pipeline(pipeline);

        assert!(store.find_pipeline(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_overwrite() {
        let store = InMemoryPersistence::new();
        let mut request = WorkflowRequest {
            workflow_id: 4,
            docker_image_tag: "one".to_string(),
            ..Default::default()
        };
        store
            .save_trigger_snapshot(4, "CI", &request)
            .await
            .unwrap();

        request.docker_image_tag = "two".to_string();
        store
            .save_trigger_snapshot(4, "CI", &request)
            .await
            .unwrap();

        let saved = store.find_trigger_snapshot(4, "CI").await.unwrap().unwrap();
        assert_eq!(saved.docker_image_tag, "two");
        assert!(store.find_trigger_snapshot(4, "JOB").await.unwrap().is_none());
    }
}
