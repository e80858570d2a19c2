// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger orchestration.
//!
//! The trigger flow: resolve materials, persist a `Starting` workflow,
//! compose the submission, snapshot it, abort superseded builds, submit,
//! and finish the audit trail in the background. Failures after the row
//! exists mark it instead of leaving it dangling in `Starting`.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::executor::WorkflowExecutor;
use crate::material::{MaterialResolver, ResolvedMaterials};
use crate::cancel::CancelService;
use crate::model::{
    SYSTEM_USER_ID, TriggerRequest, WORKFLOW_TYPE_CI, WebhookEvent, WorkflowRequest,
    WorkflowStatus,
};
use crate::persistence::{AppRecord, Persistence, PipelineRecord, WorkflowRecord};
use crate::request::{RequestBuilder, default_log_key};
use crate::tasks::BackgroundTasks;

/// How long after start a running build is considered past the point where
/// aborting it is cheaper than letting it finish.
const CRITICAL_PHASE_SECONDS: i64 = 120;

/// Message recorded when a custom tag or copy destination is already taken.
const IMAGE_TAG_UNAVAILABLE_MESSAGE: &str = "image tag unavailable";

/// Orchestrates build triggers end to end.
pub struct TriggerService {
    persistence: Arc<dyn Persistence>,
    materials: Arc<MaterialResolver>,
    requests: Arc<RequestBuilder>,
    cancel: Arc<CancelService>,
    executor: Arc<dyn WorkflowExecutor>,
    tasks: BackgroundTasks,
    config: Config,
}

impl TriggerService {
    /// Create the service.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        materials: Arc<MaterialResolver>,
        requests: Arc<RequestBuilder>,
        cancel: Arc<CancelService>,
        executor: Arc<dyn WorkflowExecutor>,
        tasks: BackgroundTasks,
        config: Config,
    ) -> Self {
        Self {
            persistence,
            materials,
            requests,
            cancel,
            executor,
            tasks,
            config,
        }
    }

    /// Trigger a build manually.
    #[instrument(skip(self, request), fields(pipeline_id = request.pipeline_id))]
    pub async fn trigger(&self, request: TriggerRequest) -> Result<i32> {
        let (pipeline, app) = self.load_pipeline(request.pipeline_id).await?;
        let resolved = self
            .materials
            .resolve(pipeline.id, &request.materials)
            .await?;
        self.materials
            .validate_sequence(pipeline.id, &resolved.materials, &resolved.commits)
            .await?;
        self.run(&pipeline, &app, resolved, request).await
    }

    /// Trigger a build from a webhook-delivered commit.
    ///
    /// Manual pipelines and pipeline types that never build from webhooks are
    /// skipped, not errors: the sensor broadcasts to every pipeline material.
    #[instrument(skip(self, event), fields(material_id = event.pipeline_material_id))]
    pub async fn trigger_from_webhook(&self, event: WebhookEvent) -> Result<Option<i32>> {
        let Some(pipeline) = self
            .persistence
            .find_pipeline_by_material(event.pipeline_material_id)
            .await?
        else {
            debug!("no pipeline bound to material, skipping");
            return Ok(None);
        };
        if pipeline.is_manual {
            debug!(pipeline_id = pipeline.id, "manual pipeline, skipping webhook");
            return Ok(None);
        }
        if !pipeline.pipeline_type.accepts_webhook_triggers() {
            debug!(
                pipeline_id = pipeline.id,
                pipeline_type = ?pipeline.pipeline_type,
                "pipeline type never builds from webhooks, skipping"
            );
            return Ok(None);
        }

        let app = self.load_app(&pipeline).await?;
        let resolved = self
            .materials
            .resolve_for_webhook(pipeline.id, event.pipeline_material_id, &event.git_commit)
            .await?;
        self.materials
            .validate_sequence(pipeline.id, &resolved.materials, &resolved.commits)
            .await?;

        let request = TriggerRequest {
            pipeline_id: pipeline.id,
            materials: Vec::new(),
            triggered_by: SYSTEM_USER_ID,
            trigger_author: event.git_commit.author.clone(),
            invalidate_cache: false,
            environment_id: 0,
            runtime_params: Default::default(),
        };
        let workflow_id = self.run(&pipeline, &app, resolved, request).await?;
        Ok(Some(workflow_id))
    }

    async fn load_pipeline(&self, pipeline_id: i32) -> Result<(PipelineRecord, AppRecord)> {
        let pipeline = self
            .persistence
            .find_pipeline(pipeline_id)
            .await?
            .ok_or(CoreError::PipelineNotFound { pipeline_id })?;
        let app = self.load_app(&pipeline).await?;
        Ok((pipeline, app))
    }

    async fn load_app(&self, pipeline: &PipelineRecord) -> Result<AppRecord> {
        self.persistence
            .find_app(pipeline.app_id)
            .await?
            .ok_or(CoreError::ValidationError {
                field: "appId".to_string(),
                message: format!("app {} not found", pipeline.app_id),
            })
    }

    /// Steps 2 through 9 of the trigger flow, shared with the webhook path.
    async fn run(
        &self,
        pipeline: &PipelineRecord,
        app: &AppRecord,
        resolved: ResolvedMaterials,
        request: TriggerRequest,
    ) -> Result<i32> {
        let mut workflow = WorkflowRecord {
            id: 0,
            name: format!("{}-{}", pipeline.name, pipeline.id),
            ci_pipeline_id: pipeline.id,
            status: WorkflowStatus::Starting,
            pod_status: String::new(),
            message: String::new(),
            started_on: Utc::now(),
            finished_on: None,
            namespace: self.config.default_namespace.clone(),
            log_location: String::new(),
            triggered_by: request.triggered_by,
            executor_type: self.config.workflow_executor,
            pod_name: String::new(),
            ci_build_type: Default::default(),
            environment_id: request.environment_id,
            reference_ci_workflow_id: 0,
            git_triggers: resolved.commits.clone(),
            image_path_reservation_ids: Vec::new(),
            blob_storage_enabled: self.config.blob.is_some(),
            ci_artifact_location: String::new(),
        };
        workflow.id = self.persistence.save_workflow(&workflow).await?;

        let built = match self
            .requests
            .build(pipeline, app, &workflow, &resolved, &request)
            .await
        {
            Ok(built) => built,
            Err(err) => {
                self.mark_failed_build(&workflow, &err).await;
                return Err(err);
            }
        };

        workflow.namespace = built.request.namespace.clone();
        workflow.image_path_reservation_ids = built.reservation_ids.clone();
        workflow.ci_artifact_location = built.request.ci_artifact_location.clone();
        workflow.log_location = default_log_key(
            &self.config.default_log_key_prefix,
            &built.request.workflow_name_prefix,
        );
        if let Some(build_config) = &built.request.ci_build_config {
            workflow.ci_build_type = build_config.ci_build_type;
        }
        if let Err(err) = self.submit_prepared(pipeline, &workflow, &built.request).await {
            self.release_reservations(&built.reservation_ids).await;
            self.mark_failed_build(&workflow, &err).await;
            return Err(err);
        }

        self.finish_async(app.id, pipeline.id, &workflow, built.resolved_variables);
        info!(workflow_id = workflow.id, pipeline_id = pipeline.id, "build triggered");
        Ok(workflow.id)
    }

    /// Persist the prepared workflow and hand it to the executor.
    async fn submit_prepared(
        &self,
        pipeline: &PipelineRecord,
        workflow: &WorkflowRecord,
        request: &WorkflowRequest,
    ) -> Result<()> {
        self.persistence.update_workflow(workflow).await?;

        self.persistence
            .save_trigger_snapshot(workflow.id, WORKFLOW_TYPE_CI, request)
            .await?;

        if pipeline.auto_abort_previous_builds {
            self.abort_superseded(pipeline.id, workflow.id).await?;
        }

        self.executor
            .submit(request)
            .await
            .map_err(|err| CoreError::ExecutorError {
                details: err.to_string(),
            })
    }

    /// Free claimed image paths when a trigger dies after reserving them.
    async fn release_reservations(&self, reservation_ids: &[i32]) {
        if reservation_ids.is_empty() {
            return;
        }
        if let Err(err) = self
            .persistence
            .deactivate_reservations(reservation_ids)
            .await
        {
            warn!(error = %err, "failed to release image path reservations");
        }
    }

    /// Mark a workflow that never made it to the executor.
    ///
    /// Job validation failures become `Aborted`, everything else `Failed`. A
    /// taken image path is recorded under a stable operator-facing message.
    async fn mark_failed_build(&self, workflow: &WorkflowRecord, err: &CoreError) {
        let (status, message) = match err {
            CoreError::ArtifactRejected { .. } => (WorkflowStatus::Aborted, err.to_string()),
            CoreError::ImagePathInUse { .. } => (
                WorkflowStatus::Failed,
                IMAGE_TAG_UNAVAILABLE_MESSAGE.to_string(),
            ),
            _ => (WorkflowStatus::Failed, err.to_string()),
        };
        if let Err(mark_err) = self
            .persistence
            .mark_workflow_if_not_terminal(workflow.id, status, &workflow.pod_status, &message)
            .await
        {
            warn!(
                workflow_id = workflow.id,
                error = %mark_err,
                "failed to mark broken trigger"
            );
        }
    }

    /// Cancel Starting and early-Running builds this trigger supersedes.
    ///
    /// A Running build past [`CRITICAL_PHASE_SECONDS`] is about to push; the
    /// image and its side effects are worth keeping, so it is left alone.
    async fn abort_superseded(&self, pipeline_id: i32, new_workflow_id: i32) -> Result<()> {
        let unfinished = self.persistence.find_unfinished_workflows(pipeline_id).await?;
        let now = Utc::now();
        for workflow in unfinished {
            if workflow.id == new_workflow_id {
                continue;
            }
            let critical = workflow.status == WorkflowStatus::Running
                && now - workflow.started_on >= Duration::seconds(CRITICAL_PHASE_SECONDS);
            if critical {
                debug!(workflow_id = workflow.id, "in critical phase, not aborting");
                continue;
            }
            if let Err(err) = self.cancel.cancel(workflow.id, false).await {
                warn!(
                    workflow_id = workflow.id,
                    error = %err,
                    "failed to abort superseded build"
                );
            }
        }
        Ok(())
    }

    /// Audit bookkeeping that must not delay the trigger response.
    fn finish_async(
        &self,
        app_id: i32,
        pipeline_id: i32,
        workflow: &WorkflowRecord,
        variables: std::collections::BTreeMap<String, String>,
    ) {
        let persistence = self.persistence.clone();
        let workflow_id = workflow.id;
        let triggered_by = workflow.triggered_by;
        self.tasks.spawn("variable-snapshot", async move {
            if !variables.is_empty() {
                persistence
                    .save_variable_snapshot(workflow_id, triggered_by, &variables)
                    .await?;
            }
            Ok(())
        });

        let persistence = self.persistence.clone();
        self.tasks.spawn("trigger-counter", async move {
            persistence
                .increment_trigger_counter(app_id, pipeline_id)
                .await?;
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterGateway;
    use crate::executor::MockExecutor;
    use crate::image_tag::CustomTagService;
    use crate::model::{PipelineType, RegistryCredentials, RegistryType, TriggerMaterial};
    use crate::persistence::memory::InMemoryPersistence;
    use crate::registry::{MockRegistryClient, RegistryAccount};
    use crate::sensor::MockGitSensor;
    use crate::steps::StepAssembler;
    use crate::test_support::{
        sample_app, sample_commit, sample_material, sample_pipeline, sample_template,
    };

    struct Harness {
        persistence: Arc<InMemoryPersistence>,
        sensor: Arc<MockGitSensor>,
        executor: Arc<MockExecutor>,
        service: TriggerService,
    }

    fn harness_with(executor: MockExecutor) -> Harness {
        let persistence = Arc::new(InMemoryPersistence::new());
        let sensor = Arc::new(MockGitSensor::new());
        let executor = Arc::new(executor);
        let config = Config::default();

        let registry = Arc::new(MockRegistryClient::new().with_account(RegistryAccount {
            id: "default-registry".to_string(),
            registry_type: RegistryType::DockerHub,
            registry_url: "registry.local".to_string(),
            credentials: RegistryCredentials::default(),
        }));
        let custom_tags = Arc::new(CustomTagService::new(persistence.clone()));
        let steps = Arc::new(StepAssembler::new(
            persistence.clone(),
            registry.clone(),
            custom_tags.clone(),
        ));
        let requests = Arc::new(RequestBuilder::new(
            persistence.clone(),
            registry,
            custom_tags.clone(),
            steps,
            config.clone(),
        ));
        let materials = Arc::new(MaterialResolver::new(persistence.clone(), sensor.clone()));
        let cancel = Arc::new(CancelService::new(
            persistence.clone(),
            executor.clone(),
            Arc::new(MockClusterGateway::new()),
            custom_tags,
            config.clone(),
        ));
        let service = TriggerService::new(
            persistence.clone(),
            materials,
            requests,
            cancel,
            executor.clone(),
            BackgroundTasks::new(4),
            config,
        );
        Harness {
            persistence,
            sensor,
            executor,
            service,
        }
    }

    fn harness() -> Harness {
        harness_with(MockExecutor::new())
    }

    fn seed_pipeline(h: &Harness) {
        h.persistence.insert_pipeline(sample_pipeline(7, 3));
        h.persistence.insert_app(sample_app(3));
        h.persistence.insert_build_template(sample_template(3, 101));
        h.persistence.insert_material(sample_material(1, 7));
        h.sensor.set_commit(1, sample_commit());
    }

    fn manual_request() -> TriggerRequest {
        TriggerRequest {
            pipeline_id: 7,
            materials: vec![TriggerMaterial {
                material_id: 1,
                commit_hash: sample_commit().commit,
                webhook_data_id: 0,
            }],
            triggered_by: 2,
            trigger_author: "dev@example.com".to_string(),
            invalidate_cache: false,
            environment_id: 0,
            runtime_params: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_manual_trigger_submits_and_snapshots() {
        let h = harness();
        seed_pipeline(&h);

        let workflow_id = h.service.trigger(manual_request()).await.unwrap();

        assert_eq!(h.executor.submissions().len(), 1);
        let stored = h
            .persistence
            .find_workflow(workflow_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, WorkflowStatus::Starting);
        assert_eq!(stored.git_triggers.len(), 1);

        let snapshot = h
            .persistence
            .find_trigger_snapshot(workflow_id, WORKFLOW_TYPE_CI)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.workflow_id, workflow_id);
        assert_eq!(snapshot.workflow_type, WORKFLOW_TYPE_CI);
    }

    #[tokio::test]
    async fn test_trigger_unknown_pipeline() {
        let h = harness();
        let err = h.service.trigger(manual_request()).await.unwrap_err();
        assert_eq!(err.error_code(), "PIPELINE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_submit_failure_marks_workflow_failed() {
        let h = harness_with(MockExecutor::failing_submit());
        seed_pipeline(&h);

        let err = h.service.trigger(manual_request()).await.unwrap_err();
        assert_eq!(err.error_code(), "EXECUTOR_ERROR");

        let workflows = h.persistence.workflows();
        assert_eq!(workflows.len(), 1);
        assert_eq!(workflows[0].status, WorkflowStatus::Failed);
        assert!(workflows[0].message.contains("submit"));
    }

    #[tokio::test]
    async fn test_submit_failure_releases_reservations() {
        let h = harness_with(MockExecutor::failing_submit());
        seed_pipeline(&h);
        h.persistence.insert_custom_tag(crate::persistence::CustomTagRecord {
            id: 1,
            entity_key: crate::image_tag::ENTITY_CI_PIPELINE,
            entity_value: "7".to_string(),
            tag_pattern: "v{x}".to_string(),
            auto_increasing_number: 0,
            enabled: true,
        });

        h.service.trigger(manual_request()).await.unwrap_err();

        let reservations = h.persistence.reservations();
        assert!(!reservations.is_empty());
        assert!(reservations.iter().all(|r| !r.active));
    }

    #[tokio::test]
    async fn test_tag_collision_marks_image_tag_unavailable() {
        let h = harness();
        seed_pipeline(&h);
        h.persistence.insert_custom_tag(crate::persistence::CustomTagRecord {
            id: 1,
            entity_key: crate::image_tag::ENTITY_CI_PIPELINE,
            entity_value: "7".to_string(),
            tag_pattern: "v{x}".to_string(),
            auto_increasing_number: 3,
            enabled: true,
        });
        // The path the next counter value produces is already claimed.
        h.persistence
            .reserve_image_path(1, "registry.local/team/orders:v3")
            .await
            .unwrap();

        let err = h.service.trigger(manual_request()).await.unwrap_err();
        assert_eq!(err.error_code(), "IMAGE_PATH_IN_USE");

        let workflows = h.persistence.workflows();
        assert_eq!(workflows[0].status, WorkflowStatus::Failed);
        assert_eq!(workflows[0].message, IMAGE_TAG_UNAVAILABLE_MESSAGE);
    }

    #[tokio::test]
    async fn test_auto_abort_supersedes_starting_builds() {
        let h = harness();
        seed_pipeline(&h);
        let mut pipeline = sample_pipeline(7, 3);
        pipeline.auto_abort_previous_builds = true;
        h.persistence.insert_pipeline(pipeline);

        // An in-flight build from a previous trigger.
        let mut previous = crate::test_support::sample_workflow(0, 7);
        previous.status = WorkflowStatus::Starting;
        let previous_id = h.persistence.save_workflow(&previous).await.unwrap();

        let new_id = h.service.trigger(manual_request()).await.unwrap();
        assert_ne!(new_id, previous_id);

        let stored = h
            .persistence
            .find_workflow(previous_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, WorkflowStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_auto_abort_spares_critical_phase_builds() {
        let h = harness();
        seed_pipeline(&h);
        let mut pipeline = sample_pipeline(7, 3);
        pipeline.auto_abort_previous_builds = true;
        h.persistence.insert_pipeline(pipeline);

        let mut running = crate::test_support::sample_workflow(0, 7);
        running.status = WorkflowStatus::Running;
        running.started_on = Utc::now() - Duration::seconds(CRITICAL_PHASE_SECONDS + 30);
        let running_id = h.persistence.save_workflow(&running).await.unwrap();

        h.service.trigger(manual_request()).await.unwrap();

        let stored = h
            .persistence
            .find_workflow(running_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn test_webhook_trigger_builds() {
        let h = harness();
        seed_pipeline(&h);

        let workflow_id = h
            .service
            .trigger_from_webhook(WebhookEvent {
                pipeline_material_id: 1,
                git_commit: sample_commit(),
            })
            .await
            .unwrap();

        let workflow_id = workflow_id.expect("webhook should trigger");
        let stored = h
            .persistence
            .find_workflow(workflow_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.triggered_by, SYSTEM_USER_ID);
        assert_eq!(h.executor.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_skips_manual_pipeline() {
        let h = harness();
        seed_pipeline(&h);
        let mut pipeline = sample_pipeline(7, 3);
        pipeline.is_manual = true;
        h.persistence.insert_pipeline(pipeline);

        let result = h
            .service
            .trigger_from_webhook(WebhookEvent {
                pipeline_material_id: 1,
                git_commit: sample_commit(),
            })
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(h.executor.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_webhook_skips_linked_pipeline() {
        let h = harness();
        seed_pipeline(&h);
        let mut pipeline = sample_pipeline(7, 3);
        pipeline.pipeline_type = PipelineType::Linked;
        h.persistence.insert_pipeline(pipeline);

        let result = h
            .service
            .trigger_from_webhook(WebhookEvent {
                pipeline_material_id: 1,
                git_commit: sample_commit(),
            })
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_stale_commit_rejected() {
        let h = harness();
        seed_pipeline(&h);

        let mut in_flight = crate::test_support::sample_workflow(0, 7);
        in_flight.status = WorkflowStatus::Running;
        in_flight.git_triggers.insert(1, sample_commit());
        h.persistence.save_workflow(&in_flight).await.unwrap();

        let mut older = sample_commit();
        older.date = older.date.map(|d| d - Duration::hours(3));
        h.sensor.set_commit(1, older);

        let err = h.service.trigger(manual_request()).await.unwrap_err();
        assert_eq!(err.http_status(), 412);
    }
}
