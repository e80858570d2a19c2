// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Snapshot replay for builds lost to infrastructure.
//!
//! When the executor reports a failed pod that the build itself did not
//! cause, the stored submission is replayed as a new workflow descending
//! from the original. The retry budget is counted against the chain's
//! reference workflow so a flapping node cannot retrigger forever.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::executor::{WorkflowExecutor, retrigger_required};
use crate::model::{SYSTEM_USER_ID, WORKFLOW_TYPE_CI, WorkflowRequest, WorkflowStatus};
use crate::persistence::Persistence;
use crate::request::{default_artifact_key, default_log_key};
use crate::tasks::BackgroundTasks;

/// A status report from the executor about one workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusEvent {
    /// Workflow object name, `{workflowId}-{workflowName}`.
    pub workflow_name: String,
    /// Reported pod status.
    pub pod_status: String,
    /// Reported detail message.
    pub message: String,
}

/// Parse the workflow row ID off a workflow object name.
pub fn parse_workflow_id(workflow_name: &str) -> Result<i32> {
    workflow_name
        .split('-')
        .next()
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| CoreError::ValidationError {
            field: "workflowName".to_string(),
            message: format!("'{}' does not start with a workflow id", workflow_name),
        })
}

/// Replays lost builds from their stored submission.
pub struct RetriggerService {
    persistence: Arc<dyn Persistence>,
    executor: Arc<dyn WorkflowExecutor>,
    tasks: BackgroundTasks,
    config: Config,
}

impl RetriggerService {
    /// Create the service.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        executor: Arc<dyn WorkflowExecutor>,
        tasks: BackgroundTasks,
        config: Config,
    ) -> Self {
        Self {
            persistence,
            executor,
            tasks,
            config,
        }
    }

    /// Decide on a status report; replay the build when warranted.
    ///
    /// Returns the new workflow ID when a replay was submitted, `None` when
    /// the report needs no action.
    #[instrument(skip(self, event), fields(workflow = %event.workflow_name))]
    pub async fn maybe_retrigger(&self, event: &StatusEvent) -> Result<Option<i32>> {
        if self.config.max_workflow_retries == 0 {
            return Ok(None);
        }

        let workflow_id = parse_workflow_id(&event.workflow_name)?;
        let workflow = self
            .persistence
            .find_workflow(workflow_id)
            .await?
            .ok_or(CoreError::WorkflowNotFound { workflow_id })?;
        if !retrigger_required(&event.pod_status, &event.message, workflow.status) {
            return Ok(None);
        }

        // Retries chain back to the first workflow of the series.
        let reference_id = if workflow.reference_ci_workflow_id != 0 {
            workflow.reference_ci_workflow_id
        } else {
            workflow.id
        };
        let retries = self.persistence.count_retries(reference_id).await?;
        if retries >= self.config.max_workflow_retries {
            warn!(
                reference_id,
                retries, "retry budget exhausted, not replaying"
            );
            return Ok(None);
        }

        let reference = self
            .persistence
            .find_workflow(reference_id)
            .await?
            .ok_or(CoreError::WorkflowNotFound {
                workflow_id: reference_id,
            })?;
        let snapshot = self
            .persistence
            .find_trigger_snapshot(reference_id, WORKFLOW_TYPE_CI)
            .await?
            .ok_or_else(|| CoreError::ValidationError {
                field: "workflowId".to_string(),
                message: format!("no submission snapshot stored for workflow {}", reference_id),
            })?;

        let mut replay = reference.clone();
        replay.id = 0;
        replay.status = WorkflowStatus::Starting;
        replay.pod_status = String::new();
        replay.message = String::new();
        replay.pod_name = String::new();
        replay.started_on = Utc::now();
        replay.finished_on = None;
        replay.triggered_by = SYSTEM_USER_ID;
        replay.reference_ci_workflow_id = reference_id;
        replay.image_path_reservation_ids = Vec::new();

        let mut request = snapshot;
        replay.id = self.persistence.save_workflow(&replay).await?;
        self.rewrite_snapshot(&mut request, replay.id, &reference.name);
        replay.log_location = default_log_key(
            &self.config.default_log_key_prefix,
            &request.workflow_name_prefix,
        );
        replay.ci_artifact_location = request.ci_artifact_location.clone();
        self.persistence.update_workflow(&replay).await?;
        self.persistence
            .save_trigger_snapshot(replay.id, WORKFLOW_TYPE_CI, &request)
            .await?;

        if let Err(err) = self.executor.submit(&request).await {
            let err = CoreError::ExecutorError {
                details: err.to_string(),
            };
            if let Err(mark_err) = self
                .persistence
                .mark_workflow_if_not_terminal(
                    replay.id,
                    WorkflowStatus::Failed,
                    "",
                    &err.to_string(),
                )
                .await
            {
                warn!(workflow_id = replay.id, error = %mark_err, "failed to mark replay");
            }
            return Err(err);
        }

        // Resolved runtime values already live in the snapshot's steps, so
        // the audit entry is rebuilt from them instead of a fresh resolution.
        let variables = runtime_variables(&request);
        let persistence = self.persistence.clone();
        let replay_id = replay.id;
        self.tasks.spawn("variable-snapshot", async move {
            if !variables.is_empty() {
                persistence
                    .save_variable_snapshot(replay_id, SYSTEM_USER_ID, &variables)
                    .await?;
            }
            Ok(())
        });

        info!(
            workflow_id = replay.id,
            reference_id, "lost build replayed from snapshot"
        );
        Ok(Some(replay.id))
    }

    fn rewrite_snapshot(&self, request: &mut WorkflowRequest, new_id: i32, reference_name: &str) {
        let chain_root = request.reference_ci_workflow_id;
        request.workflow_id = new_id;
        request.workflow_name_prefix = format!("{}-{}", new_id, reference_name);
        request.triggered_by = SYSTEM_USER_ID;
        request.is_re_trigger = true;
        request.reference_ci_workflow_id = chain_root;

        if request.blob_storage_configured {
            let key = default_artifact_key(&self.config.default_artifact_key_prefix, new_id);
            request.ci_artifact_file_name = format!("{}.zip", new_id);
            request.ci_artifact_location = if request.cloud_provider == "S3" {
                format!("s3://{}/{}", request.ci_artifact_bucket, key)
            } else {
                key
            };
        }
    }
}

/// Runtime variable values carried in a snapshot's steps.
fn runtime_variables(request: &WorkflowRequest) -> BTreeMap<String, String> {
    let mut variables = BTreeMap::new();
    for step in request.pre_ci_steps.iter().chain(&request.post_ci_steps) {
        for var in &step.input_vars {
            if var.value_type == "RUNTIME" {
                variables.insert(var.name.clone(), var.value.clone());
            }
        }
    }
    variables
}
