// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Build cancellation.
//!
//! Cancellation terminates the workflow object at the executor, marks the
//! row, and releases every image path reservation the build held. Force
//! abort additionally sweeps leftover workflow objects when the primary
//! terminate path no longer finds the workflow.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::cluster::{ClusterConfig, ClusterGateway};
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::executor::{ExecutorError, TerminationRequest, WorkflowExecutor};
use crate::image_tag::CustomTagService;
use crate::model::{
    ExecutorType, FORCE_ABORT_MESSAGE, POD_STATUS_FAILED, TERMINATED_MESSAGE, WorkflowStatus,
};
use crate::persistence::{Persistence, WorkflowRecord};

/// Cancels in-flight builds.
pub struct CancelService {
    persistence: Arc<dyn Persistence>,
    executor: Arc<dyn WorkflowExecutor>,
    cluster: Arc<dyn ClusterGateway>,
    custom_tags: Arc<CustomTagService>,
    config: Config,
}

impl CancelService {
    /// Create the service.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        executor: Arc<dyn WorkflowExecutor>,
        cluster: Arc<dyn ClusterGateway>,
        custom_tags: Arc<CustomTagService>,
        config: Config,
    ) -> Self {
        Self {
            persistence,
            executor,
            cluster,
            custom_tags,
            config,
        }
    }

    /// Cancel a workflow.
    ///
    /// The normal path requires the executor to still know the workflow; a
    /// missing workflow is a caller error. With `force_abort`, executor
    /// failures are swallowed, dangling workflow objects are swept, and the
    /// row is marked regardless. Cancelling an already terminal workflow
    /// touches nothing and returns the id unchanged.
    #[instrument(skip(self), fields(workflow_id = workflow_id))]
    pub async fn cancel(&self, workflow_id: i32, force_abort: bool) -> Result<i32> {
        let workflow = self
            .persistence
            .find_workflow(workflow_id)
            .await?
            .ok_or(CoreError::WorkflowNotFound { workflow_id })?;
        if workflow.status.is_terminal() {
            info!(
                workflow_id = workflow.id,
                status = ?workflow.status,
                "workflow already terminal, cancel is a no-op"
            );
            return Ok(workflow.id);
        }

        let termination = TerminationRequest {
            workflow_name: format!("{}-{}", workflow.id, workflow.name),
            namespace: workflow.namespace.clone(),
            executor_type: workflow.executor_type,
            cluster: self.execution_cluster(&workflow).await?,
        };

        match self.executor.terminate(&termination).await {
            Ok(()) => {}
            Err(err) if force_abort => {
                warn!(error = %err, "terminate failed, sweeping dangling workflow objects");
                if let Err(err) = self.executor.terminate_dangling(&termination).await {
                    warn!(error = %err, "dangling sweep failed");
                }
            }
            Err(ExecutorError::WorkflowNotFound(name)) => {
                return Err(CoreError::ValidationError {
                    field: "workflowId".to_string(),
                    message: format!("cannot find workflow {}", name),
                });
            }
            Err(err) => {
                return Err(CoreError::ExecutorError {
                    details: err.to_string(),
                });
            }
        }

        let (pod_status, message) = if force_abort {
            (POD_STATUS_FAILED, FORCE_ABORT_MESSAGE)
        } else if workflow.executor_type == ExecutorType::System {
            (POD_STATUS_FAILED, TERMINATED_MESSAGE)
        } else {
            (workflow.pod_status.as_str(), "")
        };
        let changed = self
            .persistence
            .mark_workflow_if_not_terminal(workflow.id, WorkflowStatus::Cancelled, pod_status, message)
            .await?;
        if !changed {
            return Err(CoreError::ValidationError {
                field: "workflowId".to_string(),
                message: format!("workflow {} is not in progress", workflow_id),
            });
        }

        self.custom_tags
            .release(&workflow.image_path_reservation_ids)
            .await?;
        info!(workflow_id = workflow.id, force_abort, "workflow cancelled");
        Ok(workflow.id)
    }

    /// Resolve the cluster a workflow runs in, `None` for the local cluster.
    async fn execution_cluster(
        &self,
        workflow: &WorkflowRecord,
    ) -> Result<Option<ClusterConfig>> {
        if workflow.namespace == self.config.default_namespace || workflow.environment_id == 0 {
            return Ok(None);
        }
        let Some(environment) = self
            .persistence
            .find_environment(workflow.environment_id)
            .await?
        else {
            return Ok(None);
        };
        let cluster = self
            .cluster
            .cluster_config(environment.cluster_id)
            .await
            .map_err(|e| CoreError::ExecutorError {
                details: e.to_string(),
            })?;
        Ok(cluster.is_external().then_some(cluster))
    }
}
