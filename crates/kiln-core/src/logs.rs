// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Build log and artifact retrieval.
//!
//! Live logs come from the executor's pod tail. Once a build is finished,
//! or its pod is gone, the uploaded blob is served instead. Builds that ran
//! in external clusters read the blob with credentials stored inside that
//! cluster, next to the build itself.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument, warn};

use crate::blob::{BlobError, BlobRequest, BlobStorage};
use crate::cluster::{ClusterConfig, ClusterGateway};
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::executor::{LogRequest, LogStream, WorkflowExecutor};
use crate::model::POD_STATUS_PENDING;
use crate::persistence::{Persistence, WorkflowRecord};
use crate::request::{default_artifact_key, default_log_key};

/// A downloadable build artifact archive.
#[derive(Debug)]
pub struct ArtifactDownload {
    /// Archive content.
    pub content: Bytes,
    /// File name to serve the archive under.
    pub file_name: String,
}

/// Whether a stored location is usable as a bucket key.
fn is_valid_key(location: &str) -> bool {
    !location.is_empty()
        && !location.contains("..")
        && !location.contains("//")
        && !location.chars().any(char::is_whitespace)
}

/// Serves build logs and artifacts.
pub struct LogService {
    persistence: Arc<dyn Persistence>,
    executor: Arc<dyn WorkflowExecutor>,
    blob: Arc<dyn BlobStorage>,
    cluster: Arc<dyn ClusterGateway>,
    config: Config,
}

impl LogService {
    /// Create the service.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        executor: Arc<dyn WorkflowExecutor>,
        blob: Arc<dyn BlobStorage>,
        cluster: Arc<dyn ClusterGateway>,
        config: Config,
    ) -> Self {
        Self {
            persistence,
            executor,
            blob,
            cluster,
            config,
        }
    }

    /// Stream the logs of a workflow, live while it runs, from blob storage
    /// once it is finished.
    #[instrument(skip(self), fields(workflow_id = workflow_id))]
    pub async fn stream_logs(&self, workflow_id: i32, follow: bool) -> Result<LogStream> {
        let workflow = self
            .persistence
            .find_workflow(workflow_id)
            .await?
            .ok_or(CoreError::WorkflowNotFound { workflow_id })?;

        // Nothing to tail yet.
        if workflow.pod_status == POD_STATUS_PENDING {
            return Ok(Box::pin(futures::stream::empty()));
        }

        let request = LogRequest {
            workflow_name: format!("{}-{}", workflow.id, workflow.name),
            pod_name: workflow.pod_name.clone(),
            namespace: workflow.namespace.clone(),
            follow,
            cluster: self.execution_cluster(&workflow).await?,
        };
        match self.executor.stream_logs(&request).await {
            Ok(stream) => Ok(stream),
            Err(err) if workflow.status.is_terminal() => {
                debug!(error = %err, "live tail gone, serving stored log");
                self.historic_logs(&workflow).await
            }
            Err(_) if !workflow.blob_storage_enabled => {
                Err(CoreError::LogsNotStored { workflow_id })
            }
            Err(err) => Err(CoreError::ExecutorError {
                details: err.to_string(),
            }),
        }
    }

    /// Serve a finished build's log from blob storage.
    async fn historic_logs(&self, workflow: &WorkflowRecord) -> Result<LogStream> {
        if !workflow.blob_storage_enabled {
            return Err(CoreError::LogsNotStored {
                workflow_id: workflow.id,
            });
        }
        let key = if workflow.log_location.is_empty() {
            // Rows predating log location persistence get the computed key
            // written back so the next read skips this branch.
            let key = default_log_key(
                &self.config.default_log_key_prefix,
                &format!("{}-{}", workflow.id, workflow.name),
            );
            if let Err(err) = self
                .persistence
                .update_log_location(workflow.id, &key)
                .await
            {
                warn!(error = %err, "failed to backfill log location");
            }
            key
        } else {
            workflow.log_location.clone()
        };

        let request = match self.external_blob_request(workflow, &key).await? {
            Some(request) => request,
            None => {
                let blob = self.config.blob.as_ref().ok_or(CoreError::LogsNotStored {
                    workflow_id: workflow.id,
                })?;
                BlobRequest::logs(blob, &key)
            }
        };
        let content = self.fetch_blob(&request, workflow.id).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(content) })))
    }

    /// Download a workflow's artifact archive.
    #[instrument(skip(self), fields(workflow_id = workflow_id))]
    pub async fn download_artifact(
        &self,
        pipeline_id: i32,
        workflow_id: i32,
    ) -> Result<ArtifactDownload> {
        let workflow = self
            .persistence
            .find_workflow(workflow_id)
            .await?
            .ok_or(CoreError::WorkflowNotFound { workflow_id })?;
        if workflow.ci_pipeline_id != pipeline_id {
            return Err(CoreError::ValidationError {
                field: "workflowId".to_string(),
                message: format!(
                    "workflow {} does not belong to pipeline {}",
                    workflow_id, pipeline_id
                ),
            });
        }
        if !workflow.blob_storage_enabled {
            return Err(CoreError::ValidationError {
                field: "blobStorage".to_string(),
                message: "blob storage is not configured for this workflow".to_string(),
            });
        }
        let blob = self
            .config
            .blob
            .as_ref()
            .ok_or_else(|| CoreError::ValidationError {
                field: "blobStorage".to_string(),
                message: "blob storage is not configured".to_string(),
            })?;

        let stored_key = artifact_key_of(&workflow);
        let key = match stored_key {
            Some(key) => key,
            None => {
                // Rows predating key persistence get the computed key written
                // back so the next download skips this branch.
                let key =
                    default_artifact_key(&self.config.default_artifact_key_prefix, workflow.id);
                if let Err(err) = self
                    .persistence
                    .update_artifact_location(workflow.id, &key)
                    .await
                {
                    warn!(error = %err, "failed to backfill artifact location");
                }
                key
            }
        };

        let content = self
            .fetch_blob(&BlobRequest::artifacts(blob, &key), workflow.id)
            .await?;
        Ok(ArtifactDownload {
            content,
            file_name: format!("{}.zip", workflow.id),
        })
    }

    async fn fetch_blob(&self, request: &BlobRequest, workflow_id: i32) -> Result<Bytes> {
        match self.blob.fetch(request).await {
            Ok(content) => Ok(content),
            Err(BlobError::NotFound { .. }) => Err(CoreError::LogsNotStored { workflow_id }),
            Err(err) => Err(CoreError::BlobStorageError {
                details: err.to_string(),
            }),
        }
    }

    /// Build a blob request with credentials read from the workflow's own
    /// cluster, `None` when the workflow ran locally or the cluster carries
    /// no credential objects.
    async fn external_blob_request(
        &self,
        workflow: &WorkflowRecord,
        key: &str,
    ) -> Result<Option<BlobRequest>> {
        let Some(cluster) = self.execution_cluster(workflow).await? else {
            return Ok(None);
        };
        let external = self
            .cluster
            .fetch_blob_config(
                &cluster,
                &workflow.namespace,
                &self.config.external_blob_config_map,
                &self.config.external_blob_secret,
            )
            .await
            .map_err(|e| CoreError::BlobStorageError {
                details: e.to_string(),
            })?;
        Ok(external.map(|config| BlobRequest::external_logs(&config, key)))
    }

    async fn execution_cluster(&self, workflow: &WorkflowRecord) -> Result<Option<ClusterConfig>> {
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

/// The stored artifact key of a workflow, when it is usable.
fn artifact_key_of(workflow: &WorkflowRecord) -> Option<String> {
    let location = workflow.ci_artifact_location.as_str();
    // S3 locations are stored as full `s3://bucket/key` URLs.
    let key = match location.strip_prefix("s3://") {
        Some(rest) => rest.split_once('/').map(|(_, key)| key).unwrap_or(""),
        None => location,
    };
    is_valid_key(key).then(|| key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MockBlobStorage;
    use crate::cluster::MockClusterGateway;
    use crate::config::BlobConfig;
    use crate::executor::MockExecutor;
    use crate::model::{BlobProvider, WorkflowStatus};
    use crate::persistence::memory::InMemoryPersistence;
    use crate::test_support::sample_workflow;
    use futures::StreamExt;

    fn blob_config() -> BlobConfig {
        BlobConfig {
            provider: BlobProvider::S3,
            logs_bucket: "ci-logs".to_string(),
            artifact_bucket: "ci-artifacts".to_string(),
            cache_bucket: "ci-logs".to_string(),
            region: "eu-central-1".to_string(),
            s3_endpoint: String::new(),
            s3_access_key: String::new(),
            s3_secret_key: String::new(),
            gcp_credentials_json: String::new(),
            azure_account_name: String::new(),
            azure_account_key: String::new(),
        }
    }

    fn service(
        persistence: Arc<InMemoryPersistence>,
        executor: Arc<MockExecutor>,
        blob: Arc<MockBlobStorage>,
        with_blob_config: bool,
    ) -> LogService {
        let mut config = Config::default();
        if with_blob_config {
            config.blob = Some(blob_config());
        }
        LogService::new(
            persistence,
            executor,
            blob,
            Arc::new(MockClusterGateway::new()),
            config,
        )
    }

    async fn collect(mut stream: LogStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_pending_pod_yields_empty_stream() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let mut workflow = sample_workflow(0, 7);
        workflow.pod_status = POD_STATUS_PENDING.to_string();
        let id = persistence.save_workflow(&workflow).await.unwrap();

        let executor = Arc::new(MockExecutor::new());
        executor.set_log_lines(vec!["should not appear"]);
        let stream = service(persistence, executor, Arc::new(MockBlobStorage::new()), false)
            .stream_logs(id, false)
            .await
            .unwrap();
        assert!(collect(stream).await.is_empty());
    }

    #[tokio::test]
    async fn test_live_logs_streamed_from_executor() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let mut workflow = sample_workflow(0, 7);
        workflow.status = WorkflowStatus::Running;
        workflow.pod_status = "Running".to_string();
        let id = persistence.save_workflow(&workflow).await.unwrap();

        let executor = Arc::new(MockExecutor::new());
        executor.set_log_lines(vec!["step 1\n", "step 2\n"]);
        let stream = service(persistence, executor, Arc::new(MockBlobStorage::new()), false)
            .stream_logs(id, true)
            .await
            .unwrap();
        assert_eq!(collect(stream).await, b"step 1\nstep 2\n");
    }

    #[tokio::test]
    async fn test_live_failure_without_blob_storage() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let mut workflow = sample_workflow(0, 7);
        workflow.status = WorkflowStatus::Running;
        let id = persistence.save_workflow(&workflow).await.unwrap();

        let err = service(
            persistence,
            Arc::new(MockExecutor::failing_logs()),
            Arc::new(MockBlobStorage::new()),
            false,
        )
        .stream_logs(id, false)
        .await
        .map(|_| ())
        .unwrap_err();
        assert_eq!(err.error_code(), "LOGS_NOT_STORED");
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn test_finished_build_served_from_blob() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let mut workflow = sample_workflow(0, 7);
        workflow.status = WorkflowStatus::Succeeded;
        workflow.blob_storage_enabled = true;
        workflow.log_location = "ci-logs/1-app-ci-7-7/main.log".to_string();
        let id = persistence.save_workflow(&workflow).await.unwrap();

        let blob = Arc::new(MockBlobStorage::new());
        blob.put("ci-logs", "ci-logs/1-app-ci-7-7/main.log", b"stored output");

        let stream = service(persistence, Arc::new(MockExecutor::failing_logs()), blob, true)
            .stream_logs(id, false)
            .await
            .unwrap();
        assert_eq!(collect(stream).await, b"stored output");
    }

    #[tokio::test]
    async fn test_historic_log_key_fallback() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let mut workflow = sample_workflow(0, 7);
        workflow.status = WorkflowStatus::Failed;
        workflow.blob_storage_enabled = true;
        let id = persistence.save_workflow(&workflow).await.unwrap();
        let stored = persistence.find_workflow(id).await.unwrap().unwrap();

        let blob = Arc::new(MockBlobStorage::new());
        blob.put(
            "ci-logs",
            &format!("ci-logs/{}-{}/main.log", id, stored.name),
            b"old layout",
        );

        let stream = service(
            persistence.clone(),
            Arc::new(MockExecutor::failing_logs()),
            blob,
            true,
        )
        .stream_logs(id, false)
        .await
        .unwrap();
        assert_eq!(collect(stream).await, b"old layout");

        // The computed key is written back for subsequent reads.
        let stored = persistence.find_workflow(id).await.unwrap().unwrap();
        assert_eq!(
            stored.log_location,
            format!("ci-logs/{}-{}/main.log", id, stored.name)
        );
    }

    #[tokio::test]
    async fn test_artifact_download() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let mut workflow = sample_workflow(0, 7);
        workflow.status = WorkflowStatus::Succeeded;
        workflow.blob_storage_enabled = true;
        let id = persistence.save_workflow(&workflow).await.unwrap();
        persistence
            .update_artifact_location(id, &format!("s3://ci-artifacts/ci-artifacts/{}/{}.zip", id, id))
            .await
            .unwrap();

        let blob = Arc::new(MockBlobStorage::new());
        blob.put(
            "ci-artifacts",
            &format!("ci-artifacts/{}/{}.zip", id, id),
            b"zip bytes",
        );

        let download = service(persistence, Arc::new(MockExecutor::new()), blob, true)
            .download_artifact(7, id)
            .await
            .unwrap();
        assert_eq!(&download.content[..], b"zip bytes");
        assert_eq!(download.file_name, format!("{}.zip", id));
    }

    #[tokio::test]
    async fn test_artifact_download_backfills_missing_location() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let mut workflow = sample_workflow(0, 7);
        workflow.status = WorkflowStatus::Succeeded;
        workflow.blob_storage_enabled = true;
        let id = persistence.save_workflow(&workflow).await.unwrap();

        let blob = Arc::new(MockBlobStorage::new());
        blob.put(
            "ci-artifacts",
            &format!("ci-artifacts/{}/{}.zip", id, id),
            b"zip bytes",
        );

        service(persistence.clone(), Arc::new(MockExecutor::new()), blob, true)
            .download_artifact(7, id)
            .await
            .unwrap();

        let stored = persistence.find_workflow(id).await.unwrap().unwrap();
        assert_eq!(
            stored.ci_artifact_location,
            format!("ci-artifacts/{}/{}.zip", id, id)
        );
    }

    #[tokio::test]
    async fn test_artifact_download_wrong_pipeline() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let mut workflow = sample_workflow(0, 7);
        workflow.blob_storage_enabled = true;
        let id = persistence.save_workflow(&workflow).await.unwrap();

        let err = service(
            persistence,
            Arc::new(MockExecutor::new()),
            Arc::new(MockBlobStorage::new()),
            true,
        )
        .download_artifact(99, id)
        .await
        .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_artifact_download_requires_blob_storage() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let workflow = sample_workflow(0, 7);
        let id = persistence.save_workflow(&workflow).await.unwrap();

        let err = service(
            persistence,
            Arc::new(MockExecutor::new()),
            Arc::new(MockBlobStorage::new()),
            true,
        )
        .download_artifact(7, id)
        .await
        .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_artifact_key_parsing() {
        let mut workflow = sample_workflow(3, 7);
        workflow.ci_artifact_location = "s3://bucket/prefix/3/3.zip".to_string();
        assert_eq!(artifact_key_of(&workflow).as_deref(), Some("prefix/3/3.zip"));

        workflow.ci_artifact_location = "prefix/3/3.zip".to_string();
        assert_eq!(artifact_key_of(&workflow).as_deref(), Some("prefix/3/3.zip"));

        workflow.ci_artifact_location = "prefix/../etc".to_string();
        assert!(artifact_key_of(&workflow).is_none());

        workflow.ci_artifact_location = String::new();
        assert!(artifact_key_of(&workflow).is_none());
    }
}
