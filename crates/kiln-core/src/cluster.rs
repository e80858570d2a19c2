// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster gateway seam.
//!
//! Job pipelines may run in environments living on clusters other than the
//! one this service runs in. The gateway resolves connection details for
//! those clusters and reads blob credentials stored inside them.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::model::BlobProvider;

/// Cluster ID of the cluster this service itself runs in.
pub const DEFAULT_CLUSTER_ID: i32 = 1;

/// Errors from the cluster gateway.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The cluster is not registered.
    #[error("cluster {0} not found")]
    NotFound(i32),

    /// The cluster API could not be reached.
    #[error("cluster api call failed: {0}")]
    Api(String),
}

/// Connection details for one registered cluster.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    /// Cluster ID.
    pub id: i32,
    /// Cluster display name.
    pub name: String,
    /// API server URL.
    pub api_server_url: String,
    /// Bearer token.
    pub token: String,
    /// Skip TLS verification for self-signed clusters.
    pub insecure_skip_verify: bool,
}

impl ClusterConfig {
    /// Whether this is a cluster other than the one the service runs in.
    pub fn is_external(&self) -> bool {
        self.id != DEFAULT_CLUSTER_ID
    }
}

/// Blob credentials read from a ConfigMap and Secret inside a cluster.
///
/// Builds running in external clusters upload logs to buckets owned by that
/// cluster; historic log reads need the same credentials.
#[derive(Debug, Clone)]
pub struct ExternalBlobConfig {
    /// Provider of the cluster-local buckets.
    pub provider: BlobProvider,
    /// Logs bucket.
    pub logs_bucket: String,
    /// Bucket region.
    pub region: String,
    /// Custom S3 endpoint.
    pub endpoint: String,
    /// S3 access key.
    pub access_key: String,
    /// S3 secret key.
    pub secret_key: String,
    /// GCP credentials JSON.
    pub gcp_credentials_json: String,
    /// Azure account name.
    pub azure_account_name: String,
    /// Azure account key.
    pub azure_account_key: String,
}

/// Client for registered clusters.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Connection details for a cluster.
    async fn cluster_config(&self, cluster_id: i32) -> Result<ClusterConfig, ClusterError>;

    /// Read blob credentials from the named ConfigMap and Secret in a
    /// namespace of the given cluster. `Ok(None)` when neither object exists.
    async fn fetch_blob_config(
        &self,
        cluster: &ClusterConfig,
        namespace: &str,
        config_map: &str,
        secret: &str,
    ) -> Result<Option<ExternalBlobConfig>, ClusterError>;
}

// ============================================================================
// Mock
// ============================================================================

/// In-memory [`ClusterGateway`] for tests.
#[derive(Default)]
pub struct MockClusterGateway {
    clusters: Mutex<HashMap<i32, ClusterConfig>>,
    blob_configs: Mutex<HashMap<(i32, String), ExternalBlobConfig>>,
}

impl MockClusterGateway {
    /// A gateway knowing only the default cluster.
    pub fn new() -> Self {
        let gateway = Self::default();
        gateway.add_cluster(ClusterConfig {
            id: DEFAULT_CLUSTER_ID,
            name: "default_cluster".to_string(),
            ..Default::default()
        });
        gateway
    }

    /// Register a cluster.
    pub fn add_cluster(&self, config: ClusterConfig) {
        self.clusters.lock().unwrap().insert(config.id, config);
    }

    /// Seed blob credentials for a cluster and namespace.
    pub fn set_blob_config(&self, cluster_id: i32, namespace: &str, config: ExternalBlobConfig) {
        self.blob_configs
            .lock()
            .unwrap()
            .insert((cluster_id, namespace.to_string()), config);
    }
}

#[async_trait]
impl ClusterGateway for MockClusterGateway {
    async fn cluster_config(&self, cluster_id: i32) -> Result<ClusterConfig, ClusterError> {
        self.clusters
            .lock()
            .unwrap()
            .get(&cluster_id)
            .cloned()
            .ok_or(ClusterError::NotFound(cluster_id))
    }

    async fn fetch_blob_config(
        &self,
        cluster: &ClusterConfig,
        namespace: &str,
        _config_map: &str,
        _secret: &str,
    ) -> Result<Option<ExternalBlobConfig>, ClusterError> {
        Ok(self
            .blob_configs
            .lock()
            .unwrap()
            .get(&(cluster.id, namespace.to_string()))
            .cloned())
    }
}
