// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Blob storage seam.
//!
//! Used on the read side only: historic build logs and artifact archives.
//! Uploads are done by the build runner itself.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cluster::ExternalBlobConfig;
use crate::config::BlobConfig;
use crate::model::BlobProvider;

/// Errors from blob storage.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// The object does not exist.
    #[error("object '{key}' not found in bucket '{bucket}'")]
    NotFound {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
    },

    /// The storage API call failed.
    #[error("blob storage call failed: {0}")]
    Api(String),
}

/// A fully credentialed object fetch.
#[derive(Debug, Clone)]
pub struct BlobRequest {
    /// Provider the bucket lives on.
    pub provider: BlobProvider,
    /// Bucket or container name.
    pub bucket: String,
    /// Object key.
    pub key: String,
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

impl BlobRequest {
    /// A fetch against the locally configured logs bucket.
    pub fn logs(config: &BlobConfig, key: &str) -> Self {
        Self {
            provider: config.provider,
            bucket: config.logs_bucket.clone(),
            key: key.to_string(),
            region: config.region.clone(),
            endpoint: config.s3_endpoint.clone(),
            access_key: config.s3_access_key.clone(),
            secret_key: config.s3_secret_key.clone(),
            gcp_credentials_json: config.gcp_credentials_json.clone(),
            azure_account_name: config.azure_account_name.clone(),
            azure_account_key: config.azure_account_key.clone(),
        }
    }

    /// A fetch against the locally configured artifact bucket.
    pub fn artifacts(config: &BlobConfig, key: &str) -> Self {
        Self {
            bucket: config.artifact_bucket.clone(),
            ..Self::logs(config, key)
        }
    }

    /// A fetch against an external cluster's logs bucket.
    pub fn external_logs(config: &ExternalBlobConfig, key: &str) -> Self {
        Self {
            provider: config.provider,
            bucket: config.logs_bucket.clone(),
            key: key.to_string(),
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            gcp_credentials_json: config.gcp_credentials_json.clone(),
            azure_account_name: config.azure_account_name.clone(),
            azure_account_key: config.azure_account_key.clone(),
        }
    }
}

/// Read access to blob storage.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Download an object fully into memory.
    async fn fetch(&self, request: &BlobRequest) -> Result<Bytes, BlobError>;
}

// ============================================================================
// Mock
// ============================================================================

/// In-memory [`BlobStorage`] for tests, keyed by bucket and object key.
#[derive(Default)]
pub struct MockBlobStorage {
    objects: Mutex<HashMap<(String, String), Bytes>>,
}

impl MockBlobStorage {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Put an object.
    pub fn put(&self, bucket: &str, key: &str, data: &[u8]) {
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            Bytes::copy_from_slice(data),
        );
    }
}

#[async_trait]
impl BlobStorage for MockBlobStorage {
    async fn fetch(&self, request: &BlobRequest) -> Result<Bytes, BlobError> {
        self.objects
            .lock()
            .unwrap()
            .get(&(request.bucket.clone(), request.key.clone()))
            .cloned()
            .ok_or_else(|| BlobError::NotFound {
                bucket: request.bucket.clone(),
                key: request.key.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3_config() -> BlobConfig {
        BlobConfig {
            provider: BlobProvider::S3,
            logs_bucket: "kiln-logs".to_string(),
            artifact_bucket: "kiln-artifacts".to_string(),
            cache_bucket: "kiln-cache".to_string(),
            region: "eu-west-1".to_string(),
            s3_endpoint: String::new(),
            s3_access_key: String::new(),
            s3_secret_key: String::new(),
            gcp_credentials_json: String::new(),
            azure_account_name: String::new(),
            azure_account_key: String::new(),
        }
    }

    #[test]
    fn test_request_builders_pick_buckets() {
        let config = s3_config();
        let logs = BlobRequest::logs(&config, "ci-logs/41-app-ci-7/main.log");
        assert_eq!(logs.bucket, "kiln-logs");
        assert_eq!(logs.key, "ci-logs/41-app-ci-7/main.log");

        let artifacts = BlobRequest::artifacts(&config, "ci-artifacts/41.zip");
        assert_eq!(artifacts.bucket, "kiln-artifacts");
        assert_eq!(artifacts.region, "eu-west-1");
    }

    #[tokio::test]
    async fn test_mock_blob_fetch() {
        let storage = MockBlobStorage::new();
        storage.put("kiln-logs", "a/main.log", b"log line\n");

        let config = s3_config();
        let data = storage
            .fetch(&BlobRequest::logs(&config, "a/main.log"))
            .await
            .unwrap();
        assert_eq!(&data[..], b"log line\n");

        let err = storage
            .fetch(&BlobRequest::logs(&config, "missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::NotFound { .. }));
    }
}
