// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Git sensor seam.
//!
//! The sensor is the service watching configured repositories. The trigger
//! engine asks it for commits at trigger time; it never talks to git itself.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::model::{GitCommit, WebhookData};

/// Errors from the git sensor.
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    /// The material or the requested commit is unknown to the sensor.
    #[error("commit not found for material {material_id}: {detail}")]
    CommitNotFound {
        /// Pipeline material ID.
        material_id: i32,
        /// What exactly was missing.
        detail: String,
    },

    /// The sensor could not be reached or failed internally.
    #[error("git sensor unavailable: {0}")]
    Unavailable(String),
}

/// A commit lookup for one pipeline material.
#[derive(Debug, Clone, Default)]
pub struct CommitRequest {
    /// Pipeline material to resolve.
    pub material_id: i32,
    /// Pin to this commit hash. Empty resolves the latest commit for the
    /// material's configured source.
    pub commit_hash: String,
}

/// Client for the repository-watching service.
#[async_trait]
pub trait GitSensor: Send + Sync {
    /// Resolve the commit to build for a material.
    async fn fetch_commit(&self, request: &CommitRequest) -> Result<GitCommit, SensorError>;

    /// Fetch a parsed webhook event by its sensor-side ID.
    async fn fetch_webhook_event(
        &self,
        material_id: i32,
        webhook_data_id: i32,
    ) -> Result<WebhookData, SensorError>;
}

// ============================================================================
// Mock
// ============================================================================

/// In-memory [`GitSensor`] for tests.
pub struct MockGitSensor {
    commits: Mutex<HashMap<i32, GitCommit>>,
    webhook_events: Mutex<HashMap<(i32, i32), WebhookData>>,
    fail: bool,
}

impl Default for MockGitSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGitSensor {
    /// A sensor with no commits; lookups fail with `CommitNotFound`.
    pub fn new() -> Self {
        Self {
            commits: Mutex::new(HashMap::new()),
            webhook_events: Mutex::new(HashMap::new()),
            fail: false,
        }
    }

    /// A sensor whose every call fails with `Unavailable`.
    pub fn failing() -> Self {
        Self {
            commits: Mutex::new(HashMap::new()),
            webhook_events: Mutex::new(HashMap::new()),
            fail: true,
        }
    }

    /// Set the commit returned for a material.
    pub fn set_commit(&self, material_id: i32, commit: GitCommit) {
        self.commits.lock().unwrap().insert(material_id, commit);
    }

    /// Builder form of [`set_commit`](Self::set_commit).
    pub fn with_commit(self, material_id: i32, commit: GitCommit) -> Self {
        self.set_commit(material_id, commit);
        self
    }

    /// Set the webhook event returned for a material and event ID.
    pub fn set_webhook_event(&self, material_id: i32, webhook_data_id: i32, data: WebhookData) {
        self.webhook_events
            .lock()
            .unwrap()
            .insert((material_id, webhook_data_id), data);
    }
}

#[async_trait]
impl GitSensor for MockGitSensor {
    async fn fetch_commit(&self, request: &CommitRequest) -> Result<GitCommit, SensorError> {
        if self.fail {
            return Err(SensorError::Unavailable("mock sensor down".to_string()));
        }
        let commits = self.commits.lock().unwrap();
        let commit = commits
            .get(&request.material_id)
            .ok_or_else(|| SensorError::CommitNotFound {
                material_id: request.material_id,
                detail: "no commit seeded".to_string(),
            })?;
        if !request.commit_hash.is_empty() && commit.commit != request.commit_hash {
            return Err(SensorError::CommitNotFound {
                material_id: request.material_id,
                detail: format!("commit {} not seeded", request.commit_hash),
            });
        }
        Ok(commit.clone())
    }

    async fn fetch_webhook_event(
        &self,
        material_id: i32,
        webhook_data_id: i32,
    ) -> Result<WebhookData, SensorError> {
        if self.fail {
            return Err(SensorError::Unavailable("mock sensor down".to_string()));
        }
        self.webhook_events
            .lock()
            .unwrap()
            .get(&(material_id, webhook_data_id))
            .cloned()
            .ok_or_else(|| SensorError::CommitNotFound {
                material_id,
                detail: format!("webhook event {} not seeded", webhook_data_id),
            })
    }
}
