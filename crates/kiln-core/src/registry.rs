// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container registry seam.
//!
//! Registry accounts are managed elsewhere; the trigger engine only needs
//! credentials for the build push and, for ECR, repository pre-creation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

pub use crate::model::{RegistryCredentials, RegistryType};

/// Errors from the registry client.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No registry account with this ID.
    #[error("registry account '{0}' not found")]
    AccountNotFound(String),

    /// The registry API call failed.
    #[error("registry api call failed: {0}")]
    Api(String),
}

/// A configured registry account.
#[derive(Debug, Clone, Default)]
pub struct RegistryAccount {
    /// Account ID, referenced from build templates.
    pub id: String,
    /// Registry flavor.
    pub registry_type: RegistryType,
    /// Registry base URL, no scheme.
    pub registry_url: String,
    /// Push and pull credentials.
    pub credentials: RegistryCredentials,
}

/// Client for registry account lookup and ECR repository management.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Fetch a registry account by ID.
    async fn fetch_account(&self, registry_id: &str) -> Result<RegistryAccount, RegistryError>;

    /// Create an ECR repository if it does not exist.
    ///
    /// Idempotent: an already-existing repository is success, so every
    /// trigger can call this unconditionally.
    async fn ensure_ecr_repository(
        &self,
        account: &RegistryAccount,
        repository: &str,
    ) -> Result<(), RegistryError>;
}

// ============================================================================
// Mock
// ============================================================================

/// In-memory [`RegistryClient`] for tests.
#[derive(Default)]
pub struct MockRegistryClient {
    accounts: Mutex<HashMap<String, RegistryAccount>>,
    created_repositories: Mutex<Vec<String>>,
    fail_ecr: bool,
}

impl MockRegistryClient {
    /// A client with no accounts.
    pub fn new() -> Self {
        Self::default()
    }

    /// A client whose ECR calls fail.
    pub fn failing_ecr() -> Self {
        Self {
            fail_ecr: true,
            ..Default::default()
        }
    }

    /// Register an account.
    pub fn add_account(&self, account: RegistryAccount) {
        self.accounts
            .lock()
            .unwrap()
            .insert(account.id.clone(), account);
    }

    /// Builder form of [`add_account`](Self::add_account).
    pub fn with_account(self, account: RegistryAccount) -> Self {
        self.add_account(account);
        self
    }

    /// Repositories passed to `ensure_ecr_repository` so far.
    pub fn created_repositories(&self) -> Vec<String> {
        self.created_repositories.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistryClient for MockRegistryClient {
    async fn fetch_account(&self, registry_id: &str) -> Result<RegistryAccount, RegistryError> {
        self.accounts
            .lock()
            .unwrap()
            .get(registry_id)
            .cloned()
            .ok_or_else(|| RegistryError::AccountNotFound(registry_id.to_string()))
    }

    async fn ensure_ecr_repository(
        &self,
        _account: &RegistryAccount,
        repository: &str,
    ) -> Result<(), RegistryError> {
        if self.fail_ecr {
            return Err(RegistryError::Api("mock ecr down".to_string()));
        }
        self.created_repositories
            .lock()
            .unwrap()
            .push(repository.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ecr_account() -> RegistryAccount {
        RegistryAccount {
            id: "ecr-main".to_string(),
            registry_type: RegistryType::Ecr,
            registry_url: "123456789.dkr.ecr.eu-west-1.amazonaws.com".to_string(),
            credentials: RegistryCredentials {
                registry_type: RegistryType::Ecr,
                aws_region: "eu-west-1".to_string(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_mock_registry_account_lookup() {
        let client = MockRegistryClient::new().with_account(ecr_account());

        let account = client.fetch_account("ecr-main").await.unwrap();
        assert_eq!(account.registry_type, RegistryType::Ecr);

        let err = client.fetch_account("missing").await.unwrap_err();
        assert!(matches!(err, RegistryError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn test_mock_registry_ecr_creation_recorded() {
        let client = MockRegistryClient::new().with_account(ecr_account());
        let account = client.fetch_account("ecr-main").await.unwrap();

        client
            .ensure_ecr_repository(&account, "team/orders")
            .await
            .unwrap();
        assert_eq!(client.created_repositories(), vec!["team/orders"]);
    }
}
