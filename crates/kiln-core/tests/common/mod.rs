// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for kiln-core end-to-end tests.
//!
//! Wires the full service graph over the in-memory backend and the mock
//! gateways, the same shape the server binary builds over Postgres.

#![allow(dead_code)]

use std::sync::Arc;

use kiln_core::cancel::CancelService;
use kiln_core::cluster::MockClusterGateway;
use kiln_core::config::Config;
use kiln_core::executor::MockExecutor;
use kiln_core::image_tag::CustomTagService;
use kiln_core::material::MaterialResolver;
use kiln_core::persistence::memory::InMemoryPersistence;
use kiln_core::registry::{MockRegistryClient, RegistryAccount, RegistryCredentials, RegistryType};
use kiln_core::request::RequestBuilder;
use kiln_core::retrigger::RetriggerService;
use kiln_core::sensor::MockGitSensor;
use kiln_core::steps::StepAssembler;
use kiln_core::tasks::BackgroundTasks;
use kiln_core::test_support::{sample_app, sample_commit, sample_material, sample_pipeline, sample_template};
use kiln_core::trigger::TriggerService;

/// Full service graph over in-memory state.
pub struct TestContext {
    pub persistence: Arc<InMemoryPersistence>,
    pub sensor: Arc<MockGitSensor>,
    pub executor: Arc<MockExecutor>,
    pub registry: Arc<MockRegistryClient>,
    pub trigger: TriggerService,
    pub cancel: Arc<CancelService>,
    pub retrigger: RetriggerService,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let persistence = Arc::new(InMemoryPersistence::new());
        let sensor = Arc::new(MockGitSensor::new());
        let executor = Arc::new(MockExecutor::new());
        let registry = Arc::new(
            MockRegistryClient::new().with_account(RegistryAccount {
                id: "default-registry".to_string(),
                registry_type: RegistryType::DockerHub,
                registry_url: "registry.local".to_string(),
                credentials: RegistryCredentials::default(),
            }),
        );

        let custom_tags = Arc::new(CustomTagService::new(persistence.clone()));
        let steps = Arc::new(StepAssembler::new(
            persistence.clone(),
            registry.clone(),
            custom_tags.clone(),
        ));
        let requests = Arc::new(RequestBuilder::new(
            persistence.clone(),
            registry.clone(),
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
        let tasks = BackgroundTasks::new(4);
        let trigger = TriggerService::new(
            persistence.clone(),
            materials,
            requests,
            cancel.clone(),
            executor.clone(),
            tasks.clone(),
            config.clone(),
        );
        let retrigger = RetriggerService::new(
            persistence.clone(),
            executor.clone(),
            tasks,
            config,
        );

        Self {
            persistence,
            sensor,
            executor,
            registry,
            trigger,
            cancel,
            retrigger,
        }
    }

    /// Seed pipeline 7 of app 3 with one branch-fixed material and the
    /// default registry template, and give the sensor its head commit.
    pub fn seed_pipeline(&self) {
        self.persistence.insert_pipeline(sample_pipeline(7, 3));
        self.persistence.insert_app(sample_app(3));
        self.persistence
            .insert_build_template(sample_template(3, 101));
        self.persistence.insert_material(sample_material(1, 7));
        self.sensor.set_commit(1, sample_commit());
    }
}
