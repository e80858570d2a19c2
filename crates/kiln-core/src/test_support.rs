// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for unit and integration tests.
//!
//! Builders return fully populated records with sensible defaults so tests
//! only spell out the fields they care about.

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};

use crate::model::{
    AppType, BuildConfig, CiBuildType, ExecutorType, GitCommit, GitOptions, PipelineType,
    SourceType, WorkflowStatus,
};
use crate::persistence::{
    AppRecord, BuildTemplateRecord, EnvironmentRecord, MaterialRecord, PipelineRecord,
    WorkflowRecord,
};

/// An automatic build pipeline named `app-ci-{id}`.
pub fn sample_pipeline(id: i32, app_id: i32) -> PipelineRecord {
    PipelineRecord {
        id,
        app_id,
        name: format!("app-ci-{}", id),
        pipeline_type: PipelineType::CiBuild,
        is_manual: false,
        scan_enabled: false,
        auto_abort_previous_builds: false,
        workflow_cache_overridden: None,
        is_docker_config_overridden: false,
        deleted: false,
    }
}

/// An application named `orders`.
pub fn sample_app(id: i32) -> AppRecord {
    AppRecord {
        id,
        name: "orders".to_string(),
        app_type: AppType::Application,
        labels: BTreeMap::new(),
    }
}

/// A branch-fixed material tracking `main`.
pub fn sample_material(id: i32, pipeline_id: i32) -> MaterialRecord {
    MaterialRecord {
        id,
        pipeline_id,
        git_material_id: id + 100,
        source_type: SourceType::BranchFixed,
        source_value: "main".to_string(),
        active: true,
        git_material_name: "orders".to_string(),
        git_repo_url: "https://git.example.com/team/orders.git".to_string(),
        checkout_path: "./".to_string(),
        fetch_submodules: false,
        git_options: GitOptions {
            auth_mode: "ANONYMOUS".to_string(),
            ..Default::default()
        },
        last_seen_hash: String::new(),
        last_seen_date: None,
    }
}

/// A self-dockerfile build template pushing to `registry.example.com`.
pub fn sample_template(app_id: i32, git_material_id: i32) -> BuildTemplateRecord {
    BuildTemplateRecord {
        app_id,
        docker_registry_id: "default-registry".to_string(),
        docker_repository: "team/orders".to_string(),
        git_material_id,
        build_config: BuildConfig {
            ci_build_type: CiBuildType::SelfDockerfile,
            dockerfile_path: "Dockerfile".to_string(),
            ..Default::default()
        },
    }
}

/// An environment on the local cluster.
pub fn sample_environment(id: i32) -> EnvironmentRecord {
    EnvironmentRecord {
        id,
        name: format!("env-{}", id),
        namespace: format!("ns-{}", id),
        cluster_id: 1,
        cluster_name: "default_cluster".to_string(),
    }
}

/// A freshly started workflow.
pub fn sample_workflow(id: i32, pipeline_id: i32) -> WorkflowRecord {
    WorkflowRecord {
        id,
        name: format!("app-ci-{}-{}", pipeline_id, pipeline_id),
        ci_pipeline_id: pipeline_id,
        status: WorkflowStatus::Starting,
        pod_status: String::new(),
        message: String::new(),
        started_on: Utc::now(),
        finished_on: None,
        namespace: "kiln-ci".to_string(),
        log_location: String::new(),
        triggered_by: 2,
        executor_type: ExecutorType::ArgoWorkflow,
        pod_name: String::new(),
        ci_build_type: CiBuildType::SelfDockerfile,
        environment_id: 0,
        reference_ci_workflow_id: 0,
        git_triggers: BTreeMap::new(),
        image_path_reservation_ids: Vec::new(),
        blob_storage_enabled: false,
        ci_artifact_location: String::new(),
    }
}

/// A commit with a fixed timestamp, hash first 8 chars `ab12cd34`.
pub fn sample_commit() -> GitCommit {
    GitCommit {
        commit: "ab12cd34ef56ab78cd90ef12ab34cd56ef78ab90".to_string(),
        author: "dev@example.com".to_string(),
        date: Some(Utc.with_ymd_and_hms(2025, 5, 12, 9, 30, 0).unwrap()),
        message: "fix order rounding".to_string(),
        changes: vec!["src/orders.rs".to_string()],
        git_tag: String::new(),
        webhook_data: None,
    }
}
