// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end API tests over the in-memory backend.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::util::ServiceExt;

use kiln_core::blob::MockBlobStorage;
use kiln_core::cancel::CancelService;
use kiln_core::cluster::MockClusterGateway;
use kiln_core::config::{BlobConfig, Config};
use kiln_core::image_tag::CustomTagService;
use kiln_core::logs::LogService;
use kiln_core::material::MaterialResolver;
use kiln_core::model::{BlobProvider, WORKFLOW_TYPE_CI, WorkflowRequest, WorkflowStatus};
use kiln_core::persistence::Persistence;
use kiln_core::persistence::memory::InMemoryPersistence;
use kiln_core::registry::{MockRegistryClient, RegistryAccount, RegistryCredentials, RegistryType};
use kiln_core::request::RequestBuilder;
use kiln_core::retrigger::RetriggerService;
use kiln_core::sensor::MockGitSensor;
use kiln_core::steps::StepAssembler;
use kiln_core::tasks::BackgroundTasks;
use kiln_core::test_support::{
    sample_app, sample_commit, sample_material, sample_pipeline, sample_template, sample_workflow,
};
use kiln_core::trigger::TriggerService;
use kiln_server::AppState;

struct Harness {
    persistence: Arc<InMemoryPersistence>,
    sensor: Arc<MockGitSensor>,
    executor: Arc<kiln_core::executor::MockExecutor>,
    blob: Arc<MockBlobStorage>,
    app: Router,
}

fn harness_with_config(config: Config) -> Harness {
    let persistence = Arc::new(InMemoryPersistence::new());
    let sensor = Arc::new(MockGitSensor::new());
    let executor = Arc::new(kiln_core::executor::MockExecutor::new());
    let blob = Arc::new(MockBlobStorage::new());
    let cluster = Arc::new(MockClusterGateway::new());

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
        cluster.clone(),
        custom_tags,
        config.clone(),
    ));
    let tasks = BackgroundTasks::new(4);
    let trigger = Arc::new(TriggerService::new(
        persistence.clone(),
        materials,
        requests,
        cancel.clone(),
        executor.clone(),
        tasks.clone(),
        config.clone(),
    ));
    let retrigger = Arc::new(RetriggerService::new(
        persistence.clone(),
        executor.clone(),
        tasks,
        config.clone(),
    ));
    let logs = Arc::new(LogService::new(
        persistence.clone(),
        executor.clone(),
        blob.clone(),
        cluster,
        config,
    ));

    let app = kiln_server::router(AppState::new(trigger, cancel, retrigger, logs));
    Harness {
        persistence,
        sensor,
        executor,
        blob,
        app,
    }
}

fn harness() -> Harness {
    harness_with_config(Config::default())
}

fn seed_pipeline(h: &Harness) {
    h.persistence.insert_pipeline(sample_pipeline(7, 3));
    h.persistence.insert_app(sample_app(3));
    h.persistence.insert_build_template(sample_template(3, 101));
    h.persistence.insert_material(sample_material(1, 7));
    h.sensor.set_commit(1, sample_commit());
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn get_raw(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::get(uri).body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

fn trigger_body() -> Value {
    json!({
        "pipelineId": 7,
        "ciPipelineMaterial": [
            {"id": 1, "gitCommit": {"commit": sample_commit().commit}}
        ],
        "triggeredBy": 2,
        "triggerAuthor": "dev@example.com"
    })
}

#[tokio::test]
async fn test_health_reports_version() {
    let h = harness();
    let (status, body) = get_raw(&h.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["status"], "healthy");
    assert!(value["version"].is_string());
}

#[tokio::test]
async fn test_manual_trigger_returns_workflow_id() {
    let h = harness();
    seed_pipeline(&h);

    let (status, body) = post_json(&h.app, "/ci-pipeline/trigger", trigger_body()).await;
    assert_eq!(status, StatusCode::OK);
    let workflow_id = body["workflowId"].as_i64().unwrap() as i32;
    assert!(workflow_id > 0);
    assert_eq!(h.executor.submissions().len(), 1);
    assert_eq!(h.persistence.workflows()[0].id, workflow_id);
}

#[tokio::test]
async fn test_trigger_unknown_pipeline_is_404() {
    let h = harness();
    let (status, body) = post_json(
        &h.app,
        "/ci-pipeline/trigger",
        json!({"pipelineId": 99, "triggeredBy": 2}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "PIPELINE_NOT_FOUND");
}

#[tokio::test]
async fn test_webhook_triggers_automatic_pipeline() {
    let h = harness();
    seed_pipeline(&h);

    let event = json!({
        "pipelineMaterialId": 1,
        "gitCommit": serde_json::to_value(sample_commit()).unwrap(),
    });
    let (status, body) = post_json(&h.app, "/webhook/ci/hook-secret", event).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["workflowId"].as_i64().unwrap() > 0);
    assert_eq!(h.executor.submissions().len(), 1);
}

#[tokio::test]
async fn test_webhook_skips_manual_pipeline_with_a_message() {
    let h = harness();
    let mut pipeline = sample_pipeline(7, 3);
    pipeline.is_manual = true;
    h.persistence.insert_pipeline(pipeline);
    h.persistence.insert_app(sample_app(3));
    h.persistence.insert_material(sample_material(1, 7));

    let event = json!({
        "pipelineMaterialId": 1,
        "gitCommit": serde_json::to_value(sample_commit()).unwrap(),
    });
    let (status, body) = post_json(&h.app, "/webhook/ci/hook-secret", event).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["workflowId"].is_null());
    assert!(body["message"].is_string());
    assert!(h.persistence.workflows().is_empty());
}

#[tokio::test]
async fn test_webhook_with_older_commit_is_acknowledged_without_a_build() {
    let h = harness();
    seed_pipeline(&h);

    // Pin the material to the 2025-05-12 commit with a running build.
    let (status, _) = post_json(&h.app, "/ci-pipeline/trigger", trigger_body()).await;
    assert_eq!(status, StatusCode::OK);

    let event = json!({
        "pipelineMaterialId": 1,
        "gitCommit": {
            "commit": "0ldc0mm1t",
            "date": "2025-05-11T08:00:00Z",
        },
    });
    let (status, body) = post_json(&h.app, "/webhook/ci/hook-secret", event).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["workflowId"].is_null());
    assert!(body["message"].as_str().unwrap().contains("older"));

    // The in-flight build is untouched and no second one was started.
    assert_eq!(h.persistence.workflows().len(), 1);
    assert_eq!(h.executor.submissions().len(), 1);
}

#[tokio::test]
async fn test_cancel_marks_the_workflow() {
    let h = harness();
    let id = h
        .persistence
        .save_workflow(&sample_workflow(0, 7))
        .await
        .unwrap();

    let (status, body) = post_json(
        &h.app,
        &format!("/ci-pipeline/{}/cancel", id),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["workflowId"].as_i64().unwrap() as i32, id);

    let stored = h.persistence.workflows()[0].clone();
    assert_eq!(stored.status, WorkflowStatus::Cancelled);
    assert_eq!(h.executor.terminations().len(), 1);
}

#[tokio::test]
async fn test_force_abort_sweeps_an_unknown_workflow() {
    let h = harness();
    let workflow = sample_workflow(0, 7);
    let id = h.persistence.save_workflow(&workflow).await.unwrap();
    h.executor
        .forget_workflow(&format!("{}-{}", id, workflow.name));

    let (status, body) = post_json(
        &h.app,
        &format!("/ci-pipeline/{}/cancel?forceAbort=true", id),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["workflowId"].as_i64().unwrap() as i32, id);

    let stored = h.persistence.workflows()[0].clone();
    assert_eq!(stored.status, WorkflowStatus::Cancelled);
    assert_eq!(stored.pod_status, "Failed");
    assert_eq!(h.executor.dangling_terminations().len(), 1);
}

#[tokio::test]
async fn test_cancel_without_force_fails_for_unknown_workflow() {
    let h = harness();
    let workflow = sample_workflow(0, 7);
    let id = h.persistence.save_workflow(&workflow).await.unwrap();
    h.executor
        .forget_workflow(&format!("{}-{}", id, workflow.name));

    let (status, body) = post_json(
        &h.app,
        &format!("/ci-pipeline/{}/cancel", id),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_logs_stream_the_live_build() {
    let h = harness();
    let id = h
        .persistence
        .save_workflow(&sample_workflow(0, 7))
        .await
        .unwrap();
    h.executor.set_log_lines(vec!["building image\n", "done\n"]);

    let (status, body) = get_raw(
        &h.app,
        &format!("/ci-pipeline/workflow/{}/logs", id),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("building image"));
    assert!(text.contains("done"));
}

#[tokio::test]
async fn test_logs_of_a_pending_pod_are_empty() {
    let h = harness();
    let mut workflow = sample_workflow(0, 7);
    workflow.pod_status = "Pending".to_string();
    let id = h.persistence.save_workflow(&workflow).await.unwrap();

    let (status, body) = get_raw(
        &h.app,
        &format!("/ci-pipeline/workflow/{}/logs", id),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_logs_for_unknown_workflow_are_404() {
    let h = harness();
    let (status, _) = get_raw(&h.app, "/ci-pipeline/workflow/99/logs").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_artifact_download_serves_the_archive() {
    let mut config = Config::default();
    config.blob = Some(BlobConfig {
        provider: BlobProvider::S3,
        logs_bucket: "kiln-logs".to_string(),
        artifact_bucket: "kiln-artifacts".to_string(),
        cache_bucket: "kiln-cache".to_string(),
        region: "eu-central-1".to_string(),
        s3_endpoint: String::new(),
        s3_access_key: String::new(),
        s3_secret_key: String::new(),
        gcp_credentials_json: String::new(),
        azure_account_name: String::new(),
        azure_account_key: String::new(),
    });
    let h = harness_with_config(config);

    let mut workflow = sample_workflow(0, 7);
    workflow.blob_storage_enabled = true;
    let id = h.persistence.save_workflow(&workflow).await.unwrap();
    h.blob.put(
        "kiln-artifacts",
        &format!("ci-artifacts/{}/{}.zip", id, id),
        b"archive bytes",
    );

    let request = Request::get(format!("/ci-pipeline/7/workflow/{}/artifact", id))
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let disposition = response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains(&format!("{}.zip", id)));
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"archive bytes");
}

#[tokio::test]
async fn test_artifact_of_another_pipeline_is_rejected() {
    let h = harness();
    let id = h
        .persistence
        .save_workflow(&sample_workflow(0, 7))
        .await
        .unwrap();

    let (status, body) = get_raw(
        &h.app,
        &format!("/ci-pipeline/8/workflow/{}/artifact", id),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_status_event_replays_a_lost_build() {
    let h = harness();
    let workflow = sample_workflow(0, 7);
    let id = h.persistence.save_workflow(&workflow).await.unwrap();
    let snapshot = WorkflowRequest {
        workflow_id: id,
        workflow_name_prefix: format!("{}-{}", id, workflow.name),
        pipeline_id: 7,
        ..WorkflowRequest::default()
    };
    h.persistence
        .save_trigger_snapshot(id, WORKFLOW_TYPE_CI, &snapshot)
        .await
        .unwrap();

    let (status, body) = post_json(
        &h.app,
        "/ci-workflow/status",
        json!({
            "workflowName": format!("{}-{}", id, workflow.name),
            "podStatus": "Failed",
            "message": "pod deleted",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let new_id = body["retriggeredWorkflowId"].as_i64().unwrap() as i32;
    assert!(new_id > id);
    assert_eq!(h.executor.submissions().len(), 1);
}

#[tokio::test]
async fn test_status_event_ignores_ordinary_failures() {
    let h = harness();
    let workflow = sample_workflow(0, 7);
    let id = h.persistence.save_workflow(&workflow).await.unwrap();

    let (status, body) = post_json(
        &h.app,
        "/ci-workflow/status",
        json!({
            "workflowName": format!("{}-{}", id, workflow.name),
            "podStatus": "Failed",
            "message": "exit code 1",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["retriggeredWorkflowId"].is_null());
    assert!(h.executor.submissions().is_empty());
}
