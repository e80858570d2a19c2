// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kiln Server binary - CI trigger API over Postgres.

use std::sync::Arc;

use tracing::{info, warn};

use kiln_core::Config;
use kiln_core::cancel::CancelService;
use kiln_core::image_tag::CustomTagService;
use kiln_core::logs::LogService;
use kiln_core::material::MaterialResolver;
use kiln_core::persistence::postgres::PostgresPersistence;
use kiln_core::request::RequestBuilder;
use kiln_core::retrigger::RetriggerService;
use kiln_core::steps::StepAssembler;
use kiln_core::tasks::BackgroundTasks;
use kiln_core::trigger::TriggerService;

use kiln_server::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_server=info,kiln_core=info,tower_http=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;
    let database_url = std::env::var("KILN_DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("KILN_DATABASE_URL is not set"))?;
    let listen_addr =
        std::env::var("KILN_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    info!(
        namespace = %config.default_namespace,
        blob_storage = config.blob.is_some(),
        "Starting Kiln Server"
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await?;
    info!("Connected to database");

    kiln_core::migrations::run_postgres(&pool).await?;
    info!("Migrations applied");

    let persistence = Arc::new(PostgresPersistence::new(pool));

    // TODO: replace the in-process stand-ins with the gRPC sensor client,
    // the Argo executor client, and the provider-backed registry/blob/cluster
    // gateways once those deployments land. Until then the stand-ins must be
    // opted into explicitly so a misconfigured deployment fails at startup
    // instead of silently building nothing.
    if !standin_gateways_allowed(std::env::var("KILN_ALLOW_STANDIN_GATEWAYS").ok().as_deref()) {
        anyhow::bail!(
            "external gateway clients are not available in this build; \
             set KILN_ALLOW_STANDIN_GATEWAYS=true to run with in-process stand-ins"
        );
    }
    let sensor = Arc::new(kiln_core::sensor::MockGitSensor::new());
    let executor = Arc::new(kiln_core::executor::MockExecutor::new());
    let registry = Arc::new(kiln_core::registry::MockRegistryClient::new());
    let cluster = Arc::new(kiln_core::cluster::MockClusterGateway::new());
    let blob = Arc::new(kiln_core::blob::MockBlobStorage::new());
    warn!("external gateways are running as in-process stand-ins");

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
    let materials = Arc::new(MaterialResolver::new(persistence.clone(), sensor));
    let cancel = Arc::new(CancelService::new(
        persistence.clone(),
        executor.clone(),
        cluster.clone(),
        custom_tags,
        config.clone(),
    ));
    let tasks = BackgroundTasks::default();
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
        persistence, executor, blob, cluster, config,
    ));

    let app = kiln_server::router(AppState::new(trigger, cancel, retrigger, logs));

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!(addr = %listen_addr, "Kiln Server ready");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Whether the operator opted into running with in-process gateway stand-ins.
fn standin_gateways_allowed(value: Option<&str>) -> bool {
    matches!(value, Some("true") | Some("1"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standin_gateways_require_explicit_opt_in() {
        assert!(!standin_gateways_allowed(None));
        assert!(!standin_gateways_allowed(Some("")));
        assert!(!standin_gateways_allowed(Some("false")));
        assert!(standin_gateways_allowed(Some("true")));
        assert!(standin_gateways_allowed(Some("1")));
    }
}
