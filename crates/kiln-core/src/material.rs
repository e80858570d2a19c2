// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Material resolution: turning a trigger request into pinned commits.
//!
//! Every active material of the pipeline must resolve to exactly one commit
//! before a workflow is created. Webhook triggers carry the commit for one
//! material; the rest fall back to their last seen head.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::error::{CoreError, Result};
use crate::model::{GitCommit, SourceType, TriggerMaterial};
use crate::persistence::{MaterialRecord, Persistence};
use crate::sensor::{CommitRequest, GitSensor, SensorError};

/// The commits a trigger will build, one per active material.
#[derive(Debug, Clone)]
pub struct ResolvedMaterials {
    /// The pipeline's active materials.
    pub materials: Vec<MaterialRecord>,
    /// Material ID to resolved commit.
    pub commits: BTreeMap<i32, GitCommit>,
}

fn sensor_error(err: SensorError) -> CoreError {
    match err {
        SensorError::CommitNotFound { material_id, detail } => CoreError::ValidationError {
            field: format!("material {}", material_id),
            message: detail,
        },
        SensorError::Unavailable(details) => CoreError::GitSensorError { details },
    }
}

/// Resolves trigger requests and webhook events to commits.
pub struct MaterialResolver {
    persistence: Arc<dyn Persistence>,
    sensor: Arc<dyn GitSensor>,
}

impl MaterialResolver {
    /// Create the resolver.
    pub fn new(persistence: Arc<dyn Persistence>, sensor: Arc<dyn GitSensor>) -> Self {
        Self { persistence, sensor }
    }

    /// Resolve all active materials of a pipeline for a manual trigger.
    ///
    /// Materials pinned in the request resolve to the pinned commit or
    /// webhook event; unpinned materials resolve to their latest commit.
    #[instrument(skip(self, pins), fields(pipeline_id = pipeline_id))]
    pub async fn resolve(
        &self,
        pipeline_id: i32,
        pins: &[TriggerMaterial],
    ) -> Result<ResolvedMaterials> {
        let materials = self
            .persistence
            .find_materials_for_pipeline(pipeline_id)
            .await?;
        if materials.is_empty() {
            return Err(CoreError::NoMaterialsConfigured { pipeline_id });
        }

        let mut commits = BTreeMap::new();
        for material in &materials {
            let pin = pins.iter().find(|p| p.material_id == material.id);
            let commit = match pin {
                Some(pin) if pin.webhook_data_id != 0 => {
                    let webhook_data = self
                        .sensor
                        .fetch_webhook_event(material.id, pin.webhook_data_id)
                        .await
                        .map_err(sensor_error)?;
                    GitCommit {
                        commit: pin.commit_hash.clone(),
                        webhook_data: Some(webhook_data),
                        ..Default::default()
                    }
                }
                Some(pin) => self
                    .sensor
                    .fetch_commit(&CommitRequest {
                        material_id: material.id,
                        commit_hash: pin.commit_hash.clone(),
                    })
                    .await
                    .map_err(sensor_error)?,
                None => self
                    .sensor
                    .fetch_commit(&CommitRequest {
                        material_id: material.id,
                        commit_hash: String::new(),
                    })
                    .await
                    .map_err(sensor_error)?,
            };
            commits.insert(material.id, commit);
        }

        debug!(materials = materials.len(), "materials resolved");
        Ok(ResolvedMaterials { materials, commits })
    }

    /// Resolve materials for a webhook-delivered commit.
    ///
    /// The event's material takes the delivered commit, which is also
    /// recorded as the material's new head. Sibling materials use their last
    /// seen head when one is known, falling back to a sensor lookup.
    #[instrument(skip(self, commit), fields(material_id = event_material_id))]
    pub async fn resolve_for_webhook(
        &self,
        pipeline_id: i32,
        event_material_id: i32,
        commit: &GitCommit,
    ) -> Result<ResolvedMaterials> {
        let materials = self
            .persistence
            .find_materials_for_pipeline(pipeline_id)
            .await?;
        if materials.is_empty() {
            return Err(CoreError::NoMaterialsConfigured { pipeline_id });
        }

        self.persistence
            .update_material_head(event_material_id, commit)
            .await?;

        let mut commits = BTreeMap::new();
        for material in &materials {
            if material.id == event_material_id {
                commits.insert(material.id, commit.clone());
                continue;
            }
            let resolved = if material.last_seen_hash.is_empty() {
                self.sensor
                    .fetch_commit(&CommitRequest {
                        material_id: material.id,
                        commit_hash: String::new(),
                    })
                    .await
                    .map_err(sensor_error)?
            } else {
                GitCommit {
                    commit: material.last_seen_hash.clone(),
                    date: material.last_seen_date,
                    ..Default::default()
                }
            };
            commits.insert(material.id, resolved);
        }

        Ok(ResolvedMaterials { materials, commits })
    }

    /// Reject triggers that would build commits older than an in-flight build.
    ///
    /// Applies only to branch-fixed materials and only while the pipeline's
    /// most recent workflow is still unfinished. Commits without timestamps
    /// pass; equality passes. Out-of-order completion of finished builds is
    /// the user's business, so terminal workflows never block.
    pub async fn validate_sequence(
        &self,
        pipeline_id: i32,
        materials: &[MaterialRecord],
        commits: &BTreeMap<i32, GitCommit>,
    ) -> Result<()> {
        let Some(last) = self
            .persistence
            .find_last_triggered_workflow(pipeline_id)
            .await?
        else {
            return Ok(());
        };
        if last.status.is_terminal() {
            return Ok(());
        }

        for material in materials {
            if material.source_type != SourceType::BranchFixed {
                continue;
            }
            let (Some(new_commit), Some(prev_commit)) =
                (commits.get(&material.id), last.git_triggers.get(&material.id))
            else {
                continue;
            };
            if let (Some(new_date), Some(prev_date)) = (new_commit.date, prev_commit.date)
                && new_date < prev_date
            {
                warn!(
                    material_id = material.id,
                    in_flight_workflow = last.id,
                    "stale commit rejected while a newer build is in flight"
                );
                return Err(CoreError::StaleCommit {
                    pipeline_id,
                    material_id: material.id,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{WebhookData, WorkflowStatus};
    use crate::persistence::memory::InMemoryPersistence;
    use crate::sensor::MockGitSensor;
    use crate::test_support::{sample_commit, sample_material, sample_pipeline, sample_workflow};
    use chrono::{Duration, Utc};

    fn setup() -> (Arc<InMemoryPersistence>, Arc<MockGitSensor>) {
        let persistence = Arc::new(InMemoryPersistence::new());
        persistence.insert_pipeline(sample_pipeline(7, 3));
        (persistence, Arc::new(MockGitSensor::new()))
    }

    #[tokio::test]
    async fn test_resolve_latest_for_unpinned_material() {
        let (persistence, sensor) = setup();
        persistence.insert_material(sample_material(1, 7));
        sensor.set_commit(1, sample_commit());

        let resolver = MaterialResolver::new(persistence, sensor);
        let resolved = resolver.resolve(7, &[]).await.unwrap();

        assert_eq!(resolved.materials.len(), 1);
        assert_eq!(resolved.commits[&1].commit, sample_commit().commit);
    }

    #[tokio::test]
    async fn test_resolve_no_materials() {
        let (persistence, sensor) = setup();
        let resolver = MaterialResolver::new(persistence, sensor);

        let err = resolver.resolve(7, &[]).await.unwrap_err();
        assert_eq!(err.error_code(), "NO_MATERIALS_CONFIGURED");
    }

    #[tokio::test]
    async fn test_resolve_pinned_webhook_event() {
        let (persistence, sensor) = setup();
        persistence.insert_material(sample_material(1, 7));
        sensor.set_webhook_event(
            1,
            55,
            WebhookData {
                id: 55,
                event_action_type: "merged".to_string(),
                data: BTreeMap::new(),
            },
        );

        let resolver = MaterialResolver::new(persistence, sensor);
        let resolved = resolver
            .resolve(
                7,
                &[TriggerMaterial {
                    material_id: 1,
                    commit_hash: "abc123".to_string(),
                    webhook_data_id: 55,
                }],
            )
            .await
            .unwrap();

        let commit = &resolved.commits[&1];
        assert_eq!(commit.commit, "abc123");
        assert_eq!(commit.webhook_data.as_ref().unwrap().id, 55);
    }

    #[tokio::test]
    async fn test_resolve_sensor_down() {
        let (persistence, _) = setup();
        persistence.insert_material(sample_material(1, 7));

        let resolver = MaterialResolver::new(persistence, Arc::new(MockGitSensor::failing()));
        let err = resolver.resolve(7, &[]).await.unwrap_err();
        assert_eq!(err.error_code(), "GIT_SENSOR_ERROR");
    }

    #[tokio::test]
    async fn test_webhook_resolution_uses_last_seen_heads() {
        let (persistence, sensor) = setup();
        persistence.insert_material(sample_material(1, 7));
        let mut sibling = sample_material(2, 7);
        sibling.last_seen_hash = "feedface".to_string();
        persistence.insert_material(sibling);

        let resolver = MaterialResolver::new(persistence.clone(), sensor);
        let commit = sample_commit();
        let resolved = resolver.resolve_for_webhook(7, 1, &commit).await.unwrap();

        assert_eq!(resolved.commits[&1].commit, commit.commit);
        assert_eq!(resolved.commits[&2].commit, "feedface");

        // The delivered commit becomes the event material's new head.
        let updated = persistence.find_material(1).await.unwrap().unwrap();
        assert_eq!(updated.last_seen_hash, commit.commit);
    }

    #[tokio::test]
    async fn test_webhook_resolution_falls_back_to_sensor() {
        let (persistence, sensor) = setup();
        persistence.insert_material(sample_material(1, 7));
        persistence.insert_material(sample_material(2, 7));
        sensor.set_commit(2, sample_commit());

        let resolver = MaterialResolver::new(persistence, sensor);
        let resolved = resolver
            .resolve_for_webhook(7, 1, &sample_commit())
            .await
            .unwrap();
        assert_eq!(resolved.commits[&2].commit, sample_commit().commit);
    }

    #[tokio::test]
    async fn test_sequence_guard_rejects_older_commit_while_in_flight() {
        let (persistence, sensor) = setup();
        let material = sample_material(1, 7);
        persistence.insert_material(material.clone());

        let mut in_flight = sample_workflow(0, 7);
        in_flight.status = WorkflowStatus::Running;
        let newer = sample_commit();
        in_flight.git_triggers.insert(1, newer.clone());
        persistence.save_workflow(&in_flight).await.unwrap();

        let mut older = sample_commit();
        older.date = newer.date.map(|d| d - Duration::hours(2));

        let resolver = MaterialResolver::new(persistence, sensor);
        let mut commits = BTreeMap::new();
        commits.insert(1, older);

        let err = resolver
            .validate_sequence(7, std::slice::from_ref(&material), &commits)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "STALE_COMMIT");
        assert_eq!(err.http_status(), 412);
    }

    #[tokio::test]
    async fn test_sequence_guard_passes_when_last_build_finished() {
        let (persistence, sensor) = setup();
        let material = sample_material(1, 7);
        persistence.insert_material(material.clone());

        let mut finished = sample_workflow(0, 7);
        finished.status = WorkflowStatus::Succeeded;
        finished.git_triggers.insert(1, sample_commit());
        persistence.save_workflow(&finished).await.unwrap();

        let mut older = sample_commit();
        older.date = Some(Utc::now() - Duration::days(30));

        let resolver = MaterialResolver::new(persistence, sensor);
        let mut commits = BTreeMap::new();
        commits.insert(1, older);

        resolver
            .validate_sequence(7, std::slice::from_ref(&material), &commits)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sequence_guard_ignores_non_branch_materials() {
        let (persistence, sensor) = setup();
        let mut material = sample_material(1, 7);
        material.source_type = SourceType::TagAny;
        persistence.insert_material(material.clone());

        let mut in_flight = sample_workflow(0, 7);
        in_flight.status = WorkflowStatus::Running;
        in_flight.git_triggers.insert(1, sample_commit());
        persistence.save_workflow(&in_flight).await.unwrap();

        let mut older = sample_commit();
        older.date = Some(Utc::now() - Duration::days(30));

        let resolver = MaterialResolver::new(persistence, sensor);
        let mut commits = BTreeMap::new();
        commits.insert(1, older);

        resolver
            .validate_sequence(7, std::slice::from_ref(&material), &commits)
            .await
            .unwrap();
    }
}
