// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Assembly of hook stage steps into an executable task list.
//!
//! Pipelines carry structured pre and post build steps, or legacy shell
//! script hooks on older installations. Assembly resolves runtime variables,
//! pulls in referenced plugins, and expands the copy container image plugin
//! into registry destinations with credentials and path reservations.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::error::{CoreError, Result};
use crate::image_tag::CustomTagService;
use crate::model::{
    COPY_CONTAINER_IMAGE_PLUGIN, DESTINATION_INFO_VARIABLE, RefPluginObject, RegistryCredentials,
    RegistryType, RuntimeParameters, STAGE_POST_CI, STAGE_PRE_CI, StepObject, StepVariable,
};
use crate::persistence::{Persistence, ScriptRecord, StepRecord};
use crate::registry::{RegistryAccount, RegistryClient};

/// Step type for directly scripted steps.
pub const STEP_TYPE_INLINE: &str = "INLINE";
/// Step type for steps delegating to a plugin version.
pub const STEP_TYPE_REF_PLUGIN: &str = "REF_PLUGIN";

/// Legacy script stage preceding the image build.
const LEGACY_STAGE_BEFORE: &str = "BEFORE_DOCKER_BUILD";

/// Variable source resolved from the trigger request.
const VALUE_TYPE_RUNTIME: &str = "RUNTIME";
/// Variable source resolved by the runner from build globals.
const VALUE_TYPE_GLOBAL: &str = "GLOBAL";

/// Credential map key carrying the build registry for copy plugin pulls.
pub const SOURCE_REGISTRY_CREDENTIAL_KEY: &str = "SOURCE_REGISTRY_CREDENTIAL";

/// Everything the hook stages contribute to a workflow request.
#[derive(Debug, Default)]
pub struct AssembledStages {
    /// Steps to run before the image build.
    pub pre_ci_steps: Vec<StepObject>,
    /// Steps to run after the image build.
    pub post_ci_steps: Vec<StepObject>,
    /// Plugins referenced by any step, deduplicated.
    pub ref_plugins: Vec<RefPluginObject>,
    /// Copy plugin destinations grouped by registry name.
    pub registry_destination_image_map: BTreeMap<String, Vec<String>>,
    /// Credentials for each destination registry.
    pub registry_credential_map: BTreeMap<String, RegistryCredentials>,
    /// Reservations claimed for copy destinations.
    pub destination_reservation_ids: Vec<i32>,
    /// Runtime variable values as resolved, for the audit snapshot.
    pub resolved_variables: BTreeMap<String, String>,
}

/// Parsed form of one copy plugin `DESTINATION_INFO` line.
#[derive(Debug, PartialEq, Eq)]
struct DestinationInfo {
    registry_name: String,
    repositories: Vec<String>,
}

/// Parse `DESTINATION_INFO` lines of the form `registry|repo1,repo2`.
fn parse_destination_info(value: &str) -> Result<Vec<DestinationInfo>> {
    let mut parsed = Vec::new();
    for line in value.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((registry, repos)) = line.split_once('|') else {
            return Err(CoreError::ValidationError {
                field: DESTINATION_INFO_VARIABLE.to_string(),
                message: format!("malformed destination line '{}'", line),
            });
        };
        let repositories: Vec<String> = repos
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect();
        if registry.trim().is_empty() || repositories.is_empty() {
            return Err(CoreError::ValidationError {
                field: DESTINATION_INFO_VARIABLE.to_string(),
                message: format!("malformed destination line '{}'", line),
            });
        }
        parsed.push(DestinationInfo {
            registry_name: registry.trim().to_string(),
            repositories,
        });
    }
    Ok(parsed)
}

/// Assembles hook stages for workflow submission.
pub struct StepAssembler {
    persistence: Arc<dyn Persistence>,
    registry: Arc<dyn RegistryClient>,
    custom_tags: Arc<CustomTagService>,
}

impl StepAssembler {
    /// Create the assembler.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        registry: Arc<dyn RegistryClient>,
        custom_tags: Arc<CustomTagService>,
    ) -> Self {
        Self {
            persistence,
            registry,
            custom_tags,
        }
    }

    /// Assemble both hook stages of a pipeline.
    ///
    /// `build_image` and `image_tag` describe the image this build will push;
    /// the copy plugin may not target it, nor any image the pipeline has
    /// already produced. `build_registry` is the registry the build pushes to,
    /// handed to the copy plugin as its pull credential.
    #[instrument(skip(self, runtime_params, build_registry), fields(pipeline_id = pipeline_id))]
    pub async fn assemble(
        &self,
        pipeline_id: i32,
        runtime_params: &RuntimeParameters,
        build_image: &str,
        image_tag: &str,
        build_registry: Option<&RegistryAccount>,
    ) -> Result<AssembledStages> {
        let mut out = AssembledStages::default();

        let pre = self
            .persistence
            .find_stage_steps(pipeline_id, STAGE_PRE_CI)
            .await?;
        let post = self
            .persistence
            .find_stage_steps(pipeline_id, STAGE_POST_CI)
            .await?;

        if pre.is_empty() && post.is_empty() {
            self.assemble_legacy(pipeline_id, &mut out).await?;
            return Ok(out);
        }

        for record in &pre {
            let step = self
                .convert_step(record, runtime_params, &mut out, true)
                .await?;
            out.pre_ci_steps.push(step);
        }
        for record in &post {
            let step = self
                .convert_step(record, runtime_params, &mut out, false)
                .await?;
            out.post_ci_steps.push(step);
        }

        self.expand_copy_destinations(build_image, image_tag, build_registry, &mut out)
            .await?;

        debug!(
            pre = out.pre_ci_steps.len(),
            post = out.post_ci_steps.len(),
            plugins = out.ref_plugins.len(),
            "stages assembled"
        );
        Ok(out)
    }

    async fn convert_step(
        &self,
        record: &StepRecord,
        runtime_params: &RuntimeParameters,
        out: &mut AssembledStages,
        pre_stage: bool,
    ) -> Result<StepObject> {
        let mut input_vars = Vec::with_capacity(record.input_vars.len());
        for var in &record.input_vars {
            input_vars.push(self.resolve_variable(var, runtime_params, out));
        }

        if record.step_type == STEP_TYPE_REF_PLUGIN {
            let plugin = self
                .persistence
                .find_plugin_version(record.ref_plugin_id)
                .await?
                .ok_or_else(|| CoreError::ValidationError {
                    field: "refPluginId".to_string(),
                    message: format!(
                        "step '{}' references missing plugin version {}",
                        record.name, record.ref_plugin_id
                    ),
                })?;
            if plugin.name == COPY_CONTAINER_IMAGE_PLUGIN && pre_stage {
                return Err(CoreError::ValidationError {
                    field: "preCiSteps".to_string(),
                    message: format!(
                        "plugin '{}' cannot run before the image is built",
                        COPY_CONTAINER_IMAGE_PLUGIN
                    ),
                });
            }
            if !out.ref_plugins.iter().any(|p| p.id == plugin.id) {
                out.ref_plugins.push(RefPluginObject {
                    id: plugin.id,
                    steps: plugin.steps.clone(),
                });
            }
        }

        Ok(StepObject {
            name: record.name.clone(),
            index: record.index,
            step_type: record.step_type.clone(),
            ref_plugin_id: record.ref_plugin_id,
            script: record.script.clone(),
            input_vars,
            output_vars: record.output_vars.clone(),
            artifact_paths: Vec::new(),
            output_directory_path: record.output_directory_paths.clone(),
        })
    }

    fn resolve_variable(
        &self,
        var: &StepVariable,
        runtime_params: &RuntimeParameters,
        out: &mut AssembledStages,
    ) -> StepVariable {
        let mut resolved = var.clone();
        if var.value_type == VALUE_TYPE_RUNTIME {
            if let Some(value) = runtime_params.env_variables.get(&var.name) {
                resolved.value = value.clone();
            }
            out.resolved_variables
                .insert(var.name.clone(), resolved.value.clone());
        }
        resolved
    }

    /// Expand each copy plugin step's destinations into concrete image paths.
    async fn expand_copy_destinations(
        &self,
        build_image: &str,
        image_tag: &str,
        build_registry: Option<&RegistryAccount>,
        out: &mut AssembledStages,
    ) -> Result<()> {
        let copy_plugin_ids: Vec<i32> = out
            .ref_plugins
            .iter()
            .map(|p| p.id)
            .collect();
        let mut destinations: Vec<String> = Vec::new();

        // Collect DESTINATION_INFO values from post steps referencing the
        // copy plugin. The plugin name check happened during conversion.
        let mut infos: Vec<DestinationInfo> = Vec::new();
        for step in &out.post_ci_steps {
            if step.step_type != STEP_TYPE_REF_PLUGIN
                || !copy_plugin_ids.contains(&step.ref_plugin_id)
            {
                continue;
            }
            if !self.is_copy_plugin(step.ref_plugin_id).await? {
                continue;
            }
            let Some(var) = step
                .input_vars
                .iter()
                .find(|v| v.name == DESTINATION_INFO_VARIABLE)
            else {
                continue;
            };
            infos.extend(parse_destination_info(&var.value)?);
        }

        for info in &infos {
            let account = self
                .registry
                .fetch_account(&info.registry_name)
                .await
                .map_err(|e| CoreError::RegistryError {
                    details: e.to_string(),
                })?;
            if account.registry_type == RegistryType::Ecr {
                for repo in &info.repositories {
                    self.registry
                        .ensure_ecr_repository(&account, repo)
                        .await
                        .map_err(|e| CoreError::RegistryError {
                            details: e.to_string(),
                        })?;
                }
            }
            let registry_destinations: Vec<String> = info
                .repositories
                .iter()
                .map(|repo| {
                    format!(
                        "{}/{}:{}",
                        account.registry_url.trim_end_matches('/'),
                        repo,
                        image_tag
                    )
                })
                .collect();
            out.registry_credential_map
                .insert(info.registry_name.clone(), account.credentials.clone());
            out.registry_destination_image_map
                .insert(info.registry_name.clone(), registry_destinations.clone());
            destinations.extend(registry_destinations);
        }

        if !infos.is_empty()
            && let Some(source) = build_registry
        {
            out.registry_credential_map.insert(
                SOURCE_REGISTRY_CREDENTIAL_KEY.to_string(),
                source.credentials.clone(),
            );
        }

        if let Some(destination) = destinations.iter().find(|d| *d == build_image) {
            warn!(destination = %destination, "copy destination collides with build image");
            return Err(CoreError::ImagePathInUse {
                image_path: destination.clone(),
            });
        }
        if !destinations.is_empty()
            && let Some(taken) = self
                .persistence
                .find_artifacts_by_image_paths(&destinations)
                .await?
                .into_iter()
                .next()
        {
            return Err(CoreError::ImagePathInUse { image_path: taken });
        }
        for destination in &destinations {
            let reservation_id = self.custom_tags.reserve_destination(destination).await?;
            out.destination_reservation_ids.push(reservation_id);
        }
        Ok(())
    }

    async fn is_copy_plugin(&self, plugin_version_id: i32) -> Result<bool> {
        Ok(self
            .persistence
            .find_plugin_version(plugin_version_id)
            .await?
            .is_some_and(|p| p.name == COPY_CONTAINER_IMAGE_PLUGIN))
    }

    /// Convert legacy script hooks into inline steps.
    ///
    /// Legacy scripts receive the build's image coordinates through global
    /// variables the runner resolves, matching what the old hook runner
    /// exported into the script environment.
    async fn assemble_legacy(&self, pipeline_id: i32, out: &mut AssembledStages) -> Result<()> {
        let scripts = self.persistence.find_legacy_scripts(pipeline_id).await?;
        for script in &scripts {
            let step = legacy_step(script);
            if script.stage == LEGACY_STAGE_BEFORE {
                out.pre_ci_steps.push(step);
            } else {
                out.post_ci_steps.push(step);
            }
        }
        Ok(())
    }
}

fn global_variable(name: &str) -> StepVariable {
    StepVariable {
        name: name.to_string(),
        format: "STRING".to_string(),
        value: String::new(),
        value_type: VALUE_TYPE_GLOBAL.to_string(),
    }
}

fn legacy_step(script: &ScriptRecord) -> StepObject {
    let artifact_paths = if script.output_location.is_empty() {
        Vec::new()
    } else {
        vec![script.output_location.clone()]
    };
    StepObject {
        name: script.name.clone(),
        index: script.index,
        step_type: STEP_TYPE_INLINE.to_string(),
        ref_plugin_id: 0,
        script: script.script.clone(),
        input_vars: vec![
            global_variable("DOCKER_IMAGE_TAG"),
            global_variable("DOCKER_REPOSITORY"),
            global_variable("DOCKER_REGISTRY_URL"),
            global_variable("DOCKER_IMAGE"),
        ],
        output_vars: Vec::new(),
        artifact_paths,
        output_directory_path: Vec::new(),
    }
}
