// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image tag derivation and custom tag reservations.
//!
//! Every build gets a deterministic tag derived from its commits unless the
//! pipeline carries an enabled custom tag pattern, in which case the pattern
//! wins and the resulting image path is reserved globally before submit.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::error::{CoreError, Result};
use crate::model::{
    GitCommit, WEBHOOK_EVENT_MERGED, WEBHOOK_SELECTOR_SOURCE_CHECKOUT,
    WEBHOOK_SELECTOR_TARGET_CHECKOUT,
};
use crate::persistence::Persistence;

/// Custom tag entity kind for build pipelines.
pub const ENTITY_CI_PIPELINE: i32 = 1;

/// Commits are abbreviated to this many characters in tags.
const COMMIT_TAG_LEN: usize = 8;

/// Docker enforces this tag length limit.
const MAX_TAG_LEN: usize = 128;

/// First 8 characters of a commit hash, or the whole hash when shorter.
fn truncated(commit: &str) -> &str {
    if commit.len() > COMMIT_TAG_LEN {
        &commit[..COMMIT_TAG_LEN]
    } else {
        commit
    }
}

fn append_part(tag: &mut String, part: &str) {
    if !tag.is_empty() {
        tag.push('-');
    }
    tag.push_str(part);
}

/// Derive the deterministic image tag for a set of trigger commits.
///
/// Plain commits contribute their abbreviated hash. Merged webhook events
/// contribute the abbreviated target and source heads. Tag-push events
/// contribute the abbreviated target head, unless `use_provider_tag` is set,
/// in which case the provider's value is used verbatim and the trailing
/// `-{pipelineId}-{workflowId}` suffix is suppressed. Slashes are rewritten
/// to underscores at the very end, after the suffix.
pub fn build_image_tag(
    commits: &BTreeMap<i32, GitCommit>,
    pipeline_id: i32,
    workflow_id: i32,
    use_provider_tag: bool,
) -> String {
    let mut tag = String::new();
    let mut append_ids = true;

    for commit in commits.values() {
        match &commit.webhook_data {
            None => {
                if !commit.commit.is_empty() {
                    append_part(&mut tag, truncated(&commit.commit));
                }
            }
            Some(webhook) => {
                let Some(target) = webhook
                    .data
                    .get(WEBHOOK_SELECTOR_TARGET_CHECKOUT)
                    .filter(|v| !v.is_empty())
                else {
                    continue;
                };
                if webhook.event_action_type == WEBHOOK_EVENT_MERGED {
                    append_part(&mut tag, truncated(target));
                    if let Some(source) = webhook
                        .data
                        .get(WEBHOOK_SELECTOR_SOURCE_CHECKOUT)
                        .filter(|v| !v.is_empty())
                    {
                        append_part(&mut tag, truncated(source));
                    }
                } else if use_provider_tag {
                    append_part(&mut tag, target);
                    append_ids = false;
                } else {
                    append_part(&mut tag, truncated(target));
                }
            }
        }
    }

    if !tag.is_empty() && append_ids {
        tag = format!("{}-{}-{}", tag, pipeline_id, workflow_id);
    }
    tag.replace('/', "_")
}

/// Whether a string is a valid docker image tag.
pub fn is_valid_tag(tag: &str) -> bool {
    if tag.is_empty() || tag.len() > MAX_TAG_LEN {
        return false;
    }
    let mut chars = tag.chars();
    let first = chars.next().unwrap_or(' ');
    if !(first.is_ascii_alphanumeric() || first == '_') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Join registry URL, repository, and tag into a fully qualified image path.
pub fn image_path(registry_url: &str, repository: &str, tag: &str) -> String {
    format!("{}/{}:{}", registry_url.trim_end_matches('/'), repository, tag)
}

/// The custom tag applied to a build, when one is configured.
#[derive(Debug, Clone)]
pub struct ResolvedTag {
    /// The tag to build with.
    pub tag: String,
    /// Reservation held for the tag's image path, absent for deterministic tags.
    pub reservation_id: Option<i32>,
}

/// Resolves custom tag patterns and reserves the produced image paths.
pub struct CustomTagService {
    persistence: Arc<dyn Persistence>,
}

impl CustomTagService {
    /// Create the service.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Resolve the tag for a build.
    ///
    /// Pipelines without an enabled custom tag get `fallback_tag` and no
    /// reservation. With a custom tag, the counter is claimed, the pattern is
    /// materialized, and the image path is reserved; a conflict propagates as
    /// [`CoreError::ImagePathInUse`].
    #[instrument(skip(self), fields(pipeline_id = pipeline_id))]
    pub async fn resolve(
        &self,
        pipeline_id: i32,
        registry_url: &str,
        repository: &str,
        fallback_tag: &str,
    ) -> Result<ResolvedTag> {
        let Some(custom_tag) = self
            .persistence
            .find_custom_tag(ENTITY_CI_PIPELINE, &pipeline_id.to_string())
            .await?
        else {
            return Ok(ResolvedTag {
                tag: fallback_tag.to_string(),
                reservation_id: None,
            });
        };

        let counter = self
            .persistence
            .next_custom_tag_value(custom_tag.id)
            .await?;
        let tag = custom_tag.tag_pattern.replace("{x}", &counter.to_string());
        if !is_valid_tag(&tag) {
            return Err(CoreError::ValidationError {
                field: "tagPattern".to_string(),
                message: format!("pattern '{}' produced invalid tag '{}'", custom_tag.tag_pattern, tag),
            });
        }

        let path = image_path(registry_url, repository, &tag);
        let reservation_id = self
            .persistence
            .reserve_image_path(custom_tag.id, &path)
            .await?;
        debug!(tag = %tag, reservation_id, "custom tag reserved");

        Ok(ResolvedTag {
            tag,
            reservation_id: Some(reservation_id),
        })
    }

    /// Reserve an image path not backed by a custom tag, e.g. a copy plugin
    /// destination.
    pub async fn reserve_destination(&self, path: &str) -> Result<i32> {
        self.persistence.reserve_image_path(0, path).await
    }

    /// Release reservations held by a workflow.
    pub async fn release(&self, reservation_ids: &[i32]) -> Result<()> {
        if reservation_ids.is_empty() {
            return Ok(());
        }
        self.persistence
            .deactivate_reservations(reservation_ids)
            .await
    }
}
