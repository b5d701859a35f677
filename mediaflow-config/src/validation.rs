use std::collections::HashSet;

use mediaflow_core::model::{ModelError, OwnerId, TemplateId};
use mediaflow_core::orchestration::OrchestratorConfig;
use thiserror::Error;

use crate::models::AppConfig;

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("default active task limit must be at least 1")]
    ZeroDefaultLimit,
    #[error("active task limit override for owner {owner_id} must be at least 1")]
    ZeroOverride { owner_id: OwnerId },
    #[error("no pipeline templates configured")]
    NoPipelines,
    #[error("pipeline template {id} is defined more than once")]
    DuplicatePipeline { id: TemplateId },
    #[error(transparent)]
    InvalidPipeline(#[from] ModelError),
    #[error("{field} {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }
}

fn must_be_positive(field: &'static str, value: u64) -> Result<(), ConfigGuardRailError> {
    if value == 0 {
        return Err(ConfigGuardRailError::InvalidSetting {
            field,
            reason: "must be greater than zero".into(),
        });
    }
    Ok(())
}

pub fn apply_guard_rails(config: &AppConfig) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let orchestrator = &config.orchestrator;
    let mut warnings = ConfigWarnings::default();

    validate_quota(orchestrator)?;
    validate_pipelines(orchestrator)?;
    validate_runtime(orchestrator)?;

    let longest_timeout = orchestrator
        .pipelines
        .iter()
        .map(|template| template.longest_timeout())
        .max()
        .unwrap_or_default();
    if orchestrator.maintenance.staleness() <= longest_timeout {
        warnings.push_with_hint(
            format!(
                "maintenance.staleness_secs ({}s) does not exceed the longest stage timeout ({}s)",
                orchestrator.maintenance.staleness_secs,
                longest_timeout.as_secs()
            ),
            "Healthy attempts may be failed as stalled; raise MEDIAFLOW_STALENESS",
        );
    }

    if orchestrator.retry.backoff_max() >= orchestrator.maintenance.staleness() {
        warnings.push_with_hint(
            format!(
                "retry.backoff_max_ms ({}ms) is not below maintenance.staleness_secs ({}s)",
                orchestrator.retry.backoff_max_ms, orchestrator.maintenance.staleness_secs
            ),
            "Tasks waiting out a long backoff may be failed as stalled; lower retry.backoff_max_ms or raise MEDIAFLOW_STALENESS",
        );
    }

    if orchestrator.storage.database_url.is_none() {
        warnings.push_with_hint(
            "No database configured; task state will not survive a restart",
            "Set MEDIAFLOW_DATABASE_URL (e.g. sqlite://mediaflow.db) or storage.database_url",
        );
    }

    if orchestrator.retry.jitter_seed.is_some() {
        warnings.push("retry.jitter_seed is set; backoff delays are deterministic");
    }

    Ok(warnings)
}

fn validate_quota(config: &OrchestratorConfig) -> Result<(), ConfigGuardRailError> {
    if config.quota.default_limit == 0 {
        return Err(ConfigGuardRailError::ZeroDefaultLimit);
    }
    if let Some((owner_id, _)) = config.quota.overrides.iter().find(|(_, limit)| **limit == 0) {
        return Err(ConfigGuardRailError::ZeroOverride {
            owner_id: owner_id.clone(),
        });
    }
    Ok(())
}

fn validate_pipelines(config: &OrchestratorConfig) -> Result<(), ConfigGuardRailError> {
    if config.pipelines.is_empty() {
        return Err(ConfigGuardRailError::NoPipelines);
    }

    let mut seen = HashSet::new();
    for template in &config.pipelines {
        template.validate()?;
        if !seen.insert(&template.id) {
            return Err(ConfigGuardRailError::DuplicatePipeline {
                id: template.id.clone(),
            });
        }
    }
    Ok(())
}

fn validate_runtime(config: &OrchestratorConfig) -> Result<(), ConfigGuardRailError> {
    must_be_positive("workers.parallelism", config.workers.parallelism as u64)?;
    must_be_positive("workers.queue_capacity", config.workers.queue_capacity as u64)?;
    must_be_positive("progress.subscriber_buffer", config.progress.subscriber_buffer as u64)?;
    must_be_positive("maintenance.interval_ms", config.maintenance.interval_ms)?;
    must_be_positive("maintenance.staleness_secs", config.maintenance.staleness_secs)?;
    must_be_positive(
        "maintenance.attempt_history_limit",
        config.maintenance.attempt_history_limit as u64,
    )?;
    must_be_positive("storage.max_connections", u64::from(config.storage.max_connections))?;

    let retry = &config.retry;
    if retry.backoff_base_ms > retry.backoff_max_ms {
        return Err(ConfigGuardRailError::InvalidSetting {
            field: "retry.backoff_base_ms",
            reason: format!(
                "({}) must not exceed retry.backoff_max_ms ({})",
                retry.backoff_base_ms, retry.backoff_max_ms
            ),
        });
    }
    if !(0.0..=1.0).contains(&retry.jitter_ratio) {
        return Err(ConfigGuardRailError::InvalidSetting {
            field: "retry.jitter_ratio",
            reason: format!("({}) must be between 0 and 1", retry.jitter_ratio),
        });
    }
    Ok(())
}
