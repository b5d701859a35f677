use std::path::PathBuf;
use std::time::Duration;

use mediaflow_core::orchestration::OrchestratorConfig;
use serde::{Deserialize, Serialize};

use crate::loader::ConfigLoadError;

/// Raw configuration as defined in a TOML file.
///
/// Orchestrator sections (`[quota]`, `[retry]`, `[[pipelines]]`, ...) sit at
/// the top level next to `[logging]`.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileConfig {
    #[serde(flatten)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub logging: FileLoggingConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileLoggingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

pub const ENV_CONFIG_PATH: &str = "MEDIAFLOW_CONFIG";
pub const ENV_DATABASE_URL: &str = "MEDIAFLOW_DATABASE_URL";
pub const ENV_MAX_ACTIVE_TASKS: &str = "MEDIAFLOW_MAX_ACTIVE_TASKS_PER_USER";
pub const ENV_WORKERS: &str = "MEDIAFLOW_WORKERS";
pub const ENV_STALENESS: &str = "MEDIAFLOW_STALENESS";
pub const ENV_MAINTENANCE_INTERVAL: &str = "MEDIAFLOW_MAINTENANCE_INTERVAL";
pub const ENV_LOG: &str = "MEDIAFLOW_LOG";

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub database_url: Option<String>,
    pub max_active_tasks_per_user: Option<u32>,
    pub workers: Option<usize>,
    pub staleness: Option<Duration>,
    pub maintenance_interval: Option<Duration>,
    pub log_filter: Option<String>,
}

impl EnvConfig {
    /// Reads the process environment.
    pub fn gather() -> Result<Self, ConfigLoadError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the overlay from any variable source. Blank values count as
    /// unset; malformed numbers or durations are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigLoadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|raw| raw.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        Ok(Self {
            config_path: var(ENV_CONFIG_PATH).map(PathBuf::from),
            database_url: var(ENV_DATABASE_URL),
            max_active_tasks_per_user: parse_number(ENV_MAX_ACTIVE_TASKS, var(ENV_MAX_ACTIVE_TASKS))?,
            workers: parse_number(ENV_WORKERS, var(ENV_WORKERS))?,
            staleness: parse_duration(ENV_STALENESS, var(ENV_STALENESS))?,
            maintenance_interval: parse_duration(
                ENV_MAINTENANCE_INTERVAL,
                var(ENV_MAINTENANCE_INTERVAL),
            )?,
            log_filter: var(ENV_LOG),
        })
    }
}

fn parse_number<T>(var: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigLoadError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|value| {
        value.parse::<T>().map_err(|err| ConfigLoadError::InvalidEnv {
            var,
            reason: format!("`{value}` is not a valid number: {err}"),
        })
    })
    .transpose()
}

fn parse_duration(var: &'static str, raw: Option<String>) -> Result<Option<Duration>, ConfigLoadError> {
    raw.map(|value| {
        humantime::parse_duration(&value).map_err(|err| ConfigLoadError::InvalidEnv {
            var,
            reason: format!("`{value}` is not a valid duration: {err}"),
        })
    })
    .transpose()
}
