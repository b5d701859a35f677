use std::fs;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::debug;

use crate::models::{AppConfig, ConfigMetadata, LoggingConfig};
use crate::sources::{EnvConfig, FileConfig};
use crate::validation::{self, ConfigGuardRailError, ConfigWarnings};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("mediaflow.toml"),
        PathBuf::from("config/mediaflow.toml"),
    ]
});

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: AppConfig,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Loads `.env`, the process environment and the config file, then
    /// applies guard rails.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = self.load_env_file()?;
        let env = EnvConfig::gather()?;
        self.load_with_env(env, env_file_loaded)
    }

    /// Like [`load`](Self::load) but with an explicit environment overlay;
    /// the process environment is not consulted.
    pub fn load_with_env(&self, env: EnvConfig, env_file_loaded: bool) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;
        self.compose_config(file_config, env, config_path, env_file_loaded)
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        let loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };
        Ok(loaded)
    }

    fn load_file_config(&self, env: &EnvConfig) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        // An explicitly named file must exist; default locations are optional.
        let explicit = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());

        let path = match explicit {
            Some(path) if !path.exists() => return Err(ConfigLoadError::MissingConfig { path }),
            Some(path) => path,
            None => match DEFAULT_CONFIG_LOCATIONS.iter().find(|candidate| candidate.exists()) {
                Some(path) => path.clone(),
                None => return Ok((None, None)),
            },
        };

        let contents = fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let file_config: FileConfig = toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
            path: path.clone(),
            source,
        })?;

        debug!(target: "mediaflow::config", path = %path.display(), "configuration file loaded");
        Ok((Some(file_config), Some(path)))
    }

    fn compose_config(
        &self,
        file_config: Option<FileConfig>,
        env: EnvConfig,
        config_path: Option<PathBuf>,
        env_file_loaded: bool,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let mut warnings = ConfigWarnings::default();
        if file_config.is_none() {
            warnings.push_with_hint(
                "No mediaflow.toml detected; using defaults and environment variables",
                "Create mediaflow.toml or pass --config to customise pipelines and quotas",
            );
        }

        let FileConfig {
            orchestrator: mut orchestrator,
            logging: file_logging,
        } = file_config.unwrap_or_default();

        orchestrator.storage.database_url = env
            .database_url
            .or(orchestrator.storage.database_url)
            .filter(|url| !url.trim().is_empty());
        if let Some(limit) = env.max_active_tasks_per_user {
            orchestrator.quota.default_limit = limit;
        }
        if let Some(workers) = env.workers {
            orchestrator.workers.parallelism = workers;
        }
        if let Some(staleness) = env.staleness {
            orchestrator.maintenance.staleness_secs = staleness.as_secs();
        }
        if let Some(interval) = env.maintenance_interval {
            orchestrator.maintenance.interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        }

        let logging = LoggingConfig {
            filter: env
                .log_filter
                .or(file_logging.filter)
                .unwrap_or_else(|| LoggingConfig::default().filter),
        };

        let config = AppConfig {
            metadata: ConfigMetadata {
                config_path,
                env_file_loaded,
            },
            orchestrator,
            logging,
        };

        warnings.extend(validation::apply_guard_rails(&config)?);
        Ok(ConfigLoad { config, warnings })
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: {reason}")]
    InvalidEnv { var: &'static str, reason: String },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}
