use std::path::PathBuf;

use mediaflow_core::orchestration::OrchestratorConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LOG_FILTER: &str = "info,sqlx=warn";

/// Fully resolved configuration for a mediaflow process.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub metadata: ConfigMetadata,
    pub orchestrator: OrchestratorConfig,
    pub logging: LoggingConfig,
}

/// Where the configuration came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing-subscriber` filter directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}
