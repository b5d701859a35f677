//! Configuration for mediaflow processes.
//!
//! Settings come from three layers, later ones winning: built-in defaults, a
//! TOML file, and `MEDIAFLOW_*` environment variables (optionally seeded from
//! a `.env` file). The merged result passes through guard rails that reject
//! unusable settings and collect warnings for questionable ones.
#![allow(missing_docs)]

pub mod loader;
pub mod models;
pub mod sources;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{AppConfig, ConfigMetadata, LoggingConfig};
pub use sources::{EnvConfig, FileConfig};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings, apply_guard_rails};
