//! Deployment configuration
//!
//! Configuration management for the deployment engine using Figment.
//!
//! # Configuration Sources
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `RUSTTSP_`
//! 2. TOML configuration file (default: `config/deploy.toml`)
//!
//! # Example
//!
//! ```no_run
//! use rust_tsp::config::DeployConfig;
//!
//! // Load from default location
//! let config = DeployConfig::load()?;
//!
//! // Or load from custom location
//! let config = DeployConfig::load_from("custom/path.toml")?;
//!
//! println!("Log level: {}", config.application.log_level);
//! println!("Legacy scripts: {}", config.legacy_scripts.len());
//! # Ok::<(), rust_tsp::config::ConfigError>(())
//! ```

pub mod deploy_config;

pub use deploy_config::{
    ApplicationConfig, ConfigError, DeployConfig, LegacyScriptDefinition, MaintenanceConfig,
    PacingConfig, ResourceConfig, ResourceFormat, ScriptDefinition, DEFAULT_CONFIG_PATH,
};
