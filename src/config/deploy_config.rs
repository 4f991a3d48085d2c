//! Deployment configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/deploy.toml` (base configuration)
//! 2. Environment variables (prefixed with `RUSTTSP_`)
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore, since key names contain
//! single underscores:
//!
//! ```text
//! RUSTTSP_APPLICATION__LOG_LEVEL=debug
//! RUSTTSP_PACING__LINE_DELAY_MS=5
//! RUSTTSP_RESOURCES__ROOT=/opt/tsp/resources
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rust_tsp::config::DeployConfig;
//!
//! let config = DeployConfig::load()?;
//! println!("Scripts: {}", config.scripts.len());
//! # Ok::<(), rust_tsp::config::ConfigError>(())
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::DEFAULT_SCRIPT_EXTENSION;
use crate::codec::ScriptFormat;
use crate::maintenance::DEFAULT_DEBUG_EXTENSION;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/deploy.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be read or parsed.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// A loaded value is out of range or inconsistent.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level deployment configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Delays between transport calls
    #[serde(default)]
    pub pacing: PacingConfig,
    /// Read-parse-write settings
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    /// Resource directory settings
    #[serde(default)]
    pub resources: ResourceConfig,
    /// Release catalog
    #[serde(default)]
    pub scripts: Vec<ScriptDefinition>,
    /// Script names shipped by earlier releases
    #[serde(default)]
    pub legacy_scripts: Vec<LegacyScriptDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Transport pacing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Pause after commands that change a node's catalog
    #[serde(default)]
    pub command_delay_ms: u64,
    /// Pause between lines of an uploaded script
    #[serde(default)]
    pub line_delay_ms: u64,
}

/// Read-parse-write configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Extension appended to trimmed files
    #[serde(default = "default_debug_extension")]
    pub debug_extension: String,
    /// Extension of script files
    #[serde(default = "default_script_extension")]
    pub script_extension: String,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            debug_extension: default_debug_extension(),
            script_extension: default_script_extension(),
        }
    }
}

/// Resource directory configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Directory holding `{namespace}.{folder}.{file}` resources
    #[serde(default)]
    pub root: Option<PathBuf>,
}

/// Storage format of a resource file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceFormat {
    /// Plain text source.
    #[default]
    Plain,
    /// Byte code.
    Binary,
    /// Compressed plain text.
    Compressed,
    /// Compressed byte code.
    CompressedBinary,
}

impl From<ResourceFormat> for ScriptFormat {
    fn from(format: ResourceFormat) -> Self {
        match format {
            ResourceFormat::Plain => ScriptFormat::empty(),
            ResourceFormat::Binary => ScriptFormat::BINARY,
            ResourceFormat::Compressed => ScriptFormat::COMPRESSED,
            ResourceFormat::CompressedBinary => ScriptFormat::BINARY | ScriptFormat::COMPRESSED,
        }
    }
}

/// One script of the release catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptDefinition {
    /// Script name on the instrument
    pub name: String,
    /// Models the script applies to (empty = all)
    #[serde(default)]
    pub model_mask: String,
    /// Folder holding the script and resource files
    #[serde(default)]
    pub folder: PathBuf,
    /// Script file name
    #[serde(default)]
    pub file_name: String,
    /// Resource file name
    #[serde(default)]
    pub resource_file_name: String,
    /// Resource file format
    #[serde(default)]
    pub resource_format: ResourceFormat,
    /// Released version; a leading `+` requests a read-parse-write pass
    #[serde(default)]
    pub released_version: String,
    /// Function returning the embedded version, e.g. `isr.version`
    #[serde(default)]
    pub version_getter: String,
    /// Comma-separated namespaces defined by the script
    #[serde(default)]
    pub namespaces: String,
    /// Runs at power-up.
    #[serde(default)]
    pub boot: bool,
    /// Part of the primary program.
    #[serde(default)]
    pub primary: bool,
    /// Library used by other scripts.
    #[serde(default)]
    pub support: bool,
    /// Ships as byte code (reported only).
    #[serde(default)]
    pub save_as_binary: bool,
    /// Save to non-volatile memory.
    #[serde(default)]
    pub embed: bool,
    /// Convert to byte code before saving.
    #[serde(default)]
    pub convert_to_byte_code: bool,
}

/// A script name to remove from nodes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyScriptDefinition {
    /// Script name.
    pub name: String,
    /// Model mask the name was shipped for.
    #[serde(default)]
    pub model_mask: String,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "rust_tsp".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_debug_extension() -> String {
    DEFAULT_DEBUG_EXTENSION.to_string()
}

fn default_script_extension() -> String {
    DEFAULT_SCRIPT_EXTENSION.to_string()
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl DeployConfig {
    /// Load configuration from `config/deploy.toml` and environment variables
    ///
    /// Environment variables take precedence over the file. The result is
    /// validated before it is returned.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be loaded or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::extract(
            Figment::new()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("RUSTTSP_").split("__")),
        )
    }

    /// Parse configuration from TOML text, without environment overrides
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Self::extract(Figment::new().merge(Toml::string(text)))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(ConfigError::LoadError)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Extensions start with `.`
    /// - Script names are not empty
    /// - Name and model mask pairs are unique
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        for (key, extension) in [
            ("debug_extension", &self.maintenance.debug_extension),
            ("script_extension", &self.maintenance.script_extension),
        ] {
            if !extension.starts_with('.') {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid {key} '{extension}'. Must start with '.'"
                )));
            }
        }

        let mut keys = HashSet::new();
        for script in &self.scripts {
            if script.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Script definition with empty name".to_string(),
                ));
            }
            if !keys.insert((script.name.as_str(), script.model_mask.as_str())) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate script: '{}' with mask '{}'",
                    script.name, script.model_mask
                )));
            }
        }

        let mut legacy_keys = HashSet::new();
        for script in &self.legacy_scripts {
            if script.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Legacy script definition with empty name".to_string(),
                ));
            }
            if !legacy_keys.insert((script.name.as_str(), script.model_mask.as_str())) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate legacy script: '{}' with mask '{}'",
                    script.name, script.model_mask
                )));
            }
        }

        Ok(())
    }

    /// Scripts that apply to a model
    pub fn scripts_for_model(&self, model_number: &str) -> Vec<&ScriptDefinition> {
        self.scripts
            .iter()
            .filter(|s| crate::model_mask::matches(model_number, &s.model_mask))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(name: &str, mask: &str) -> ScriptDefinition {
        ScriptDefinition {
            name: name.to_string(),
            model_mask: mask.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_validation_valid() {
        let config = DeployConfig {
            scripts: vec![script("isr_support", "260%*"), script("isr_support", "27*")],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = DeployConfig::default();
        config.application.log_level = "invalid".to_string();

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_invalid_extension() {
        let mut config = DeployConfig::default();
        config.maintenance.debug_extension = "debug".to_string();

        let result = config.validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid debug_extension"));
    }

    #[test]
    fn test_duplicate_scripts() {
        let config = DeployConfig {
            scripts: vec![script("isr_support", "26*"), script("isr_support", "26*")],
            ..Default::default()
        };

        let result = config.validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Duplicate script"));
    }

    #[test]
    fn test_empty_script_name() {
        let config = DeployConfig {
            scripts: vec![script(" ", "")],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_str() {
        let config = DeployConfig::from_toml_str(
            r#"
            [application]
            log_level = "debug"

            [[scripts]]
            name = "isr_support"
            model_mask = "260%*"
            resource_format = "compressed_binary"
            released_version = "+2.1.0"
            embed = true

            [[legacy_scripts]]
            name = "isr_old"
            "#,
        )
        .unwrap();

        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.maintenance.debug_extension, ".debug");
        assert_eq!(config.scripts.len(), 1);
        assert_eq!(
            ScriptFormat::from(config.scripts[0].resource_format),
            ScriptFormat::BINARY | ScriptFormat::COMPRESSED
        );
        assert_eq!(config.scripts_for_model("2602A").len(), 1);
        assert!(config.scripts_for_model("2701A").is_empty());
        assert_eq!(config.legacy_scripts[0].name, "isr_old");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.toml");
        std::fs::write(&path, "[pacing]\nline_delay_ms = 5\n").unwrap();

        let config = DeployConfig::load_from(&path).unwrap();
        assert_eq!(config.pacing.line_delay_ms, 5);
        assert_eq!(config.application.log_level, "info");
    }
}
