//! Error types for script deployment.
//!
//! This module defines the primary error type, `DeployError`, used by every
//! deployment workflow. Using the `thiserror` crate, it keeps the error classes of
//! the engine apart so callers can react to each one differently.
//!
//! ## Error Hierarchy
//!
//! - **Precondition violations** (`MissingValue`, `SourceNotLoaded`): a required
//!   value was empty or absent. Never retried.
//! - **State violations** (`ModelMismatch`, `DuplicateScript`, `NodeNotRegistered`,
//!   `ControllerNode`, `ScriptNotFound`): the deployment plan is misconfigured. A
//!   script whose model mask does not match its node is never silently skipped.
//! - **Resource-not-found** (`FileNotFound`, `ResourceNotFound`): kept apart from
//!   transport failures.
//! - **Transport and device errors** (`Transport`, `Device`): the transport
//!   collaborator failed, or the node reported an error after a command.
//! - **Parse/format errors** (`Codec`, `VersionParse`, `FileNotUsable`,
//!   `EmptyTrimResult`).
//! - **`ScriptRunFailed`**: a script raised an error while running; carries the
//!   action log of the failing instance.
//! - **`ScriptStepFailed`**: any other failure during a bulk load, save or run,
//!   tagged with the script it stopped at.
//!
//! Transport implementations return `anyhow::Result`; `#[from]` lets those errors
//! flow into `DeployError::Transport` with the `?` operator.

use std::path::PathBuf;

use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ConfigError;

/// Convenience alias for results using the deployment error type.
pub type DeployResult<T> = std::result::Result<T, DeployError>;

/// Errors raised by the deployment engine.
#[derive(Error, Debug)]
pub enum DeployError {
    /// A required value was empty.
    #[error("Missing required value: {0}")]
    MissingValue(&'static str),

    /// Upload was requested for a script whose source has not been loaded.
    #[error("Source for script '{0}' is not loaded")]
    SourceNotLoaded(String),

    /// A script was bound to a node whose model does not match its mask.
    #[error("Script '{script}' (mask '{mask}') does not apply to model '{model}'")]
    ModelMismatch {
        /// Script name.
        script: String,
        /// Model mask of the script.
        mask: String,
        /// Model number of the node.
        model: String,
    },

    /// Two scripts share the same name and model mask.
    #[error("Duplicate script entry: {0}")]
    DuplicateScript(String),

    /// No script collection has been registered for the node.
    #[error("No script collection registered for node {0}")]
    NodeNotRegistered(u8),

    /// A subordinate node was registered with the controller's node number.
    #[error("Node {0} is the controller node")]
    ControllerNode(u8),

    /// The named script is not part of the collection.
    #[error("Script '{0}' not found")]
    ScriptNotFound(String),

    /// A script file does not exist.
    #[error("Script file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// An embedded resource does not exist.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// A script file exists but is too short to hold a script.
    #[error("Script file '{}' is not usable ({len} bytes)", .path.display())]
    FileNotUsable {
        /// File path.
        path: PathBuf,
        /// File length in bytes.
        len: usize,
    },

    /// The trimmer produced nothing from a script file.
    #[error("Trimming '{}' produced an empty script", .0.display())]
    EmptyTrimResult(PathBuf),

    /// A version string could not be parsed.
    #[error("Invalid version string: '{0}'")]
    VersionParse(String),

    /// Encoding or decoding of script source failed.
    #[error("Script encoding error: {0}")]
    Codec(#[from] CodecError),

    /// Configuration could not be loaded or validated.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The transport collaborator failed.
    #[error("Transport error: {0}")]
    Transport(#[from] anyhow::Error),

    /// The node reported an error after a command.
    #[error("Device error on node {node}: {message}")]
    Device {
        /// Node number.
        node: u8,
        /// Message read from the error queue.
        message: String,
    },

    /// A script failed to run.
    #[error("Script '{name}' failed to run: {details}")]
    ScriptRunFailed {
        /// Script name.
        name: String,
        /// Action log of the failing instance.
        details: String,
    },

    /// A load, save or run step failed for a script.
    #[error("Step '{step}' of script '{name}' on node {node} failed: {source}")]
    ScriptStepFailed {
        /// Script name.
        name: String,
        /// Node number.
        node: u8,
        /// Workflow step that failed.
        step: &'static str,
        /// Underlying failure.
        #[source]
        source: Box<DeployError>,
    },

    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeployError::ModelMismatch {
            script: "isr_support".to_string(),
            mask: "260%*".to_string(),
            model: "2701A".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Script 'isr_support' (mask '260%*') does not apply to model '2701A'"
        );
    }

    #[test]
    fn test_transport_error_conversion() {
        fn fails() -> DeployResult<()> {
            Err(anyhow::anyhow!("session closed"))?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert!(matches!(err, DeployError::Transport(_)));
        assert!(err.to_string().contains("session closed"));
    }

    #[test]
    fn test_not_found_is_distinct() {
        let err = DeployError::FileNotFound(PathBuf::from("scripts/isr.tsp"));
        assert!(err.to_string().contains("scripts/isr.tsp"));
        assert!(!matches!(err, DeployError::Transport(_)));
    }

    #[test]
    fn test_step_failure_names_script() {
        let err = DeployError::ScriptStepFailed {
            name: "isr_meter".to_string(),
            node: 2,
            step: "load",
            source: Box::new(anyhow::anyhow!("session timeout").into()),
        };
        assert_eq!(
            err.to_string(),
            "Step 'load' of script 'isr_meter' on node 2 failed: Transport error: session timeout"
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
