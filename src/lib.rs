//! Firmware script deployment for TSP instrument networks.
//!
//! This library decides, for every node of an instrument network and every
//! script of a release catalog, whether the node already holds a current copy in
//! the right format, and drives the upload, embed, run and delete steps needed to
//! bring it into line. It is used by the `rust_tsp` command-line tool.
//!
//! The transport that talks to the instrument is injected per call through the
//! [`transport::ScriptTransport`] trait; [`transport::SimulatedTransport`] stands
//! in for hardware in tests and dry runs.

pub mod catalog;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod maintenance;
pub mod model_mask;
pub mod node;
pub mod script;
pub mod transport;
pub mod version;

pub use coordinator::DeploymentCoordinator;
pub use error::{DeployError, DeployResult};
pub use node::NodeIdentity;
pub use script::{FirmwareScriptDescriptor, RunReport, ScriptInstance, ScriptInstanceCollection};
pub use version::{FirmwareVersion, VersionStatus};
