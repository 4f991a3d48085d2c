//! Firmware scripts: catalog descriptors, per-node instances and collections.

pub mod collection;
pub mod descriptor;
pub mod instance;

pub use collection::{RunReport, ScriptInstanceCollection};
pub use descriptor::FirmwareScriptDescriptor;
pub use instance::{CatalogView, ScriptInstance};
