//! A firmware script bound to one node.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{debug, info};

use super::descriptor::FirmwareScriptDescriptor;
use crate::codec;
use crate::error::{DeployError, DeployResult};
use crate::node::NodeIdentity;
use crate::transport::{self, commands, ScriptTransport};
use crate::version::VersionStatus;

/// Script names reported by a node's catalogs.
#[derive(Debug, Clone, Copy, Default)]
pub struct CatalogView<'a> {
    /// Non-volatile user-script catalog.
    pub embedded: &'a [String],
    /// Embedded scripts stored as byte code.
    pub saved: &'a [String],
    /// Scripts in runtime memory.
    pub loaded: &'a [String],
}

fn listed(names: &[String], name: &str) -> bool {
    names.iter().any(|n| n == name)
}

/// Runtime state of a descriptor on a node.
#[derive(Debug, Clone)]
pub struct ScriptInstance {
    descriptor: Arc<FirmwareScriptDescriptor>,
    node: Arc<NodeIdentity>,
    loaded: bool,
    activated: bool,
    embedded: bool,
    saved: bool,
    loaded_as_byte_code: bool,
    embedded_firmware_version: String,
    has_firmware_version_getter: bool,
    version_status: VersionStatus,
    requires_deletion: bool,
    last_actions: String,
}

impl ScriptInstance {
    /// Binds a descriptor to a node.
    ///
    /// # Errors
    /// `ModelMismatch` when the node model does not match the descriptor's mask.
    pub fn new(descriptor: Arc<FirmwareScriptDescriptor>, node: Arc<NodeIdentity>) -> DeployResult<Self> {
        if !descriptor.applies_to(node.model_number()) {
            return Err(DeployError::ModelMismatch {
                script: descriptor.name().to_string(),
                mask: descriptor.model_mask().to_string(),
                model: node.model_number().to_string(),
            });
        }
        Ok(Self {
            descriptor,
            node,
            loaded: false,
            activated: false,
            embedded: false,
            saved: false,
            loaded_as_byte_code: false,
            embedded_firmware_version: String::new(),
            has_firmware_version_getter: false,
            version_status: VersionStatus::None,
            requires_deletion: false,
            last_actions: String::new(),
        })
    }

    /// Catalog entry the instance was created from.
    pub fn descriptor(&self) -> &Arc<FirmwareScriptDescriptor> {
        &self.descriptor
    }

    /// Node the instance is bound to.
    pub fn node(&self) -> &Arc<NodeIdentity> {
        &self.node
    }

    /// Script name.
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// In runtime memory.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Has run since it was loaded.
    pub fn is_activated(&self) -> bool {
        self.activated
    }

    /// In the non-volatile catalog.
    pub fn is_embedded(&self) -> bool {
        self.embedded
    }

    /// Embedded in the form the catalog asks for.
    pub fn is_saved(&self) -> bool {
        self.saved
    }

    /// Loaded or embedded.
    pub fn exists(&self) -> bool {
        self.loaded || self.embedded
    }

    /// Loaded copy is byte code.
    pub fn is_loaded_as_byte_code(&self) -> bool {
        self.loaded_as_byte_code
    }

    /// Version the getter returned, empty when unknown.
    pub fn embedded_firmware_version(&self) -> &str {
        &self.embedded_firmware_version
    }

    /// A version getter is configured.
    pub fn has_firmware_version_getter(&self) -> bool {
        self.has_firmware_version_getter
    }

    /// Outcome of the last version reconciliation.
    pub fn version_status(&self) -> VersionStatus {
        self.version_status
    }

    /// True when the node holds a copy that must be removed before upload.
    pub fn requires_deletion(&self) -> bool {
        self.requires_deletion
    }

    /// Actions taken by the last workflow step, one per line.
    pub fn last_actions(&self) -> &str {
        &self.last_actions
    }

    fn record(&mut self, action: impl std::fmt::Display) {
        let _ = writeln!(self.last_actions, "{action}");
    }

    fn target(&self) -> String {
        format!("{}{}", self.node.command_prefix(), self.descriptor.name())
    }

    /// Refreshes the runtime state from the node.
    pub async fn read_state(
        &mut self,
        transport: &dyn ScriptTransport,
        catalogs: CatalogView<'_>,
    ) -> DeployResult<()> {
        let prefix = self.node.command_prefix();
        let name = self.descriptor.name().to_string();

        self.loaded = listed(catalogs.loaded, &name) || !transport.is_nil(&self.target()).await?;
        self.embedded = listed(catalogs.embedded, &name);
        self.loaded_as_byte_code = if self.loaded {
            let head = transport
                .query_print_value(&commands::source_head_query(&prefix, &name))
                .await?;
            codec::classify(&head).is_binary
        } else {
            false
        };
        self.saved = self.embedded
            && (!self.descriptor.convert_to_byte_code() || listed(catalogs.saved, &name));

        let namespace = self.descriptor.top_namespace();
        self.activated = if namespace.is_empty() {
            self.activated && self.loaded
        } else {
            self.loaded && !transport.is_nil(&format!("{prefix}{namespace}")).await?
        };

        self.read_firmware_version(transport).await?;
        debug!(
            "{} on node {}: loaded={} embedded={} saved={} activated={} version={}",
            name,
            self.node.node_number(),
            self.loaded,
            self.embedded,
            self.saved,
            self.activated,
            self.version_status
        );
        Ok(())
    }

    /// Reads the embedded version and reconciles it with the release.
    pub async fn read_firmware_version(
        &mut self,
        transport: &dyn ScriptTransport,
    ) -> DeployResult<VersionStatus> {
        let prefix = self.node.command_prefix();
        let getter = self.descriptor.firmware_version_getter();
        self.has_firmware_version_getter = self.descriptor.has_version_getter();

        self.embedded_firmware_version = if self.has_firmware_version_getter
            && !transport.is_nil(&format!("{prefix}{getter}")).await?
        {
            transport
                .query_print_value(&commands::version_query(&prefix, getter))
                .await?
                .trim()
                .to_string()
        } else {
            String::new()
        };

        self.version_status = VersionStatus::reconcile(
            self.has_firmware_version_getter,
            self.descriptor.comparable_released_version(),
            &self.embedded_firmware_version,
        );
        self.requires_deletion = (self.exists() && self.version_status == VersionStatus::Older)
            || (self.embedded && self.descriptor.convert_to_byte_code() && !self.saved);
        Ok(self.version_status)
    }

    /// Runs the script.
    ///
    /// # Errors
    /// `ScriptRunFailed` carrying the action log when the node reports an error.
    pub async fn run(&mut self, transport: &dyn ScriptTransport) -> DeployResult<()> {
        self.last_actions.clear();
        let command = commands::run_script(&self.node.command_prefix(), self.descriptor.name());
        transport.write_line(&command).await?;
        self.record(format!("sent: {command}"));

        if let Some(message) = transport::read_device_error(transport).await? {
            self.record(format!("device error: {message}"));
            return Err(DeployError::ScriptRunFailed {
                name: self.descriptor.name().to_string(),
                details: self.last_actions.trim_end().to_string(),
            });
        }
        self.loaded = true;
        self.activated = true;
        self.record("ran");
        Ok(())
    }

    /// Loads the descriptor's source into the node's runtime memory.
    pub async fn load(&mut self, transport: &dyn ScriptTransport) -> DeployResult<()> {
        if !self.descriptor.has_source() {
            return Err(DeployError::SourceNotLoaded(self.descriptor.name().to_string()));
        }
        self.last_actions.clear();
        let lines = commands::load_script(
            &self.node.command_prefix(),
            self.descriptor.name(),
            self.descriptor.source(),
            self.descriptor.is_binary_script(),
        );
        let delay = transport.pacing().line_delay;
        for line in &lines {
            transport.write_line(line).await?;
            transport::pause(delay).await;
        }
        self.record(format!("loaded {} lines", lines.len()));
        self.check_device(transport).await?;

        self.loaded = true;
        self.activated = false;
        self.loaded_as_byte_code = self.descriptor.is_binary_script();
        info!("Loaded {} on node {}", self.descriptor.name(), self.node.node_number());
        Ok(())
    }

    /// Saves the loaded script to non-volatile memory.
    pub async fn save(&mut self, transport: &dyn ScriptTransport) -> DeployResult<()> {
        self.last_actions.clear();
        let prefix = self.node.command_prefix();
        let name = self.descriptor.name().to_string();

        if self.descriptor.convert_to_byte_code() && !self.loaded_as_byte_code {
            transport
                .write_line(&commands::convert_to_byte_code(&prefix, &name))
                .await?;
            self.record("converted to byte code");
            self.check_device(transport).await?;
            self.loaded_as_byte_code = true;
        }

        transport.write_line(&commands::save_script(&prefix, &name)).await?;
        transport::pause(transport.pacing().command_delay).await;
        self.record("saved");
        self.check_device(transport).await?;

        self.embedded = true;
        self.saved = !self.descriptor.convert_to_byte_code() || self.loaded_as_byte_code;
        self.requires_deletion = false;
        info!("Embedded {} on node {}", name, self.node.node_number());
        Ok(())
    }

    async fn check_device(&mut self, transport: &dyn ScriptTransport) -> DeployResult<()> {
        if let Some(message) = transport::read_device_error(transport).await? {
            self.record(format!("device error: {message}"));
            return Err(DeployError::Device {
                node: self.node.node_number(),
                message,
            });
        }
        Ok(())
    }

    /// Records that the script no longer resolves on the node.
    pub(crate) fn mark_removed(&mut self) {
        self.loaded = false;
        self.activated = false;
        self.embedded = false;
        self.saved = false;
        self.loaded_as_byte_code = false;
        self.requires_deletion = false;
    }

    /// Forgets everything read from the node.
    pub fn reset_state(&mut self) {
        self.mark_removed();
        self.embedded_firmware_version.clear();
        self.has_firmware_version_getter = false;
        self.version_status = VersionStatus::None;
        self.last_actions.clear();
    }
}
