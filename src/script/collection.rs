//! Per-node collection of script instances.
//!
//! The collection owns the node's catalog caches and drives the bulk workflows
//! (read, upload, embed, run, delete) over its instances in insertion order.
//! Caches are `None` until fetched and are dropped whenever a command changes
//! the node's catalog.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use super::descriptor::FirmwareScriptDescriptor;
use super::instance::{CatalogView, ScriptInstance};
use crate::error::{DeployError, DeployResult};
use crate::node::NodeIdentity;
use crate::transport::{self, commands, ScriptTransport};
use crate::version::VersionStatus;

/// Outcome of [`ScriptInstanceCollection::run_scripts`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Every applicable script ran.
    pub success: bool,
    /// Action log of the failing script, empty on success.
    pub details: String,
    /// Name of the failing script.
    pub failed_script: Option<String>,
}

impl RunReport {
    /// Report for a run where every script succeeded.
    pub fn succeeded() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    /// Report for a run stopped by `name`.
    pub fn failed(name: &str, details: &str) -> Self {
        Self {
            success: false,
            details: details.to_string(),
            failed_script: Some(name.to_string()),
        }
    }
}

/// Scripts bound to one node, keyed by name and model mask.
#[derive(Debug)]
pub struct ScriptInstanceCollection {
    node: Arc<NodeIdentity>,
    controller_node_number: u8,
    instances: IndexMap<String, ScriptInstance>,
    embedded_script_names: Option<Vec<String>>,
    saved_script_names: Option<Vec<String>>,
    loaded_script_names: Option<Vec<String>>,
    identified_script: Option<String>,
}

impl ScriptInstanceCollection {
    /// Creates an empty collection for `node`.
    pub fn new(node: Arc<NodeIdentity>, controller_node_number: u8) -> Self {
        Self {
            node,
            controller_node_number,
            instances: IndexMap::new(),
            embedded_script_names: None,
            saved_script_names: None,
            loaded_script_names: None,
            identified_script: None,
        }
    }

    /// Node the scripts are bound to.
    pub fn node(&self) -> &Arc<NodeIdentity> {
        &self.node
    }

    /// Node number of the network controller.
    pub fn controller_node_number(&self) -> u8 {
        self.controller_node_number
    }

    /// Number of bound scripts.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// True when no script is bound.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instances in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ScriptInstance> {
        self.instances.values()
    }

    /// First instance with the given name.
    pub fn get(&self, name: &str) -> Option<&ScriptInstance> {
        self.instances.values().find(|i| i.name() == name)
    }

    /// Instance with the given name.
    ///
    /// # Errors
    /// `ScriptNotFound` when no instance has that name.
    pub fn require(&self, name: &str) -> DeployResult<&ScriptInstance> {
        self.get(name)
            .ok_or_else(|| DeployError::ScriptNotFound(name.to_string()))
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut ScriptInstance> {
        self.instances.values_mut().find(|i| i.name() == name)
    }

    /// Name of the instance singled out by the last bulk query or workflow.
    pub fn identified_script(&self) -> Option<&str> {
        self.identified_script.as_deref()
    }

    /// Binds a descriptor to this collection's node.
    ///
    /// # Errors
    /// - `DuplicateScript` if the name and mask are already present
    /// - `ModelMismatch` if the descriptor does not apply to the node model
    pub fn add(&mut self, descriptor: Arc<FirmwareScriptDescriptor>) -> DeployResult<&ScriptInstance> {
        let key = descriptor.key();
        if self.instances.contains_key(&key) {
            return Err(DeployError::DuplicateScript(descriptor.to_string()));
        }
        let instance = ScriptInstance::new(descriptor, Arc::clone(&self.node))?;
        let (index, _) = self.instances.insert_full(key, instance);
        Ok(&self.instances[index])
    }

    fn applicable_keys(&self) -> Vec<String> {
        let model = self.node.model_number();
        self.instances
            .iter()
            .filter(|(_, i)| i.descriptor().applies_to(model))
            .map(|(key, _)| key.clone())
            .collect()
    }

    // ---- catalog caches ----

    /// Cached non-volatile catalog, `None` until fetched.
    pub fn embedded_script_names(&self) -> Option<&[String]> {
        self.embedded_script_names.as_deref()
    }

    /// Cached byte-code subset of the non-volatile catalog.
    pub fn saved_script_names(&self) -> Option<&[String]> {
        self.saved_script_names.as_deref()
    }

    /// Cached runtime catalog.
    pub fn loaded_script_names(&self) -> Option<&[String]> {
        self.loaded_script_names.as_deref()
    }

    async fn fetch_names(&self, transport: &dyn ScriptTransport, query: String) -> DeployResult<Vec<String>> {
        let reply = transport.query_print_value(&query).await?;
        Ok(commands::parse_name_list(&reply))
    }

    /// Fetches the non-volatile catalog.
    pub async fn refresh_embedded_names(&mut self, transport: &dyn ScriptTransport) -> DeployResult<()> {
        let query = commands::embedded_catalog_query(&self.node.command_prefix());
        self.embedded_script_names = Some(self.fetch_names(transport, query).await?);
        Ok(())
    }

    /// Fetches the byte-code subset of the non-volatile catalog.
    pub async fn refresh_saved_names(&mut self, transport: &dyn ScriptTransport) -> DeployResult<()> {
        let query = commands::byte_code_catalog_query(&self.node.command_prefix());
        self.saved_script_names = Some(self.fetch_names(transport, query).await?);
        Ok(())
    }

    /// Fetches the runtime catalog.
    pub async fn refresh_loaded_names(&mut self, transport: &dyn ScriptTransport) -> DeployResult<()> {
        let query = commands::loaded_catalog_query(&self.node.command_prefix());
        self.loaded_script_names = Some(self.fetch_names(transport, query).await?);
        Ok(())
    }

    /// Fetches all three catalogs.
    pub async fn refresh_catalogs(&mut self, transport: &dyn ScriptTransport) -> DeployResult<()> {
        self.refresh_embedded_names(transport).await?;
        self.refresh_saved_names(transport).await?;
        self.refresh_loaded_names(transport).await
    }

    fn invalidate_catalogs(&mut self) {
        self.embedded_script_names = None;
        self.saved_script_names = None;
        self.loaded_script_names = None;
    }

    /// True when `name` is in the non-volatile catalog.
    ///
    /// The cache is fetched when `refresh` is set or nothing is cached yet.
    pub async fn embedded_script_exists(
        &mut self,
        transport: &dyn ScriptTransport,
        name: &str,
        refresh: bool,
    ) -> DeployResult<bool> {
        if refresh || self.embedded_script_names.is_none() {
            self.refresh_embedded_names(transport).await?;
        }
        Ok(self
            .embedded_script_names
            .as_ref()
            .is_some_and(|names| names.iter().any(|n| n == name)))
    }

    /// True when `name` is embedded as byte code.
    pub async fn is_already_byte_code(
        &mut self,
        transport: &dyn ScriptTransport,
        name: &str,
        refresh: bool,
    ) -> DeployResult<bool> {
        if refresh || self.saved_script_names.is_none() {
            self.refresh_saved_names(transport).await?;
        }
        Ok(self
            .saved_script_names
            .as_ref()
            .is_some_and(|names| names.iter().any(|n| n == name)))
    }

    /// Decides whether a script must be saved to non-volatile memory.
    pub async fn is_embed_required(
        &mut self,
        transport: &dyn ScriptTransport,
        name: &str,
        embed_to_nvm: bool,
        convert_to_byte_code: bool,
        is_boot_script: bool,
        refresh: bool,
    ) -> DeployResult<bool> {
        if !embed_to_nvm {
            return Ok(false);
        }
        if convert_to_byte_code && !self.is_already_byte_code(transport, name, refresh).await? {
            return Ok(true);
        }
        if !self.embedded_script_exists(transport, name, refresh).await? {
            return Ok(true);
        }
        Ok(is_boot_script && self.node.boot_script_embed_required())
    }

    // ---- deletion ----

    /// Deletes a script from the node; returns true when the name resolves to nil.
    ///
    /// Deleting a name that is already nil succeeds without sending anything.
    pub async fn delete_script(&mut self, transport: &dyn ScriptTransport, name: &str) -> DeployResult<bool> {
        let prefix = self.node.command_prefix();
        let target = format!("{prefix}{name}");
        if transport.is_nil(&target).await? {
            debug!("{} is already nil on node {}", name, self.node.node_number());
            return Ok(true);
        }

        let command = if self.embedded_script_exists(transport, name, true).await? {
            commands::delete_script(&prefix, name)
        } else {
            commands::nil_reference(&prefix, name)
        };
        transport.write_line(&command).await?;
        transport::pause(transport.pacing().command_delay).await;
        self.invalidate_catalogs();

        let is_nil = transport.is_nil(&target).await?;
        if is_nil {
            if let Some(instance) = self.get_mut(name) {
                instance.mark_removed();
            }
            info!("Deleted {} from node {}", name, self.node.node_number());
        } else {
            warn!("{} still resolves on node {} after delete", name, self.node.node_number());
        }
        Ok(is_nil)
    }

    /// Deletes a script, then collects garbage and checks the error queue.
    ///
    /// Cleanup problems are logged and never change the result.
    pub async fn remove_script(&mut self, transport: &dyn ScriptTransport, name: &str) -> DeployResult<bool> {
        let removed = self.delete_script(transport, name).await?;
        if !removed {
            return Ok(false);
        }

        let node = self.node.node_number();
        let query = commands::collect_garbage_query(&self.node.command_prefix());
        match transport.query_print_value(&query).await {
            Ok(reply) if reply.trim() == commands::COLLECT_GARBAGE_DONE => {}
            Ok(reply) => warn!("Garbage collection on node {} did not complete: '{}'", node, reply),
            Err(e) => warn!("Garbage collection on node {} failed: {}", node, e),
        }
        match transport::drain_device_errors(transport).await {
            Ok(messages) => {
                for message in messages {
                    warn!("Node {} reported after removing {}: {}", node, name, message);
                }
            }
            Err(e) => warn!("Could not read error queue of node {}: {}", node, e),
        }
        Ok(true)
    }

    /// Removes present scripts in reverse insertion order.
    ///
    /// With `only_flagged`, only instances that require deletion are removed.
    /// Stops at the first script that cannot be removed and returns false.
    pub async fn delete_scripts(&mut self, transport: &dyn ScriptTransport, only_flagged: bool) -> DeployResult<bool> {
        let names: Vec<String> = self
            .applicable_keys()
            .iter()
            .rev()
            .filter_map(|key| self.instances.get(key))
            .filter(|i| i.exists() && (!only_flagged || i.requires_deletion()))
            .map(|i| i.name().to_string())
            .collect();

        for name in names {
            if !self.remove_script(transport, &name).await? {
                self.identified_script = Some(name);
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ---- workflows ----

    /// Refreshes the catalogs and the state of every instance.
    pub async fn read_states(&mut self, transport: &dyn ScriptTransport) -> DeployResult<()> {
        self.refresh_catalogs(transport).await?;
        let model = self.node.model_number().to_string();
        let catalogs = CatalogView {
            embedded: self.embedded_script_names.as_deref().unwrap_or_default(),
            saved: self.saved_script_names.as_deref().unwrap_or_default(),
            loaded: self.loaded_script_names.as_deref().unwrap_or_default(),
        };
        for instance in self.instances.values_mut() {
            if instance.descriptor().applies_to(&model) {
                instance.read_state(transport, catalogs).await?;
            }
        }
        Ok(())
    }

    /// Runs the scripts in insertion order, stopping at the first failure.
    pub async fn run_scripts(&mut self, transport: &dyn ScriptTransport, refresh: bool) -> DeployResult<RunReport> {
        if refresh {
            self.read_states(transport).await?;
        }
        let mut ran = 0;
        for key in self.applicable_keys() {
            let Some(instance) = self.instances.get_mut(&key) else {
                continue;
            };
            let name = instance.name().to_string();
            match instance.run(transport).await {
                Ok(()) => ran += 1,
                Err(DeployError::ScriptRunFailed { name, details }) => {
                    warn!("{} failed on node {}", name, self.node.node_number());
                    let report = RunReport::failed(&name, &details);
                    self.identified_script = Some(name);
                    return Ok(report);
                }
                Err(e) => return Err(self.step_failed(&name, "run", e)),
            }
        }
        info!("Ran {} scripts on node {}", ran, self.node.node_number());
        Ok(RunReport::succeeded())
    }

    /// Loads every script that is not loaded, removing outdated copies first.
    pub async fn upload_scripts(&mut self, transport: &dyn ScriptTransport) -> DeployResult<()> {
        for key in self.applicable_keys() {
            let Some(instance) = self.instances.get(&key) else {
                continue;
            };
            let name = instance.name().to_string();
            if instance.requires_deletion() && !self.remove_script(transport, &name).await? {
                self.identified_script = Some(name.clone());
                return Err(DeployError::Device {
                    node: self.node.node_number(),
                    message: format!("could not delete outdated script '{name}'"),
                });
            }
            if let Some(instance) = self.instances.get_mut(&key) {
                if !instance.is_loaded() {
                    if let Err(e) = instance.load(transport).await {
                        return Err(self.step_failed(&name, "load", e));
                    }
                }
            }
        }
        self.loaded_script_names = None;
        Ok(())
    }

    /// Saves every script that needs embedding to non-volatile memory.
    pub async fn embed_scripts(&mut self, transport: &dyn ScriptTransport) -> DeployResult<()> {
        for key in self.applicable_keys() {
            let Some(descriptor) = self.instances.get(&key).map(|i| Arc::clone(i.descriptor())) else {
                continue;
            };
            let required = self
                .is_embed_required(
                    transport,
                    descriptor.name(),
                    descriptor.embed_to_non_volatile_memory(),
                    descriptor.convert_to_byte_code(),
                    descriptor.is_boot_script(),
                    false,
                )
                .await?;
            if !required {
                debug!("{} needs no embedding on node {}", descriptor.name(), self.node.node_number());
                continue;
            }
            if let Some(instance) = self.instances.get_mut(&key) {
                let (step, result) = if instance.is_loaded() {
                    ("save", instance.save(transport).await)
                } else {
                    match instance.load(transport).await {
                        Ok(()) => ("save", instance.save(transport).await),
                        Err(e) => ("load", Err(e)),
                    }
                };
                if let Err(e) = result {
                    return Err(self.step_failed(descriptor.name(), step, e));
                }
            }
            self.invalidate_catalogs();
        }
        Ok(())
    }

    fn step_failed(&mut self, name: &str, step: &'static str, source: DeployError) -> DeployError {
        let node = self.node.node_number();
        warn!("{} of {} failed on node {}: {}", step, name, node, source);
        self.identified_script = Some(name.to_string());
        DeployError::ScriptStepFailed {
            name: name.to_string(),
            node,
            step,
            source: Box::new(source),
        }
    }

    // ---- bulk queries ----

    /// Records and reports the first applicable instance matching `predicate`.
    fn identify(&mut self, skip_boot: bool, predicate: impl Fn(&ScriptInstance) -> bool) -> bool {
        let model = self.node.model_number();
        self.identified_script = self
            .instances
            .values()
            .filter(|i| i.descriptor().applies_to(model))
            .filter(|i| !(skip_boot && i.descriptor().is_boot_script()))
            .find(|i| predicate(*i))
            .map(|i| i.name().to_string());
        self.identified_script.is_some()
    }

    /// Every script is loaded or embedded.
    pub fn all_exist(&mut self) -> bool {
        !self.identify(false, |i| !i.exists())
    }

    /// Some script is loaded or embedded.
    pub fn any_exist(&mut self) -> bool {
        self.identify(false, ScriptInstance::exists)
    }

    /// Every script is in runtime memory.
    pub fn all_loaded(&mut self) -> bool {
        !self.identify(false, |i| !i.is_loaded())
    }

    /// Some script is in runtime memory.
    pub fn any_loaded(&mut self) -> bool {
        self.identify(false, ScriptInstance::is_loaded)
    }

    /// Every script is in the non-volatile catalog.
    pub fn all_embedded(&mut self) -> bool {
        !self.identify(false, |i| !i.is_embedded())
    }

    /// Some script is in the non-volatile catalog.
    pub fn any_embedded(&mut self) -> bool {
        self.identify(false, ScriptInstance::is_embedded)
    }

    /// Every script has run.
    pub fn all_activated(&mut self) -> bool {
        !self.identify(false, |i| !i.is_activated())
    }

    /// Some script has run.
    pub fn any_activated(&mut self) -> bool {
        self.identify(false, ScriptInstance::is_activated)
    }

    /// Every script is embedded in the requested form.
    pub fn all_saved(&mut self) -> bool {
        !self.identify(false, |i| !i.is_saved())
    }

    /// Some script holds a copy that must be removed first.
    pub fn any_requires_deletion(&mut self) -> bool {
        self.identify(false, ScriptInstance::requires_deletion)
    }

    /// Every non-boot script has a version getter defined on the node.
    pub fn all_version_getters_exist(&mut self) -> bool {
        !self.identify(true, |i| i.version_status() == VersionStatus::Missing)
    }

    /// Every non-boot script is at the released version.
    pub fn all_versions_current(&mut self) -> bool {
        !self.identify(true, |i| i.version_status() != VersionStatus::Current)
    }

    /// Some non-boot script is newer than the release.
    pub fn is_program_outdated(&mut self) -> bool {
        self.identify(true, |i| i.version_status() == VersionStatus::Newer)
    }

    /// Some non-boot script has no determinable version.
    pub fn versions_unspecified(&mut self) -> bool {
        self.identify(true, |i| i.version_status().is_unspecified())
    }

    /// Every support script is loaded or embedded.
    pub fn support_scripts_exist(&mut self) -> bool {
        !self.identify(false, |i| i.descriptor().is_support_script() && !i.exists())
    }

    /// Every primary script is loaded or embedded.
    pub fn primary_scripts_exist(&mut self) -> bool {
        !self.identify(false, |i| i.descriptor().is_primary_script() && !i.exists())
    }

    /// Forgets every cached catalog and instance state, e.g. after a device reset.
    pub fn define_known_reset_state(&mut self) {
        self.invalidate_catalogs();
        self.identified_script = None;
        for instance in self.instances.values_mut() {
            instance.reset_state();
        }
    }
}
