//! Deployment across the controller and its subordinate nodes.
//!
//! The coordinator owns the release catalog and one script collection per node.
//! Workflows visit the controller first, then subordinate nodes in ascending
//! node order, and stop at the first hard failure.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{info, warn};

use crate::error::{DeployError, DeployResult};
use crate::maintenance::{self, SourceTrimmer};
use crate::node::NodeIdentity;
use crate::script::{FirmwareScriptDescriptor, RunReport, ScriptInstance, ScriptInstanceCollection};
use crate::transport::{self, ScriptTransport};

/// Orchestrates script collections across nodes.
#[derive(Debug)]
pub struct DeploymentCoordinator {
    catalog: IndexMap<String, Arc<FirmwareScriptDescriptor>>,
    legacy_catalog: IndexMap<String, Arc<FirmwareScriptDescriptor>>,
    script_entities: ScriptInstanceCollection,
    node_scripts: BTreeMap<u8, ScriptInstanceCollection>,
    legacy_script_entities: ScriptInstanceCollection,
    legacy_node_scripts: BTreeMap<u8, ScriptInstanceCollection>,
    identified_script: Option<(u8, String)>,
}

impl DeploymentCoordinator {
    /// Creates a coordinator for the controller node.
    pub fn new(controller: NodeIdentity) -> Self {
        let number = controller.node_number();
        let controller = Arc::new(controller);
        Self {
            catalog: IndexMap::new(),
            legacy_catalog: IndexMap::new(),
            script_entities: ScriptInstanceCollection::new(Arc::clone(&controller), number),
            node_scripts: BTreeMap::new(),
            legacy_script_entities: ScriptInstanceCollection::new(controller, number),
            legacy_node_scripts: BTreeMap::new(),
            identified_script: None,
        }
    }

    /// Node number of the controller.
    pub fn controller_node_number(&self) -> u8 {
        self.script_entities.node().node_number()
    }

    /// Release catalog in insertion order.
    pub fn catalog(&self) -> impl Iterator<Item = &Arc<FirmwareScriptDescriptor>> {
        self.catalog.values()
    }

    /// Legacy catalog in insertion order.
    pub fn legacy_catalog(&self) -> impl Iterator<Item = &Arc<FirmwareScriptDescriptor>> {
        self.legacy_catalog.values()
    }

    /// Adds a script to the catalog and binds it to every matching node.
    pub fn add_script(&mut self, descriptor: FirmwareScriptDescriptor) -> DeployResult<Arc<FirmwareScriptDescriptor>> {
        let key = descriptor.key();
        if self.catalog.contains_key(&key) {
            return Err(DeployError::DuplicateScript(descriptor.to_string()));
        }
        let descriptor = Arc::new(descriptor);
        for scripts in std::iter::once(&mut self.script_entities).chain(self.node_scripts.values_mut()) {
            if descriptor.applies_to(scripts.node().model_number()) {
                scripts.add(Arc::clone(&descriptor))?;
            }
        }
        self.catalog.insert(key, Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Adds a script name shipped by an earlier release, to be removed from nodes.
    pub fn add_legacy_script(&mut self, name: &str, model_mask: &str) -> DeployResult<()> {
        let descriptor = FirmwareScriptDescriptor::new(name, model_mask)?;
        let key = descriptor.key();
        if self.legacy_catalog.contains_key(&key) {
            return Err(DeployError::DuplicateScript(descriptor.to_string()));
        }
        let descriptor = Arc::new(descriptor);
        for scripts in std::iter::once(&mut self.legacy_script_entities)
            .chain(self.legacy_node_scripts.values_mut())
        {
            if descriptor.applies_to(scripts.node().model_number()) {
                scripts.add(Arc::clone(&descriptor))?;
            }
        }
        self.legacy_catalog.insert(key, descriptor);
        Ok(())
    }

    /// Registers a subordinate node, binding every matching catalog script.
    ///
    /// Registering a node number again replaces its collections.
    pub fn register_node(&mut self, node: NodeIdentity) -> DeployResult<()> {
        let number = node.node_number();
        if number == self.controller_node_number() {
            return Err(DeployError::ControllerNode(number));
        }
        let node = Arc::new(node);
        let controller = self.controller_node_number();
        let mut scripts = ScriptInstanceCollection::new(Arc::clone(&node), controller);
        let mut legacy = ScriptInstanceCollection::new(Arc::clone(&node), controller);
        for descriptor in self.catalog.values() {
            if descriptor.applies_to(node.model_number()) {
                scripts.add(Arc::clone(descriptor))?;
            }
        }
        for descriptor in self.legacy_catalog.values() {
            if descriptor.applies_to(node.model_number()) {
                legacy.add(Arc::clone(descriptor))?;
            }
        }
        info!("Registered {} with {} scripts", node, scripts.len());
        self.node_scripts.insert(number, scripts);
        self.legacy_node_scripts.insert(number, legacy);
        Ok(())
    }

    /// Collection bound to the controller node.
    pub fn script_entities(&self) -> &ScriptInstanceCollection {
        &self.script_entities
    }

    /// Collection bound to a node.
    pub fn node_scripts(&self, node: u8) -> DeployResult<&ScriptInstanceCollection> {
        if node == self.controller_node_number() {
            return Ok(&self.script_entities);
        }
        self.node_scripts.get(&node).ok_or(DeployError::NodeNotRegistered(node))
    }

    /// Mutable collection bound to a node.
    pub fn node_scripts_mut(&mut self, node: u8) -> DeployResult<&mut ScriptInstanceCollection> {
        if node == self.controller_node_number() {
            return Ok(&mut self.script_entities);
        }
        self.node_scripts
            .get_mut(&node)
            .ok_or(DeployError::NodeNotRegistered(node))
    }

    /// Instance of `name` on `node`.
    ///
    /// # Errors
    /// `NodeNotRegistered` or `ScriptNotFound`.
    pub fn instance(&self, node: u8, name: &str) -> DeployResult<&ScriptInstance> {
        self.node_scripts(node)?.require(name)
    }

    /// Registered node numbers, controller first.
    pub fn node_numbers(&self) -> Vec<u8> {
        std::iter::once(self.controller_node_number())
            .chain(self.node_scripts.keys().copied())
            .collect()
    }

    fn collections_mut(&mut self) -> impl Iterator<Item = &mut ScriptInstanceCollection> {
        std::iter::once(&mut self.script_entities).chain(self.node_scripts.values_mut())
    }

    fn legacy_collections_mut(&mut self) -> impl Iterator<Item = &mut ScriptInstanceCollection> {
        std::iter::once(&mut self.legacy_script_entities).chain(self.legacy_node_scripts.values_mut())
    }

    /// Node and name of the script singled out by the last query or workflow.
    pub fn identified_script(&self) -> Option<(u8, &str)> {
        self.identified_script
            .as_ref()
            .map(|(node, name)| (*node, name.as_str()))
    }

    /// Runs `query` on each collection until one reports `stop_on`.
    fn query_nodes(&mut self, stop_on: bool, query: impl Fn(&mut ScriptInstanceCollection) -> bool) -> bool {
        let mut identified = None;
        let mut hit = false;
        for scripts in self.collections_mut() {
            if query(&mut *scripts) == stop_on {
                identified = scripts
                    .identified_script()
                    .map(|name| (scripts.node().node_number(), name.to_string()));
                hit = true;
                break;
            }
        }
        self.identified_script = identified;
        hit
    }

    // ---- state ----

    /// Refreshes the state of every script on every node.
    pub async fn read_states(&mut self, transport: &dyn ScriptTransport) -> DeployResult<()> {
        for scripts in self.collections_mut() {
            scripts.read_states(transport).await?;
        }
        for scripts in self.legacy_collections_mut() {
            scripts.read_states(transport).await?;
        }
        Ok(())
    }

    /// Every catalog script is loaded or embedded on every node.
    pub fn firmware_exists(&mut self) -> bool {
        !self.query_nodes(false, ScriptInstanceCollection::all_exist)
    }

    /// Every non-boot script has a version getter on every node.
    pub fn version_getter_exists(&mut self) -> bool {
        !self.query_nodes(false, ScriptInstanceCollection::all_version_getters_exist)
    }

    /// Every support script is present on every node.
    pub fn support_scripts_exist(&mut self) -> bool {
        !self.query_nodes(false, ScriptInstanceCollection::support_scripts_exist)
    }

    /// Every non-boot script is at the released version on every node.
    pub fn all_versions_current(&mut self) -> bool {
        !self.query_nodes(false, ScriptInstanceCollection::all_versions_current)
    }

    /// Some node runs a script newer than the release.
    pub fn is_program_outdated(&mut self) -> bool {
        self.query_nodes(true, ScriptInstanceCollection::is_program_outdated)
    }

    /// Some node has a script whose version cannot be determined.
    pub fn versions_unspecified(&mut self) -> bool {
        self.query_nodes(true, ScriptInstanceCollection::versions_unspecified)
    }

    /// Some legacy script is still present on a node.
    pub fn legacy_scripts_exist(&mut self) -> bool {
        self.legacy_collections_mut().any(|scripts| scripts.any_exist())
    }

    // ---- workflows ----

    /// Loads missing scripts on every node, removing outdated copies first.
    pub async fn upload_scripts(&mut self, transport: &dyn ScriptTransport) -> DeployResult<()> {
        let mut failure = None;
        for scripts in self.collections_mut() {
            if let Err(e) = scripts.upload_scripts(transport).await {
                failure = Some((identified_in(scripts), e));
                break;
            }
        }
        self.settle(failure)
    }

    /// Embeds scripts that need it on every node.
    pub async fn save_scripts(&mut self, transport: &dyn ScriptTransport) -> DeployResult<()> {
        let mut failure = None;
        for scripts in self.collections_mut() {
            if let Err(e) = scripts.embed_scripts(transport).await {
                failure = Some((identified_in(scripts), e));
                break;
            }
        }
        self.settle(failure)
    }

    /// Records the script a failed workflow stopped at.
    fn settle(&mut self, failure: Option<(Option<(u8, String)>, DeployError)>) -> DeployResult<()> {
        match failure {
            Some((identified, e)) => {
                self.identified_script = identified;
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Removes catalog scripts from every node, subordinate nodes first.
    pub async fn delete_scripts(&mut self, transport: &dyn ScriptTransport, only_flagged: bool) -> DeployResult<bool> {
        let mut collections: Vec<&mut ScriptInstanceCollection> = self.collections_mut().collect();
        collections.reverse();
        let mut failed = None;
        for scripts in collections {
            if !scripts.delete_scripts(transport, only_flagged).await? {
                let node = scripts.node().node_number();
                failed = Some((node, scripts.identified_script().unwrap_or_default().to_string()));
                break;
            }
        }
        match failed {
            Some((node, name)) => {
                warn!("Could not delete {} from node {}", name, node);
                self.identified_script = Some((node, name));
                Ok(false)
            }
            None => Ok(true),
        }
    }

    /// Removes legacy scripts from every node.
    pub async fn delete_legacy_scripts(&mut self, transport: &dyn ScriptTransport) -> DeployResult<bool> {
        let mut all_removed = true;
        for scripts in self.legacy_collections_mut() {
            let names: Vec<String> = scripts.iter().map(|i| i.name().to_string()).collect();
            for name in names.iter().rev() {
                if !scripts.remove_script(transport, name).await? {
                    warn!("Legacy script {} remains on node {}", name, scripts.node().node_number());
                    all_removed = false;
                }
            }
        }
        Ok(all_removed)
    }

    /// Runs the scripts on every node, stopping at the first failure.
    pub async fn run_scripts(&mut self, transport: &dyn ScriptTransport, refresh: bool) -> DeployResult<RunReport> {
        clear_device_errors(transport).await?;
        let mut failure = None;
        let mut error = None;
        for scripts in self.collections_mut() {
            match scripts.run_scripts(transport, refresh).await {
                Ok(report) if report.success => {}
                Ok(report) => {
                    failure = Some((scripts.node().node_number(), report));
                    break;
                }
                Err(e) => {
                    error = Some((identified_in(scripts), e));
                    break;
                }
            }
        }
        self.settle(error)?;
        match failure {
            Some((node, report)) => {
                self.identified_script = report.failed_script.clone().map(|name| (node, name));
                Ok(report)
            }
            None => Ok(RunReport::succeeded()),
        }
    }

    /// Brings every node in line with the catalog and runs the scripts.
    ///
    /// Legacy scripts are removed, outdated or missing scripts uploaded and
    /// embedded, then everything is run and the state read back.
    pub async fn deploy(&mut self, transport: &dyn ScriptTransport) -> DeployResult<RunReport> {
        clear_device_errors(transport).await?;
        self.read_states(transport).await?;
        if !self.delete_legacy_scripts(transport).await? {
            warn!("Some legacy scripts could not be removed");
        }
        self.upload_scripts(transport).await?;
        self.save_scripts(transport).await?;
        let report = self.run_scripts(transport, false).await?;
        self.read_states(transport).await?;
        info!("Deployment finished: success={}", report.success);
        Ok(report)
    }

    /// Forgets every cached catalog and state, e.g. after a device reset.
    pub fn define_known_reset_state(&mut self) {
        for scripts in self.collections_mut() {
            scripts.define_known_reset_state();
        }
        for scripts in self.legacy_collections_mut() {
            scripts.define_known_reset_state();
        }
        self.identified_script = None;
    }

    /// Runs the read-parse-write pass over the catalog's script files.
    pub fn maintain_sources(&self, trimmer: &dyn SourceTrimmer, extension: &str) -> DeployResult<Vec<PathBuf>> {
        maintenance::maintain_catalog(self.catalog.values().map(Arc::as_ref), trimmer, extension)
    }
}

fn identified_in(scripts: &ScriptInstanceCollection) -> Option<(u8, String)> {
    scripts
        .identified_script()
        .map(|name| (scripts.node().node_number(), name.to_string()))
}

/// Empties the shared error queue so stale entries are not blamed on the next script.
async fn clear_device_errors(transport: &dyn ScriptTransport) -> DeployResult<()> {
    for message in transport::drain_device_errors(transport).await? {
        warn!("Discarding stale device error: {}", message);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> DeploymentCoordinator {
        DeploymentCoordinator::new(NodeIdentity::controller("2602A", "4046", 1))
    }

    #[test]
    fn test_controller_collection_always_present() {
        let coordinator = coordinator();
        assert!(coordinator.node_scripts(1).is_ok());
        assert!(matches!(
            coordinator.node_scripts(2).unwrap_err(),
            DeployError::NodeNotRegistered(2)
        ));
    }

    #[test]
    fn test_scripts_bind_to_matching_nodes_only() {
        let mut coordinator = coordinator();
        coordinator
            .register_node(NodeIdentity::subordinate("2701A", "77", 2))
            .unwrap();
        coordinator
            .add_script(FirmwareScriptDescriptor::new("isr_support", "260%*").unwrap())
            .unwrap();
        coordinator
            .add_script(FirmwareScriptDescriptor::new("isr_common", "").unwrap())
            .unwrap();

        assert_eq!(coordinator.script_entities().len(), 2);
        assert_eq!(coordinator.node_scripts(2).unwrap().len(), 1);
        assert_eq!(coordinator.node_numbers(), vec![1, 2]);
    }

    #[test]
    fn test_register_after_catalog() {
        let mut coordinator = coordinator();
        coordinator
            .add_script(FirmwareScriptDescriptor::new("isr_support", "26*").unwrap())
            .unwrap();
        coordinator
            .register_node(NodeIdentity::subordinate("2602B", "77", 3))
            .unwrap();
        assert!(coordinator.node_scripts(3).unwrap().get("isr_support").is_some());
    }

    #[test]
    fn test_duplicate_catalog_entry() {
        let mut coordinator = coordinator();
        coordinator
            .add_script(FirmwareScriptDescriptor::new("isr_support", "").unwrap())
            .unwrap();
        let err = coordinator
            .add_script(FirmwareScriptDescriptor::new("isr_support", "").unwrap())
            .unwrap_err();
        assert!(matches!(err, DeployError::DuplicateScript(_)));
    }

    #[test]
    fn test_queries_identify_node_and_script() {
        let mut coordinator = coordinator();
        coordinator
            .add_script(FirmwareScriptDescriptor::new("isr_support", "").unwrap())
            .unwrap();
        assert!(!coordinator.firmware_exists());
        assert_eq!(coordinator.identified_script(), Some((1, "isr_support")));
        assert!(!coordinator.is_program_outdated());
        assert_eq!(coordinator.identified_script(), None);
    }
}
