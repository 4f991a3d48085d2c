//! Building the release catalog from configuration.
//!
//! Script files follow the naming convention
//! `{title}.{releaseBuild}[.{modelFamily}.{firmwareMajor}].{extension}`.
//! Bundled resources live in one directory and are addressed as
//! `{namespace}.{folderName}.{fileName}`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::{DeployConfig, ScriptDefinition};
use crate::coordinator::DeploymentCoordinator;
use crate::error::{DeployError, DeployResult};
use crate::node::NodeIdentity;
use crate::script::FirmwareScriptDescriptor;

/// Default script file extension.
pub const DEFAULT_SCRIPT_EXTENSION: &str = ".tsp";

/// File name for a script release, optionally specific to a model family and
/// firmware major version.
pub fn script_file_name(
    title: &str,
    release_build: &str,
    target: Option<(&str, &str)>,
    extension: &str,
) -> String {
    let extension = if extension.is_empty() { DEFAULT_SCRIPT_EXTENSION } else { extension };
    let extension = extension.trim_start_matches('.');
    match target {
        Some((family, major)) => format!("{title}.{release_build}.{family}.{major}.{extension}"),
        None => format!("{title}.{release_build}.{extension}"),
    }
}

/// File name for a script release targeted at a node.
///
/// Falls back to the generic name when the node reports no firmware version.
pub fn script_file_name_for_node(
    title: &str,
    release_build: &str,
    node: &NodeIdentity,
    extension: &str,
) -> String {
    let target = node.firmware_major().map(|major| (node.model_family(), major));
    script_file_name(title, release_build, target, extension)
}

/// Directory of bundled script resources.
#[derive(Debug, Clone)]
pub struct ResourceDirectory {
    root: PathBuf,
}

impl ResourceDirectory {
    /// Resource directory rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory the resources are read from.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resource name for a namespace, folder and file.
    pub fn resource_name(namespace: &str, folder: &str, file: &str) -> String {
        format!("{namespace}.{folder}.{file}")
    }

    /// Reads a resource as UTF-8 text.
    ///
    /// # Errors
    /// `ResourceNotFound` when no such resource exists.
    pub fn read(&self, namespace: &str, folder: &str, file: &str) -> DeployResult<String> {
        let name = Self::resource_name(namespace, folder, file);
        let path = self.root.join(&name);
        if !path.is_file() {
            return Err(DeployError::ResourceNotFound(name));
        }
        Ok(fs::read_to_string(path)?)
    }

    /// Reads the resource that backs a descriptor.
    pub fn read_for(&self, descriptor: &FirmwareScriptDescriptor) -> DeployResult<String> {
        let folder = descriptor
            .folder_path()
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        self.read(
            descriptor.top_namespace(),
            folder,
            descriptor.resource_file_name(),
        )
    }
}

/// Builds a descriptor from its configuration entry.
pub fn descriptor_from_definition(definition: &ScriptDefinition) -> DeployResult<FirmwareScriptDescriptor> {
    let mut descriptor = FirmwareScriptDescriptor::new(&definition.name, &definition.model_mask)?;
    descriptor.set_folder_path(&definition.folder);
    descriptor.set_file_name(&definition.file_name);
    descriptor.set_resource_file_name(&definition.resource_file_name);
    descriptor.set_resource_file_format(definition.resource_format.into());
    descriptor.set_released_version(&definition.released_version);
    descriptor.set_firmware_version_getter(&definition.version_getter);
    descriptor.set_namespace_list(&definition.namespaces);
    descriptor.set_boot_script(definition.boot);
    descriptor.set_primary_script(definition.primary);
    descriptor.set_support_script(definition.support);
    descriptor.set_save_as_binary(definition.save_as_binary);
    descriptor.set_embed_to_non_volatile_memory(definition.embed);
    descriptor.set_convert_to_byte_code(definition.convert_to_byte_code);
    Ok(descriptor)
}

/// Builds every configured descriptor, in configuration order.
pub fn build_descriptors(config: &DeployConfig) -> DeployResult<Vec<FirmwareScriptDescriptor>> {
    config.scripts.iter().map(descriptor_from_definition).collect()
}

/// Loads each descriptor's source from its script file, or from the resource
/// directory when the file is absent.
pub fn load_sources(
    descriptors: &mut [FirmwareScriptDescriptor],
    resources: Option<&ResourceDirectory>,
) -> DeployResult<()> {
    for descriptor in descriptors.iter_mut() {
        if descriptor.file_name().is_empty() && descriptor.resource_file_name().is_empty() {
            debug!("{} has no source file", descriptor);
            continue;
        }
        if !descriptor.file_name().is_empty() && descriptor.file_path().is_file() {
            descriptor.read_source_file()?;
            continue;
        }
        match resources {
            Some(resources) if !descriptor.resource_file_name().is_empty() => {
                let text = resources.read_for(descriptor)?;
                descriptor.set_source(&text)?;
            }
            _ => return Err(DeployError::FileNotFound(descriptor.file_path())),
        }
    }
    Ok(())
}

/// Creates a coordinator for `controller` holding the configured catalog.
///
/// Sources are loaded when `with_sources` is set.
pub fn build_coordinator(
    config: &DeployConfig,
    controller: NodeIdentity,
    with_sources: bool,
) -> DeployResult<DeploymentCoordinator> {
    let mut descriptors = build_descriptors(config)?;
    if with_sources {
        let resources = config.resources.root.as_ref().map(ResourceDirectory::new);
        load_sources(&mut descriptors, resources.as_ref())?;
    }

    let mut coordinator = DeploymentCoordinator::new(controller);
    for descriptor in descriptors {
        coordinator.add_script(descriptor)?;
    }
    for legacy in &config.legacy_scripts {
        coordinator.add_legacy_script(&legacy.name, &legacy.model_mask)?;
    }
    info!(
        "Catalog holds {} scripts and {} legacy scripts",
        config.scripts.len(),
        config.legacy_scripts.len()
    );
    Ok(coordinator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ScriptFormat;
    use crate::config::ResourceFormat;

    #[test]
    fn test_script_file_name() {
        assert_eq!(script_file_name("isr", "2.1.0", None, ""), "isr.2.1.0.tsp");
        assert_eq!(
            script_file_name("isr", "2.1.0", Some(("2602", "3")), ".tsp"),
            "isr.2.1.0.2602.3.tsp"
        );
    }

    #[test]
    fn test_script_file_name_for_node() {
        let node = NodeIdentity::controller("2602B", "1", 1).with_firmware_version("3.2.1");
        assert_eq!(
            script_file_name_for_node("isr", "7", &node, ".tspb"),
            "isr.7.2602.3.tspb"
        );
        let unknown = NodeIdentity::controller("2602B", "1", 1);
        assert_eq!(script_file_name_for_node("isr", "7", &unknown, ""), "isr.7.tsp");
    }

    #[test]
    fn test_missing_resource() {
        let dir = tempfile::tempdir().unwrap();
        let resources = ResourceDirectory::new(dir.path());
        match resources.read("isr", "scripts", "isr.tsp").unwrap_err() {
            DeployError::ResourceNotFound(name) => assert_eq!(name, "isr.scripts.isr.tsp"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_descriptor_from_definition() {
        let definition = ScriptDefinition {
            name: "isr_support".to_string(),
            model_mask: "260%*".to_string(),
            resource_format: ResourceFormat::Compressed,
            released_version: "2.1.0".to_string(),
            namespaces: "isr".to_string(),
            embed: true,
            save_as_binary: true,
            ..Default::default()
        };
        let descriptor = descriptor_from_definition(&definition).unwrap();
        assert_eq!(descriptor.resource_file_format(), ScriptFormat::COMPRESSED);
        assert_eq!(descriptor.top_namespace(), "isr");
        assert!(descriptor.embed_to_non_volatile_memory());
        assert!(descriptor.save_as_binary());
        assert!(!descriptor.convert_to_byte_code());
    }

    #[test]
    fn test_load_sources_prefers_file_then_resource() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("scripts");
        fs::create_dir(&folder).unwrap();
        fs::write(folder.join("isr.tsp"), "isr = {}\n").unwrap();
        let resource_root = dir.path().join("resources");
        fs::create_dir(&resource_root).unwrap();
        fs::write(resource_root.join("meter.scripts.meter.tsp"), "meter = {}").unwrap();

        let mut from_file = FirmwareScriptDescriptor::new("isr", "").unwrap();
        from_file.set_folder_path(&folder);
        from_file.set_file_name("isr.tsp");
        let mut from_resource = FirmwareScriptDescriptor::new("meter", "").unwrap();
        from_resource.set_folder_path(&folder);
        from_resource.set_file_name("absent.tsp");
        from_resource.set_resource_file_name("meter.tsp");
        from_resource.set_namespace_list("meter");

        let mut descriptors = vec![from_file, from_resource];
        let resources = ResourceDirectory::new(&resource_root);
        load_sources(&mut descriptors, Some(&resources)).unwrap();
        assert_eq!(descriptors[0].source(), "isr = {} ");
        assert_eq!(descriptors[1].source(), "meter = {} ");
    }

    #[test]
    fn test_load_sources_without_resources() {
        let mut descriptor = FirmwareScriptDescriptor::new("isr", "").unwrap();
        descriptor.set_file_name("absent.tsp");
        let err = load_sources(std::slice::from_mut(&mut descriptor), None).unwrap_err();
        assert!(matches!(err, DeployError::FileNotFound(_)));
    }
}
