//! Release-catalog entry for one firmware script.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::codec::{self, CodecError, ScriptFormat};
use crate::error::{DeployError, DeployResult};
use crate::model_mask;

/// Marks a released version whose script file needs a read-parse-write pass.
pub const READ_PARSE_WRITE_MARKER: char = '+';

/// Identity and deployment metadata of a firmware script.
///
/// The name and model mask are fixed at construction. Everything else is set
/// while the catalog is built; once bound to nodes the descriptor is shared
/// read-only behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareScriptDescriptor {
    name: String,
    model_mask: String,
    folder_path: PathBuf,
    file_name: String,
    resource_file_name: String,
    resource_file_format: ScriptFormat,
    released_version: String,
    firmware_version_getter: String,
    namespace_list: String,
    is_boot_script: bool,
    is_primary_script: bool,
    is_support_script: bool,
    save_as_binary: bool,
    embed_to_non_volatile_memory: bool,
    convert_to_byte_code: bool,
    source: String,
    source_format: ScriptFormat,
    is_binary_script: bool,
    saved_to_file: bool,
}

impl FirmwareScriptDescriptor {
    /// Creates a descriptor. An empty mask applies to every model.
    pub fn new(name: &str, model_mask: &str) -> DeployResult<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DeployError::MissingValue("script name"));
        }
        Ok(Self {
            name: name.to_string(),
            model_mask: model_mask.trim().to_string(),
            folder_path: PathBuf::new(),
            file_name: String::new(),
            resource_file_name: String::new(),
            resource_file_format: ScriptFormat::empty(),
            released_version: String::new(),
            firmware_version_getter: String::new(),
            namespace_list: String::new(),
            is_boot_script: false,
            is_primary_script: false,
            is_support_script: false,
            save_as_binary: false,
            embed_to_non_volatile_memory: false,
            convert_to_byte_code: false,
            source: String::new(),
            source_format: ScriptFormat::empty(),
            is_binary_script: false,
            saved_to_file: true,
        })
    }

    /// Script name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Model mask, empty for every model.
    pub fn model_mask(&self) -> &str {
        &self.model_mask
    }

    /// Collection key: name followed by model mask.
    pub fn key(&self) -> String {
        format!("{}{}", self.name, self.model_mask)
    }

    /// True when the script applies to the model.
    pub fn applies_to(&self, model_number: &str) -> bool {
        model_mask::matches(model_number, &self.model_mask)
    }

    // ---- file locations ----

    /// Folder holding the script and resource files.
    pub fn folder_path(&self) -> &Path {
        &self.folder_path
    }

    /// Sets the folder.
    pub fn set_folder_path(&mut self, folder_path: impl Into<PathBuf>) {
        self.folder_path = folder_path.into();
    }

    /// Script file name inside the folder.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Sets the script file name.
    pub fn set_file_name(&mut self, file_name: &str) {
        self.file_name = file_name.to_string();
    }

    /// Bundled resource name, used when the script file is absent.
    pub fn resource_file_name(&self) -> &str {
        &self.resource_file_name
    }

    /// Sets the resource name.
    pub fn set_resource_file_name(&mut self, resource_file_name: &str) {
        self.resource_file_name = resource_file_name.to_string();
    }

    /// Script file path: folder joined with file name.
    pub fn file_path(&self) -> PathBuf {
        self.folder_path.join(&self.file_name)
    }

    /// Resource file path: folder joined with resource file name.
    pub fn resource_file_path(&self) -> PathBuf {
        self.folder_path.join(&self.resource_file_name)
    }

    /// Format the resource file is stored in.
    pub fn resource_file_format(&self) -> ScriptFormat {
        self.resource_file_format
    }

    /// Changes the resource format; a loaded source is re-checked against it.
    pub fn set_resource_file_format(&mut self, format: ScriptFormat) {
        self.resource_file_format = format;
        if !self.source.is_empty() {
            self.saved_to_file = self.source_format == format;
        }
    }

    // ---- versions ----

    /// Released version as configured, including a read-parse-write marker.
    pub fn released_version(&self) -> &str {
        &self.released_version
    }

    /// Sets the released version; a leading `+` requests read-parse-write.
    pub fn set_released_version(&mut self, version: &str) {
        self.released_version = version.trim().to_string();
    }

    /// Released version without the read-parse-write marker.
    pub fn comparable_released_version(&self) -> &str {
        self.released_version
            .strip_prefix(READ_PARSE_WRITE_MARKER)
            .unwrap_or(&self.released_version)
            .trim()
    }

    /// True when the script file must be trimmed and written again.
    pub fn requires_read_parse_write(&self) -> bool {
        self.released_version.starts_with(READ_PARSE_WRITE_MARKER)
    }

    /// Expression that returns the embedded version, e.g. `isr.version`.
    pub fn firmware_version_getter(&self) -> &str {
        &self.firmware_version_getter
    }

    /// Sets the version getter expression.
    pub fn set_firmware_version_getter(&mut self, getter: &str) {
        self.firmware_version_getter = getter.trim().to_string();
    }

    /// True when a version getter is configured.
    pub fn has_version_getter(&self) -> bool {
        !self.firmware_version_getter.is_empty()
    }

    // ---- namespaces ----

    /// Comma-separated namespace list as configured.
    pub fn namespace_list(&self) -> &str {
        &self.namespace_list
    }

    /// Sets the comma-separated namespace list.
    pub fn set_namespace_list(&mut self, namespace_list: &str) {
        self.namespace_list = namespace_list.to_string();
    }

    /// Namespaces defined by the script.
    pub fn namespaces(&self) -> Vec<&str> {
        self.namespace_list
            .split(',')
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .collect()
    }

    /// First namespace, or empty.
    pub fn top_namespace(&self) -> &str {
        self.namespaces().first().copied().unwrap_or_default()
    }

    // ---- flags ----

    /// Runs at power-up.
    pub fn is_boot_script(&self) -> bool {
        self.is_boot_script
    }

    /// Marks the script as a power-up script.
    pub fn set_boot_script(&mut self, value: bool) {
        self.is_boot_script = value;
    }

    /// Part of the primary program.
    pub fn is_primary_script(&self) -> bool {
        self.is_primary_script
    }

    /// Marks the script as part of the primary program.
    pub fn set_primary_script(&mut self, value: bool) {
        self.is_primary_script = value;
    }

    /// Library the primary scripts depend on.
    pub fn is_support_script(&self) -> bool {
        self.is_support_script
    }

    /// Marks the script as a support library.
    pub fn set_support_script(&mut self, value: bool) {
        self.is_support_script = value;
    }

    /// Release metadata: the script ships as byte code.
    ///
    /// Only reported; byte code is produced on the node, so neither resource
    /// writing nor upload changes with this flag.
    pub fn save_as_binary(&self) -> bool {
        self.save_as_binary
    }

    /// Sets the byte-code release flag.
    pub fn set_save_as_binary(&mut self, value: bool) {
        self.save_as_binary = value;
    }

    /// Saved to non-volatile memory during deployment.
    pub fn embed_to_non_volatile_memory(&self) -> bool {
        self.embed_to_non_volatile_memory
    }

    /// Requests saving to non-volatile memory.
    pub fn set_embed_to_non_volatile_memory(&mut self, value: bool) {
        self.embed_to_non_volatile_memory = value;
    }

    /// Converted to byte code before saving.
    pub fn convert_to_byte_code(&self) -> bool {
        self.convert_to_byte_code
    }

    /// Requests byte-code conversion before saving.
    pub fn set_convert_to_byte_code(&mut self, value: bool) {
        self.convert_to_byte_code = value;
    }

    // ---- source ----

    /// Normalized plain source, empty when not loaded.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True once a non-empty source has been set.
    pub fn has_source(&self) -> bool {
        !self.source.is_empty()
    }

    /// Format the source was found in.
    pub fn source_format(&self) -> ScriptFormat {
        self.source_format
    }

    /// True when the plain source is byte code.
    pub fn is_binary_script(&self) -> bool {
        self.is_binary_script
    }

    /// True when the source was read in the resource file's format.
    pub fn saved_to_file(&self) -> bool {
        self.saved_to_file
    }

    /// Sets the source from stored text, decoding compressed scripts.
    ///
    /// Blank text clears the source and its format flags.
    pub fn set_source(&mut self, text: &str) -> Result<(), CodecError> {
        if text.trim().is_empty() {
            self.source.clear();
            self.source_format = ScriptFormat::empty();
            self.is_binary_script = false;
            self.saved_to_file = true;
            return Ok(());
        }
        let (plain, format) = codec::decode(text)?;
        self.is_binary_script = format.contains(ScriptFormat::BINARY);
        self.source_format = format;
        self.saved_to_file = format == self.resource_file_format;
        self.source = plain;
        Ok(())
    }

    /// Reads the script file into the source.
    pub fn read_source_file(&mut self) -> DeployResult<()> {
        let path = self.file_path();
        if !path.is_file() {
            return Err(DeployError::FileNotFound(path));
        }
        let text = fs::read_to_string(&path)?;
        self.set_source(&text)?;
        debug!("Read {} ({:?})", path.display(), self.source_format);
        Ok(())
    }

    /// Writes the source to the resource file in the resource format.
    pub fn write_resource_file(&mut self) -> DeployResult<PathBuf> {
        if !self.has_source() {
            return Err(DeployError::SourceNotLoaded(self.name.clone()));
        }
        let path = self.resource_file_path();
        let text = codec::encode(&self.source, self.resource_file_format)?;
        fs::write(&path, text)?;
        self.source_format = (self.source_format & ScriptFormat::BINARY)
            | (self.resource_file_format & ScriptFormat::COMPRESSED);
        self.saved_to_file = self.source_format == self.resource_file_format;
        debug!("Wrote {}", path.display());
        Ok(path)
    }
}

impl fmt::Display for FirmwareScriptDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.model_mask.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} [{}]", self.name, self.model_mask)
        }
    }
}
