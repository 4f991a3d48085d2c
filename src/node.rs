//! Identity of a node on the instrument network.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Describes one addressable node.
///
/// The controller node is addressed directly; subordinate nodes are reached
/// through it with a `node[N].` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    model_number: String,
    serial_number: String,
    node_number: u8,
    is_controller: bool,
    boot_script_embed_required: bool,
    #[serde(default)]
    firmware_version: String,
}

impl NodeIdentity {
    /// Creates the identity of the controller node.
    pub fn controller(model_number: &str, serial_number: &str, node_number: u8) -> Self {
        Self {
            model_number: model_number.to_string(),
            serial_number: serial_number.to_string(),
            node_number,
            is_controller: true,
            boot_script_embed_required: false,
            firmware_version: String::new(),
        }
    }

    /// Creates the identity of a node reached through the controller.
    pub fn subordinate(model_number: &str, serial_number: &str, node_number: u8) -> Self {
        Self {
            is_controller: false,
            ..Self::controller(model_number, serial_number, node_number)
        }
    }

    /// Requires boot scripts to be embedded again even when already present.
    pub fn with_boot_script_embed_required(mut self, required: bool) -> Self {
        self.boot_script_embed_required = required;
        self
    }

    /// Records the instrument firmware version reported by the node.
    pub fn with_firmware_version(mut self, version: &str) -> Self {
        self.firmware_version = version.to_string();
        self
    }

    /// Model number, e.g. `2602A`.
    pub fn model_number(&self) -> &str {
        &self.model_number
    }

    /// Serial number.
    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    /// Node number on the instrument network.
    pub fn node_number(&self) -> u8 {
        self.node_number
    }

    /// True for the node the host talks to directly.
    pub fn is_controller(&self) -> bool {
        self.is_controller
    }

    /// True when boot scripts must be embedded again on every deployment.
    pub fn boot_script_embed_required(&self) -> bool {
        self.boot_script_embed_required
    }

    /// Instrument firmware version, empty when not reported.
    pub fn firmware_version(&self) -> &str {
        &self.firmware_version
    }

    /// Major component of the instrument firmware version.
    pub fn firmware_major(&self) -> Option<&str> {
        self.firmware_version
            .split('.')
            .next()
            .map(str::trim)
            .filter(|major| !major.is_empty())
    }

    /// Leading digits of the model number, e.g. `2602` for `2602A`.
    pub fn model_family(&self) -> &str {
        let end = self
            .model_number
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(self.model_number.len());
        &self.model_number[..end]
    }

    /// Prefix that addresses globals on this node from the controller.
    pub fn command_prefix(&self) -> String {
        if self.is_controller {
            String::new()
        } else {
            format!("node[{}].", self.node_number)
        }
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} SN {} (node {})",
            self.model_number, self.serial_number, self.node_number
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_prefix() {
        assert_eq!(NodeIdentity::controller("2602A", "1", 1).command_prefix(), "");
        assert_eq!(
            NodeIdentity::subordinate("2602A", "2", 3).command_prefix(),
            "node[3]."
        );
    }

    #[test]
    fn test_model_family_and_firmware_major() {
        let node = NodeIdentity::controller("2602A", "4046", 1).with_firmware_version("2.1.6");
        assert_eq!(node.model_family(), "2602");
        assert_eq!(node.firmware_major(), Some("2"));
        assert_eq!(NodeIdentity::controller("2602A", "1", 1).firmware_major(), None);
    }
}
