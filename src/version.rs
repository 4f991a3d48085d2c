//! Firmware version parsing and reconciliation.
//!
//! Versions are dotted numeric tuples (`major.minor[.build[.revision]]`). They are
//! ordered component by component; a version that is a strict prefix of another
//! orders before it, so `1.2 < 1.2.0`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DeployError;

/// Maximum number of dotted components.
pub const MAX_COMPONENTS: usize = 4;

/// A parsed dotted version number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirmwareVersion {
    components: Vec<u32>,
}

impl FirmwareVersion {
    /// Parses a version, returning `None` when the text is not a version.
    pub fn try_parse(text: &str) -> Option<Self> {
        text.parse().ok()
    }

    /// Numeric components, most significant first.
    pub fn components(&self) -> &[u32] {
        &self.components
    }
}

impl FromStr for FirmwareVersion {
    type Err = DeployError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let trimmed = text.trim();
        let components = trimmed
            .split('.')
            .map(|part| part.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| DeployError::VersionParse(text.to_string()))?;
        if components.is_empty() || components.len() > MAX_COMPONENTS {
            return Err(DeployError::VersionParse(text.to_string()));
        }
        Ok(Self { components })
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components.cmp(&other.components)
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.components.iter().map(u32::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Outcome of comparing a node's embedded version with the released version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VersionStatus {
    /// Not evaluated yet.
    #[default]
    None,
    /// Embedded version is older than the release.
    Older,
    /// Embedded version equals the release.
    Current,
    /// Embedded version is newer than the release.
    Newer,
    /// The getter returned nothing (script not loaded or not run).
    Unknown,
    /// The catalog has no released version for the script.
    ReleaseVersionNotSet,
    /// No version getter is configured for the script.
    Missing,
}

impl VersionStatus {
    /// Applies the reconciliation decision table.
    ///
    /// Rules are evaluated in order: missing getter, missing release version,
    /// empty embedded version, then numeric comparison.
    pub fn reconcile(has_getter: bool, released_version: &str, embedded_version: &str) -> Self {
        if !has_getter {
            return Self::Missing;
        }
        let released = released_version.trim();
        let released = released.strip_prefix('+').unwrap_or(released);
        if released.is_empty() {
            return Self::ReleaseVersionNotSet;
        }
        if embedded_version.trim().is_empty() {
            return Self::Unknown;
        }
        let Some(released) = FirmwareVersion::try_parse(released) else {
            return Self::ReleaseVersionNotSet;
        };
        let Some(embedded) = FirmwareVersion::try_parse(embedded_version) else {
            return Self::Unknown;
        };
        match embedded.cmp(&released) {
            Ordering::Less => Self::Older,
            Ordering::Equal => Self::Current,
            Ordering::Greater => Self::Newer,
        }
    }

    /// True for the states that mean the embedded version cannot be determined.
    pub fn is_unspecified(self) -> bool {
        matches!(self, Self::Missing | Self::Unknown)
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::None => "none",
            Self::Older => "older",
            Self::Current => "current",
            Self::Newer => "newer",
            Self::Unknown => "unknown",
            Self::ReleaseVersionNotSet => "release version not set",
            Self::Missing => "missing",
        };
        f.write_str(text)
    }
}
