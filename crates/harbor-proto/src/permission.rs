use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Capability category gating a class of commands.
///
/// The set is closed: new commands are mapped onto an existing kind, never
/// onto a fresh string. Anything the wire carries that is not one of the
/// named kinds collapses into [`PermissionKind::Unknown`], which can never be
/// granted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    Camera,
    Files,
    Sms,
    Flashlight,
    Location,
    #[serde(other)]
    Unknown,
}

impl PermissionKind {
    /// Every kind a target can actually grant.
    pub const GRANTABLE: [PermissionKind; 5] = [
        PermissionKind::Camera,
        PermissionKind::Files,
        PermissionKind::Sms,
        PermissionKind::Flashlight,
        PermissionKind::Location,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionKind::Camera => "camera",
            PermissionKind::Files => "files",
            PermissionKind::Sms => "sms",
            PermissionKind::Flashlight => "flashlight",
            PermissionKind::Location => "location",
            PermissionKind::Unknown => "unknown",
        }
    }

    /// Human readable label used when prompting the local user.
    pub fn label(&self) -> &'static str {
        match self {
            PermissionKind::Camera => "Camera Access",
            PermissionKind::Files => "File Access",
            PermissionKind::Sms => "SMS Access",
            PermissionKind::Flashlight => "Flashlight Control",
            PermissionKind::Location => "Location Access",
            PermissionKind::Unknown => "Unknown Capability",
        }
    }

    pub fn is_grantable(&self) -> bool {
        !matches!(self, PermissionKind::Unknown)
    }
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unrecognised permission kind '{0}'")]
pub struct PermissionParseError(String);

impl FromStr for PermissionKind {
    type Err = PermissionParseError;

    /// Strict parse for configuration input; the wire path uses serde and
    /// falls back to `Unknown` instead of failing.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        PermissionKind::GRANTABLE
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| PermissionParseError(value.to_string()))
    }
}
