use std::collections::{BTreeSet, HashMap};

use harbor_proto::PermissionKind;
use thiserror::Error;

/// Outcome of a registry lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Granted,
    Ungranted,
}

impl Grant {
    pub fn is_granted(&self) -> bool {
        matches!(self, Grant::Granted)
    }
}

/// Permissions a target has granted to its bound controller.
///
/// `Unknown` can never enter the set, so a command that resolves to it
/// always fails the check.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PermissionRegistry {
    granted: BTreeSet<PermissionKind>,
}

impl PermissionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, permission: PermissionKind) -> Grant {
        if permission.is_grantable() && self.granted.contains(&permission) {
            Grant::Granted
        } else {
            Grant::Ungranted
        }
    }

    /// Returns true when the permission was not already held.
    pub fn grant(&mut self, permission: PermissionKind) -> bool {
        if !permission.is_grantable() {
            return false;
        }
        self.granted.insert(permission)
    }

    pub fn revoke_all(&mut self) {
        self.granted.clear();
    }

    pub fn granted(&self) -> &BTreeSet<PermissionKind> {
        &self.granted
    }

    pub fn is_empty(&self) -> bool {
        self.granted.is_empty()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("command '{0}' cannot be registered against the unknown permission")]
    UnknownPermission(String),
    #[error("command name must not be empty")]
    EmptyCommand,
}

/// Maps command names onto the permission kind that gates them.
#[derive(Debug, Clone)]
pub struct PermissionCatalog {
    commands: HashMap<String, PermissionKind>,
}

impl Default for PermissionCatalog {
    fn default() -> Self {
        let commands = PermissionKind::GRANTABLE
            .iter()
            .map(|kind| (kind.as_str().to_string(), *kind))
            .collect();
        Self { commands }
    }
}

impl PermissionCatalog {
    pub fn empty() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        command: impl Into<String>,
        permission: PermissionKind,
    ) -> Result<(), CatalogError> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(CatalogError::EmptyCommand);
        }
        if !permission.is_grantable() {
            return Err(CatalogError::UnknownPermission(command));
        }
        self.commands.insert(command, permission);
        Ok(())
    }

    pub fn resolve(&self, command: &str) -> PermissionKind {
        self.commands
            .get(command)
            .copied()
            .unwrap_or(PermissionKind::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn unknown_is_never_granted() {
        let mut registry = PermissionRegistry::new();
        assert!(!registry.grant(PermissionKind::Unknown));
        assert_eq!(registry.check(PermissionKind::Unknown), Grant::Ungranted);
        assert!(registry.is_empty());
    }

    #[test_timeout::timeout]
    fn grants_are_per_kind() {
        let mut registry = PermissionRegistry::new();
        assert!(registry.grant(PermissionKind::Camera));
        assert!(!registry.grant(PermissionKind::Camera));
        assert!(registry.check(PermissionKind::Camera).is_granted());
        assert!(!registry.check(PermissionKind::Files).is_granted());

        registry.revoke_all();
        assert!(!registry.check(PermissionKind::Camera).is_granted());
    }

    #[test_timeout::timeout]
    fn catalog_defaults_cover_builtin_commands() {
        let catalog = PermissionCatalog::default();
        assert_eq!(catalog.resolve("sms"), PermissionKind::Sms);
        assert_eq!(catalog.resolve("location"), PermissionKind::Location);
        assert_eq!(catalog.resolve("self-destruct"), PermissionKind::Unknown);
    }

    #[test_timeout::timeout]
    fn catalog_extends_by_registration_only() {
        let mut catalog = PermissionCatalog::empty();
        catalog
            .register("snapshot", PermissionKind::Camera)
            .expect("register");
        assert_eq!(catalog.resolve("snapshot"), PermissionKind::Camera);
        assert_eq!(
            catalog.register("mystery", PermissionKind::Unknown),
            Err(CatalogError::UnknownPermission("mystery".into()))
        );
        assert_eq!(
            catalog.register("  ", PermissionKind::Files),
            Err(CatalogError::EmptyCommand)
        );
    }
}
