//! User groups and namespace permission assignment.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::permission::{NamespacePermissions, PermissionLevel, WILDCARD_NAMESPACE};
use crate::error::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserGroup {
    pub id: Uuid,
    pub name: String,
    pub site_admin: bool,
    pub namespace_permissions: NamespacePermissions,
}

impl UserGroup {
    pub fn new(name: &str, site_admin: bool) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() || name.len() > 128 {
            return Err(AppError::Validation(
                "User group name must be between 1 and 128 characters".into(),
            ));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            site_admin,
            namespace_permissions: NamespacePermissions::new(),
        })
    }

    /// Only READ, MODIFY and FULL may be assigned to a group.
    pub fn set_permission(&mut self, namespace: &str, level: PermissionLevel) -> Result<()> {
        if !level.assignable_to_group() {
            return Err(AppError::Validation(format!(
                "Permission level {} cannot be assigned to a user group",
                level
            )));
        }
        let mut perms: NamespacePermissions = self
            .namespace_permissions
            .iter()
            .filter(|(ns, _)| !ns.eq_ignore_ascii_case(namespace))
            .map(|(ns, level)| (ns.clone(), *level))
            .collect();
        perms.grant(namespace, level);
        self.namespace_permissions = perms;
        Ok(())
    }

    pub fn remove_permission(&mut self, namespace: &str) -> bool {
        let before = self.namespace_permissions.len();
        self.namespace_permissions = self
            .namespace_permissions
            .iter()
            .filter(|(ns, _)| !ns.eq_ignore_ascii_case(namespace))
            .map(|(ns, level)| (ns.clone(), *level))
            .collect();
        self.namespace_permissions.len() != before
    }
}

/// Effective permissions of a principal: the maximum over every group and
/// direct assignment. A site-admin group grants `*` at FULL.
pub fn effective_permissions(
    groups: &[UserGroup],
    direct: &NamespacePermissions,
) -> NamespacePermissions {
    let mut perms = direct.clone();
    for group in groups {
        perms.merge(&group.namespace_permissions);
        if group.site_admin {
            perms.grant(WILDCARD_NAMESPACE, PermissionLevel::Full);
        }
    }
    perms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_not_assignable() {
        let mut group = UserGroup::new("devs", false).unwrap();
        assert!(group.set_permission("acme", PermissionLevel::Upload).is_err());
        group.set_permission("acme", PermissionLevel::Modify).unwrap();
        group.set_permission("ACME", PermissionLevel::Read).unwrap();
        assert_eq!(
            group.namespace_permissions.resolve("acme"),
            Some(PermissionLevel::Read)
        );
    }

    #[test]
    fn test_effective_permissions_max_over_groups() {
        let mut a = UserGroup::new("a", false).unwrap();
        a.set_permission("acme", PermissionLevel::Read).unwrap();
        let mut b = UserGroup::new("b", false).unwrap();
        b.set_permission("acme", PermissionLevel::Full).unwrap();
        let direct = NamespacePermissions::new().with("other", PermissionLevel::Modify);
        let perms = effective_permissions(&[a, b], &direct);
        assert_eq!(perms.resolve("acme"), Some(PermissionLevel::Full));
        assert_eq!(perms.resolve("other"), Some(PermissionLevel::Modify));
        assert_eq!(perms.resolve("missing"), None);
    }

    #[test]
    fn test_site_admin_injects_wildcard() {
        let admins = UserGroup::new("admins", true).unwrap();
        let perms = effective_permissions(&[admins], &NamespacePermissions::new());
        assert_eq!(perms.get("*"), Some(PermissionLevel::Full));
        assert!(perms.has("anything", PermissionLevel::Full));
    }

    #[test]
    fn test_remove_permission() {
        let mut group = UserGroup::new("devs", false).unwrap();
        group.set_permission("acme", PermissionLevel::Read).unwrap();
        assert!(group.remove_permission("Acme"));
        assert!(!group.remove_permission("acme"));
    }
}
