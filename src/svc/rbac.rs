//! # Rbac module
//!
//! This module computes the role and role binding that grant read access on
//! an inventory to the users and groups allowed to use it.

use std::collections::BTreeSet;

use k8s_openapi::{
    api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::ResourceExt;

use crate::svc::{
    crd::{
        inventory::{self, DBaaSInventory},
        tenant::DBaaSTenant,
        GROUP,
    },
    k8s::resource,
};

// -----------------------------------------------------------------------------
// Constants

pub const RBAC_GROUP: &str = "rbac.authorization.k8s.io";
pub const KIND_USER: &str = "User";
pub const KIND_GROUP: &str = "Group";

// -----------------------------------------------------------------------------
// Helpers

/// returns the name of the role that grants read access on the inventory
pub fn role_name(inventory: &str) -> String {
    format!("dbaas-{}-inventory-viewer", inventory)
}

/// returns the subjects allowed to read the inventory, the ones it declares
/// or the developers of every tenant of its namespace
pub fn subjects(inventory: &DBaaSInventory, tenants: &[DBaaSTenant]) -> Vec<Subject> {
    let namespace = inventory.namespace().unwrap_or_default();
    let mut users = BTreeSet::new();
    let mut groups = BTreeSet::new();

    match &inventory.spec.authz {
        Some(inventory::Authz { users: u, groups: g }) if u.is_some() || g.is_some() => {
            users.extend(u.iter().flatten().cloned());
            groups.extend(g.iter().flatten().cloned());
        }
        _ => {
            for tenant in tenants
                .iter()
                .filter(|tenant| tenant.spec.inventory_namespace == namespace)
            {
                let developer = &tenant.spec.authz.developer;
                users.extend(developer.users.iter().flatten().cloned());
                groups.extend(developer.groups.iter().flatten().cloned());
            }
        }
    }

    let subject = |kind: &str, name: String| Subject {
        api_group: Some(RBAC_GROUP.to_string()),
        kind: kind.to_string(),
        name,
        namespace: Some(namespace.to_owned()),
    };

    users
        .into_iter()
        .map(|user| subject(KIND_USER, user))
        .chain(groups.into_iter().map(|group| subject(KIND_GROUP, group)))
        .collect()
}

/// returns the role and role binding of the inventory, both owned by it
pub fn inventory_objects(inventory: &DBaaSInventory, tenants: &[DBaaSTenant]) -> (Role, RoleBinding) {
    let (namespace, name) = resource::namespaced_name(inventory);
    let role = role_name(&name);
    let owners = resource::owner_reference(inventory).map(|owner| vec![owner]);

    let metadata = |name: String| ObjectMeta {
        name: Some(name),
        namespace: Some(namespace.to_owned()),
        owner_references: owners.to_owned(),
        ..Default::default()
    };

    let binding = RoleBinding {
        metadata: metadata(format!("{}s", role)),
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "Role".to_string(),
            name: role.to_owned(),
        },
        subjects: Some(subjects(inventory, tenants)),
    };

    let role = Role {
        metadata: metadata(role),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![GROUP.to_string()]),
            resources: Some(vec![
                "dbaasinventories".to_string(),
                "dbaasinventories/status".to_string(),
            ]),
            resource_names: Some(vec![name]),
            verbs: vec!["get".to_string()],
            ..Default::default()
        }]),
    };

    (role, binding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::crd::tests::{inventory_in, tenant_of};

    #[test]
    fn tenants_subjects_are_deduplicated() {
        let inventory = inventory_in("aws", "tenant-ns", None);
        let tenants = vec![
            tenant_of("first", "tenant-ns", &["alice", "bob"], &["devs"]),
            tenant_of("second", "tenant-ns", &["alice"], &["devs"]),
            tenant_of("elsewhere", "other-ns", &["carol"], &[]),
        ];

        let subjects = subjects(&inventory, &tenants);
        let names: Vec<_> = subjects
            .iter()
            .map(|subject| (subject.kind.as_str(), subject.name.as_str()))
            .collect();

        assert_eq!(
            vec![(KIND_USER, "alice"), (KIND_USER, "bob"), (KIND_GROUP, "devs")],
            names
        );
    }

    #[test]
    fn explicit_authorization_wins_over_tenants() {
        let mut inventory = inventory_in("aws", "tenant-ns", None);
        inventory.spec.authz = Some(inventory::Authz {
            users: Some(vec!["dave".to_string(), "dave".to_string()]),
            groups: None,
        });
        let tenants = vec![tenant_of("first", "tenant-ns", &["alice"], &["devs"])];

        let subjects = subjects(&inventory, &tenants);

        assert_eq!(1, subjects.len());
        assert_eq!("dave", subjects[0].name);
    }

    #[test]
    fn objects_grant_read_on_the_inventory_only() {
        let inventory = inventory_in("aws", "tenant-ns", None);
        let (role, binding) = inventory_objects(&inventory, &[]);

        assert_eq!(Some("dbaas-inventory-inventory-viewer".to_string()), role.metadata.name);
        assert_eq!(Some("dbaas-inventory-inventory-viewers".to_string()), binding.metadata.name);
        assert_eq!(role.metadata.name, Some(binding.role_ref.name.to_owned()));

        let rule = &role.rules.expect("role to have rules")[0];
        assert_eq!(vec!["get".to_string()], rule.verbs);
        assert_eq!(Some(vec!["inventory".to_string()]), rule.resource_names);
        assert_eq!(
            Some("uid-inventory".to_string()),
            role.metadata
                .owner_references
                .and_then(|owners| owners.first().map(|owner| owner.uid.to_owned()))
        );
    }
}
