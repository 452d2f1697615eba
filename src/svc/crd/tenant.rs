//! # Tenant custom resource
//!
//! This module provide the tenant custom resource, which gives the default
//! developers of the inventories of a namespace, and its reconciliation loop
//! that keeps the access to those inventories in line with it.

use std::sync::Arc;

use async_trait::async_trait;
use kube::{
    runtime::{watcher, Controller},
    Api, CustomResource, Resource, ResourceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::svc::{
    cfg::Configuration,
    crd::{
        inventory::{self, DBaaSInventory},
        ReconcilerError,
    },
    k8s::{self, controller_config, finalizer, resource, Context, ControllerBuilder, Outcome},
    rbac,
};

// -----------------------------------------------------------------------------
// Constants

/// annotation that holds the namespace whose inventories the tenant has been
/// projected on
pub const PROJECTED_NAMESPACE: &str = "dbaas.redhat.com/inventory-namespace";

/// finalizer that withdraws the access given by the tenant
pub const FINALIZER: &str = "dbaas.redhat.com/rbac";

// -----------------------------------------------------------------------------
// Authz structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Authz {
    /// users and groups that may read the inventories of the namespace
    #[serde(rename = "developer", default)]
    pub developer: inventory::Authz,
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[kube(group = "dbaas.redhat.com")]
#[kube(version = "v1alpha1")]
#[kube(kind = "DBaaSTenant")]
#[kube(singular = "dbaastenant")]
#[kube(plural = "dbaastenants")]
#[kube(derive = "PartialEq")]
pub struct Spec {
    #[serde(rename = "inventoryNamespace")]
    pub inventory_namespace: String,
    #[serde(rename = "authz", default)]
    pub authz: Authz,
}

// -----------------------------------------------------------------------------
// DBaaSTenant implementation

impl DBaaSTenant {
    /// returns the namespace the tenant has last been projected on
    pub fn projected_namespace(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(PROJECTED_NAMESPACE))
            .map(String::as_str)
    }

    /// returns the tenant with its finalizer and the namespace it is
    /// projected on
    fn tracked(&self) -> Self {
        let mut tenant = finalizer::add(self.to_owned(), FINALIZER);

        tenant
            .annotations_mut()
            .insert(PROJECTED_NAMESPACE.to_string(), self.spec.inventory_namespace.to_owned());

        tenant
    }
}

// -----------------------------------------------------------------------------
// Helpers

/// returns the tenants of the inventory namespace, tenants being deleted are
/// left out
pub async fn list_by_namespace(ctx: &Context, namespace: &str) -> Result<Vec<DBaaSTenant>, ReconcilerError> {
    Ok(resource::list::<DBaaSTenant>(&*ctx.store, None)
        .await?
        .into_iter()
        .filter(|tenant| tenant.spec.inventory_namespace == namespace && !resource::deleted(tenant))
        .collect())
}

/// returns a soft requeue if the write collided with another one
fn requeue_on_conflict(err: resource::Error) -> Result<Outcome, ReconcilerError> {
    if err.is_conflict() {
        Ok(Outcome::RequeueNow)
    } else {
        Err(err.into())
    }
}

/// create or update the role and role binding of the inventory
pub async fn project(
    ctx: &Context,
    inventory: &DBaaSInventory,
    tenants: &[DBaaSTenant],
) -> Result<Outcome, ReconcilerError> {
    let (role, binding) = rbac::inventory_objects(inventory, tenants);

    if let Err(err) = resource::upsert(&*ctx.store, &role).await {
        return requeue_on_conflict(err);
    }

    if let Err(err) = resource::upsert(&*ctx.store, &binding).await {
        return requeue_on_conflict(err);
    }

    Ok(Outcome::Done)
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl ControllerBuilder<DBaaSTenant> for Reconciler {
    fn build(&self, client: kube::Client, config: &Configuration) -> Controller<DBaaSTenant> {
        Controller::new(Api::all(client), watcher::Config::default()).with_config(controller_config(config))
    }
}

#[async_trait]
impl k8s::Reconciler<DBaaSTenant> for Reconciler {
    type Error = ReconcilerError;

    async fn upsert(ctx: Arc<Context>, origin: Arc<DBaaSTenant>) -> Result<Outcome, ReconcilerError> {
        let kind = DBaaSTenant::kind(&()).to_string();
        let name = origin.name_any();
        let namespace = &origin.spec.inventory_namespace;

        // ---------------------------------------------------------------------
        // Step 1: withdraw access from the namespace the tenant moved away from

        if let Some(previous) = origin.projected_namespace().filter(|previous| *previous != namespace.as_str()) {
            info!(
                kind = &kind,
                name = &name,
                namespace = previous,
                "Withdraw access of tenant on its previous inventory namespace",
            );

            let outcome = reproject(&ctx, previous, Some(&name)).await?;
            if outcome != Outcome::Done {
                return Ok(outcome);
            }
        }

        // ---------------------------------------------------------------------
        // Step 2: set finalizer and remember the projected namespace

        let modified = origin.tracked();
        if modified != *origin {
            match resource::replace(&*ctx.store, &modified).await {
                Ok(_) => {}
                Err(err) if err.is_conflict() => return Ok(Outcome::RequeueNow),
                Err(err) => return Err(err.into()),
            }
        }

        // ---------------------------------------------------------------------
        // Step 3: project access on every inventory of the namespace

        reproject(&ctx, namespace, None).await
    }

    async fn delete(ctx: Arc<Context>, origin: Arc<DBaaSTenant>) -> Result<(), ReconcilerError> {
        let kind = DBaaSTenant::kind(&()).to_string();
        let name = origin.name_any();

        if !finalizer::contains(&*origin, FINALIZER) {
            return Ok(());
        }

        let mut namespaces = vec![origin.spec.inventory_namespace.as_str()];
        namespaces.extend(
            origin
                .projected_namespace()
                .filter(|previous| *previous != origin.spec.inventory_namespace),
        );

        for namespace in namespaces {
            if reproject(&ctx, namespace, Some(&name)).await? != Outcome::Done {
                return Err(ReconcilerError::Reconcile(format!(
                    "access objects of namespace '{}' have been modified concurrently",
                    namespace
                )));
            }
        }

        info!(
            kind = &kind,
            name = &name,
            finalizer = FINALIZER,
            "Remove finalizer on custom resource",
        );

        resource::replace(&*ctx.store, &finalizer::remove((*origin).to_owned(), FINALIZER)).await?;
        Ok(())
    }
}

/// project the tenants of the namespace on each of its inventories, leaving
/// out the given tenant
async fn reproject(ctx: &Context, namespace: &str, excluded: Option<&str>) -> Result<Outcome, ReconcilerError> {
    let tenants: Vec<_> = list_by_namespace(ctx, namespace)
        .await?
        .into_iter()
        .filter(|tenant| Some(tenant.name_any().as_str()) != excluded)
        .collect();

    let inventories = resource::list::<DBaaSInventory>(&*ctx.store, Some(namespace)).await?;

    info!(
        namespace = namespace,
        inventories = inventories.len(),
        tenants = tenants.len(),
        "Project access of tenants on inventories",
    );

    for inventory in inventories.iter().filter(|inventory| !resource::deleted(*inventory)) {
        let outcome = project(ctx, inventory, &tenants).await?;
        if outcome != Outcome::Done {
            debug!(
                namespace = namespace,
                inventory = inventory.metadata.name.as_deref(),
                "Access objects of inventory have been modified, retry projecting",
            );
            return Ok(outcome);
        }
    }

    Ok(Outcome::Done)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::rbac::v1::RoleBinding;

    use super::*;
    use crate::svc::{
        crd::tests::{fixture, inventory_in, tenant_of, PROVIDER},
        k8s::{memory::MemoryStore, Reconciler as _},
    };

    fn subjects(store: &MemoryStore, namespace: &str, name: &str) -> Vec<String> {
        store
            .typed::<RoleBinding>(Some(namespace), name)
            .expect("role binding to exist")
            .subjects
            .unwrap_or_default()
            .into_iter()
            .map(|subject| subject.name)
            .collect()
    }

    fn stored(store: &MemoryStore, name: &str) -> Arc<DBaaSTenant> {
        Arc::new(store.typed::<DBaaSTenant>(None, name).expect("tenant to exist"))
    }

    #[tokio::test]
    async fn tenant_change_is_projected_on_every_inventory() {
        let fixture = fixture();
        let store = &fixture.store;

        let mut other = inventory_in(PROVIDER, "tenant-ns", None);
        other.metadata.name = Some("other".to_string());
        other.metadata.uid = Some("uid-other".to_string());

        store.insert(&inventory_in(PROVIDER, "tenant-ns", None));
        store.insert(&other);
        store.insert(&inventory_in(PROVIDER, "elsewhere", None));
        store.insert(&tenant_of("first", "tenant-ns", &["alice"], &[]));
        let second = store.insert(&tenant_of("second", "tenant-ns", &["alice", "bob"], &[]));

        let outcome = Reconciler::upsert(fixture.ctx.to_owned(), Arc::new(second))
            .await
            .expect("tenant to be reconciled");
        assert_eq!(Outcome::Done, outcome);

        for name in ["dbaas-inventory-inventory-viewers", "dbaas-other-inventory-viewers"] {
            assert_eq!(vec!["alice", "bob"], subjects(store, "tenant-ns", name));
        }

        assert!(store
            .typed::<RoleBinding>(Some("elsewhere"), "dbaas-inventory-inventory-viewers")
            .is_none());

        let second = stored(store, "second");
        assert!(finalizer::contains(&*second, FINALIZER));
        assert_eq!(Some("tenant-ns"), second.projected_namespace());
    }

    #[tokio::test]
    async fn projection_is_idempotent() {
        let fixture = fixture();
        let store = &fixture.store;

        store.insert(&inventory_in(PROVIDER, "tenant-ns", None));
        store.insert(&tenant_of("first", "tenant-ns", &["alice"], &["devs"]));

        Reconciler::upsert(fixture.ctx.to_owned(), stored(store, "first"))
            .await
            .expect("tenant to be reconciled");
        let outcome = Reconciler::upsert(fixture.ctx.to_owned(), stored(store, "first"))
            .await
            .expect("tenant to be reconciled");

        assert_eq!(Outcome::Done, outcome);
        assert_eq!(1, store.writes("DBaaSTenant"));
        assert_eq!(1, store.writes("Role"));
        assert_eq!(1, store.writes("RoleBinding"));
    }

    #[tokio::test]
    async fn removed_tenant_loses_access() {
        let fixture = fixture();
        let store = &fixture.store;

        store.insert(&inventory_in(PROVIDER, "tenant-ns", None));
        store.insert(&tenant_of("first", "tenant-ns", &["alice"], &[]));
        store.insert(&tenant_of("second", "tenant-ns", &["bob"], &[]));

        for name in ["first", "second"] {
            Reconciler::upsert(fixture.ctx.to_owned(), stored(store, name))
                .await
                .expect("tenant to be reconciled");
        }
        assert_eq!(
            vec!["alice", "bob"],
            subjects(store, "tenant-ns", "dbaas-inventory-inventory-viewers")
        );

        Reconciler::delete(fixture.ctx.to_owned(), stored(store, "second"))
            .await
            .expect("tenant to be released");

        assert_eq!(
            vec!["alice"],
            subjects(store, "tenant-ns", "dbaas-inventory-inventory-viewers")
        );
        assert!(!finalizer::contains(&*stored(store, "second"), FINALIZER));
    }

    #[tokio::test]
    async fn moved_tenant_loses_access_on_its_previous_namespace() {
        let fixture = fixture();
        let store = &fixture.store;

        store.insert(&inventory_in(PROVIDER, "tenant-ns", None));
        store.insert(&inventory_in(PROVIDER, "elsewhere", None));
        store.insert(&tenant_of("first", "tenant-ns", &["alice"], &[]));

        Reconciler::upsert(fixture.ctx.to_owned(), stored(store, "first"))
            .await
            .expect("tenant to be reconciled");

        let mut moved = (*stored(store, "first")).to_owned();
        moved.spec.inventory_namespace = "elsewhere".to_string();
        let moved = store.insert(&moved);

        let outcome = Reconciler::upsert(fixture.ctx.to_owned(), Arc::new(moved))
            .await
            .expect("tenant to be reconciled");
        assert_eq!(Outcome::Done, outcome);

        assert!(subjects(store, "tenant-ns", "dbaas-inventory-inventory-viewers").is_empty());
        assert_eq!(
            vec!["alice"],
            subjects(store, "elsewhere", "dbaas-inventory-inventory-viewers")
        );
        assert_eq!(Some("elsewhere"), stored(store, "first").projected_namespace());
    }
}
