//! # Inventory custom resource
//!
//! This module provide the inventory custom resource, which binds a provider
//! to a namespace and lists the database instances the provider discovered,
//! and its reconciliation loop.

use std::{collections::BTreeMap, ops::ControlFlow, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::{
    api::rbac::v1::{Role, RoleBinding},
    apimachinery::pkg::apis::meta::v1::Condition,
};
use kube::{
    runtime::{watcher, Controller},
    Api, CustomResource, Resource, ResourceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use tracing::debug;

use crate::svc::{
    cfg::Configuration,
    crd::{self, tenant, Delegated, LocalObjectReference, NamespacedName, ReconcilerError},
    k8s::{self, controller_config, resource, Context, ControllerBuilder, Outcome},
    status::{self, Statused},
    telemetry::gauge::{Metrics, Telemetry},
};

// -----------------------------------------------------------------------------
// Constants

/// allows connections and instances from every namespace
pub const WILDCARD_NAMESPACE: &str = "*";

// -----------------------------------------------------------------------------
// Authz structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Authz {
    #[serde(rename = "users", skip_serializing_if = "Option::is_none", default)]
    pub users: Option<Vec<String>>,
    #[serde(rename = "groups", skip_serializing_if = "Option::is_none", default)]
    pub groups: Option<Vec<String>>,
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "dbaas.redhat.com")]
#[kube(version = "v1alpha1")]
#[kube(kind = "DBaaSInventory")]
#[kube(singular = "dbaasinventory")]
#[kube(plural = "dbaasinventories")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
pub struct Spec {
    #[serde(rename = "providerRef")]
    pub provider_ref: NamespacedName,
    #[serde(rename = "credentialsRef", skip_serializing_if = "Option::is_none", default)]
    pub credentials_ref: Option<LocalObjectReference>,
    /// namespaces allowed to use the inventory beside its own, `*` allows all
    #[serde(rename = "connectionNamespaces", skip_serializing_if = "Option::is_none", default)]
    pub connection_namespaces: Option<Vec<String>>,
    /// users and groups allowed to read the inventory, the developers of the
    /// tenants of the namespace when absent
    #[serde(rename = "authz", skip_serializing_if = "Option::is_none", default)]
    pub authz: Option<Authz>,
}

// -----------------------------------------------------------------------------
// Status structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Instance {
    #[serde(rename = "instanceID")]
    pub instance_id: String,
    #[serde(rename = "name", default)]
    pub name: String,
    #[serde(rename = "instanceInfo", skip_serializing_if = "BTreeMap::is_empty", default)]
    pub instance_info: BTreeMap<String, String>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "conditions", default)]
    pub conditions: Vec<Condition>,
    #[serde(rename = "instances", default)]
    pub instances: Vec<Instance>,
}

// -----------------------------------------------------------------------------
// DBaaSInventory implementation

impl DBaaSInventory {
    /// returns if resources of the namespace may use the inventory
    pub fn accepts(&self, namespace: &str) -> bool {
        self.namespace().as_deref() == Some(namespace)
            || self
                .spec
                .connection_namespaces
                .iter()
                .flatten()
                .any(|allowed| allowed == namespace || allowed == WILDCARD_NAMESPACE)
    }
}

impl Statused for DBaaSInventory {
    type Status = Status;

    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|status| status.conditions.as_slice())
            .unwrap_or_default()
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Status::default).conditions
    }

    fn provider_conditions(status: &Status) -> &[Condition] {
        &status.conditions
    }

    fn replace_status(&mut self, status: Status) {
        self.status = Some(status);
    }
}

impl Delegated for DBaaSInventory {
    fn provider_kind(provider: &crd::provider::DBaaSProvider) -> &str {
        &provider.spec.inventory_kind
    }

    fn sync_condition(config: &Configuration) -> &str {
        &config.conditions.inventory
    }

    fn metrics(telemetry: &Telemetry) -> &Metrics {
        &telemetry.inventory
    }

    /// inventories report the synchronisation condition of their provider
    fn metrics_condition(&self, config: &Configuration) -> Option<&Condition> {
        status::find(self.conditions(), Self::sync_condition(config))
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl ControllerBuilder<DBaaSInventory> for Reconciler {
    fn build(&self, client: kube::Client, config: &Configuration) -> Controller<DBaaSInventory> {
        Controller::new(Api::all(client.to_owned()), watcher::Config::default())
            .owns(Api::<Role>::all(client.to_owned()), watcher::Config::default())
            .owns(Api::<RoleBinding>::all(client), watcher::Config::default())
            .with_config(controller_config(config))
    }
}

#[async_trait]
impl k8s::Reconciler<DBaaSInventory> for Reconciler {
    type Error = ReconcilerError;

    async fn upsert(ctx: Arc<Context>, origin: Arc<DBaaSInventory>) -> Result<Outcome, ReconcilerError> {
        let kind = DBaaSInventory::kind(&()).to_string();
        let (namespace, name) = resource::namespaced_name(&*origin);

        // ---------------------------------------------------------------------
        // Step 1: only inventories of tenant namespaces are handled

        let tenants = tenant::list_by_namespace(&ctx, &namespace).await?;
        if tenants.is_empty() {
            debug!(
                kind = &kind,
                namespace = &namespace,
                name = &name,
                "Skip custom resource, its namespace does not belong to any tenant",
            );
            return Ok(Outcome::Done);
        }

        // ---------------------------------------------------------------------
        // Step 2: set finalizer

        let origin = match crd::ensure_finalizer(&ctx, &*origin).await? {
            ControlFlow::Continue(origin) => origin,
            ControlFlow::Break(outcome) => return Ok(outcome),
        };

        // ---------------------------------------------------------------------
        // Step 3: grant read access on the inventory

        let outcome = tenant::project(&ctx, &origin, &tenants).await?;
        if outcome != Outcome::Done {
            return Ok(outcome);
        }

        // ---------------------------------------------------------------------
        // Step 4: delegate to the provider

        let label = origin.spec.provider_ref.name.to_owned();
        let provider = crd::resolve_provider(&ctx, &origin, &label).await?;

        crd::delegate(&ctx, &origin, &provider, &label, &Map::new()).await
    }

    async fn delete(ctx: Arc<Context>, origin: Arc<DBaaSInventory>) -> Result<(), ReconcilerError> {
        crd::finalize(&ctx, &*origin).await
    }
}
