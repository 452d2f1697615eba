//! # Custom resource definition module
//!
//! This module provide custom resource definition managed by the operator,
//! their structures, implementation and reconciliation loop. It also holds the
//! steps shared by the kinds delegated to providers.

use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::ControlFlow,
};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::svc::{
    adapter,
    cfg::Configuration,
    crd::{inventory::DBaaSInventory, provider::DBaaSProvider},
    k8s::{finalizer, resource, Context, Outcome},
    status::{self, Statused},
    telemetry::gauge::{Labels, Metrics, Telemetry},
};

pub mod connection;
pub mod instance;
pub mod inventory;
pub mod provider;
pub mod tenant;

// -----------------------------------------------------------------------------
// Constants

pub const GROUP: &str = "dbaas.redhat.com";
pub const VERSION: &str = "v1alpha1";
pub const FINALIZER: &str = "dbaas.redhat.com/metrics";

// -----------------------------------------------------------------------------
// NamespacedName structure

/// reference to a resource, the namespace defaults to the one of the
/// referencing resource
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct NamespacedName {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "namespace", skip_serializing_if = "Option::is_none", default)]
    pub namespace: Option<String>,
}

impl Display for NamespacedName {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}", namespace, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl NamespacedName {
    pub fn new(name: &str, namespace: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.map(String::from),
        }
    }

    /// returns the namespace of the reference or the given one
    pub fn namespace_or(&self, namespace: &str) -> String {
        self.namespace
            .to_owned()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| namespace.to_string())
    }
}

// -----------------------------------------------------------------------------
// LocalObjectReference structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct LocalObjectReference {
    #[serde(rename = "name")]
    pub name: String,
}

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("inventory '{0}' does not exist")]
    InventoryNotFound(String),
    #[error("provider '{0}' is not registered")]
    ProviderNotFound(String),
    #[error("resource is misconfigured, {0}")]
    Configuration(String),
    #[error("instance '{0}' does not exist")]
    InstanceNotFound(String),
    #[error("instance '{0}' is not available, it is in phase '{1}'")]
    InstanceNotAvailable(String, String),
    #[error("failed to delegate resource to its provider, {0}")]
    Provider(adapter::Error),
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(resource::Error),
    #[error("failed to compute diff between the original and modified object, {0}")]
    Serialize(serde_json::Error),
    #[error("failed to reconcile resource, {0}")]
    Reconcile(String),
}

impl From<resource::Error> for ReconcilerError {
    fn from(err: resource::Error) -> Self {
        Self::KubeClient(err)
    }
}

impl From<adapter::Error> for ReconcilerError {
    fn from(err: adapter::Error) -> Self {
        Self::Provider(err)
    }
}

// -----------------------------------------------------------------------------
// Delegated trait

/// Logical resource implemented by a provider resource whose kind is given by
/// the provider descriptor.
pub trait Delegated:
    Statused
    + Resource<DynamicType = ()>
    + ResourceExt
    + Serialize
    + DeserializeOwned
    + Clone
    + Debug
    + Send
    + Sync
    + 'static
{
    /// returns the kind of the provider resource
    fn provider_kind(provider: &DBaaSProvider) -> &str;

    /// returns the type of the condition set by the provider once its
    /// resource is in sync
    fn sync_condition(config: &Configuration) -> &str;

    /// returns the gauges of the kind
    fn metrics(telemetry: &Telemetry) -> &Metrics;

    /// returns the condition reflected by the gauges
    fn metrics_condition(&self, _config: &Configuration) -> Option<&Condition> {
        status::find(self.conditions(), status::READY)
    }
}

// -----------------------------------------------------------------------------
// Admitted structure

/// inventory and provider of a resource that passed [`admit`]
#[derive(Clone, Debug)]
pub struct Admitted {
    pub inventory: DBaaSInventory,
    pub provider: DBaaSProvider,
}

impl Admitted {
    /// returns the name of the provider as used in metrics
    pub fn label(&self) -> &str {
        &self.inventory.spec.provider_ref.name
    }
}

// -----------------------------------------------------------------------------
// Helpers

/// write the status of the modified resource if it changed, then report it in
/// the gauges. A write conflict is a soft requeue, otherwise `then` is
/// returned.
pub async fn commit<T>(
    ctx: &Context,
    origin: &T,
    modified: &T,
    provider: Option<&str>,
    then: Outcome,
) -> Result<Outcome, ReconcilerError>
where
    T: Delegated,
{
    let (namespace, name) = resource::namespaced_name(origin);
    let kind = T::kind(&()).to_string();

    let patch = resource::diff(origin, modified).map_err(ReconcilerError::Serialize)?;
    if !patch.0.is_empty() {
        debug!(
            kind = &kind,
            namespace = &namespace,
            name = &name,
            "Update status of custom resource",
        );

        match resource::replace_status(&*ctx.store, modified).await {
            Ok(_) => {}
            Err(err) if err.is_conflict() => {
                debug!(
                    kind = &kind,
                    namespace = &namespace,
                    name = &name,
                    "Custom resource has been modified, retry syncing status",
                );
                return Ok(Outcome::RequeueNow);
            }
            Err(err) => return Err(err.into()),
        }
    }

    if let Some(provider) = provider {
        let labels = Labels {
            provider,
            resource: &name,
            namespace: &namespace,
        };

        T::metrics(&ctx.telemetry).observe(
            &labels,
            modified.metrics_condition(&ctx.config),
            modified.meta().creation_timestamp.as_ref(),
        );
    }

    Ok(then)
}

/// returns a copy of the resource with a `Ready` condition set to false
fn unready<T>(origin: &T, reason: &str, message: &str) -> T
where
    T: Delegated,
{
    let mut modified = origin.to_owned();
    let condition = status::ready(false, reason, message, origin.meta().generation);

    status::set(modified.conditions_mut(), condition, status::now());
    modified
}

/// surface a fatal error on the `Ready` condition of the resource, the error
/// itself is returned by the caller
pub async fn fail<T>(ctx: &Context, origin: &T, reason: &str, message: &str, provider: Option<&str>)
where
    T: Delegated,
{
    let modified = unready(origin, reason, message);

    if let Err(err) = commit(ctx, origin, &modified, provider, Outcome::Done).await {
        let (namespace, name) = resource::namespaced_name(origin);

        warn!(
            kind = T::kind(&()).as_ref(),
            namespace = &namespace,
            name = &name,
            reason = reason,
            error = err.to_string(),
            "Failed to surface error on the status of custom resource",
        );
    }
}

/// set the `Ready` condition to false with the given reason and look at the
/// resource again later
pub async fn refuse<T>(
    ctx: &Context,
    origin: &T,
    reason: &str,
    message: &str,
    provider: Option<&str>,
) -> Result<Outcome, ReconcilerError>
where
    T: Delegated,
{
    let (namespace, name) = resource::namespaced_name(origin);

    info!(
        kind = T::kind(&()).as_ref(),
        namespace = &namespace,
        name = &name,
        reason = reason,
        message = message,
        "Custom resource cannot be delegated yet",
    );

    let modified = unready(origin, reason, message);
    commit(
        ctx,
        origin,
        &modified,
        provider,
        Outcome::RequeueAfter(ctx.config.operator.requeue()),
    )
    .await
}

/// add the finalizer used to clear gauges on deletion, returns the stored
/// resource
pub async fn ensure_finalizer<T>(ctx: &Context, origin: &T) -> Result<ControlFlow<Outcome, T>, ReconcilerError>
where
    T: Delegated,
{
    if finalizer::contains(origin, FINALIZER) {
        return Ok(ControlFlow::Continue(origin.to_owned()));
    }

    let (namespace, name) = resource::namespaced_name(origin);
    info!(
        kind = T::kind(&()).as_ref(),
        namespace = &namespace,
        name = &name,
        finalizer = FINALIZER,
        "Set finalizer on custom resource",
    );

    let modified = finalizer::add(origin.to_owned(), FINALIZER);
    match resource::replace(&*ctx.store, &modified).await {
        Ok(stored) => Ok(ControlFlow::Continue(stored)),
        Err(err) if err.is_conflict() => Ok(ControlFlow::Break(Outcome::RequeueNow)),
        Err(err) => Err(err.into()),
    }
}

/// clear the gauges of the resource and release it
pub async fn finalize<T>(ctx: &Context, origin: &T) -> Result<(), ReconcilerError>
where
    T: Delegated,
{
    let (namespace, name) = resource::namespaced_name(origin);

    T::metrics(&ctx.telemetry).clear(&namespace, &name);
    if !finalizer::contains(origin, FINALIZER) {
        return Ok(());
    }

    info!(
        kind = T::kind(&()).as_ref(),
        namespace = &namespace,
        name = &name,
        finalizer = FINALIZER,
        "Remove finalizer on custom resource",
    );

    resource::replace(&*ctx.store, &finalizer::remove(origin.to_owned(), FINALIZER)).await?;
    Ok(())
}

/// returns the provider descriptor or surface its absence on the resource
pub async fn resolve_provider<T>(ctx: &Context, origin: &T, name: &str) -> Result<DBaaSProvider, ReconcilerError>
where
    T: Delegated,
{
    match resource::get::<DBaaSProvider>(&*ctx.store, None, name).await? {
        Some(provider) => Ok(provider),
        None => {
            let message = format!("provider '{}' is not registered in this environment", name);

            fail(ctx, origin, status::REASON_PROVIDER_NOT_FOUND, &message, Some(name)).await;
            Err(ReconcilerError::ProviderNotFound(name.to_string()))
        }
    }
}

/// resolve the inventory of the resource and check that the resource may be
/// delegated through it
pub async fn admit<T>(
    ctx: &Context,
    origin: &T,
    reference: &NamespacedName,
) -> Result<ControlFlow<Outcome, Admitted>, ReconcilerError>
where
    T: Delegated,
{
    let (namespace, _) = resource::namespaced_name(origin);
    let inventory_namespace = reference.namespace_or(&namespace);

    let inventory = match resource::get::<DBaaSInventory>(&*ctx.store, Some(&inventory_namespace), &reference.name).await? {
        Some(inventory) => inventory,
        None => {
            let reference = format!("{}/{}", inventory_namespace, reference.name);
            let message = format!("inventory '{}' does not exist", reference);

            fail(ctx, origin, status::REASON_INVENTORY_NOT_FOUND, &message, None).await;
            return Err(ReconcilerError::InventoryNotFound(reference));
        }
    };

    let label = inventory.spec.provider_ref.name.to_owned();
    if !inventory.accepts(&namespace) {
        let message = format!(
            "namespace '{}' is not allowed to use inventory '{}/{}'",
            namespace,
            inventory_namespace,
            inventory.name_any()
        );

        return refuse(ctx, origin, status::REASON_INVALID_NAMESPACE, &message, Some(&label))
            .await
            .map(ControlFlow::Break);
    }

    if !status::is_true(inventory.conditions(), &ctx.config.conditions.inventory) {
        let message = format!(
            "inventory '{}/{}' is not synchronised with its provider",
            inventory_namespace,
            inventory.name_any()
        );

        return refuse(ctx, origin, status::REASON_INVENTORY_NOT_READY, &message, Some(&label))
            .await
            .map(ControlFlow::Break);
    }

    let provider = resolve_provider(ctx, origin, &label).await?;

    Ok(ControlFlow::Continue(Admitted { inventory, provider }))
}

/// apply the resource on its provider resource and fold the status reported
/// by the provider back into it
pub async fn delegate<T>(
    ctx: &Context,
    origin: &T,
    provider: &DBaaSProvider,
    label: &str,
    overrides: &Map<String, Value>,
) -> Result<Outcome, ReconcilerError>
where
    T: Delegated,
    T::Status: Serialize + DeserializeOwned + Default,
{
    let (namespace, name) = resource::namespaced_name(origin);
    let target = adapter::materialize(origin, T::provider_kind(provider));

    let obj = match adapter::apply_desired_state(&*ctx.store, origin, &target, overrides).await {
        Ok((operation, obj)) => {
            debug!(
                kind = &target.resource.kind,
                namespace = &namespace,
                name = &name,
                operation = operation.to_string(),
                "Provider resource reconciled",
            );
            obj
        }
        Err(adapter::Error::Conflict(..)) => {
            debug!(
                kind = &target.resource.kind,
                namespace = &namespace,
                name = &name,
                "Provider resource has been modified, retry syncing specification",
            );
            return Ok(Outcome::RequeueNow);
        }
        Err(err) => {
            fail(ctx, origin, status::REASON_PROVIDER_WRITE, &err.to_string(), Some(label)).await;
            return Err(err.into());
        }
    };

    let observed = match adapter::decode_observed_state::<T::Status>(&obj) {
        Ok(observed) => observed,
        Err(err) => {
            fail(ctx, origin, status::REASON_PROVIDER_PARSING, &err.to_string(), Some(label)).await;
            return Err(err.into());
        }
    };

    let mut modified = origin.to_owned();
    status::merge(
        &mut modified,
        observed,
        T::sync_condition(&ctx.config),
        origin.meta().generation,
        status::now(),
    );

    commit(ctx, origin, &modified, Some(label), Outcome::Done).await
}

#[cfg(test)]
pub mod tests {
    use std::sync::Arc;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use prometheus::Registry;

    use super::*;
    use crate::svc::k8s::{memory::MemoryStore, store::Store};

    pub const PROVIDER: &str = "aws";
    pub const INVENTORY_KIND: &str = "AwsInventory";
    pub const INSTANCE_KIND: &str = "AwsInstance";
    pub const CONNECTION_KIND: &str = "AwsConnection";

    pub struct Fixture {
        pub ctx: Arc<Context>,
        pub store: Arc<MemoryStore>,
        pub registry: Registry,
    }

    /// returns a context over an empty store and a fresh registry
    pub fn fixture() -> Fixture {
        let registry = Registry::new();
        let store = Arc::new(MemoryStore::default());
        let telemetry = Telemetry::try_new(&registry).expect("metrics to be registered");
        let ctx = Context::new(
            store.to_owned() as Arc<dyn Store>,
            Arc::new(Configuration::default()),
            Arc::new(telemetry),
        );

        Fixture {
            ctx: Arc::new(ctx),
            store,
            registry,
        }
    }

    pub fn metadata(name: &str, namespace: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(String::from),
            uid: Some(format!("uid-{}", name)),
            ..Default::default()
        }
    }

    pub fn condition(type_: &str, status: &str, reason: &str) -> Condition {
        Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: String::new(),
            observed_generation: None,
            last_transition_time: Time(chrono::Utc::now()),
        }
    }

    pub fn descriptor() -> DBaaSProvider {
        DBaaSProvider {
            metadata: metadata(PROVIDER, None),
            spec: provider::Spec {
                provider: provider::Provider {
                    name: "Amazon".to_string(),
                    display_name: None,
                },
                inventory_kind: INVENTORY_KIND.to_string(),
                instance_kind: INSTANCE_KIND.to_string(),
                connection_kind: CONNECTION_KIND.to_string(),
            },
        }
    }

    /// returns an inventory named `inventory`, which accepts the given
    /// namespaces if any
    pub fn inventory_in(provider: &str, namespace: &str, namespaces: Option<&[&str]>) -> DBaaSInventory {
        DBaaSInventory {
            metadata: metadata("inventory", Some(namespace)),
            spec: inventory::Spec {
                provider_ref: NamespacedName::new(provider, None),
                credentials_ref: Some(LocalObjectReference {
                    name: "credentials".to_string(),
                }),
                connection_namespaces: namespaces
                    .map(|namespaces| namespaces.iter().map(|ns| ns.to_string()).collect()),
                authz: None,
            },
            status: None,
        }
    }

    /// returns an inventory in sync with its provider
    pub fn ready_inventory_in(namespace: &str, namespaces: Option<&[&str]>) -> DBaaSInventory {
        let mut inventory = inventory_in(PROVIDER, namespace, namespaces);
        inventory.status = Some(inventory::Status {
            conditions: vec![condition("SpecSynced", status::STATUS_TRUE, "SyncOK")],
            instances: vec![],
        });
        inventory
    }

    pub fn tenant_of(name: &str, namespace: &str, users: &[&str], groups: &[&str]) -> tenant::DBaaSTenant {
        let strings = |values: &[&str]| Some(values.iter().map(|v| v.to_string()).collect());

        tenant::DBaaSTenant {
            metadata: metadata(name, None),
            spec: tenant::Spec {
                inventory_namespace: namespace.to_string(),
                authz: tenant::Authz {
                    developer: inventory::Authz {
                        users: strings(users),
                        groups: strings(groups),
                    },
                },
            },
        }
    }

    /// returns the status of a provider in sync, as a provider backend would
    /// write it
    pub fn synced(type_: &str) -> Value {
        serde_json::json!({
            "conditions": [{
                "type": type_,
                "status": "True",
                "reason": "SyncOK",
                "message": "",
                "lastTransitionTime": "2023-11-14T22:13:20Z",
            }],
        })
    }

    #[test]
    fn reference_namespace_defaults_to_the_referencing_one() {
        assert_eq!("apps", NamespacedName::new("db", None).namespace_or("apps"));
        assert_eq!("apps", NamespacedName::new("db", Some("")).namespace_or("apps"));
        assert_eq!("data", NamespacedName::new("db", Some("data")).namespace_or("apps"));
        assert_eq!("data/db", NamespacedName::new("db", Some("data")).to_string());
    }

    #[test]
    fn references_skip_missing_namespace() {
        let value = serde_json::to_value(NamespacedName::new("db", None)).expect("to serialize");

        assert_eq!(serde_json::json!({ "name": "db" }), value);
    }
}
