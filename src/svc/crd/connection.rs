//! # Connection custom resource
//!
//! This module provide the connection custom resource, a request to bind
//! workloads to a database instance of an inventory, and its reconciliation
//! loop.

use std::{ops::ControlFlow, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{
    runtime::{watcher, Controller},
    Api, CustomResource, Resource,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::svc::{
    cfg::Configuration,
    crd::{
        self, instance::DBaaSInstance, provider::DBaaSProvider, Delegated, LocalObjectReference,
        NamespacedName, ReconcilerError,
    },
    k8s::{self, controller_config, resource, Context, ControllerBuilder, Outcome},
    status::{self, Statused},
    telemetry::gauge::{Metrics, Telemetry},
};

// -----------------------------------------------------------------------------
// Constants

/// field of the provider specification that receives the resolved instance
pub const INSTANCE_ID: &str = "instanceID";

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[kube(group = "dbaas.redhat.com")]
#[kube(version = "v1alpha1")]
#[kube(kind = "DBaaSConnection")]
#[kube(singular = "dbaasconnection")]
#[kube(plural = "dbaasconnections")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
pub struct Spec {
    #[serde(rename = "inventoryRef")]
    pub inventory_ref: NamespacedName,
    /// identifier of an instance listed by the inventory
    #[serde(rename = "instanceID", skip_serializing_if = "Option::is_none", default)]
    pub instance_id: Option<String>,
    /// instance provisioned through the operator, used when no identifier is
    /// given
    #[serde(rename = "instanceRef", skip_serializing_if = "Option::is_none", default)]
    pub instance_ref: Option<NamespacedName>,
}

// -----------------------------------------------------------------------------
// Status structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "conditions", default)]
    pub conditions: Vec<Condition>,
    #[serde(rename = "credentialsRef", skip_serializing_if = "Option::is_none", default)]
    pub credentials_ref: Option<LocalObjectReference>,
    #[serde(rename = "connectionInfoRef", skip_serializing_if = "Option::is_none", default)]
    pub connection_info_ref: Option<LocalObjectReference>,
}

// -----------------------------------------------------------------------------
// DBaaSConnection implementation

impl DBaaSConnection {
    /// returns the instance identifier given in the specification
    pub fn instance_id(&self) -> Option<&str> {
        self.spec.instance_id.as_deref().filter(|id| !id.is_empty())
    }

    /// returns the instance reference given in the specification, a reference
    /// without name designates nothing
    pub fn instance_ref(&self) -> Option<&NamespacedName> {
        self.spec.instance_ref.as_ref().filter(|reference| !reference.name.is_empty())
    }
}

impl Statused for DBaaSConnection {
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

impl Delegated for DBaaSConnection {
    fn provider_kind(provider: &DBaaSProvider) -> &str {
        &provider.spec.connection_kind
    }

    fn sync_condition(config: &Configuration) -> &str {
        &config.conditions.connection
    }

    fn metrics(telemetry: &Telemetry) -> &Metrics {
        &telemetry.connection
    }
}

// -----------------------------------------------------------------------------
// Helpers

/// returns the identifier of the referenced instance, breaks while the
/// instance is provisioned
pub async fn resolve_instance(
    ctx: &Context,
    origin: &DBaaSConnection,
    reference: &NamespacedName,
    label: &str,
) -> Result<ControlFlow<Outcome, String>, ReconcilerError> {
    let (namespace, _) = resource::namespaced_name(origin);
    let reference = NamespacedName::new(&reference.name, Some(&reference.namespace_or(&namespace)));

    let instance = match resource::get::<DBaaSInstance>(
        &*ctx.store,
        reference.namespace.as_deref(),
        &reference.name,
    )
    .await?
    {
        Some(instance) => instance,
        None => {
            let message = format!("instance '{}' does not exist", reference);

            crd::fail(ctx, origin, status::REASON_INSTANCE_NOT_FOUND, &message, Some(label)).await;
            return Err(ReconcilerError::InstanceNotFound(reference.to_string()));
        }
    };

    if let Some(phase) = instance.unavailable() {
        let message = format!("instance '{}' is in phase '{}'", reference, phase);

        crd::fail(ctx, origin, status::REASON_INSTANCE_NOT_AVAILABLE, &message, Some(label)).await;
        return Err(ReconcilerError::InstanceNotAvailable(
            reference.to_string(),
            phase.to_string(),
        ));
    }

    match instance.instance_id() {
        Some(id) => Ok(ControlFlow::Continue(id.to_string())),
        None => {
            let message = format!("instance '{}' is being provisioned", reference);

            crd::refuse(ctx, origin, status::REASON_IN_PROGRESS, &message, Some(label))
                .await
                .map(ControlFlow::Break)
        }
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl ControllerBuilder<DBaaSConnection> for Reconciler {
    fn build(&self, client: kube::Client, config: &Configuration) -> Controller<DBaaSConnection> {
        Controller::new(Api::all(client), watcher::Config::default()).with_config(controller_config(config))
    }
}

#[async_trait]
impl k8s::Reconciler<DBaaSConnection> for Reconciler {
    type Error = ReconcilerError;

    async fn upsert(ctx: Arc<Context>, origin: Arc<DBaaSConnection>) -> Result<Outcome, ReconcilerError> {
        let kind = DBaaSConnection::kind(&()).to_string();
        let (namespace, name) = resource::namespaced_name(&*origin);

        // ---------------------------------------------------------------------
        // Step 1: set finalizer

        let origin = match crd::ensure_finalizer(&ctx, &*origin).await? {
            ControlFlow::Continue(origin) => origin,
            ControlFlow::Break(outcome) => return Ok(outcome),
        };

        // ---------------------------------------------------------------------
        // Step 2: check that an instance is designated

        if origin.instance_id().is_none() && origin.instance_ref().is_none() {
            let message = "either 'instanceID' or 'instanceRef' has to be set";

            crd::fail(&ctx, &origin, status::REASON_CONFIGURATION, message, None).await;
            return Err(ReconcilerError::Configuration(message.to_string()));
        }

        // ---------------------------------------------------------------------
        // Step 3: check the inventory

        let admitted = match crd::admit(&ctx, &origin, &origin.spec.inventory_ref).await? {
            ControlFlow::Continue(admitted) => admitted,
            ControlFlow::Break(outcome) => return Ok(outcome),
        };

        // ---------------------------------------------------------------------
        // Step 4: resolve the instance

        let instance_id = match (origin.instance_id(), origin.instance_ref()) {
            (Some(id), _) => id.to_string(),
            (None, Some(reference)) => {
                match resolve_instance(&ctx, &origin, reference, admitted.label()).await? {
                    ControlFlow::Continue(id) => id,
                    ControlFlow::Break(outcome) => return Ok(outcome),
                }
            }
            (None, None) => {
                return Err(ReconcilerError::Reconcile(
                    "connection does not designate any instance".to_string(),
                ))
            }
        };

        debug!(
            kind = &kind,
            namespace = &namespace,
            name = &name,
            instance = &instance_id,
            "Resolved instance of custom resource",
        );

        // ---------------------------------------------------------------------
        // Step 5: delegate to the provider

        let mut overrides = Map::new();
        overrides.insert(INSTANCE_ID.to_string(), Value::String(instance_id));

        crd::delegate(&ctx, &origin, &admitted.provider, admitted.label(), &overrides).await
    }

    async fn delete(ctx: Arc<Context>, origin: Arc<DBaaSConnection>) -> Result<(), ReconcilerError> {
        crd::finalize(&ctx, &*origin).await
    }
}
