//! # Instance custom resource
//!
//! This module provide the instance custom resource, a request to provision a
//! database instance through the provider of an inventory, and its
//! reconciliation loop.

use std::{collections::BTreeMap, ops::ControlFlow, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{
    runtime::{watcher, Controller},
    Api, CustomResource,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::svc::{
    cfg::Configuration,
    crd::{self, provider::DBaaSProvider, Delegated, NamespacedName, ReconcilerError},
    k8s::{self, controller_config, Context, ControllerBuilder, Outcome},
    status::Statused,
    telemetry::gauge::{Metrics, Telemetry},
};

// -----------------------------------------------------------------------------
// Constants

pub const PHASE_FAILED: &str = "Failed";
pub const PHASE_DELETED: &str = "Deleted";

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "dbaas.redhat.com")]
#[kube(version = "v1alpha1")]
#[kube(kind = "DBaaSInstance")]
#[kube(singular = "dbaasinstance")]
#[kube(plural = "dbaasinstances")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
pub struct Spec {
    #[serde(rename = "inventoryRef")]
    pub inventory_ref: NamespacedName,
    /// name of the instance on the provider side
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "cloudProvider", skip_serializing_if = "Option::is_none", default)]
    pub cloud_provider: Option<String>,
    #[serde(rename = "cloudRegion", skip_serializing_if = "Option::is_none", default)]
    pub cloud_region: Option<String>,
    #[serde(rename = "otherInstanceParams", skip_serializing_if = "BTreeMap::is_empty", default)]
    pub other_instance_params: BTreeMap<String, String>,
}

// -----------------------------------------------------------------------------
// Status structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "conditions", default)]
    pub conditions: Vec<Condition>,
    /// identifier given by the provider, empty while provisioning
    #[serde(rename = "instanceID", default)]
    pub instance_id: String,
    #[serde(rename = "phase", default)]
    pub phase: String,
    #[serde(rename = "instanceInfo", skip_serializing_if = "BTreeMap::is_empty", default)]
    pub instance_info: BTreeMap<String, String>,
}

// -----------------------------------------------------------------------------
// DBaaSInstance implementation

impl DBaaSInstance {
    /// returns the phase reported by the provider, if it rules out the
    /// instance
    pub fn unavailable(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|status| status.phase.as_str())
            .filter(|phase| *phase == PHASE_FAILED || *phase == PHASE_DELETED)
    }

    /// returns the identifier of the instance once provisioned
    pub fn instance_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|status| status.instance_id.as_str())
            .filter(|id| !id.is_empty())
    }
}

impl Statused for DBaaSInstance {
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

impl Delegated for DBaaSInstance {
    fn provider_kind(provider: &DBaaSProvider) -> &str {
        &provider.spec.instance_kind
    }

    fn sync_condition(config: &Configuration) -> &str {
        &config.conditions.instance
    }

    fn metrics(telemetry: &Telemetry) -> &Metrics {
        &telemetry.instance
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl ControllerBuilder<DBaaSInstance> for Reconciler {
    fn build(&self, client: kube::Client, config: &Configuration) -> Controller<DBaaSInstance> {
        Controller::new(Api::all(client), watcher::Config::default()).with_config(controller_config(config))
    }
}

#[async_trait]
impl k8s::Reconciler<DBaaSInstance> for Reconciler {
    type Error = ReconcilerError;

    async fn upsert(ctx: Arc<Context>, origin: Arc<DBaaSInstance>) -> Result<Outcome, ReconcilerError> {
        // ---------------------------------------------------------------------
        // Step 1: set finalizer

        let origin = match crd::ensure_finalizer(&ctx, &*origin).await? {
            ControlFlow::Continue(origin) => origin,
            ControlFlow::Break(outcome) => return Ok(outcome),
        };

        // ---------------------------------------------------------------------
        // Step 2: check the inventory

        let admitted = match crd::admit(&ctx, &origin, &origin.spec.inventory_ref).await? {
            ControlFlow::Continue(admitted) => admitted,
            ControlFlow::Break(outcome) => return Ok(outcome),
        };

        // ---------------------------------------------------------------------
        // Step 3: delegate to the provider

        crd::delegate(&ctx, &origin, &admitted.provider, admitted.label(), &Map::new()).await
    }

    async fn delete(ctx: Arc<Context>, origin: Arc<DBaaSInstance>) -> Result<(), ReconcilerError> {
        crd::finalize(&ctx, &*origin).await
    }
}

#[cfg(test)]
pub mod tests {
    use serde_json::json;

    use super::*;
    use crate::svc::{
        crd::tests::{descriptor, fixture, metadata, ready_inventory_in, INSTANCE_KIND, PROVIDER},
        k8s::Reconciler as _,
        status,
        telemetry::gauge::tests::value,
    };

    pub fn instance_in(namespace: &str) -> DBaaSInstance {
        DBaaSInstance {
            metadata: metadata("instance", Some(namespace)),
            spec: Spec {
                inventory_ref: NamespacedName::new("inventory", Some("tenant-ns")),
                name: "orders".to_string(),
                cloud_provider: Some("aws".to_string()),
                cloud_region: Some("eu-west-1".to_string()),
                other_instance_params: BTreeMap::new(),
            },
            status: None,
        }
    }

    #[test]
    fn availability_follows_provider_phase() {
        let mut instance = instance_in("apps");
        assert_eq!(None, instance.unavailable());
        assert_eq!(None, instance.instance_id());

        instance.status = Some(Status {
            instance_id: "i-42".to_string(),
            phase: "Ready".to_string(),
            ..Default::default()
        });
        assert_eq!(None, instance.unavailable());
        assert_eq!(Some("i-42"), instance.instance_id());

        instance.status = Some(Status {
            phase: PHASE_FAILED.to_string(),
            ..Default::default()
        });
        assert_eq!(Some(PHASE_FAILED), instance.unavailable());
    }

    #[tokio::test]
    async fn instance_is_delegated_and_reports_provisioning() {
        let fixture = fixture();
        let store = &fixture.store;

        store.insert(&descriptor());
        store.insert(&ready_inventory_in("tenant-ns", Some(&["apps"])));
        let origin = store.insert(&instance_in("apps"));

        let outcome = Reconciler::upsert(fixture.ctx.to_owned(), Arc::new(origin))
            .await
            .expect("instance to be reconciled");
        assert_eq!(Outcome::Done, outcome);

        let provider_instance = store
            .object(INSTANCE_KIND, Some("apps"), "instance")
            .expect("provider instance to exist");
        assert_eq!(Some("orders"), provider_instance.data["spec"]["name"].as_str());

        let origin = store
            .typed::<DBaaSInstance>(Some("apps"), "instance")
            .expect("instance to exist");
        let ready = status::find(origin.conditions(), status::READY).expect("ready condition");
        assert_eq!(status::REASON_IN_PROGRESS, ready.reason);
        assert_eq!(None, origin.instance_id());

        // the provider is done provisioning
        let mut provisioned = crate::svc::crd::tests::synced("ProvisionReady");
        provisioned["instanceID"] = json!("i-42");
        provisioned["phase"] = json!("Ready");
        store.set_status(INSTANCE_KIND, "apps", "instance", provisioned);

        Reconciler::upsert(fixture.ctx.to_owned(), Arc::new(origin))
            .await
            .expect("instance to be reconciled");

        let origin = store
            .typed::<DBaaSInstance>(Some("apps"), "instance")
            .expect("instance to exist");
        assert_eq!(Some("i-42"), origin.instance_id());
        assert!(status::is_true(origin.conditions(), status::READY));

        let labels = [("provider", PROVIDER), ("resource", "instance"), ("namespace", "apps")];
        assert_eq!(
            Some(1.0),
            value(&fixture.registry, "dbaas_instance_status_ready", &labels)
        );
    }

    #[tokio::test]
    async fn instance_waits_for_its_inventory() {
        let fixture = fixture();
        let store = &fixture.store;

        store.insert(&descriptor());
        store.insert(&crate::svc::crd::tests::inventory_in(PROVIDER, "tenant-ns", Some(&["apps"])));
        let origin = store.insert(&instance_in("apps"));

        let outcome = Reconciler::upsert(fixture.ctx.to_owned(), Arc::new(origin))
            .await
            .expect("instance to be reconciled");
        assert_eq!(Outcome::RequeueAfter(fixture.ctx.config.operator.requeue()), outcome);

        let origin = store
            .typed::<DBaaSInstance>(Some("apps"), "instance")
            .expect("instance to exist");
        let ready = status::find(origin.conditions(), status::READY).expect("ready condition");
        assert_eq!(status::REASON_INVENTORY_NOT_READY, ready.reason);
        assert_eq!(0, store.writes(INSTANCE_KIND));
    }
}
