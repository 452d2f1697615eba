//! # Adapter module
//!
//! This module maps a logical resource to the resource of the provider that
//! implements it. Provider kinds are only known at runtime through the
//! provider descriptor, so provider resources are handled as
//! [`DynamicObject`] while logical resources and decoded status stay typed.

use std::fmt::{self, Display, Formatter};

use kube::{
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::svc::{
    crd::{GROUP, VERSION},
    k8s::{resource, store::Store},
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("provider resource '{0}' has been modified concurrently, {1}")]
    Conflict(String, kube::Error),
    #[error("failed to apply desired state on provider resource '{0}', {1}")]
    Write(String, kube::Error),
    #[error("failed to decode status of provider resource '{0}', {1}")]
    Decode(String, serde_json::Error),
    #[error("failed to serialize specification of resource '{0}', {1}")]
    Serialize(String, serde_json::Error),
}

impl Error {
    fn from_kube(target: &Target, err: kube::Error) -> Self {
        if resource::conflict(&err) {
            Self::Conflict(target.to_string(), err)
        } else {
            Self::Write(target.to_string(), err)
        }
    }
}

// -----------------------------------------------------------------------------
// Operation enumeration

/// what [`apply_desired_state`] did to the provider resource
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Operation {
    Created,
    Updated,
    Unchanged,
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

// -----------------------------------------------------------------------------
// Target structure

/// identity of a provider resource
#[derive(Clone, Debug)]
pub struct Target {
    pub resource: ApiResource,
    pub namespace: String,
    pub name: String,
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.resource.kind, self.namespace, self.name)
    }
}

/// returns the identity of the provider resource backing the logical one, it
/// shares its namespace and name
pub fn materialize<T>(logical: &T, kind: &str) -> Target
where
    T: ResourceExt,
{
    let (namespace, name) = resource::namespaced_name(logical);

    Target {
        resource: ApiResource::from_gvk(&GroupVersionKind::gvk(GROUP, VERSION, kind)),
        namespace,
        name,
    }
}

/// returns the specification of the logical resource with the overrides applied
fn desired_spec<T>(logical: &T, overrides: &Map<String, Value>) -> Result<Value, Error>
where
    T: Serialize + ResourceExt,
{
    let mut spec = serde_json::to_value(logical)
        .map_err(|err| Error::Serialize(logical.name_any(), err))?
        .get_mut("spec")
        .map(Value::take)
        .unwrap_or_else(|| Value::Object(Map::new()));

    if let Some(fields) = spec.as_object_mut() {
        for (key, value) in overrides {
            fields.insert(key.to_owned(), value.to_owned());
        }
    }

    Ok(spec)
}

/// create the provider resource or bring its specification and owner back to
/// the desired ones, the status is left to the provider
pub async fn apply_desired_state<T>(
    store: &dyn Store,
    logical: &T,
    target: &Target,
    overrides: &Map<String, Value>,
) -> Result<(Operation, DynamicObject), Error>
where
    T: Resource<DynamicType = ()> + ResourceExt + Serialize,
{
    let spec = desired_spec(logical, overrides)?;
    let owner = resource::owner_reference(logical);

    let existing = store
        .get(&target.resource, Some(&target.namespace), &target.name)
        .await
        .map_err(|err| Error::from_kube(target, err))?;

    let mut obj = match existing {
        Some(obj) => obj,
        None => {
            let mut obj = DynamicObject::new(&target.name, &target.resource).within(&target.namespace);
            obj.metadata.owner_references = owner.map(|owner| vec![owner]);
            obj.data = serde_json::json!({ "spec": spec });

            debug!(
                kind = &target.resource.kind,
                namespace = &target.namespace,
                name = &target.name,
                "Create provider resource",
            );

            let obj = store
                .create(&target.resource, &obj)
                .await
                .map_err(|err| Error::from_kube(target, err))?;

            return Ok((Operation::Created, obj));
        }
    };

    let owned = match &owner {
        None => true,
        Some(owner) => obj
            .owner_references()
            .iter()
            .any(|reference| reference.uid == owner.uid),
    };

    if owned && obj.data.get("spec") == Some(&spec) {
        return Ok((Operation::Unchanged, obj));
    }

    if !owned {
        obj.metadata
            .owner_references
            .get_or_insert_with(Vec::new)
            .extend(owner);
    }

    obj.data["spec"] = spec;

    debug!(
        kind = &target.resource.kind,
        namespace = &target.namespace,
        name = &target.name,
        "Update provider resource",
    );

    let obj = store
        .replace(&target.resource, &obj)
        .await
        .map_err(|err| Error::from_kube(target, err))?;

    Ok((Operation::Updated, obj))
}

/// returns the top-level fields of the reported status that the decoded
/// status does not carry
fn dropped_fields(reported: &Value, decoded: &Value) -> Vec<String> {
    match (reported.as_object(), decoded.as_object()) {
        (Some(reported), Some(decoded)) => reported
            .iter()
            .filter(|(key, value)| !value.is_null() && !decoded.contains_key(*key))
            .map(|(key, _)| key.to_owned())
            .collect(),
        _ => vec![],
    }
}

/// decode the status reported by the provider, a resource the provider did
/// not look at yet has an empty status. Fields unknown to the logical status
/// are ignored and logged.
pub fn decode_observed_state<S>(obj: &DynamicObject) -> Result<S, Error>
where
    S: Serialize + DeserializeOwned + Default,
{
    let status = match obj.data.get("status") {
        None | Some(Value::Null) => return Ok(S::default()),
        Some(status) => status,
    };

    let observed: S = serde_json::from_value(status.to_owned())
        .map_err(|err| Error::Decode(obj.name_any(), err))?;

    let decoded = serde_json::to_value(&observed).unwrap_or(Value::Null);
    let dropped = dropped_fields(status, &decoded);
    if !dropped.is_empty() {
        debug!(
            namespace = obj.namespace().unwrap_or_default(),
            name = obj.name_any(),
            fields = dropped.join(","),
            "Ignore fields of provider status that are not part of the status",
        );
    }

    Ok(observed)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta};
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::svc::{
        crd::{
            connection::{self, DBaaSConnection},
            NamespacedName,
        },
        k8s::memory::MemoryStore,
    };

    #[derive(Serialize, Deserialize, Default, Debug)]
    struct Observed {
        #[serde(default)]
        conditions: Vec<Condition>,
    }

    fn connection(store: &MemoryStore) -> DBaaSConnection {
        store.insert(&DBaaSConnection {
            metadata: ObjectMeta {
                name: Some("db".to_string()),
                namespace: Some("apps".to_string()),
                ..Default::default()
            },
            spec: connection::Spec {
                inventory_ref: NamespacedName::new("inventory", None),
                instance_id: None,
                instance_ref: Some(NamespacedName::new("instance", None)),
            },
            status: None,
        })
    }

    fn overrides() -> Map<String, Value> {
        let mut overrides = Map::new();
        overrides.insert("instanceID".to_string(), json!("i-42"));
        overrides
    }

    #[test]
    fn materialize_keeps_identity() {
        let store = MemoryStore::default();
        let target = materialize(&connection(&store), "MongoDBAtlasConnection");

        assert_eq!("MongoDBAtlasConnection", target.resource.kind);
        assert_eq!("dbaas.redhat.com/v1alpha1", target.resource.api_version);
        assert_eq!("apps", target.namespace);
        assert_eq!("db", target.name);
    }

    #[tokio::test]
    async fn apply_creates_then_leaves_unchanged() {
        let store = MemoryStore::default();
        let logical = connection(&store);
        let target = materialize(&logical, "MongoDBAtlasConnection");

        let (operation, obj) = apply_desired_state(&store, &logical, &target, &overrides())
            .await
            .expect("provider resource to be created");

        assert_eq!(Operation::Created, operation);
        assert_eq!(
            json!({
                "inventoryRef": { "name": "inventory" },
                "instanceID": "i-42",
                "instanceRef": { "name": "instance" },
            }),
            obj.data["spec"]
        );
        assert_eq!(logical.uid(), obj.owner_references().first().map(|o| o.uid.to_owned()));

        let (operation, _) = apply_desired_state(&store, &logical, &target, &overrides())
            .await
            .expect("provider resource to be left as is");

        assert_eq!(Operation::Unchanged, operation);
        assert_eq!(1, store.writes("MongoDBAtlasConnection"));
    }

    #[tokio::test]
    async fn apply_updates_spec_and_keeps_status() {
        let store = MemoryStore::default();
        let logical = connection(&store);
        let target = materialize(&logical, "MongoDBAtlasConnection");

        apply_desired_state(&store, &logical, &target, &Map::new())
            .await
            .expect("provider resource to be created");
        store.set_status("MongoDBAtlasConnection", "apps", "db", json!({ "conditions": [] }));

        let (operation, obj) = apply_desired_state(&store, &logical, &target, &overrides())
            .await
            .expect("provider resource to be updated");

        assert_eq!(Operation::Updated, operation);
        assert_eq!(json!("i-42"), obj.data["spec"]["instanceID"]);
        assert_eq!(json!({ "conditions": [] }), obj.data["status"]);
    }

    #[test]
    fn decode_tolerates_missing_status_only() {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(GROUP, VERSION, "Provider"));
        let mut obj = DynamicObject::new("db", &resource);

        let observed: Observed = decode_observed_state(&obj).expect("empty status to decode");
        assert!(observed.conditions.is_empty());

        obj.data = json!({ "status": { "conditions": [{ "type": 42 }] } });
        let result: Result<Observed, _> = decode_observed_state(&obj);
        assert!(matches!(result, Err(Error::Decode(..))));

        obj.data = json!({ "status": { "conditions": "nope" } });
        let result: Result<Observed, _> = decode_observed_state(&obj);
        assert!(matches!(result, Err(Error::Decode(..))));
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(GROUP, VERSION, "Provider"));
        let mut obj = DynamicObject::new("db", &resource);
        obj.data = json!({
            "status": { "conditions": [], "instances": [{ "instanceID": "i-1" }], "phase": null },
        });

        let observed: Observed = decode_observed_state(&obj).expect("status to decode");
        assert!(observed.conditions.is_empty());

        let decoded = serde_json::to_value(&observed).expect("status to serialize");
        assert_eq!(
            vec!["instances".to_string()],
            dropped_fields(&obj.data["status"], &decoded)
        );
    }
}
