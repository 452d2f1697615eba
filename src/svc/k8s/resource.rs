//! # Resource module
//!
//! This module provide helpers on kubernetes [`Resource`]

use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    core::{ApiResource, DynamicObject},
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::svc::k8s::store::Store;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("failed to convert resource '{0}', {1}")]
    Convert(String, serde_json::Error),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

impl Error {
    /// returns if the error is an optimistic concurrency collision
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::KubeClient(err) if conflict(err))
    }
}

// -----------------------------------------------------------------------------
// Helpers functions

/// returns if the resource is considered from kubernetes point of view as deleted
pub fn deleted<T>(obj: &T) -> bool
where
    T: Resource,
{
    obj.meta().deletion_timestamp.is_some()
}

/// returns the namespace and name of the kubernetes resource, the namespace
/// is empty for cluster scoped resources
pub fn namespaced_name<T>(obj: &T) -> (String, String)
where
    T: ResourceExt,
{
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

/// returns if the kubernetes api refused a write because the resource changed
/// since it was read
pub fn conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}

/// returns a owner references object pointing to the given resource, `None`
/// if kubernetes did not give it an identifier yet
pub fn owner_reference<T>(obj: &T) -> Option<OwnerReference>
where
    T: Resource<DynamicType = ()>,
{
    Some(OwnerReference {
        api_version: T::api_version(&()).to_string(),
        block_owner_deletion: Some(true),
        controller: Some(true),
        kind: T::kind(&()).to_string(),
        name: obj.meta().name.to_owned()?,
        uid: obj.meta().uid.to_owned()?,
    })
}

/// returns the api resource of a kind known at build time
pub fn api_resource<T>() -> ApiResource
where
    T: Resource<DynamicType = ()>,
{
    ApiResource::erase::<T>(&())
}

/// convert a typed resource into its schema-erased representation
pub fn to_dynamic<T>(obj: &T) -> Result<DynamicObject, Error>
where
    T: Serialize + ResourceExt,
{
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|err| Error::Convert(obj.name_any(), err))
}

/// convert a schema-erased resource into a typed one
pub fn from_dynamic<T>(obj: DynamicObject) -> Result<T, Error>
where
    T: DeserializeOwned,
{
    let name = obj.name_any();

    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|err| Error::Convert(name, err))
}

/// returns the typed resource, or `None` if it does not exist
pub async fn get<T>(store: &dyn Store, namespace: Option<&str>, name: &str) -> Result<Option<T>, Error>
where
    T: Resource<DynamicType = ()> + DeserializeOwned,
{
    store
        .get(&api_resource::<T>(), namespace, name)
        .await?
        .map(from_dynamic)
        .transpose()
}

/// returns typed resources of the namespace or of the whole cluster
pub async fn list<T>(store: &dyn Store, namespace: Option<&str>) -> Result<Vec<T>, Error>
where
    T: Resource<DynamicType = ()> + DeserializeOwned,
{
    store
        .list(&api_resource::<T>(), namespace)
        .await?
        .into_iter()
        .map(from_dynamic)
        .collect()
}

/// replace the whole typed resource, used for metadata changes
pub async fn replace<T>(store: &dyn Store, obj: &T) -> Result<T, Error>
where
    T: Resource<DynamicType = ()> + ResourceExt + Serialize + DeserializeOwned,
{
    let (namespace, name) = namespaced_name(obj);

    debug!(
        kind = T::kind(&()).as_ref(),
        namespace = &namespace,
        name = &name,
        "execute replace request on resource",
    );
    from_dynamic(store.replace(&api_resource::<T>(), &to_dynamic(obj)?).await?)
}

/// replace the status of the typed resource
pub async fn replace_status<T>(store: &dyn Store, obj: &T) -> Result<T, Error>
where
    T: Resource<DynamicType = ()> + ResourceExt + Serialize + DeserializeOwned,
{
    let (namespace, name) = namespaced_name(obj);

    debug!(
        kind = T::kind(&()).as_ref(),
        namespace = &namespace,
        name = &name,
        "execute replace request on resource's status",
    );
    from_dynamic(store.replace_status(&api_resource::<T>(), &to_dynamic(obj)?).await?)
}

/// returns differnce between the two given object serialize as json patch
pub fn diff<T>(origin: &T, modified: &T) -> Result<json_patch::Patch, serde_json::Error>
where
    T: Serialize,
{
    Ok(json_patch::diff(
        &serde_json::to_value(origin)?,
        &serde_json::to_value(modified)?,
    ))
}

/// create the resource or update its content and owners if they drift from
/// the given object, returns the stored resource
pub async fn upsert<T>(store: &dyn Store, obj: &T) -> Result<T, Error>
where
    T: Resource<DynamicType = ()> + ResourceExt + Serialize + DeserializeOwned + Clone + Debug,
{
    let resource = api_resource::<T>();
    let (namespace, name) = namespaced_name(obj);
    let desired = to_dynamic(obj)?;
    let namespace = Some(namespace.as_str()).filter(|ns| !ns.is_empty());

    let existing = match store.get(&resource, namespace, &name).await? {
        Some(existing) => existing,
        None => {
            debug!(
                kind = &resource.kind,
                namespace = namespace,
                name = &name,
                "execute create request on resource",
            );
            return from_dynamic(store.create(&resource, &desired).await?);
        }
    };

    let patch = json_patch::diff(&existing.data, &desired.data);
    if patch.0.is_empty() && existing.metadata.owner_references == desired.metadata.owner_references {
        debug!(
            kind = &resource.kind,
            namespace = namespace,
            name = &name,
            "skip update request on resource, no operation to apply",
        );
        return from_dynamic(existing);
    }

    debug!(
        kind = &resource.kind,
        namespace = namespace,
        name = &name,
        patch = serde_json::to_string(&patch).unwrap_or_default(),
        "execute update request on resource"
    );

    let mut modified = existing;
    modified.data = desired.data;
    modified.metadata.owner_references = desired.metadata.owner_references;

    from_dynamic(store.replace(&resource, &modified).await?)
}
