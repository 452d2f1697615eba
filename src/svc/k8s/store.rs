//! # Store module
//!
//! This module provide the [`Store`] trait which is the single point of
//! contact between reconcilers and the kubernetes api. It works on
//! [`DynamicObject`] so that provider resources, whose kind is only known at
//! runtime, go through the same path as the ones known at build time.

use async_trait::async_trait;
use kube::{
    api::{ListParams, PostParams},
    core::{ApiResource, DynamicObject},
    Api, Client, ResourceExt,
};
use tracing::trace;

// -----------------------------------------------------------------------------
// Store trait

#[async_trait]
pub trait Store: Send + Sync {
    /// returns the object, or `None` if it does not exist
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, kube::Error>;

    /// returns objects of the namespace or of the whole cluster
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, kube::Error>;

    async fn create(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error>;

    /// replace the object, the write is refused with a conflict if the
    /// resource version does not match the stored one
    async fn replace(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error>;

    /// replace the status sub-resource of the object, same concurrency rules
    /// as [`Store::replace`]
    async fn replace_status(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error>;
}

// -----------------------------------------------------------------------------
// KubeStore structure

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl From<Client> for KubeStore {
    fn from(client: Client) -> Self {
        Self { client }
    }
}

impl KubeStore {
    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(namespace) => Api::namespaced_with(self.client.to_owned(), namespace, resource),
            None => Api::all_with(self.client.to_owned(), resource),
        }
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, kube::Error> {
        trace!(
            kind = &resource.kind,
            namespace = namespace,
            name = name,
            "execute a request to retrieve resource",
        );
        match self.api(resource, namespace).get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, kube::Error> {
        trace!(
            kind = &resource.kind,
            namespace = namespace,
            "execute a request to list resources",
        );
        Ok(self
            .api(resource, namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn create(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        trace!(
            kind = &resource.kind,
            namespace = obj.namespace(),
            name = obj.name_any(),
            "execute a request to create resource",
        );
        self.api(resource, obj.namespace().as_deref())
            .create(&PostParams::default(), obj)
            .await
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        trace!(
            kind = &resource.kind,
            namespace = obj.namespace(),
            name = obj.name_any(),
            "execute a request to replace resource",
        );
        self.api(resource, obj.namespace().as_deref())
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await
    }

    async fn replace_status(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        trace!(
            kind = &resource.kind,
            namespace = obj.namespace(),
            name = obj.name_any(),
            "execute a request to replace resource's status",
        );
        let body = serde_json::to_vec(obj).map_err(kube::Error::SerdeError)?;

        self.api(resource, obj.namespace().as_deref())
            .replace_status(&obj.name_any(), &PostParams::default(), body)
            .await
    }
}
