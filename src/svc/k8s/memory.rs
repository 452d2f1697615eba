//! # Memory module
//!
//! In-memory [`Store`] used by tests, it mimics the behaviour of the api
//! server that reconcilers rely on: resource versions, conflicts on stale
//! writes, and status sub-resource isolation.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    core::{ApiResource, DynamicObject, ErrorResponse},
    Resource, ResourceExt,
};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use crate::svc::k8s::{resource, store::Store};

type Key = (String, String, String);

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<Key, DynamicObject>>,
    writes: Mutex<BTreeMap<String, usize>>,
    rejections: Mutex<BTreeMap<String, u16>>,
    version: AtomicU64,
}

fn key(kind: &str, namespace: Option<&str>, name: &str) -> Key {
    (
        kind.to_string(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

impl MemoryStore {
    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// store the object as if a user created it
    pub fn insert<T>(&self, obj: &T) -> T
    where
        T: Serialize + DeserializeOwned + ResourceExt,
    {
        let mut obj = resource::to_dynamic(obj).expect("object to be convertible");
        let version = self.next_version();

        obj.metadata.resource_version = Some(version.to_owned());
        obj.metadata.uid.get_or_insert_with(|| format!("uid-{}", version));
        obj.metadata
            .creation_timestamp
            .get_or_insert_with(|| Time(Utc::now()));

        let kind = obj.types.as_ref().map(|t| t.kind.to_owned()).unwrap_or_default();
        let k = key(&kind, obj.namespace().as_deref(), &obj.name_any());
        self.objects.lock().insert(k, obj.to_owned());

        resource::from_dynamic(obj).expect("object to be convertible")
    }

    /// returns the typed object as stored
    pub fn typed<T>(&self, namespace: Option<&str>, name: &str) -> Option<T>
    where
        T: Resource<DynamicType = ()> + DeserializeOwned,
    {
        self.object(&T::kind(&()), namespace, name)
            .map(|obj| resource::from_dynamic(obj).expect("object to be convertible"))
    }

    pub fn object(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        self.objects.lock().get(&key(kind, namespace, name)).cloned()
    }

    /// overwrite the status of a stored object, as a provider backend would
    pub fn set_status(&self, kind: &str, namespace: &str, name: &str, status: serde_json::Value) {
        let mut objects = self.objects.lock();
        let obj = objects
            .get_mut(&key(kind, Some(namespace), name))
            .expect("object to exist");

        obj.data["status"] = status;
        obj.metadata.resource_version = Some(self.next_version());
    }

    /// returns the number of writes made by reconcilers on the kind
    pub fn writes(&self, kind: &str) -> usize {
        self.writes.lock().get(kind).copied().unwrap_or_default()
    }

    /// make the next create or replace of the kind fail with the given code,
    /// as if another writer or an admission webhook got in the way
    pub fn reject(&self, kind: &str, code: u16) {
        self.rejections.lock().insert(kind.to_string(), code);
    }

    fn rejection(&self, kind: &str, name: &str) -> Result<(), kube::Error> {
        match self.rejections.lock().remove(kind) {
            Some(409) => Err(api_error(
                409,
                "Conflict",
                format!("the object '{}' has been modified", name),
            )),
            Some(code) => Err(api_error(code, "Invalid", format!("'{}' is invalid", name))),
            None => Ok(()),
        }
    }

    fn count(&self, kind: &str) {
        *self.writes.lock().entry(kind.to_string()).or_default() += 1;
    }

    fn check(&self, stored: &DynamicObject, obj: &DynamicObject) -> Result<(), kube::Error> {
        match &obj.metadata.resource_version {
            Some(version) if Some(version) != stored.metadata.resource_version.as_ref() => {
                Err(api_error(
                    409,
                    "Conflict",
                    format!("the object '{}' has been modified", obj.name_any()),
                ))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, kube::Error> {
        Ok(self.object(&resource.kind, namespace, name))
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, kube::Error> {
        Ok(self
            .objects
            .lock()
            .iter()
            .filter(|((kind, ns, _), _)| {
                kind == &resource.kind && namespace.map(|n| n == ns).unwrap_or(true)
            })
            .map(|(_, obj)| obj.to_owned())
            .collect())
    }

    async fn create(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        self.rejection(&resource.kind, &obj.name_any())?;

        let k = key(&resource.kind, obj.namespace().as_deref(), &obj.name_any());
        let mut objects = self.objects.lock();
        if objects.contains_key(&k) {
            return Err(api_error(409, "AlreadyExists", format!("'{}' already exists", obj.name_any())));
        }

        let version = self.next_version();
        let mut created = obj.to_owned();
        created.metadata.resource_version = Some(version.to_owned());
        created.metadata.uid = Some(format!("uid-{}", version));
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        if let Some(map) = created.data.as_object_mut() {
            map.remove("status");
        }

        objects.insert(k, created.to_owned());
        drop(objects);

        self.count(&resource.kind);
        Ok(created)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        self.rejection(&resource.kind, &obj.name_any())?;

        let k = key(&resource.kind, obj.namespace().as_deref(), &obj.name_any());
        let mut objects = self.objects.lock();
        let stored = objects
            .get(&k)
            .ok_or_else(|| api_error(404, "NotFound", format!("'{}' not found", obj.name_any())))?;
        self.check(stored, obj)?;

        let mut replaced = obj.to_owned();
        replaced.metadata.uid = stored.metadata.uid.to_owned();
        replaced.metadata.creation_timestamp = stored.metadata.creation_timestamp.to_owned();
        replaced.metadata.resource_version = Some(self.next_version());
        match stored.data.get("status") {
            Some(status) => replaced.data["status"] = status.to_owned(),
            None => {
                if let Some(map) = replaced.data.as_object_mut() {
                    map.remove("status");
                }
            }
        }

        objects.insert(k, replaced.to_owned());
        drop(objects);

        self.count(&resource.kind);
        Ok(replaced)
    }

    async fn replace_status(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        let k = key(&resource.kind, obj.namespace().as_deref(), &obj.name_any());
        let mut objects = self.objects.lock();
        let stored = objects
            .get(&k)
            .ok_or_else(|| api_error(404, "NotFound", format!("'{}' not found", obj.name_any())))?;
        self.check(stored, obj)?;

        let mut replaced = stored.to_owned();
        replaced.metadata.resource_version = Some(self.next_version());
        replaced.data["status"] = obj
            .data
            .get("status")
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        objects.insert(k, replaced.to_owned());
        drop(objects);

        self.count(&resource.kind);
        Ok(replaced)
    }
}
