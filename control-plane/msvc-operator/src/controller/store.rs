//! Typed access to the authoritative object store.
//!
//! The reconciler only talks to the cluster through [`StoreClient`], so the
//! convergence logic can be exercised against an in-memory fake.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::trace;

use super::errors::StoreError;
use crate::crd::microservice::{MicroService, MicroServiceStatus};

/// Any namespaced kind the store can hold.
pub trait StoreObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Result of a delete request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Removal {
    /// Gone from the store.
    Deleted,
    /// Accepted, but the object is held by its own finalizers.
    Pending,
    /// Was already absent.
    Absent,
}

#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn get<K: StoreObject>(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<K>, StoreError>;

    async fn create<K: StoreObject>(
        &self,
        ns: &str,
        obj: &K,
    ) -> Result<K, StoreError>;

    /// Full update guarded by `obj.metadata.resourceVersion`; a stale
    /// version fails with [`StoreError::Conflict`].
    async fn replace<K: StoreObject>(
        &self,
        ns: &str,
        obj: &K,
    ) -> Result<K, StoreError>;

    async fn delete<K: StoreObject>(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Removal, StoreError>;

    async fn update_status(
        &self,
        ns: &str,
        name: &str,
        status: &MicroServiceStatus,
    ) -> Result<MicroService, StoreError>;
}

/// [`StoreClient`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: StoreObject>(&self, ns: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), ns)
    }
}

#[async_trait]
impl StoreClient for KubeStore {
    async fn get<K: StoreObject>(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<K>, StoreError> {
        trace!(kind = %K::kind(&()), %ns, %name, "store: get");
        Ok(self.api::<K>(ns).get_opt(name).await?)
    }

    async fn create<K: StoreObject>(
        &self,
        ns: &str,
        obj: &K,
    ) -> Result<K, StoreError> {
        trace!(kind = %K::kind(&()), %ns, name = %obj.name_any(), "store: create");
        Ok(self.api::<K>(ns).create(&PostParams::default(), obj).await?)
    }

    async fn replace<K: StoreObject>(
        &self,
        ns: &str,
        obj: &K,
    ) -> Result<K, StoreError> {
        let name = obj.meta().name.clone().ok_or_else(|| {
            StoreError::Invalid(format!("{} without a name", K::kind(&())))
        })?;
        if obj.resource_version().is_none() {
            return Err(StoreError::Invalid(format!(
                "{} {name} has no resourceVersion to guard the update",
                K::kind(&())
            )));
        }
        trace!(kind = %K::kind(&()), %ns, %name, "store: replace");
        Ok(self
            .api::<K>(ns)
            .replace(&name, &PostParams::default(), obj)
            .await?)
    }

    async fn delete<K: StoreObject>(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Removal, StoreError> {
        trace!(kind = %K::kind(&()), %ns, %name, "store: delete");
        match self
            .api::<K>(ns)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(res) => Ok(res.either(
                |obj| {
                    if obj.finalizers().is_empty() {
                        Removal::Deleted
                    } else {
                        Removal::Pending
                    }
                },
                |_status| Removal::Deleted,
            )),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(Removal::Absent),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_status(
        &self,
        ns: &str,
        name: &str,
        status: &MicroServiceStatus,
    ) -> Result<MicroService, StoreError> {
        trace!(%ns, %name, "store: update status");
        let patch = json!({ "status": status });
        Ok(self
            .api::<MicroService>(ns)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }
}
