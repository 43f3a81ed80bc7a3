//! Dynamic resource access against the local cluster
//!
//! The executor never talks to `kube::Api` directly; it goes through
//! [`ClusterResources`] so its request handling can be tested with mocks.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams,
    PostParams,
};
use kube::discovery::{pinned_kind, Scope};
use kube::Client;
use serde_json::Value;
use tracing::debug;

use planegate_common::kube_utils::{Gvk, ManifestIdentity};

/// Operations the executor performs on the local cluster
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterResources: Send + Sync {
    /// Server-side apply `manifest` with `force`
    async fn apply(
        &self,
        identity: &ManifestIdentity,
        manifest: &Value,
        field_manager: &str,
    ) -> Result<DynamicObject, kube::Error>;

    /// List objects of a kind, optionally in one namespace and filtered by labels
    async fn list(
        &self,
        gvk: &Gvk,
        namespace: Option<String>,
        label_selector: Option<String>,
    ) -> Result<Vec<DynamicObject>, kube::Error>;

    /// Fetch one object
    async fn get(
        &self,
        gvk: &Gvk,
        name: &str,
        namespace: Option<String>,
    ) -> Result<DynamicObject, kube::Error>;

    /// Delete the object a manifest describes
    async fn delete(&self, identity: &ManifestIdentity) -> Result<(), kube::Error>;

    /// JSON merge patch the object a manifest describes
    async fn merge_patch(
        &self,
        identity: &ManifestIdentity,
        patch: &Value,
    ) -> Result<DynamicObject, kube::Error>;

    /// Create a namespace; AlreadyExists is returned as an error
    async fn create_namespace(&self, name: &str) -> Result<(), kube::Error>;
}

/// [`ClusterResources`] backed by a live kube client
#[derive(Clone)]
pub struct KubeResources {
    client: Client,
}

impl KubeResources {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Resolve a GVK through discovery and build a scoped dynamic API.
    ///
    /// Namespaced kinds without a namespace use the client's default
    /// namespace, or every namespace when `all_if_unset` is true.
    async fn api(
        &self,
        gvk: &Gvk,
        namespace: Option<&str>,
        all_if_unset: bool,
    ) -> Result<Api<DynamicObject>, kube::Error> {
        let (ar, caps) = pinned_kind(&self.client, &GroupVersionKind::from(gvk)).await?;
        let api = match (caps.scope, namespace) {
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), &ar),
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (Scope::Namespaced, None) if all_if_unset => Api::all_with(self.client.clone(), &ar),
            (Scope::Namespaced, None) => Api::default_namespaced_with(self.client.clone(), &ar),
        };
        Ok(api)
    }
}

#[async_trait]
impl ClusterResources for KubeResources {
    async fn apply(
        &self,
        identity: &ManifestIdentity,
        manifest: &Value,
        field_manager: &str,
    ) -> Result<DynamicObject, kube::Error> {
        let api = self
            .api(&identity.gvk, identity.namespace.as_deref(), false)
            .await?;
        debug!(kind = %identity.gvk.kind, name = %identity.name, "server-side apply");
        let params = PatchParams::apply(field_manager).force();
        api.patch(&identity.name, &params, &Patch::Apply(manifest))
            .await
    }

    async fn list(
        &self,
        gvk: &Gvk,
        namespace: Option<String>,
        label_selector: Option<String>,
    ) -> Result<Vec<DynamicObject>, kube::Error> {
        let api = self.api(gvk, namespace.as_deref(), true).await?;
        let mut params = ListParams::default();
        if let Some(selector) = label_selector.as_deref() {
            params = params.labels(selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn get(
        &self,
        gvk: &Gvk,
        name: &str,
        namespace: Option<String>,
    ) -> Result<DynamicObject, kube::Error> {
        self.api(gvk, namespace.as_deref(), false)
            .await?
            .get(name)
            .await
    }

    async fn delete(&self, identity: &ManifestIdentity) -> Result<(), kube::Error> {
        let api = self
            .api(&identity.gvk, identity.namespace.as_deref(), false)
            .await?;
        api.delete(&identity.name, &DeleteParams::default())
            .await
            .map(|_| ())
    }

    async fn merge_patch(
        &self,
        identity: &ManifestIdentity,
        patch: &Value,
    ) -> Result<DynamicObject, kube::Error> {
        let api = self
            .api(&identity.gvk, identity.namespace.as_deref(), false)
            .await?;
        api.patch(&identity.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
    }

    async fn create_namespace(&self, name: &str) -> Result<(), kube::Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        api.create(&PostParams::default(), &namespace)
            .await
            .map(|_| ())
    }
}
