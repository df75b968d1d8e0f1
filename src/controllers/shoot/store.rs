use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, ResourceQuota};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::client::Client;
use kube::ResourceExt;
use tracing::*;

use crate::resources::{Shoot, ShootState};
use crate::{Error, Result};

/// Field manager recorded on every write of the operator
pub const FIELD_MANAGER: &str = "kubeconfig-operator";

/// Namespace and name of the ConfigMap publishing the identity of the garden cluster
pub const CLUSTER_IDENTITY_NAMESPACE: &str = "kube-system";
pub const CLUSTER_IDENTITY_NAME: &str = "cluster-identity";

/// Reads and writes of the reconciler against the garden cluster.
///
/// Every read goes to the API server, the reconciler never acts on cached objects.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn shoot(&self, namespace: &str, name: &str) -> Result<Option<Shoot>>;

    async fn shoot_state(&self, namespace: &str, name: &str) -> Result<Option<ShootState>>;

    async fn config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    async fn resource_quotas(&self, namespace: &str) -> Result<Vec<ResourceQuota>>;

    async fn cluster_identity(&self) -> Result<Option<ConfigMap>>;

    async fn create_config_map(&self, cm: &ConfigMap) -> Result<()>;

    /// Replaces the ConfigMap, conditional on the resourceVersion it carries
    async fn replace_config_map(&self, cm: &ConfigMap) -> Result<()>;

    /// Deletes the ConfigMap; returns false if it did not exist
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<bool>;
}

/// `ClusterStore` backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        }
    }
}

fn namespace_of(cm: &ConfigMap) -> Result<String> {
    cm.namespace()
        .ok_or(Error::MissingObjectKey("configmap metadata.namespace"))
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn shoot(&self, namespace: &str, name: &str) -> Result<Option<Shoot>> {
        let api: Api<Shoot> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn shoot_state(&self, namespace: &str, name: &str) -> Result<Option<ShootState>> {
        let api: Api<ShootState> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.config_maps(namespace).get_opt(name).await?)
    }

    async fn resource_quotas(&self, namespace: &str) -> Result<Vec<ResourceQuota>> {
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn cluster_identity(&self) -> Result<Option<ConfigMap>> {
        Ok(self
            .config_maps(CLUSTER_IDENTITY_NAMESPACE)
            .get_opt(CLUSTER_IDENTITY_NAME)
            .await?)
    }

    async fn create_config_map(&self, cm: &ConfigMap) -> Result<()> {
        let namespace = namespace_of(cm)?;
        debug!("Creating ConfigMap {}/{}", namespace, cm.name_any());
        self.config_maps(&namespace)
            .create(&Self::post_params(), cm)
            .await?;
        Ok(())
    }

    async fn replace_config_map(&self, cm: &ConfigMap) -> Result<()> {
        let namespace = namespace_of(cm)?;
        debug!("Replacing ConfigMap {}/{}", namespace, cm.name_any());
        self.config_maps(&namespace)
            .replace(&cm.name_any(), &Self::post_params(), cm)
            .await?;
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<bool> {
        debug!(
            "Ensuring ConfigMap {} in namespace {} does not exist",
            name, namespace
        );
        match self
            .config_maps(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Err(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })) => Ok(false),
            Err(err) => Err(err.into()),
            Ok(_) => Ok(true),
        }
    }
}
