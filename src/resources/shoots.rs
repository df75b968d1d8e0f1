use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Gardener Shoot cluster, reduced to the fields this operator reads.
/// API: core.gardener.cloud/v1beta1
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "core.gardener.cloud",
    version = "v1beta1",
    kind = "Shoot",
    namespaced
)]
#[kube(status = "ShootStatus")]
#[serde(rename_all = "camelCase")]
pub struct ShootSpec {
    /// Kubernetes settings of the shoot cluster
    pub kubernetes: KubernetesSettings,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct KubernetesSettings {
    /// Kubernetes version of the shoot cluster, eg `1.27.3`
    pub version: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShootStatus {
    /// Addresses under which the kube-apiserver of the shoot can be reached
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advertised_addresses: Vec<ShootAdvertisedAddress>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct ShootAdvertisedAddress {
    /// Name of the address, usually `external`, `internal` or `unmanaged`
    pub name: String,
    /// URL of the kube-apiserver, eg `https://api.foo.example.com`
    pub url: String,
}

impl Shoot {
    pub fn advertised_addresses(&self) -> &[ShootAdvertisedAddress] {
        self.status
            .as_ref()
            .map(|s| s.advertised_addresses.as_slice())
            .unwrap_or_default()
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
