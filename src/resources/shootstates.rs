use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Gardener ShootState, which holds the secrets and infra data generated for a shoot.
/// It shares its name and namespace with the Shoot.
/// API: core.gardener.cloud/v1alpha1
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "core.gardener.cloud",
    version = "v1alpha1",
    kind = "ShootState",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ShootStateSpec {
    /// Data generated by the gardenlet, eg certificate authorities
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gardener: Vec<GardenerResourceData>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct GardenerResourceData {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    /// Raw JSON payload; for certificates a map of data keys to base64 encoded values
    pub data: serde_json::Value,
}

impl ShootState {
    pub fn gardener_resource_data(&self, name: &str) -> Option<&GardenerResourceData> {
        self.spec.gardener.iter().find(|d| d.name == name)
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
