use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::resources::Shoot;
use crate::{Error, Result};

/// Label key marking objects by their gardener operations role
pub const ROLE_LABEL: &str = "operations.gardener.cloud/role";
/// Role of the ConfigMaps maintained by this operator
pub const ROLE_KUBECONFIG: &str = "kubeconfig";
/// Data key of the rendered kubeconfig
pub const DATA_KEY_KUBECONFIG: &str = "kubeconfig";

const NAME_SUFFIX: &str = ".kubeconfig";

pub fn config_map_name(shoot_name: &str) -> String {
    format!("{shoot_name}{NAME_SUFFIX}")
}

pub fn has_kubeconfig_role(cm: &ConfigMap) -> bool {
    cm.labels().get(ROLE_LABEL).map(String::as_str) == Some(ROLE_KUBECONFIG)
}

pub fn kubeconfig_data(cm: &ConfigMap) -> Option<&str> {
    cm.data
        .as_ref()
        .and_then(|d| d.get(DATA_KEY_KUBECONFIG))
        .map(String::as_str)
}

fn owner_reference(shoot: &Shoot) -> Result<OwnerReference> {
    let oref = shoot
        .controller_owner_ref(&())
        .ok_or_else(|| Error::MissingObjectKey("shoot metadata.uid"))?;

    // deleting the shoot must not wait for the garbage collector to remove the kubeconfig first
    Ok(OwnerReference {
        block_owner_deletion: Some(false),
        ..oref
    })
}

/// The kubeconfig ConfigMap as it should exist for `shoot`.
pub fn desired_config_map(shoot: &Shoot, kubeconfig: String) -> Result<ConfigMap> {
    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(&shoot.name_any())),
            namespace: shoot.namespace(),
            labels: Some(BTreeMap::from([(
                ROLE_LABEL.to_string(),
                ROLE_KUBECONFIG.to_string(),
            )])),
            owner_references: Some(vec![owner_reference(shoot)?]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(DATA_KEY_KUBECONFIG.to_string(), kubeconfig)])),
        ..Default::default()
    })
}

/// Folds the desired state into an existing ConfigMap.
///
/// Returns `None` when the existing object already matches, so that no write is issued.
/// Unrelated labels and owner references on the existing object are preserved, the data is
/// replaced as a whole. The existing `resourceVersion` is kept for the replace call.
pub fn merge_config_map(existing: &ConfigMap, desired: &ConfigMap) -> Result<Option<ConfigMap>> {
    let desired_oref = desired
        .owner_references()
        .first()
        .ok_or_else(|| Error::MissingObjectKey("desired owner reference"))?;

    if let Some(other) = existing
        .owner_references()
        .iter()
        .find(|o| o.controller == Some(true) && o.uid != desired_oref.uid)
    {
        return Err(Error::AlreadyOwned {
            name: existing.name_any(),
            owner: format!("{}/{}", other.kind, other.name),
        });
    }

    let mut merged = existing.clone();

    merged
        .labels_mut()
        .insert(ROLE_LABEL.into(), ROLE_KUBECONFIG.into());

    let orefs = merged.owner_references_mut();
    match orefs.iter_mut().find(|o| o.uid == desired_oref.uid) {
        Some(oref) => *oref = desired_oref.clone(),
        None => orefs.push(desired_oref.clone()),
    }

    merged.data = desired.data.clone();

    if merged == *existing {
        Ok(None)
    } else {
        Ok(Some(merged))
    }
}

/// Rejects ConfigMaps the kubeconfig validation webhook would refuse, measured on the JSON
/// encoding that is sent to the API server.
pub fn ensure_object_size(cm: &ConfigMap, max_object_size: usize) -> Result<()> {
    let size = serde_json::to_vec(cm)?.len();
    if size > max_object_size {
        return Err(Error::ObjectTooLarge {
            name: cm.name_any(),
            size,
            max: max_object_size,
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::resources::{ShootSpec, ShootStatus};

    pub(crate) fn shoot(name: &str) -> Shoot {
        let mut shoot = Shoot::new(name, ShootSpec::default());
        shoot.metadata.namespace = Some("garden-dev".into());
        shoot.metadata.uid = Some(format!("uid-{name}"));
        shoot.status = Some(ShootStatus::default());
        shoot
    }

    #[test]
    fn desired_config_map_is_owned_and_labelled() {
        let cm = desired_config_map(&shoot("foo"), "apiVersion: v1".into()).unwrap();

        assert_eq!(cm.name_any(), "foo.kubeconfig");
        assert_eq!(cm.namespace().as_deref(), Some("garden-dev"));
        assert!(has_kubeconfig_role(&cm));
        assert_eq!(kubeconfig_data(&cm), Some("apiVersion: v1"));

        let orefs = cm.owner_references();
        assert_eq!(orefs.len(), 1);
        assert_eq!(orefs[0].kind, "Shoot");
        assert_eq!(orefs[0].name, "foo");
        assert_eq!(orefs[0].uid, "uid-foo");
        assert_eq!(orefs[0].controller, Some(true));
        assert_eq!(orefs[0].block_owner_deletion, Some(false));
    }

    #[test]
    fn shoot_without_uid_cannot_own() {
        let mut s = shoot("foo");
        s.metadata.uid = None;
        assert!(matches!(
            desired_config_map(&s, String::new()),
            Err(Error::MissingObjectKey(_))
        ));
    }

    #[test]
    fn identical_config_map_needs_no_write() {
        let desired = desired_config_map(&shoot("foo"), "a".into()).unwrap();
        let mut existing = desired.clone();
        existing.metadata.resource_version = Some("42".into());

        assert!(merge_config_map(&existing, &desired).unwrap().is_none());
    }

    #[test]
    fn drifted_data_is_replaced_keeping_resource_version() {
        let desired = desired_config_map(&shoot("foo"), "new".into()).unwrap();
        let mut existing = desired_config_map(&shoot("foo"), "old".into()).unwrap();
        existing.metadata.resource_version = Some("42".into());
        existing
            .data
            .as_mut()
            .unwrap()
            .insert("stray".into(), "x".into());

        let merged = merge_config_map(&existing, &desired).unwrap().unwrap();
        assert_eq!(merged.resource_version().as_deref(), Some("42"));
        assert_eq!(merged.data, desired.data);
    }

    #[test]
    fn removed_role_label_is_restored_and_other_labels_kept() {
        let desired = desired_config_map(&shoot("foo"), "a".into()).unwrap();
        let mut existing = desired.clone();
        existing.labels_mut().clear();
        existing.labels_mut().insert("team".into(), "dev".into());

        let merged = merge_config_map(&existing, &desired).unwrap().unwrap();
        assert!(has_kubeconfig_role(&merged));
        assert_eq!(merged.labels().get("team").map(String::as_str), Some("dev"));
    }

    #[test]
    fn missing_owner_reference_is_added() {
        let desired = desired_config_map(&shoot("foo"), "a".into()).unwrap();
        let mut existing = desired.clone();
        existing.metadata.owner_references = None;

        let merged = merge_config_map(&existing, &desired).unwrap().unwrap();
        assert_eq!(merged.owner_references(), desired.owner_references());
    }

    #[test]
    fn foreign_controller_is_an_error() {
        let desired = desired_config_map(&shoot("foo"), "a".into()).unwrap();
        let mut existing = desired.clone();
        existing.owner_references_mut()[0].uid = "someone-else".into();

        assert!(matches!(
            merge_config_map(&existing, &desired),
            Err(Error::AlreadyOwned { .. })
        ));
    }

    #[test]
    fn oversized_config_map_is_rejected() {
        let cm = desired_config_map(&shoot("foo"), "x".repeat(2048)).unwrap();
        assert!(ensure_object_size(&cm, 100 * 1024).is_ok());
        assert!(matches!(
            ensure_object_size(&cm, 1024),
            Err(Error::ObjectTooLarge { max: 1024, .. })
        ));
    }
}
