use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceQuota;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;

use super::quantity_parser::{ParseError, QuantityParser};

/// Quota resource name that limits the number of ConfigMaps in a namespace
pub const CONFIG_MAP_COUNT_RESOURCE: &str = "count/configmaps";

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("Could not determine hard status of ResourceQuota {quota} for {resource}; status does not seem to be up-to-date")]
    HardStatusMissing { quota: String, resource: String },
    #[error("Could not determine used status of ResourceQuota {quota} for {resource}; status does not seem to be up-to-date")]
    UsedStatusMissing { quota: String, resource: String },
    #[error("ResourceQuota {quota} has an invalid quantity for {resource}: {source}")]
    InvalidQuantity {
        quota: String,
        resource: String,
        #[source]
        source: ParseError,
    },
}

/// Reads a single resource out of a resource list, ignoring all other resources.
pub fn masked_amount(
    list: Option<&BTreeMap<String, Quantity>>,
    resource: &str,
) -> Result<Option<i128>, ParseError> {
    list.and_then(|l| l.get(resource))
        .map(|q| q.to_milli_value())
        .transpose()
}

/// `a < b` over masked resource lists: a resource that is absent on either side does not
/// take part in the comparison, so two absent amounts compare as less.
pub fn less_than(a: Option<i128>, b: Option<i128>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a < b,
        _ => true,
    }
}

/// Decides whether one more object of `resource` may be created given the quotas of a namespace.
///
/// Quotas that do not restrict `resource` in their spec are ignored. A restricting quota whose
/// status has not been populated yet makes the whole decision fail, as neither answer would be
/// trustworthy.
pub fn has_capacity(quotas: &[ResourceQuota], resource: &str) -> Result<bool, QuotaError> {
    let mut sufficient = true;

    for quota in quotas {
        let restricts = quota
            .spec
            .as_ref()
            .and_then(|s| s.hard.as_ref())
            .is_some_and(|hard| hard.contains_key(resource));
        if !restricts {
            continue;
        }

        let status = quota.status.as_ref();
        let invalid = |source| QuotaError::InvalidQuantity {
            quota: quota.name_any(),
            resource: resource.into(),
            source,
        };

        let hard = masked_amount(status.and_then(|s| s.hard.as_ref()), resource)
            .map_err(invalid)?
            .ok_or_else(|| QuotaError::HardStatusMissing {
                quota: quota.name_any(),
                resource: resource.into(),
            })?;
        let used = masked_amount(status.and_then(|s| s.used.as_ref()), resource)
            .map_err(invalid)?
            .ok_or_else(|| QuotaError::UsedStatusMissing {
                quota: quota.name_any(),
                resource: resource.into(),
            })?;

        // quantities are in milli units, one more object is 1000
        if used.checked_add(1_000).is_none_or(|next| next > hard) {
            sufficient = false;
        }
    }

    Ok(sufficient)
}
