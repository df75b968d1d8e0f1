//! Update filtering for the watched resources.
//!
//! Creates and deletes always pass. Updates only pass when they carry a change that can alter
//! the kubeconfig ConfigMap, or unblock a reconcile that is waiting for quota.

use std::collections::{HashMap, HashSet};

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, ResourceQuota};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Event;
use kube::{Resource, ResourceExt};
use tracing::*;

use super::reconcilers::config_map::{kubeconfig_data, ROLE_KUBECONFIG, ROLE_LABEL};
use super::reconcilers::quota::{less_than, masked_amount, CONFIG_MAP_COUNT_RESOURCE};
use super::reconcilers::trust_anchor::{cluster_ca, TrustAnchorError};
use crate::resources::{Shoot, ShootState};

/// An update of a watched object, with both sides
pub enum UpdateEvent<'a> {
    Shoot {
        old: &'a Shoot,
        new: &'a Shoot,
    },
    ShootState {
        old: &'a ShootState,
        new: &'a ShootState,
    },
    ConfigMap {
        old: &'a ConfigMap,
        new: &'a ConfigMap,
    },
    ResourceQuota {
        old: &'a ResourceQuota,
        new: &'a ResourceQuota,
    },
}

impl UpdateEvent<'_> {
    pub fn is_relevant(&self) -> bool {
        match self {
            Self::Shoot { old, new } => shoot_changed(old, new),
            Self::ShootState { old, new } => cluster_ca_changed(old, new),
            Self::ConfigMap { old, new } => kubeconfig_changed(old, new),
            Self::ResourceQuota { old, new } => quota_freed(old, new),
        }
    }
}

/// Resources whose updates are filtered before they reach the controller
pub trait Watched: Resource<DynamicType = ()> + Clone {
    fn update_event<'a>(old: &'a Self, new: &'a Self) -> UpdateEvent<'a>;
}

impl Watched for Shoot {
    fn update_event<'a>(old: &'a Self, new: &'a Self) -> UpdateEvent<'a> {
        UpdateEvent::Shoot { old, new }
    }
}

impl Watched for ShootState {
    fn update_event<'a>(old: &'a Self, new: &'a Self) -> UpdateEvent<'a> {
        UpdateEvent::ShootState { old, new }
    }
}

impl Watched for ConfigMap {
    fn update_event<'a>(old: &'a Self, new: &'a Self) -> UpdateEvent<'a> {
        UpdateEvent::ConfigMap { old, new }
    }
}

impl Watched for ResourceQuota {
    fn update_event<'a>(old: &'a Self, new: &'a Self) -> UpdateEvent<'a> {
        UpdateEvent::ResourceQuota { old, new }
    }
}

fn shoot_changed(old: &Shoot, new: &Shoot) -> bool {
    old.advertised_addresses() != new.advertised_addresses()
}

fn kubeconfig_changed(old: &ConfigMap, new: &ConfigMap) -> bool {
    let role = |cm: &ConfigMap| cm.labels().get(ROLE_LABEL).cloned();
    let (old_role, new_role) = (role(old), role(new));

    if old_role.as_deref() != Some(ROLE_KUBECONFIG) && new_role.as_deref() != Some(ROLE_KUBECONFIG)
    {
        return false;
    }

    old_role != new_role || kubeconfig_data(old) != kubeconfig_data(new)
}

fn cluster_ca_changed(old: &ShootState, new: &ShootState) -> bool {
    let new_ca = match cluster_ca(new) {
        Ok(ca) => ca,
        Err(err) => {
            if err != TrustAnchorError::NotProvisioned {
                error!(
                    "Update event failed to read cluster ca from new ShootState {}/{}: {err}",
                    new.namespace().unwrap_or_default(),
                    new.name_any()
                );
            }
            return false;
        }
    };

    match cluster_ca(old) {
        Ok(old_ca) => old_ca != new_ca,
        Err(TrustAnchorError::NotProvisioned) => true,
        Err(err) => {
            error!(
                "Update event failed to read cluster ca from old ShootState {}/{}: {err}",
                old.namespace().unwrap_or_default(),
                old.name_any()
            );
            false
        }
    }
}

fn quota_freed(old: &ResourceQuota, new: &ResourceQuota) -> bool {
    let amounts = |q: &ResourceQuota| {
        let status = q.status.as_ref();
        let hard = masked_amount(status.and_then(|s| s.hard.as_ref()), CONFIG_MAP_COUNT_RESOURCE)?;
        let used = masked_amount(status.and_then(|s| s.used.as_ref()), CONFIG_MAP_COUNT_RESOURCE)?;
        Ok::<_, super::reconcilers::quantity_parser::ParseError>((hard, used))
    };

    let ((old_hard, old_used), (new_hard, new_used)) = match (amounts(old), amounts(new)) {
        (Ok(o), Ok(n)) => (o, n),
        (Err(err), _) | (_, Err(err)) => {
            warn!(
                "Ignoring update of ResourceQuota {}/{}: {err}",
                new.namespace().unwrap_or_default(),
                new.name_any()
            );
            return false;
        }
    };

    if old_hard != new_hard && less_than(old_hard, new_hard) {
        return true;
    }

    if old_used != new_used {
        let had_capacity = less_than(old_used, old_hard);
        let has_capacity = less_than(new_used, new_hard);
        return !had_capacity && has_capacity;
    }

    false
}

/// Remembers the last version of every object seen on a watch stream, so that updates can be
/// judged against their old side.
struct UpdateFilter<K: Watched> {
    last_seen: HashMap<ObjectRef<K>, K>,
    relisted: Option<HashSet<ObjectRef<K>>>,
}

impl<K: Watched> Default for UpdateFilter<K> {
    fn default() -> Self {
        Self {
            last_seen: HashMap::new(),
            relisted: None,
        }
    }
}

impl<K: Watched> UpdateFilter<K> {
    /// Records the object and decides whether it passes
    fn apply(&mut self, obj: &K) -> bool {
        let key = ObjectRef::from_obj(obj);
        if let Some(relisted) = self.relisted.as_mut() {
            relisted.insert(key.clone());
        }
        match self.last_seen.insert(key, obj.clone()) {
            Some(old) => K::update_event(&old, obj).is_relevant(),
            None => true,
        }
    }

    fn observe(&mut self, event: Event<K>) -> Option<Event<K>> {
        match event {
            Event::Apply(obj) => self.apply(&obj).then_some(Event::Apply(obj)),
            Event::InitApply(obj) => self.apply(&obj).then_some(Event::InitApply(obj)),
            Event::Delete(obj) => {
                self.last_seen.remove(&ObjectRef::from_obj(&obj));
                Some(Event::Delete(obj))
            }
            Event::Init => {
                self.relisted = Some(HashSet::new());
                Some(Event::Init)
            }
            Event::InitDone => {
                // objects that vanished while the watch was down are not listed again
                if let Some(relisted) = self.relisted.take() {
                    self.last_seen.retain(|key, _| relisted.contains(key));
                }
                Some(Event::InitDone)
            }
        }
    }
}

/// Drops irrelevant updates from a watch event stream
pub fn filter_updates<K, E, S>(stream: S) -> impl Stream<Item = Result<Event<K>, E>>
where
    K: Watched,
    S: Stream<Item = Result<Event<K>, E>>,
{
    let mut filter = UpdateFilter::<K>::default();
    stream.filter_map(move |event| {
        futures::future::ready(match event {
            Ok(event) => filter.observe(event).map(Ok),
            Err(err) => Some(Err(err)),
        })
    })
}
