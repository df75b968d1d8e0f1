use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use http::Uri;
use k8s_openapi::api::core::v1::{ConfigMap, ResourceQuota};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{self, Action, Controller},
        watcher::Config,
    },
    Resource,
};
use tokio::{
    sync::{RwLock, Semaphore},
    time::Duration,
};
use tracing::*;

use crate::config::{OperatorConfig, ShootControllerConfig};
use crate::controllers::{Diagnostics, State};
use crate::resources::{Shoot, ShootState};
use crate::{telemetry, Error, ErrorClass, Metrics, Result};

use super::admission::{requeue_jitter, AdmissionController};
use super::predicates::filter_updates;
use super::reconcilers::config_map::{
    config_map_name, desired_config_map, ensure_object_size, merge_config_map, ROLE_KUBECONFIG,
    ROLE_LABEL,
};
use super::reconcilers::kubeconfig::{Endpoint, KubeconfigFormat, KubeconfigRequest};
use super::reconcilers::quota::{has_capacity, CONFIG_MAP_COUNT_RESOURCE};
use super::reconcilers::trust_anchor::{cluster_ca, validate_certificate, TrustAnchorError};
use super::store::{
    ClusterStore, KubeStore, CLUSTER_IDENTITY_NAME, CLUSTER_IDENTITY_NAMESPACE, FIELD_MANAGER,
};

/// Data key holding the identity in the cluster identity ConfigMap
const CLUSTER_IDENTITY_KEY: &str = "cluster-identity";
const CLUSTER_IDENTITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Requeue delay for states that only resolve through an external change
const RESYNC_INTERVAL: Duration = Duration::from_secs(60 * 60);
const TRANSIENT_ERROR_REQUEUE: Duration = Duration::from_secs(30);
/// Attempts to clean up after a shoot that left the cache before giving up on it
const DELETED_SHOOT_ATTEMPTS: usize = 5;

/// Result of a reconcile that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Namespace already has the maximum number of reconciles in flight
    AdmissionDenied,
    /// Shoot or ShootState is gone or terminating, the kubeconfig was removed
    Cleanup,
    /// No room left in the namespace's ConfigMap quota
    QuotaExceeded,
    /// Shoot does not advertise any kube-apiserver address yet
    NoEndpoints,
    /// Cluster CA has not been generated yet
    TrustAnchorPending,
    Unchanged,
    Created,
    Updated,
}

impl Outcome {
    /// Metric label for outcomes that postpone the kubeconfig
    pub fn deferral_reason(&self) -> Option<&'static str> {
        match self {
            Outcome::AdmissionDenied => Some("AdmissionDenied"),
            Outcome::QuotaExceeded => Some("QuotaExceeded"),
            Outcome::NoEndpoints => Some("NoEndpoints"),
            Outcome::TrustAnchorPending => Some("TrustAnchorPending"),
            Outcome::Cleanup | Outcome::Unchanged | Outcome::Created | Outcome::Updated => None,
        }
    }
}

/// Sequences the gates and the build for one shoot key
pub struct Reconciler {
    store: Arc<dyn ClusterStore>,
    /// Global ceiling, shared by controller workers and deleted-shoot cleanups
    workers: Semaphore,
    admission: Arc<AdmissionController>,
    config: ShootControllerConfig,
    max_object_size: usize,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ClusterStore>, config: &OperatorConfig) -> Self {
        Self {
            store,
            workers: Semaphore::new(config.controllers.shoot.max_concurrent_reconciles),
            admission: AdmissionController::new(
                config.controllers.shoot.max_concurrent_reconciles_per_namespace,
            ),
            config: config.controllers.shoot.clone(),
            max_object_size: config.webhooks.config_map_validation.max_object_size,
        }
    }

    pub fn action(&self, outcome: Outcome) -> Action {
        match outcome {
            Outcome::AdmissionDenied => Action::requeue(self.admission_jitter()),
            Outcome::Cleanup => Action::await_change(),
            Outcome::QuotaExceeded => Action::requeue(self.config.quota_exceeded_retry_delay),
            Outcome::NoEndpoints
            | Outcome::TrustAnchorPending
            | Outcome::Unchanged
            | Outcome::Created
            | Outcome::Updated => Action::requeue(RESYNC_INTERVAL),
        }
    }

    fn admission_jitter(&self) -> Duration {
        requeue_jitter(
            self.config.admission_requeue_min,
            self.config.admission_requeue_max,
        )
    }

    /// Drives the kubeconfig ConfigMap of `namespace/name` towards the state derived from the
    /// Shoot, its ShootState and the garden cluster identity.
    pub async fn reconcile_key(&self, namespace: &str, name: &str) -> Result<Outcome> {
        let _permit = self
            .workers
            .acquire()
            .await
            .expect("reconcile semaphore is never closed");
        let _ticket = match self.admission.admit(namespace) {
            Ok(ticket) => ticket,
            Err(denied) => {
                debug!("{denied}, requeueing {namespace}/{name}");
                return Ok(Outcome::AdmissionDenied);
            }
        };

        let cm_name = config_map_name(name);

        let shoot = match self.store.shoot(namespace, name).await? {
            Some(shoot) if !shoot.is_terminating() => shoot,
            _ => return self.cleanup(namespace, &cm_name).await,
        };

        let existing = self.store.config_map(namespace, &cm_name).await?;

        // an update does not consume quota, only a create does
        if existing.is_none() {
            let quotas = self.store.resource_quotas(namespace).await?;
            if !has_capacity(&quotas, CONFIG_MAP_COUNT_RESOURCE)? {
                info!(
                    "Not enough {CONFIG_MAP_COUNT_RESOURCE} quota in namespace {namespace} for {cm_name}"
                );
                return Ok(Outcome::QuotaExceeded);
            }
        }

        match self.store.shoot_state(namespace, name).await? {
            Some(shoot_state) if !shoot_state.is_terminating() => {
                if shoot.advertised_addresses().is_empty() {
                    info!("No kube-apiserver advertised addresses in Shoot {namespace}/{name}");
                    return Ok(Outcome::NoEndpoints);
                }

                let ca_cert = match cluster_ca(&shoot_state) {
                    Ok(ca) => ca,
                    Err(TrustAnchorError::NotProvisioned) => {
                        info!("Certificate authority of Shoot {namespace}/{name} not yet provisioned");
                        return Ok(Outcome::TrustAnchorPending);
                    }
                    Err(err) => return Err(err.into()),
                };
                validate_certificate(&ca_cert)?;

                let request = KubeconfigRequest {
                    endpoints: endpoints(&shoot)?,
                    ca_cert,
                    namespace: namespace.into(),
                    shoot_name: name.into(),
                    garden_cluster_identity: self.garden_cluster_identity().await?,
                };
                let format = KubeconfigFormat::for_kubernetes_version(&shoot.spec.kubernetes.version)?;
                let kubeconfig = request.build(format)?;

                let desired = desired_config_map(&shoot, kubeconfig)?;
                self.upsert(existing, desired).await
            }
            _ => self.cleanup(namespace, &cm_name).await,
        }
    }

    async fn upsert(&self, existing: Option<ConfigMap>, desired: ConfigMap) -> Result<Outcome> {
        match existing {
            None => {
                ensure_object_size(&desired, self.max_object_size)?;
                self.store.create_config_map(&desired).await?;
                info!(
                    "Created ConfigMap {}/{}",
                    desired.namespace().unwrap_or_default(),
                    desired.name_any()
                );
                Ok(Outcome::Created)
            }
            Some(existing) => match merge_config_map(&existing, &desired)? {
                None => Ok(Outcome::Unchanged),
                Some(merged) => {
                    ensure_object_size(&merged, self.max_object_size)?;
                    self.store.replace_config_map(&merged).await?;
                    info!(
                        "Updated ConfigMap {}/{}",
                        merged.namespace().unwrap_or_default(),
                        merged.name_any()
                    );
                    Ok(Outcome::Updated)
                }
            },
        }
    }

    async fn cleanup(&self, namespace: &str, cm_name: &str) -> Result<Outcome> {
        if self.store.delete_config_map(namespace, cm_name).await? {
            info!("Deleted ConfigMap {namespace}/{cm_name}");
        }
        Ok(Outcome::Cleanup)
    }

    async fn garden_cluster_identity(&self) -> Result<String> {
        let reference = format!("{CLUSTER_IDENTITY_NAMESPACE}/{CLUSTER_IDENTITY_NAME}");
        let cm = tokio::time::timeout(CLUSTER_IDENTITY_TIMEOUT, self.store.cluster_identity())
            .await
            .map_err(|_| Error::ClusterIdentityTimeout)??
            .ok_or_else(|| Error::ClusterIdentityNotFound(reference.clone()))?;

        cm.data
            .as_ref()
            .and_then(|d| d.get(CLUSTER_IDENTITY_KEY))
            .filter(|identity| !identity.is_empty())
            .cloned()
            .ok_or_else(|| Error::ClusterIdentityEmpty(reference, CLUSTER_IDENTITY_KEY.into()))
    }
}

/// Endpoints of the shoot in advertised order. The host is the url's authority as written,
/// including a port that is the scheme's default.
fn endpoints(shoot: &Shoot) -> Result<Vec<Endpoint>> {
    shoot
        .advertised_addresses()
        .iter()
        .map(|address| {
            let uri: Uri = address.url.parse().map_err(|source| Error::InvalidEndpointUrl {
                name: address.name.clone(),
                url: address.url.clone(),
                source,
            })?;
            // userinfo never ends up in the server
            let host = uri
                .authority()
                .map(|authority| authority.as_str())
                .and_then(|authority| authority.rsplit('@').next())
                .unwrap_or_default();
            Ok(Endpoint {
                name: address.name.clone(),
                host: host.to_string(),
            })
        })
        .collect()
}

// Context for our reconciler
pub(super) struct Context {
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// State machine run for every key
    pub reconciler: Reconciler,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl Context {
    pub fn new(client: Client, metrics: Metrics, state: &State) -> Arc<Context> {
        Arc::new(Context {
            recorder: Recorder::new(client.clone(), FIELD_MANAGER.into()),
            reconciler: Reconciler::new(Arc::new(KubeStore::new(client)), state.config()),
            diagnostics: state.diagnostics.clone(),
            metrics,
        })
    }

    fn observe(&self, outcome: Outcome) -> Action {
        if let Some(reason) = outcome.deferral_reason() {
            self.metrics.reconcile_deferred(reason);
        }
        self.reconciler.action(outcome)
    }
}

#[instrument(skip(ctx, shoot), fields(trace_id))]
async fn reconcile(shoot: Arc<Shoot>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<Shoot>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = shoot
        .namespace()
        .ok_or(Error::MissingObjectKey("shoot metadata.namespace"))?;
    let name = shoot.name_any();

    info!("Reconciling Shoot \"{namespace}/{name}\"");
    match ctx.reconciler.reconcile_key(&namespace, &name).await {
        Ok(outcome) => {
            debug!("Shoot \"{namespace}/{name}\" reconciled: {outcome:?}");
            Ok(ctx.observe(outcome))
        }
        Err(err) if err.class() == ErrorClass::Transient => {
            info!("Reconciling Shoot \"{namespace}/{name}\" will be retried: {err}");
            ctx.metrics.reconcile_failure(shoot.as_ref(), &err);
            Err(err)
        }
        Err(err) => {
            warn!("reconcile failed: {:?}", err);

            if let Err(publish_err) = ctx
                .recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "FailedReconcile".into(),
                        note: Some(err.to_string()),
                        action: "Reconcile".into(),
                        secondary: None,
                    },
                    &shoot.object_ref(&()),
                )
                .await
            {
                warn!("failed to publish event: {publish_err}");
            }

            ctx.metrics.reconcile_failure(shoot.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy(_shoot: Arc<Shoot>, error: &Error, _ctx: Arc<Context>) -> Action {
    match error.class() {
        ErrorClass::Transient => Action::requeue(TRANSIENT_ERROR_REQUEUE),
        // retrying will not help until the inputs change, which also triggers a reconcile
        ErrorClass::Validation => Action::requeue(RESYNC_INTERVAL),
    }
}

/// The controller never sees keys whose Shoot left the cache, so their cleanup runs here.
/// Returns the final outcome, or the last error once the attempts are used up.
async fn reconcile_deleted(
    reconciler: &Reconciler,
    metrics: &Metrics,
    namespace: &str,
    name: &str,
) -> Result<Outcome> {
    let instance = format!("{namespace}/{name}");
    let mut failures = 0;
    loop {
        match reconciler.reconcile_key(namespace, name).await {
            Ok(Outcome::AdmissionDenied) => {
                metrics.reconcile_deferred("AdmissionDenied");
                tokio::time::sleep(reconciler.admission_jitter()).await;
            }
            Ok(outcome) => {
                debug!("Deleted Shoot \"{instance}\" reconciled: {outcome:?}");
                if let Some(reason) = outcome.deferral_reason() {
                    metrics.reconcile_deferred(reason);
                }
                return Ok(outcome);
            }
            Err(err) => {
                failures += 1;
                metrics
                    .failures
                    .with_label_values(&["Shoot", instance.as_str(), err.metric_label()])
                    .inc();
                if failures >= DELETED_SHOOT_ATTEMPTS {
                    error!("Giving up cleaning up after deleted Shoot \"{instance}\": {err}");
                    return Err(err);
                }
                match err.class() {
                    ErrorClass::Transient => {
                        info!("Cleaning up after deleted Shoot \"{instance}\" will be retried: {err}")
                    }
                    ErrorClass::Validation => {
                        warn!("Cleaning up after deleted Shoot \"{instance}\" failed: {err}")
                    }
                }
                tokio::time::sleep(TRANSIENT_ERROR_REQUEUE).await;
            }
        }
    }
}

/// Shoots of the quota's namespace that still wait for their kubeconfig ConfigMap
fn shoots_waiting_for_quota(
    quota: &ResourceQuota,
    shoots: &Store<Shoot>,
    config_maps: &Store<ConfigMap>,
) -> Vec<ObjectRef<Shoot>> {
    let Some(namespace) = quota.namespace() else {
        return Vec::new();
    };

    shoots
        .state()
        .iter()
        .filter(|shoot| shoot.namespace().as_deref() == Some(namespace.as_str()))
        .filter(|shoot| {
            let cm_ref = ObjectRef::new(&config_map_name(&shoot.name_any())).within(&namespace);
            config_maps.get(&cm_ref).is_none()
        })
        .map(|shoot| ObjectRef::from_obj(shoot.as_ref()))
        .collect()
}

// Initialize the controller and shared state (given the crds are installed)
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let shoot_api = Api::<Shoot>::all(client.clone());
    let shoot_state_api = Api::<ShootState>::all(client.clone());
    let cm_api = Api::<ConfigMap>::all(client.clone());
    let quota_api = Api::<ResourceQuota>::all(client.clone());

    if let Err(e) = shoot_api.list(&ListParams::default().limit(1)).await {
        error!("Shoot is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }
    if let Err(e) = shoot_state_api.list(&ListParams::default().limit(1)).await {
        error!("ShootState is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let (shoot_store, shoot_writer) = reflector::store();
    let shoot_reflector = filter_updates(
        reflector(shoot_writer, watcher(shoot_api, Config::default())).default_backoff(),
    )
    .touched_objects();

    // only kubeconfig ConfigMaps are of interest, and only those are cached
    let (cm_store, cm_writer) = reflector::store();
    let cm_reflector = filter_updates(
        reflector(
            cm_writer,
            watcher(
                cm_api,
                Config::default().labels(&format!("{ROLE_LABEL}={ROLE_KUBECONFIG}")),
            ),
        )
        .default_backoff(),
    )
    .touched_objects();

    let shoot_state_watcher =
        filter_updates(watcher(shoot_state_api, Config::default()).default_backoff())
            .touched_objects();

    let quota_watcher =
        filter_updates(watcher(quota_api, Config::default()).default_backoff()).touched_objects();

    let shoot_config = &state.config().controllers.shoot;
    let concurrency = u16::try_from(shoot_config.max_concurrent_reconciles).unwrap_or(u16::MAX);
    info!(
        "Starting Shoot controller with {} workers, at most {} per namespace",
        concurrency, shoot_config.max_concurrent_reconciles_per_namespace
    );

    let ctx = Context::new(client, metrics, &state);
    let quota_shoot_store = shoot_store.clone();

    Controller::for_stream(shoot_reflector, shoot_store)
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .owns_stream(cm_reflector)
        .watches_stream(
            shoot_state_watcher,
            |shoot_state| -> Option<ObjectRef<Shoot>> {
                // a ShootState shares its key with its Shoot
                let namespace = shoot_state.namespace()?;
                Some(ObjectRef::new(&shoot_state.name_any()).within(&namespace))
            },
        )
        .watches_stream(quota_watcher, move |quota| {
            shoots_waiting_for_quota(&quota, &quota_shoot_store, &cm_store)
        })
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|res| {
            let ctx = ctx.clone();
            async move {
                match res {
                    Ok((obj, _)) => trace!("reconciled {obj}"),
                    Err(controller::Error::ObjectNotFound(obj)) => match obj.namespace {
                        Some(namespace) => {
                            tokio::spawn(async move {
                                let _ = reconcile_deleted(
                                    &ctx.reconciler,
                                    &ctx.metrics,
                                    &namespace,
                                    &obj.name,
                                )
                                .await;
                            });
                        }
                        None => warn!("ignoring cluster scoped object {}", obj.name),
                    },
                    Err(err) => debug!("controller error: {err}"),
                }
            }
        })
        .await;
}
