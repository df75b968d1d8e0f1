use crate::Error;
use kube::ResourceExt;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub deferrals: IntCounterVec,
    pub reconcile_duration: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "kubeconfig_operator_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["kind"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "kubeconfig_operator_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["kind", "instance", "error"],
        )
        .unwrap();
        let deferrals = IntCounterVec::new(
            opts!(
                "kubeconfig_operator_reconcile_deferrals_total",
                "reconciles that were postponed without an error",
            ),
            &["reason"],
        )
        .unwrap();
        let reconciliations = IntCounter::new(
            "kubeconfig_operator_reconciliations_total",
            "reconciliations",
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            deferrals,
            reconcile_duration,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.deferrals.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure<T: kube::Resource<DynamicType = ()>>(&self, obj: &T, e: &Error) {
        self.failures
            .with_label_values(&[
                T::kind(&()).as_ref(),
                format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any()).as_ref(),
                e.metric_label(),
            ])
            .inc()
    }

    pub fn reconcile_deferred(&self, reason: &str) {
        self.deferrals.with_label_values(&[reason]).inc()
    }

    pub fn count_and_measure<T: kube::Resource<DynamicType = ()>>(&self) -> ReconcileMeasurer<T> {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            _resource_type: std::marker::PhantomData,
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer<T: kube::Resource<DynamicType = ()>> {
    start: Instant,
    metric: HistogramVec,
    _resource_type: std::marker::PhantomData<T>,
}

impl<T: kube::Resource<DynamicType = ()>> Drop for ReconcileMeasurer<T> {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[T::kind(&()).as_ref()])
            .observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{Shoot, ShootSpec};

    #[test]
    fn failures_and_deferrals_are_exported() {
        let registry = Registry::new();
        let metrics = Metrics::default().register(&registry).unwrap();

        let mut shoot = Shoot::new("foo", ShootSpec::default());
        shoot.metadata.namespace = Some("garden-dev".into());
        metrics.reconcile_failure(&shoot, &Error::ClusterIdentityTimeout);
        metrics.reconcile_deferred("QuotaExceeded");
        drop(metrics.count_and_measure::<Shoot>());

        let families = registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"kubeconfig_operator_reconciliation_errors_total".to_string()));
        assert!(names.contains(&"kubeconfig_operator_reconcile_deferrals_total".to_string()));
        assert_eq!(metrics.reconciliations.get(), 1);
        assert_eq!(
            metrics
                .failures
                .with_label_values(&["Shoot", "garden-dev/foo", "ClusterIdentityTimeout"])
                .get(),
            1
        );
    }
}
