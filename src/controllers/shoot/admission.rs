use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;

/// Returned when a namespace already has the maximum number of reconciles in flight
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("max count reached for namespace {namespace}")]
pub struct Denied {
    pub namespace: String,
}

/// Bounds the number of concurrent reconciles per namespace, so that one project with many
/// shoots cannot occupy the whole worker pool.
#[derive(Debug)]
pub struct AdmissionController {
    max_per_namespace: usize,
    in_flight: Mutex<HashMap<String, usize>>,
}

impl AdmissionController {
    pub fn new(max_per_namespace: usize) -> Arc<Self> {
        Arc::new(Self {
            max_per_namespace,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        // the map holds plain counters, they stay consistent even if a holder panicked
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Takes a slot for `namespace`. The slot is given back when the ticket is dropped.
    pub fn admit(self: &Arc<Self>, namespace: &str) -> Result<AdmissionTicket, Denied> {
        let mut in_flight = self.lock();
        let count = in_flight.entry(namespace.to_string()).or_insert(0);
        if *count >= self.max_per_namespace {
            if *count == 0 {
                in_flight.remove(namespace);
            }
            return Err(Denied {
                namespace: namespace.into(),
            });
        }
        *count += 1;

        Ok(AdmissionTicket {
            controller: self.clone(),
            namespace: namespace.into(),
        })
    }

    fn release(&self, namespace: &str) {
        let mut in_flight = self.lock();
        let Some(count) = in_flight.get_mut(namespace) else {
            panic!("released admission for namespace {namespace} that was never admitted");
        };
        *count -= 1;
        if *count == 0 {
            in_flight.remove(namespace);
        }
    }

    /// Number of reconciles currently admitted for `namespace`
    pub fn in_flight(&self, namespace: &str) -> usize {
        self.lock().get(namespace).copied().unwrap_or(0)
    }

    /// Number of namespaces with at least one admitted reconcile
    pub fn tracked_namespaces(&self) -> usize {
        self.lock().len()
    }
}

/// Proof of admission. Dropping it releases the slot, on every exit path of a reconcile.
#[derive(Debug)]
pub struct AdmissionTicket {
    controller: Arc<AdmissionController>,
    namespace: String,
}

impl AdmissionTicket {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.controller.release(&self.namespace);
    }
}

/// Uniformly random requeue delay for denied admissions, spreading retries of a busy namespace
pub fn requeue_jitter(min: Duration, max: Duration) -> Duration {
    if min >= max {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[test]
    fn admits_up_to_the_ceiling() {
        let admission = AdmissionController::new(3);
        let tickets: Vec<_> = (0..3)
            .map(|_| admission.admit("garden-dev").unwrap())
            .collect();

        assert_eq!(
            admission.admit("garden-dev").unwrap_err(),
            Denied {
                namespace: "garden-dev".into()
            }
        );
        assert_eq!(admission.in_flight("garden-dev"), 3);

        drop(tickets);
        assert!(admission.admit("garden-dev").is_ok());
    }

    #[test]
    fn namespaces_are_independent() {
        let admission = AdmissionController::new(1);
        let _dev = admission.admit("garden-dev").unwrap();
        assert!(admission.admit("garden-dev").is_err());
        assert!(admission.admit("garden-prod").is_ok());
    }

    #[test]
    fn entry_is_removed_when_last_ticket_drops() {
        let admission = AdmissionController::new(2);
        let a = admission.admit("garden-dev").unwrap();
        let b = admission.admit("garden-dev").unwrap();
        assert_eq!(admission.tracked_namespaces(), 1);

        drop(a);
        assert_eq!(admission.in_flight("garden-dev"), 1);
        drop(b);
        assert_eq!(admission.tracked_namespaces(), 0);
    }

    #[test]
    fn denial_leaves_no_entry_behind() {
        let admission = AdmissionController::new(0);
        assert!(admission.admit("garden-dev").is_err());
        assert_eq!(admission.tracked_namespaces(), 0);
    }

    #[test]
    #[should_panic(expected = "never admitted")]
    fn releasing_unknown_namespace_panics() {
        let admission = AdmissionController::new(1);
        admission.release("garden-dev");
    }

    #[test]
    fn ticket_is_released_on_panic() {
        let admission = AdmissionController::new(1);
        let inner = admission.clone();
        let result = std::panic::catch_unwind(move || {
            let _ticket = inner.admit("garden-dev").unwrap();
            panic!("reconcile blew up");
        });
        assert!(result.is_err());
        assert_eq!(admission.in_flight("garden-dev"), 0);
    }

    #[test]
    fn bound_holds_under_contention() {
        const THREADS: usize = 16;
        let admission = AdmissionController::new(3);
        let barrier = Arc::new(Barrier::new(THREADS));
        let peak = Arc::new(AtomicUsize::new(0));
        let admitted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let admission = admission.clone();
                let barrier = barrier.clone();
                let peak = peak.clone();
                let admitted = admitted.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..200 {
                        if let Ok(ticket) = admission.admit("garden-dev") {
                            admitted.fetch_add(1, Ordering::SeqCst);
                            peak.fetch_max(admission.in_flight(ticket.namespace()), Ordering::SeqCst);
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(admitted.load(Ordering::SeqCst) > 0);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(admission.tracked_namespaces(), 0);
    }

    #[test]
    fn jitter_stays_in_window() {
        let min = Duration::from_millis(100);
        let max = Duration::from_secs(5);
        for _ in 0..1000 {
            let d = requeue_jitter(min, max);
            assert!(d >= min && d <= max, "{d:?}");
        }
        assert_eq!(requeue_jitter(max, max), max);
    }
}
