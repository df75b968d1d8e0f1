//! Maintains a kubeconfig ConfigMap next to every Shoot.

pub mod admission;
pub mod controller;
pub mod predicates;
pub mod reconcilers;
pub mod store;

pub use controller::{run, Outcome, Reconciler};
