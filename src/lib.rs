use controllers::shoot::reconcilers::{
    kubeconfig::BuildError, quota::QuotaError, trust_anchor::TrustAnchorError,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error(transparent)]
    TrustAnchor(#[from] TrustAnchorError),

    #[error("Failed to build kubeconfig: {0}")]
    Kubeconfig(#[from] BuildError),

    #[error("Could not parse url {url} of advertised address {name}: {source}")]
    InvalidEndpointUrl {
        name: String,
        url: String,
        #[source]
        source: http::uri::InvalidUri,
    },

    #[error("The garden cluster identity ConfigMap {0} does not exist")]
    ClusterIdentityNotFound(String),

    #[error("The garden cluster identity ConfigMap {0} has no data for key {1}")]
    ClusterIdentityEmpty(String, String),

    #[error("Timed out fetching the garden cluster identity")]
    ClusterIdentityTimeout,

    #[error("ConfigMap {name} has {size} bytes, which is more than the allowed {max}")]
    ObjectTooLarge {
        name: String,
        size: usize,
        max: usize,
    },

    #[error("ConfigMap {name} is already controlled by {owner}")]
    AlreadyOwned { name: String, owner: String },

    #[error("Object is missing {0}")]
    MissingObjectKey(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How a failed reconcile should be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// May succeed on its own, retried soon
    Transient,
    /// Needs the inputs to change, retried only on the resync interval or on a watch event
    Validation,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::KubeError(kube::Error::Api(kube::error::ErrorResponse {
                code: 400 | 422,
                ..
            })) => ErrorClass::Validation,
            Error::KubeError(_)
            | Error::Quota(_)
            | Error::ClusterIdentityNotFound(_)
            | Error::ClusterIdentityEmpty(..)
            | Error::ClusterIdentityTimeout => ErrorClass::Transient,
            Error::SerializationError(_)
            | Error::TrustAnchor(_)
            | Error::Kubeconfig(_)
            | Error::InvalidEndpointUrl { .. }
            | Error::ObjectTooLarge { .. }
            | Error::AlreadyOwned { .. }
            | Error::MissingObjectKey(_) => ErrorClass::Validation,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::Quota(_) => "QuotaStatusUnknown",
            Error::TrustAnchor(_) => "InvalidTrustAnchor",
            Error::Kubeconfig(_) => "InvalidKubeconfig",
            Error::InvalidEndpointUrl { .. } => "InvalidEndpointUrl",
            Error::ClusterIdentityNotFound(_) => "ClusterIdentityNotFound",
            Error::ClusterIdentityEmpty(..) => "ClusterIdentityEmpty",
            Error::ClusterIdentityTimeout => "ClusterIdentityTimeout",
            Error::ObjectTooLarge { .. } => "ObjectTooLarge",
            Error::AlreadyOwned { .. } => "AlreadyOwned",
            Error::MissingObjectKey(_) => "MissingObjectKey",
        }
    }
}

/// Operator configuration
pub mod config;

pub mod controllers;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use controllers::{run, State};
pub use metrics::Metrics;

/// External CRDs
pub mod resources;

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "nope".into(),
            reason: "Test".into(),
            code,
        }))
    }

    #[test]
    fn api_errors_are_transient_unless_rejected_as_invalid() {
        assert_eq!(api_error(409).class(), ErrorClass::Transient);
        assert_eq!(api_error(500).class(), ErrorClass::Transient);
        assert_eq!(api_error(422).class(), ErrorClass::Validation);
    }

    #[test]
    fn identity_problems_are_transient() {
        assert_eq!(Error::ClusterIdentityTimeout.class(), ErrorClass::Transient);
        assert_eq!(
            Error::ClusterIdentityNotFound("kube-system/cluster-identity".into()).class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn malformed_inputs_are_validation_errors() {
        assert_eq!(
            Error::TrustAnchor(TrustAnchorError::Malformed("x".into())).class(),
            ErrorClass::Validation
        );
        assert_eq!(
            Error::Kubeconfig(BuildError::MissingEndpoints).class(),
            ErrorClass::Validation
        );
        assert_eq!(
            Error::ObjectTooLarge {
                name: "foo.kubeconfig".into(),
                size: 2,
                max: 1
            }
            .class(),
            ErrorClass::Validation
        );
    }
}
