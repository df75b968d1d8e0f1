use std::collections::BTreeMap;

use base64::Engine;

use crate::resources::ShootState;

/// Name of the gardener resource data entry holding the cluster certificate authority
pub const CA_CLUSTER_DATA_NAME: &str = "ca";
/// Key of the certificate inside the certificate authority data
pub const DATA_KEY_CERTIFICATE_CA: &str = "ca.crt";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TrustAnchorError {
    #[error("Certificate authority not yet provisioned")]
    NotProvisioned,
    #[error("Failed to decode certificate authority: {0}")]
    Malformed(String),
    #[error("Invalid certificate authority: {0}")]
    InvalidCertificate(String),
}

/// Reads the PEM encoded cluster CA certificate out of a ShootState.
///
/// The entry is stored as a JSON object of base64 encoded values. A missing entry is the normal
/// state for clusters that are still being created and is reported as `NotProvisioned`.
pub fn cluster_ca(shoot_state: &ShootState) -> Result<Vec<u8>, TrustAnchorError> {
    let ca = shoot_state
        .gardener_resource_data(CA_CLUSTER_DATA_NAME)
        .ok_or(TrustAnchorError::NotProvisioned)?;

    let data: BTreeMap<String, String> = serde_json::from_value(ca.data.clone()).map_err(|_| {
        TrustAnchorError::Malformed("failed to unmarshal certificate authority from raw data".into())
    })?;

    let encoded = data.get(DATA_KEY_CERTIFICATE_CA).ok_or_else(|| {
        TrustAnchorError::Malformed(format!("missing {DATA_KEY_CERTIFICATE_CA}"))
    })?;

    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| TrustAnchorError::Malformed(format!("{DATA_KEY_CERTIFICATE_CA} is not base64: {e}")))
}

/// Ensures the bytes hold a PEM `CERTIFICATE` block that parses as X.509.
pub fn validate_certificate(bytes: &[u8]) -> Result<(), TrustAnchorError> {
    let block = pem::parse(bytes)
        .map_err(|e| TrustAnchorError::InvalidCertificate(format!("failed to parse PEM: {e}")))?;

    if block.tag() != "CERTIFICATE" {
        return Err(TrustAnchorError::InvalidCertificate(
            "PEM block type must be CERTIFICATE".into(),
        ));
    }

    x509_parser::parse_x509_certificate(block.contents())
        .map_err(|e| TrustAnchorError::InvalidCertificate(format!("failed to parse certificate: {e}")))?;

    Ok(())
}
