//! TLS material tracking
//!
//! The operator never generates key material. It reads certificates supplied
//! by an external issuer, records the CA fingerprint and serving certificate
//! expiry as a [`TlsMaterialRef`], and asks the issuer to rotate before expiry.

mod manager;
mod store;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x509_parser::pem::parse_x509_pem;

use crate::error::{Error, Result};

pub use manager::{default_rotation_threshold, MaterialStore, TlsMaterialManager};
pub use store::{KubeSecretStore, ROTATION_REQUESTED_ANNOTATION};

/// Raw PEM material as stored by the secret store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert_pem: Vec<u8>,
    pub ca_pem: Vec<u8>,
}

/// Reference to one generation of TLS material
///
/// Shared read-only by every route bound to it. Two refs are equal only when
/// they describe the same CA and the same serving certificate expiry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsMaterialRef {
    pub secret_name: String,
    /// Hex SHA-256 of the CA certificate DER
    pub ca_fingerprint: String,
    pub cert_expiry: DateTime<Utc>,
    pub mutual_required: bool,
}

impl TlsMaterialRef {
    /// Build a ref by parsing PEM material
    pub fn from_material(
        secret_name: &str,
        material: &TlsMaterial,
        mutual_required: bool,
    ) -> Result<Self> {
        let (_, cert_pem) = parse_x509_pem(&material.cert_pem)
            .map_err(|e| Error::MaterialInvalid(format!("{secret_name}: tls.crt: {e}")))?;
        let cert = cert_pem
            .parse_x509()
            .map_err(|e| Error::MaterialInvalid(format!("{secret_name}: tls.crt: {e}")))?;
        let not_after = cert.validity().not_after.timestamp();
        let cert_expiry = Utc
            .timestamp_opt(not_after, 0)
            .single()
            .ok_or_else(|| {
                Error::MaterialInvalid(format!("{secret_name}: expiry {not_after} out of range"))
            })?;

        let (_, ca_pem) = parse_x509_pem(&material.ca_pem)
            .map_err(|e| Error::MaterialInvalid(format!("{secret_name}: ca.crt: {e}")))?;

        Ok(Self {
            secret_name: secret_name.to_string(),
            ca_fingerprint: fingerprint(&ca_pem.contents),
            cert_expiry,
            mutual_required,
        })
    }

    /// Validity left at `now`; negative once expired
    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.cert_expiry - now
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.cert_expiry <= now
    }
}

/// Hex-encoded SHA-256 of a DER blob
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}
