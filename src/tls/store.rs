//! Kubernetes Secret backed material store

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, ApiResource, DynamicObject, GroupVersionKind, Patch, PatchParams},
    Client,
};
use serde_json::json;
use tracing::{debug, info};

use super::{MaterialStore, TlsMaterial};
use crate::error::{Error, Result};

/// Annotation stamped on a Secret when rotation is requested
pub const ROTATION_REQUESTED_ANNOTATION: &str = "access.cassandra.io/rotation-requested";

/// Annotation cert-manager puts on Secrets it issues
const CERT_MANAGER_CERTIFICATE_ANNOTATION: &str = "cert-manager.io/certificate-name";

pub struct KubeSecretStore {
    client: Client,
    namespace: String,
}

impl KubeSecretStore {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Mark a cert-manager Certificate for re-issuance, as `cmctl renew` does
    async fn renew_certificate(&self, certificate: &str) -> Result<()> {
        let gvk = GroupVersionKind::gvk("cert-manager.io", "v1", "Certificate");
        let resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &self.namespace, &resource);

        let patch = json!({
            "status": {
                "conditions": [{
                    "type": "Issuing",
                    "status": "True",
                    "reason": "ManuallyTriggered",
                    "message": "Renewal requested by cass-access-operator",
                    "lastTransitionTime": Utc::now().to_rfc3339(),
                }]
            }
        });
        api.patch_status(
            certificate,
            &PatchParams::apply("cass-access-operator"),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

/// Extract PEM material from Secret data
///
/// `ca.crt` falls back to `tls.crt` for self-signed material.
pub(crate) fn material_from_secret(secret_name: &str, secret: &Secret) -> Result<TlsMaterial> {
    let data = secret
        .data
        .as_ref()
        .ok_or_else(|| Error::MaterialInvalid(format!("Secret {secret_name} has no data")))?;

    let cert_pem = data
        .get("tls.crt")
        .ok_or_else(|| Error::MaterialInvalid(format!("Secret {secret_name} is missing tls.crt")))?
        .0
        .clone();
    let ca_pem = data
        .get("ca.crt")
        .map(|b| b.0.clone())
        .unwrap_or_else(|| cert_pem.clone());

    Ok(TlsMaterial { cert_pem, ca_pem })
}

#[async_trait]
impl MaterialStore for KubeSecretStore {
    async fn load(&self, secret_name: &str) -> Result<TlsMaterial> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = secrets.get(secret_name).await?;
        material_from_secret(secret_name, &secret)
    }

    async fn request_rotation(&self, secret_name: &str) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = secrets.get(secret_name).await?;

        let certificate = secret
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(CERT_MANAGER_CERTIFICATE_ANNOTATION))
            .cloned();

        if let Some(certificate) = certificate {
            info!(
                "Requesting cert-manager renewal of Certificate {}/{}",
                self.namespace, certificate
            );
            self.renew_certificate(&certificate).await?;
        }

        let patch = json!({
            "metadata": {
                "annotations": {
                    ROTATION_REQUESTED_ANNOTATION: Utc::now().to_rfc3339()
                }
            }
        });
        secrets
            .patch(
                secret_name,
                &PatchParams::apply("cass-access-operator"),
                &Patch::Merge(&patch),
            )
            .await?;
        debug!("Stamped rotation request on Secret {}", secret_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret(entries: &[(&str, &[u8])]) -> Secret {
        let data: BTreeMap<String, ByteString> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
            .collect();
        Secret {
            data: Some(data),
            ..Default::default()
        }
    }

    #[test]
    fn test_material_from_secret() {
        let s = secret(&[("tls.crt", b"CERT"), ("ca.crt", b"CA")]);
        let m = material_from_secret("ingress-tls", &s).unwrap();
        assert_eq!(m.cert_pem, b"CERT");
        assert_eq!(m.ca_pem, b"CA");
    }

    #[test]
    fn test_ca_falls_back_to_cert() {
        let s = secret(&[("tls.crt", b"CERT")]);
        let m = material_from_secret("ingress-tls", &s).unwrap();
        assert_eq!(m.ca_pem, b"CERT");
    }

    #[test]
    fn test_missing_cert_is_invalid() {
        let s = secret(&[("ca.crt", b"CA")]);
        assert!(matches!(
            material_from_secret("ingress-tls", &s),
            Err(Error::MaterialInvalid(_))
        ));
        assert!(material_from_secret("ingress-tls", &Secret::default()).is_err());
    }
}
