//! Make-before-break TLS rotation
//!
//! A ref that drops below the rotation threshold is replaced by a freshly
//! issued one. The old ref moves to the retiring set and stays valid until no
//! Active route references it any more.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use super::{TlsMaterial, TlsMaterialRef};
use crate::error::{Error, Result};

/// Default remaining validity below which rotation is triggered
pub fn default_rotation_threshold() -> chrono::Duration {
    chrono::Duration::days(crate::crd::DEFAULT_ROTATION_THRESHOLD_DAYS)
}

/// Source of certificate material, owned by an external secret store
#[async_trait]
pub trait MaterialStore: Send + Sync {
    async fn load(&self, secret_name: &str) -> Result<TlsMaterial>;

    /// Ask the external issuer to re-issue the material behind `secret_name`
    async fn request_rotation(&self, secret_name: &str) -> Result<()>;
}

pub struct TlsMaterialManager {
    store: Arc<dyn MaterialStore>,
    threshold: chrono::Duration,
    retiring: Mutex<Vec<TlsMaterialRef>>,
}

impl TlsMaterialManager {
    pub fn new(store: Arc<dyn MaterialStore>, threshold: chrono::Duration) -> Self {
        Self {
            store,
            threshold,
            retiring: Mutex::new(Vec::new()),
        }
    }

    pub fn threshold(&self) -> chrono::Duration {
        self.threshold
    }

    /// Current material behind `secret_name`
    pub async fn load_ref(&self, secret_name: &str, mutual_required: bool) -> Result<TlsMaterialRef> {
        let material = self.store.load(secret_name).await?;
        TlsMaterialRef::from_material(secret_name, &material, mutual_required)
    }

    /// Return a ref that is safe to bind new routes to
    ///
    /// Refs with at least `threshold` validity left are returned unchanged.
    /// Otherwise rotation is requested and the re-issued ref returned, with
    /// the old one kept as retiring. If the issuer has not produced new
    /// material yet, a still-valid old ref is returned; an expired one fails
    /// with `MaterialExpired`.
    #[instrument(skip(self, current), fields(secret = %current.secret_name))]
    pub async fn ensure_valid(
        &self,
        current: &TlsMaterialRef,
        now: DateTime<Utc>,
    ) -> Result<TlsMaterialRef> {
        if current.remaining(now) >= self.threshold {
            return Ok(current.clone());
        }

        info!(
            "TLS material in {} expires {}, requesting rotation",
            current.secret_name,
            current.cert_expiry.to_rfc3339()
        );

        if let Err(e) = self.store.request_rotation(&current.secret_name).await {
            warn!("Rotation request for {} failed: {}", current.secret_name, e);
        }

        match self
            .load_ref(&current.secret_name, current.mutual_required)
            .await
        {
            Ok(fresh) if fresh != *current && !fresh.is_expired(now) => {
                self.retire(current.clone());
                info!(
                    "Rotated TLS material in {}: new expiry {}",
                    fresh.secret_name,
                    fresh.cert_expiry.to_rfc3339()
                );
                Ok(fresh)
            }
            Ok(_) | Err(_) if !current.is_expired(now) => {
                warn!(
                    "Rotation of {} still pending; keeping current material until {}",
                    current.secret_name,
                    current.cert_expiry.to_rfc3339()
                );
                Ok(current.clone())
            }
            _ => Err(Error::MaterialExpired {
                secret_name: current.secret_name.clone(),
                expired_at: current.cert_expiry,
            }),
        }
    }

    fn retire(&self, old: TlsMaterialRef) {
        if let Ok(mut retiring) = self.retiring.lock() {
            if !retiring.contains(&old) {
                retiring.push(old);
            }
        }
    }

    /// Refs replaced by rotation but possibly still served
    pub fn retiring(&self) -> Vec<TlsMaterialRef> {
        self.retiring.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Drop retiring refs that no Active route references
    ///
    /// Returns the released refs.
    pub fn release_unreferenced(&self, active: &[TlsMaterialRef]) -> Vec<TlsMaterialRef> {
        let Ok(mut retiring) = self.retiring.lock() else {
            return Vec::new();
        };
        let (keep, released): (Vec<_>, Vec<_>) =
            retiring.drain(..).partition(|r| active.contains(r));
        *retiring = keep;
        released
    }
}
