//! Snapshot reader with retry and last-known-good fallback

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use super::{read_with_timeout, TopologySnapshot, TopologySource};
use crate::error::{Error, Result};
use crate::retry::RetryConfig;

#[derive(Clone, Debug)]
pub struct SnapshotReaderConfig {
    /// Bound on a single read of the state store
    pub read_timeout: Duration,
    /// Retries within one snapshot request
    pub retry: RetryConfig,
    /// Consecutive failed reads after which the last-known-good snapshot is served
    pub failure_ceiling: u32,
}

impl Default for SnapshotReaderConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            failure_ceiling: 5,
        }
    }
}

/// Reads fresh topology snapshots, degrading to the last good one on repeated failure
pub struct SnapshotReader {
    source: Arc<dyn TopologySource>,
    config: SnapshotReaderConfig,
    last_good: Mutex<Option<TopologySnapshot>>,
    consecutive_failures: AtomicU32,
}

impl SnapshotReader {
    pub fn new(source: Arc<dyn TopologySource>, config: SnapshotReaderConfig) -> Self {
        Self {
            source,
            config,
            last_good: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Take a snapshot for one reconciliation pass
    ///
    /// Returns a fresh snapshot when the source answers. After
    /// `failure_ceiling` consecutive failures the last-known-good snapshot is
    /// returned with `degraded` set; without one, `SourceUnavailable`.
    pub async fn snapshot(&self) -> Result<TopologySnapshot> {
        let attempts = self.config.retry.max_attempts.max(1);
        let mut last_err = None;

        for attempt in 0..attempts {
            match read_with_timeout(self.source.as_ref(), self.config.read_timeout).await {
                Ok(snapshot) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    if let Ok(mut guard) = self.last_good.lock() {
                        *guard = Some(snapshot.clone());
                    }
                    debug!(
                        "Topology snapshot with {} nodes ({} ready)",
                        snapshot.nodes.len(),
                        snapshot.ready_count()
                    );
                    return Ok(snapshot);
                }
                Err(e) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        attempt = attempt + 1,
                        failures,
                        error = %e,
                        "Topology read failed"
                    );

                    if failures >= self.config.failure_ceiling {
                        if let Some(snapshot) = self.last_known_good() {
                            warn!(
                                "Serving last-known-good topology from {} after {} failures",
                                snapshot.observed_at.to_rfc3339(),
                                failures
                            );
                            return Ok(TopologySnapshot {
                                degraded: true,
                                ..snapshot
                            });
                        }
                    }
                    last_err = Some(e);
                }
            }

            if attempt + 1 < attempts {
                tokio::time::sleep(self.config.retry.jittered_delay_for(attempt)).await;
            }
        }

        Err(last_err.unwrap_or_else(|| Error::SourceUnavailable {
            reason: "no read attempted".to_string(),
        }))
    }

    fn last_known_good(&self) -> Option<TopologySnapshot> {
        self.last_good.lock().ok().and_then(|g| g.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{NodeIdentity, ReadyState};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use uuid::Uuid;

    struct FlakySource {
        healthy: AtomicBool,
        reads: AtomicU32,
    }

    #[async_trait]
    impl TopologySource for FlakySource {
        async fn read(&self) -> Result<Vec<NodeIdentity>> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            if self.healthy.load(Ordering::Relaxed) {
                Ok(vec![NodeIdentity {
                    host_id: Uuid::from_u128(1),
                    pod_name: "demo-dc1-r1-sts-0".to_string(),
                    pod_ip: "10.42.0.29".to_string(),
                    host_address: None,
                    rack: "r1".to_string(),
                    datacenter: "dc1".to_string(),
                    ready_state: ReadyState::Ready,
                }])
            } else {
                Err(Error::SourceUnavailable {
                    reason: "apiserver unreachable".to_string(),
                })
            }
        }
    }

    struct HangingSource;

    #[async_trait]
    impl TopologySource for HangingSource {
        async fn read(&self) -> Result<Vec<NodeIdentity>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![])
        }
    }

    fn fast_config(failure_ceiling: u32) -> SnapshotReaderConfig {
        SnapshotReaderConfig {
            read_timeout: Duration::from_millis(50),
            retry: RetryConfig {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            failure_ceiling,
        }
    }

    #[tokio::test]
    async fn test_fresh_snapshot_resets_failures() {
        let source = Arc::new(FlakySource {
            healthy: AtomicBool::new(true),
            reads: AtomicU32::new(0),
        });
        let reader = SnapshotReader::new(source, fast_config(3));

        let snapshot = reader.snapshot().await.unwrap();
        assert_eq!(snapshot.nodes.len(), 1);
        assert!(!snapshot.degraded);
        assert_eq!(reader.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_without_last_good() {
        let source = Arc::new(FlakySource {
            healthy: AtomicBool::new(false),
            reads: AtomicU32::new(0),
        });
        let reader = SnapshotReader::new(source.clone(), fast_config(1));

        let err = reader.snapshot().await.unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
        assert_eq!(source.reads.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_degrades_to_last_known_good_after_ceiling() {
        let source = Arc::new(FlakySource {
            healthy: AtomicBool::new(true),
            reads: AtomicU32::new(0),
        });
        let reader = SnapshotReader::new(source.clone(), fast_config(3));
        reader.snapshot().await.unwrap();

        source.healthy.store(false, Ordering::Relaxed);

        // 2 failures, still below the ceiling
        assert!(reader.snapshot().await.is_err());

        // third failure crosses the ceiling
        let snapshot = reader.snapshot().await.unwrap();
        assert!(snapshot.degraded);
        assert_eq!(snapshot.nodes.len(), 1);

        source.healthy.store(true, Ordering::Relaxed);
        let snapshot = reader.snapshot().await.unwrap();
        assert!(!snapshot.degraded);
    }

    #[tokio::test]
    async fn test_read_timeout_is_source_unavailable() {
        let reader = SnapshotReader::new(Arc::new(HangingSource), fast_config(10));
        let err = reader.snapshot().await.unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
        assert_eq!(reader.consecutive_failures(), 2);
    }
}
