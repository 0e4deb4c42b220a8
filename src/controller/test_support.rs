//! In-memory fakes for controller tests

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::applier::{ApplierConfig, DatacenterLocks, RouteApplier, RouteSink};
use crate::error::{Error, Result};
use crate::retry::RetryConfig;
use crate::tls::{MaterialStore, TlsMaterial};
use crate::topology::{NodeIdentity, ReadyState, TopologySource};
use crate::translator::RouteObject;

pub fn node(n: u128, rack: &str, state: ReadyState) -> NodeIdentity {
    NodeIdentity {
        host_id: Uuid::from_u128(n),
        pod_name: format!("demo-dc1-{rack}-sts-{n}"),
        pod_ip: format!("10.42.0.{n}"),
        host_address: Some(format!("192.168.1.{n}")),
        rack: rack.to_string(),
        datacenter: "dc1".to_string(),
        ready_state: state,
    }
}

pub struct StaticTopology {
    pub nodes: Mutex<Vec<NodeIdentity>>,
    /// Reads fail while set
    pub unavailable: AtomicBool,
}

impl StaticTopology {
    pub fn new(nodes: Vec<NodeIdentity>) -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(nodes),
            unavailable: AtomicBool::new(false),
        })
    }

    pub fn set(&self, nodes: Vec<NodeIdentity>) {
        *self.nodes.lock().unwrap() = nodes;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }
}

#[async_trait]
impl TopologySource for StaticTopology {
    async fn read(&self) -> Result<Vec<NodeIdentity>> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(Error::SourceUnavailable {
                reason: "state store unreachable".to_string(),
            });
        }
        Ok(self.nodes.lock().unwrap().clone())
    }
}

/// Secret store keyed by secret name; rotation swaps in a queued replacement
#[derive(Default)]
pub struct MemoryStore {
    pub secrets: Mutex<HashMap<String, TlsMaterial>>,
    pub replacements: Mutex<HashMap<String, TlsMaterial>>,
    pub rotation_requests: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn with_secret(name: &str, material: TlsMaterial) -> Arc<Self> {
        let store = Self::default();
        store
            .secrets
            .lock()
            .unwrap()
            .insert(name.to_string(), material);
        Arc::new(store)
    }

    pub fn queue_replacement(&self, name: &str, material: TlsMaterial) {
        self.replacements
            .lock()
            .unwrap()
            .insert(name.to_string(), material);
    }
}

#[async_trait]
impl MaterialStore for MemoryStore {
    async fn load(&self, secret_name: &str) -> Result<TlsMaterial> {
        self.secrets
            .lock()
            .unwrap()
            .get(secret_name)
            .cloned()
            .ok_or_else(|| Error::ConfigError(format!("secret {secret_name} not found")))
    }

    async fn request_rotation(&self, secret_name: &str) -> Result<()> {
        self.rotation_requests
            .lock()
            .unwrap()
            .push(secret_name.to_string());
        if let Some(next) = self.replacements.lock().unwrap().remove(secret_name) {
            self.secrets
                .lock()
                .unwrap()
                .insert(secret_name.to_string(), next);
        }
        Ok(())
    }
}

/// Routing system kept in memory, with scripted failures
#[derive(Default)]
pub struct InMemorySink {
    pub applied: Mutex<BTreeMap<String, RouteObject>>,
    /// Every call, as `op:id`, in call order
    pub log: Mutex<Vec<String>>,
    /// Ids whose apply always fails
    pub failing_apply: Mutex<HashSet<String>>,
    /// Applies accepted but lost before taking effect, per id
    pub lost_applies: Mutex<HashMap<String, u32>>,
    /// Ids whose remove always fails
    pub failing_remove: Mutex<HashSet<String>>,
    /// Confirm calls answered `false` before an id is reported serving
    pub confirm_after: Mutex<HashMap<String, u32>>,
    /// Ids that never become serving
    pub never_confirm: Mutex<HashSet<String>>,
    /// Ids in the order they were first reported serving
    pub confirmed: Mutex<Vec<String>>,
    /// Called on every apply, before it takes effect
    pub on_apply: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl InMemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn preload(&self, routes: &[RouteObject]) {
        let mut applied = self.applied.lock().unwrap();
        for route in routes {
            applied.insert(route.id.clone(), route.clone());
        }
    }

    pub fn ops(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn applied_ids(&self) -> Vec<String> {
        self.applied.lock().unwrap().keys().cloned().collect()
    }

    fn record(&self, op: &str, id: &str) {
        self.log.lock().unwrap().push(format!("{op}:{id}"));
    }
}

#[async_trait]
impl RouteSink for InMemorySink {
    async fn apply(&self, route: &RouteObject) -> Result<()> {
        self.record("apply", &route.id);
        if let Some(hook) = self.on_apply.lock().unwrap().as_ref() {
            hook();
        }
        if self.failing_apply.lock().unwrap().contains(&route.id) {
            return Err(Error::Timeout {
                operation: "apply".to_string(),
                route_id: route.id.clone(),
            });
        }
        if let Some(n) = self.lost_applies.lock().unwrap().get_mut(&route.id) {
            if *n > 0 {
                *n -= 1;
                return Ok(());
            }
        }
        self.applied
            .lock()
            .unwrap()
            .insert(route.id.clone(), route.clone());
        Ok(())
    }

    async fn confirm(&self, id: &str) -> Result<bool> {
        if !self.applied.lock().unwrap().contains_key(id) {
            return Ok(false);
        }
        if self.never_confirm.lock().unwrap().contains(id) {
            return Ok(false);
        }
        {
            let mut remaining = self.confirm_after.lock().unwrap();
            if let Some(n) = remaining.get_mut(id) {
                if *n > 0 {
                    *n -= 1;
                    return Ok(false);
                }
            }
        }
        let mut confirmed = self.confirmed.lock().unwrap();
        if !confirmed.iter().any(|c| c == id) {
            confirmed.push(id.to_string());
        }
        Ok(true)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.record("remove", id);
        if self.failing_remove.lock().unwrap().contains(id) {
            return Err(Error::Timeout {
                operation: "remove".to_string(),
                route_id: id.to_string(),
            });
        }
        self.applied.lock().unwrap().remove(id);
        Ok(())
    }

    async fn list_applied(&self) -> Result<Vec<RouteObject>> {
        Ok(self.applied.lock().unwrap().values().cloned().collect())
    }
}

pub fn fast_applier_config() -> ApplierConfig {
    ApplierConfig {
        op_timeout: Duration::from_millis(200),
        confirm_timeout: Duration::from_millis(300),
        confirm_interval: Duration::from_millis(5),
        retry: RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
    }
}

pub fn applier(sink: Arc<InMemorySink>) -> RouteApplier {
    RouteApplier::new(sink, Arc::new(DatacenterLocks::new()), fast_applier_config())
}
