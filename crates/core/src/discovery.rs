use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::Result;
use crate::types::{EngineId, EngineInfo};

/// Member label carrying the stable engine id; the member name is the
/// fallback.
pub const ENGINE_ID_LABEL: &str = "engine-id";
/// Member annotation carrying the engine port.
pub const PORT_ANNOTATION: &str = "port";
/// Member annotation carrying the engine capacity.
pub const CAPACITY_ANNOTATION: &str = "capacity";

pub const DEFAULT_ENGINE_PORT: u16 = 50051;
pub const DEFAULT_ENGINE_CAPACITY: usize = 10;

/// Callback receiving the entire current set of healthy engines.
pub type ChangeHandler = Box<dyn Fn(Vec<EngineInfo>) + Send + Sync>;

/// Produces a live set of reachable engines from a cluster membership
/// source.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Run until `shutdown`. Fires `on_change` once immediately with the
    /// current snapshot, then again with the full set (not deltas) on every
    /// membership change. Invocations are serialized, never concurrent.
    async fn watch(&self, on_change: ChangeHandler) -> Result<()>;

    fn shutdown(&self);
}

/// One record from the cluster membership backend, already reduced to the
/// fields discovery consumes.
#[derive(Debug, Clone)]
pub struct MemberRecord {
    pub name: String,
    pub address: String,
    /// Only running members are surfaced as engines.
    pub running: bool,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
}

/// Map membership records onto engine descriptors.
///
/// Members that are not running or have no address yet are skipped; port
/// and capacity fall back to their defaults when the annotations are
/// missing or unparsable.
pub fn engines_from_members(members: Vec<MemberRecord>) -> Vec<EngineInfo> {
    let mut engines = Vec::with_capacity(members.len());

    for member in members {
        if !member.running || member.address.is_empty() {
            continue;
        }

        let engine_id = member
            .labels
            .get(ENGINE_ID_LABEL)
            .cloned()
            .unwrap_or_else(|| member.name.clone());

        let port = member
            .annotations
            .get(PORT_ANNOTATION)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_ENGINE_PORT);

        let capacity = member
            .annotations
            .get(CAPACITY_ANNOTATION)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_ENGINE_CAPACITY);

        let metadata: HashMap<String, String> = member
            .labels
            .iter()
            .filter(|(k, _)| k.as_str() != "app" && k.as_str() != ENGINE_ID_LABEL)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        engines.push(EngineInfo {
            engine_id: EngineId::new(engine_id),
            address: member.address,
            port,
            capacity,
            metadata,
            last_seen: Utc::now(),
        });
    }

    engines
}

fn same_membership(a: &[EngineInfo], b: &[EngineInfo]) -> bool {
    fn keys(engines: &[EngineInfo]) -> Vec<(EngineId, String, u16, usize)> {
        let mut keys: Vec<_> = engines
            .iter()
            .map(|e| (e.engine_id.clone(), e.address.clone(), e.port, e.capacity))
            .collect();
        keys.sort();
        keys
    }
    keys(a) == keys(b)
}

/// Discovery over an in-memory engine set, updated by pushes.
/// Wires up single-process deployments and tests.
pub struct StaticDiscovery {
    engines: Mutex<Vec<EngineInfo>>,
    generation: watch::Sender<u64>,
    stop: watch::Sender<bool>,
}

impl StaticDiscovery {
    pub fn new(initial: Vec<EngineInfo>) -> Self {
        let (generation, _) = watch::channel(0);
        let (stop, _) = watch::channel(false);
        Self {
            engines: Mutex::new(initial),
            generation,
            stop,
        }
    }

    /// Replace the engine set and notify watchers.
    pub fn update(&self, engines: Vec<EngineInfo>) {
        *self.engines.lock().unwrap() = engines;
        self.generation.send_modify(|generation| *generation += 1);
    }

    fn snapshot(&self) -> Vec<EngineInfo> {
        self.engines.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn watch(&self, on_change: ChangeHandler) -> Result<()> {
        let mut generation = self.generation.subscribe();
        let mut stop = self.stop.subscribe();

        on_change(self.snapshot());

        loop {
            tokio::select! {
                changed = generation.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    on_change(self.snapshot());
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn shutdown(&self) {
        self.stop.send_replace(true);
    }
}

/// Lists members from a cluster membership backend.
///
/// The backend itself (its client, namespace and selector scoping) lives
/// outside the core; this is the seam it implements.
#[async_trait]
pub trait MembershipSource: Send + Sync {
    async fn list_members(&self) -> anyhow::Result<Vec<MemberRecord>>;
}

/// Polling discovery over a membership source; the fallback for backends
/// without a native watch.
///
/// Transient source errors are logged and the previous snapshot remains in
/// force until the next successful poll.
pub struct MembershipDiscovery<S> {
    source: S,
    refresh: Duration,
    stop: watch::Sender<bool>,
}

impl<S: MembershipSource> MembershipDiscovery<S> {
    pub fn new(source: S, refresh: Duration) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            source,
            refresh,
            stop,
        }
    }
}

#[async_trait]
impl<S: MembershipSource> ServiceDiscovery for MembershipDiscovery<S> {
    async fn watch(&self, on_change: ChangeHandler) -> Result<()> {
        let mut stop = self.stop.subscribe();
        let mut previous: Option<Vec<EngineInfo>> = None;
        let mut ticker = tokio::time::interval(self.refresh);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.source.list_members().await {
                        Ok(members) => {
                            let engines = engines_from_members(members);
                            let changed = previous
                                .as_ref()
                                .map(|p| !same_membership(p, &engines))
                                .unwrap_or(true);
                            if changed {
                                on_change(engines.clone());
                                previous = Some(engines);
                            }
                        }
                        Err(err) => {
                            tracing::warn!(
                                "membership refresh failed, keeping previous snapshot: {}",
                                err
                            );
                        }
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn shutdown(&self) {
        self.stop.send_replace(true);
    }
}
