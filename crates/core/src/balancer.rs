use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::error::{Result, WeftError};
use crate::types::EngineId;

/// Default number of virtual nodes per engine on the hash ring.
pub const DEFAULT_VIRTUAL_NODES: usize = 150;

/// Maps a routing key to one engine and keeps per-engine active counts.
///
/// Selection never refuses on capacity: refusal is the engine runtime's
/// job, and refusing here would starve keys that map to a full engine.
/// Callers may observe `active` to implement fallback policies.
pub trait LoadBalancer: Send + Sync {
    fn add(&self, engine_id: &EngineId, capacity: usize);

    fn remove(&self, engine_id: &EngineId);

    fn update_capacity(&self, engine_id: &EngineId, capacity: usize) -> Result<()>;

    /// Pick the engine owning `key`. `NO_ENGINE` when empty.
    fn select(&self, key: &str) -> Result<EngineId>;

    fn incr(&self, engine_id: &EngineId);

    fn decr(&self, engine_id: &EngineId);

    fn active(&self, engine_id: &EngineId) -> usize;

    fn capacity(&self, engine_id: &EngineId) -> Option<usize>;

    fn engines(&self) -> Vec<EngineId>;
}

fn ring_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let bytes: [u8; 8] = digest[..8].try_into().expect("digest is 32 bytes");
    u64::from_be_bytes(bytes)
}

struct HashRingState {
    ring: BTreeMap<u64, EngineId>,
    capacities: HashMap<EngineId, usize>,
    active: HashMap<EngineId, usize>,
}

/// Consistent hashing with virtual nodes.
///
/// Each engine occupies `virtual_nodes` positions on a 64-bit ring;
/// `select` walks clockwise from the key's hash to the first occupied
/// position. Membership changes reassign only O(1/N) of the key space, so
/// a workflow id keeps routing to the same engine and its warm definition
/// cache.
pub struct ConsistentHashBalancer {
    virtual_nodes: usize,
    state: RwLock<HashRingState>,
}

impl ConsistentHashBalancer {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            state: RwLock::new(HashRingState {
                ring: BTreeMap::new(),
                capacities: HashMap::new(),
                active: HashMap::new(),
            }),
        }
    }
}

impl Default for ConsistentHashBalancer {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}

impl LoadBalancer for ConsistentHashBalancer {
    fn add(&self, engine_id: &EngineId, capacity: usize) {
        let mut state = self.state.write().unwrap();
        for i in 0..self.virtual_nodes {
            state
                .ring
                .insert(ring_hash(&format!("{}#{}", engine_id, i)), engine_id.clone());
        }
        state.capacities.insert(engine_id.clone(), capacity);
        state.active.entry(engine_id.clone()).or_insert(0);
    }

    fn remove(&self, engine_id: &EngineId) {
        let mut state = self.state.write().unwrap();
        state.ring.retain(|_, id| id != engine_id);
        state.capacities.remove(engine_id);
        state.active.remove(engine_id);
    }

    fn update_capacity(&self, engine_id: &EngineId, capacity: usize) -> Result<()> {
        let mut state = self.state.write().unwrap();
        match state.capacities.get_mut(engine_id) {
            Some(slot) => {
                *slot = capacity;
                Ok(())
            }
            None => Err(WeftError::NotFound(format!("engine {}", engine_id))),
        }
    }

    fn select(&self, key: &str) -> Result<EngineId> {
        let state = self.state.read().unwrap();
        if state.ring.is_empty() {
            return Err(WeftError::NoEngine);
        }

        let hash = ring_hash(key);
        // First virtual node clockwise from the key, wrapping at the top.
        let owner = state
            .ring
            .range(hash..)
            .next()
            .or_else(|| state.ring.iter().next())
            .map(|(_, id)| id.clone())
            .ok_or(WeftError::NoEngine)?;
        Ok(owner)
    }

    fn incr(&self, engine_id: &EngineId) {
        let mut state = self.state.write().unwrap();
        if let Some(count) = state.active.get_mut(engine_id) {
            *count += 1;
        }
    }

    fn decr(&self, engine_id: &EngineId) {
        let mut state = self.state.write().unwrap();
        if let Some(count) = state.active.get_mut(engine_id) {
            *count = count.saturating_sub(1);
        }
    }

    fn active(&self, engine_id: &EngineId) -> usize {
        self.state
            .read()
            .unwrap()
            .active
            .get(engine_id)
            .copied()
            .unwrap_or(0)
    }

    fn capacity(&self, engine_id: &EngineId) -> Option<usize> {
        self.state.read().unwrap().capacities.get(engine_id).copied()
    }

    fn engines(&self) -> Vec<EngineId> {
        self.state.read().unwrap().capacities.keys().cloned().collect()
    }
}

struct RoundRobinState {
    engines: Vec<EngineId>,
    current: usize,
    capacities: HashMap<EngineId, usize>,
    active: HashMap<EngineId, usize>,
}

/// Round-robin selection; admissible for stateless workloads.
///
/// Skips engines whose active count has reached their capacity; when every
/// engine is full, hands out the next engine anyway and lets the runtime
/// refuse.
pub struct RoundRobinBalancer {
    state: RwLock<RoundRobinState>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RoundRobinState {
                engines: Vec::new(),
                current: 0,
                capacities: HashMap::new(),
                active: HashMap::new(),
            }),
        }
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn add(&self, engine_id: &EngineId, capacity: usize) {
        let mut state = self.state.write().unwrap();
        if !state.engines.contains(engine_id) {
            state.engines.push(engine_id.clone());
        }
        state.capacities.insert(engine_id.clone(), capacity);
        state.active.entry(engine_id.clone()).or_insert(0);
    }

    fn remove(&self, engine_id: &EngineId) {
        let mut state = self.state.write().unwrap();
        state.engines.retain(|id| id != engine_id);
        state.capacities.remove(engine_id);
        state.active.remove(engine_id);
        if !state.engines.is_empty() {
            state.current %= state.engines.len();
        } else {
            state.current = 0;
        }
    }

    fn update_capacity(&self, engine_id: &EngineId, capacity: usize) -> Result<()> {
        let mut state = self.state.write().unwrap();
        match state.capacities.get_mut(engine_id) {
            Some(slot) => {
                *slot = capacity;
                Ok(())
            }
            None => Err(WeftError::NotFound(format!("engine {}", engine_id))),
        }
    }

    fn select(&self, _key: &str) -> Result<EngineId> {
        let mut state = self.state.write().unwrap();
        if state.engines.is_empty() {
            return Err(WeftError::NoEngine);
        }

        let len = state.engines.len();
        let mut fallback = None;
        for _ in 0..len {
            let engine_id = state.engines[state.current].clone();
            state.current = (state.current + 1) % len;

            if fallback.is_none() {
                fallback = Some(engine_id.clone());
            }
            let capacity = state.capacities.get(&engine_id).copied().unwrap_or(0);
            let active = state.active.get(&engine_id).copied().unwrap_or(0);
            if active < capacity {
                return Ok(engine_id);
            }
        }

        // Everyone is full; the engine runtime gets to refuse.
        Ok(fallback.expect("engines is non-empty"))
    }

    fn incr(&self, engine_id: &EngineId) {
        let mut state = self.state.write().unwrap();
        if let Some(count) = state.active.get_mut(engine_id) {
            *count += 1;
        }
    }

    fn decr(&self, engine_id: &EngineId) {
        let mut state = self.state.write().unwrap();
        if let Some(count) = state.active.get_mut(engine_id) {
            *count = count.saturating_sub(1);
        }
    }

    fn active(&self, engine_id: &EngineId) -> usize {
        self.state
            .read()
            .unwrap()
            .active
            .get(engine_id)
            .copied()
            .unwrap_or(0)
    }

    fn capacity(&self, engine_id: &EngineId) -> Option<usize> {
        self.state.read().unwrap().capacities.get(engine_id).copied()
    }

    fn engines(&self) -> Vec<EngineId> {
        self.state.read().unwrap().engines.clone()
    }
}
