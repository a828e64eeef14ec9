//! Connection Pool: capacity-bounded map of live outbound
//! connections plus a time-bounded blacklist.
//!
//! All state lives behind a single `std::sync::Mutex` critical section.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::device::{ConnectionEntry, DeviceInfo, Priority};

/// Read-only point-in-time view surfaced to the front-end; never used
/// internally for control flow.
#[derive(Debug, Clone)]
pub struct ConnectionSummary {
    pub address: String,
    pub priority: Priority,
    pub health_score: f32,
    pub messages_sent: u64,
    pub messages_received: u64,
}

struct Inner {
    connections: HashMap<String, ConnectionEntry>,
    blacklist: HashMap<String, Instant>,
}

pub struct ConnectionPool {
    config: std::sync::Arc<Config>,
    inner: Mutex<Inner>,
    on_health_changed: Mutex<Option<Box<dyn Fn(&str, f32) + Send + Sync>>>,
}

impl ConnectionPool {
    pub fn new(config: std::sync::Arc<Config>) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner { connections: HashMap::new(), blacklist: HashMap::new() }),
            on_health_changed: Mutex::new(None),
        }
    }

    pub fn set_on_health_changed(&self, f: impl Fn(&str, f32) + Send + Sync + 'static) {
        *self.on_health_changed.lock().expect("pool callback mutex poisoned") = Some(Box::new(f));
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().expect("pool mutex poisoned").connections.len()
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.inner.lock().expect("pool mutex poisoned").connections.contains_key(address)
    }

    pub fn connected_addresses(&self) -> Vec<String> {
        self.inner.lock().expect("pool mutex poisoned").connections.keys().cloned().collect()
    }

    /// `add(address, device, priority)`
    pub fn add(&self, address: &str, device: DeviceInfo, priority: Priority, now: Instant) -> Result<(), PoolError> {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");

        if let Some(&unblock_time) = inner.blacklist.get(address) {
            if now < unblock_time {
                return Err(PoolError::Blacklisted);
            }
            inner.blacklist.remove(address);
        }

        if inner.connections.contains_key(address) {
            return Ok(());
        }

        if inner.connections.len() >= self.config.max_concurrent_connections {
            let evicted = evict(&mut inner.connections, priority, now);
            if !evicted {
                return Err(PoolError::Full);
            }
        }

        inner.connections.insert(address.to_string(), ConnectionEntry::new(device, priority, now));
        Ok(())
    }

    /// `remove(address, blacklist?)`
    pub fn remove(&self, address: &str, blacklist: bool, now: Instant) {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        inner.connections.remove(address);
        if blacklist {
            inner.blacklist.insert(address.to_string(), now + self.config.connection_blacklist_duration);
        }
    }

    pub fn with_entry_mut<R>(&self, address: &str, f: impl FnOnce(&mut ConnectionEntry) -> R) -> Option<R> {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        inner.connections.get_mut(address).map(f)
    }

    /// Maintenance pass (run every 30s by the Supervisor):
    /// expire blacklist entries, emit `on_health_changed` for any entry
    /// below `HEALTH_SCORE_CRITICAL`.
    pub fn run_maintenance(&self, now: Instant) {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        inner.blacklist.retain(|_, &mut unblock_time| unblock_time > now);

        let critical = self.config.health_score_critical;
        let unhealthy: Vec<(String, f32)> = inner
            .connections
            .iter()
            .map(|(addr, entry)| (addr.clone(), entry.health_score(now)))
            .filter(|(_, score)| *score < critical)
            .collect();
        drop(inner);

        if let Some(cb) = self.on_health_changed.lock().expect("pool callback mutex poisoned").as_ref() {
            for (addr, score) in unhealthy {
                cb(&addr, score);
            }
        }
    }

    pub fn snapshot(&self, now: Instant) -> Vec<ConnectionSummary> {
        self.inner
            .lock()
            .expect("pool mutex poisoned")
            .connections
            .iter()
            .map(|(addr, entry)| ConnectionSummary {
                address: addr.clone(),
                priority: entry.priority,
                health_score: entry.health_score(now),
                messages_sent: entry.messages_sent,
                messages_received: entry.messages_received,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    Blacklisted,
    Full,
}

/// Evict the worst same-or-lower-priority entry. Candidates are
/// entries whose priority is no more important than the incoming
/// connection's (`priority <= new_priority`, since `Priority`'s `Ord` puts
/// `High` above `Normal` above `Low`), sorted by (priority ascending —
/// least important first — then health ascending), worst evicted first.
/// Returns whether an eviction happened.
fn evict(connections: &mut HashMap<String, ConnectionEntry>, new_priority: Priority, now: Instant) -> bool {
    let mut candidates: Vec<(String, Priority, f32)> = connections
        .iter()
        .filter(|(_, e)| e.priority <= new_priority)
        .map(|(addr, e)| (addr.clone(), e.priority, e.health_score(now)))
        .collect();

    if candidates.is_empty() {
        return false;
    }

    candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal)));
    let (victim, _, _) = &candidates[0];
    connections.remove(victim);
    true
}
