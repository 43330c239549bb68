//! In-flight dedup markers.
//!
//! A marker is reserved before a task is published and lives for a fixed TTL.
//! Expired markers are treated as absent and pruned on the next reservation.
//! The guard covers one process only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

#[derive(Clone)]
pub struct DedupGuard {
    ttl: Duration,
    markers: Arc<Mutex<HashMap<String, Instant>>>,
}

impl DedupGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            markers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.markers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Reserve `key`. Returns false when a live marker already holds it.
    pub fn try_reserve(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut markers = self.lock();
        markers.retain(|_, expires| *expires > now);
        if markers.contains_key(key) {
            debug!(subsystem = "bus", component = "dedup", key, "Key already reserved");
            return false;
        }
        markers.insert(key.to_string(), now + self.ttl);
        true
    }

    /// Drop the marker for `key`, if any.
    pub fn release(&self, key: &str) {
        if self.lock().remove(key).is_some() {
            debug!(subsystem = "bus", component = "dedup", key, "Key released");
        }
    }

    pub fn is_reserved(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock().get(key).is_some_and(|expires| *expires > now)
    }

    /// Live markers.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|e| **e > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
