//! Identity data that outlives a single connection.
//!
//! Keyed by session id (the charge point's path). Sessions seed their cache
//! from here at construction and write back every cacheable payload they
//! see, so a reconnecting device that skips `BootNotification` can still have
//! one replayed on its behalf.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::RwLock;

use crate::ocpp::Action;

struct Entry {
    payloads: HashMap<Action, Value>,
    updated: Instant,
}

/// Shared deviceId → cached payloads store with expiry.
#[derive(Clone)]
pub struct IdentityStore {
    inner: Arc<RwLock<HashMap<String, Entry>>>,
    ttl: Duration,
}

impl IdentityStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Cached payloads for a device, dropping the entry if it has expired.
    pub async fn load(&self, device_id: &str) -> HashMap<Action, Value> {
        let mut map = self.inner.write().await;
        match map.get(device_id) {
            Some(entry) if entry.updated.elapsed() <= self.ttl => entry.payloads.clone(),
            Some(_) => {
                map.remove(device_id);
                HashMap::new()
            }
            None => HashMap::new(),
        }
    }

    pub async fn store(&self, device_id: &str, action: Action, payload: Value) {
        let mut map = self.inner.write().await;
        let entry = map.entry(device_id.to_string()).or_insert_with(|| Entry {
            payloads: HashMap::new(),
            updated: Instant::now(),
        });
        entry.payloads.insert(action, payload);
        entry.updated = Instant::now();
    }

    /// Remove everything known about a device.
    pub async fn forget(&self, device_id: &str) -> bool {
        self.inner.write().await.remove(device_id).is_some()
    }

    /// Drop expired entries. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut map = self.inner.write().await;
        let before = map.len();
        map.retain(|_, entry| entry.updated.elapsed() <= self.ttl);
        before - map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn stores_and_forgets() {
        let store = IdentityStore::new(Duration::from_secs(60));
        store
            .store("CP1", Action::BootNotification, json!({"chargePointModel": "X"}))
            .await;
        let cached = store.load("CP1").await;
        assert_eq!(cached[&Action::BootNotification]["chargePointModel"], "X");
        assert!(store.load("CP2").await.is_empty());

        assert!(store.forget("CP1").await);
        assert!(store.load("CP1").await.is_empty());
        assert!(!store.forget("CP1").await);
    }

    #[tokio::test]
    async fn expired_entries_are_dropped() {
        let store = IdentityStore::new(Duration::ZERO);
        store.store("CP1", Action::BootNotification, json!({})).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.sweep().await, 1);
        assert!(store.load("CP1").await.is_empty());
    }
}
