// src/core/storage/keyspace.rs

//! The keyspace holds every string key this server knows about. Per the
//! single-mutex-per-resource discipline, it is guarded by one lock; no other
//! lock is ever held across an await point while this one is held.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::Mutex;

/// A value record: the string payload plus an optional absolute expiry
/// instant in milliseconds since the Unix epoch.
#[derive(Debug, Clone)]
pub struct StoredValue {
    pub value: Bytes,
    pub expires_at_ms: Option<u64>,
}

impl StoredValue {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expires_at_ms, Some(exp) if now_ms >= exp)
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as u64
}

#[derive(Debug, Default)]
pub struct Keyspace {
    entries: Mutex<HashMap<Bytes, StoredValue>>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, key: Bytes, value: Bytes, expires_at_ms: Option<u64>) {
        let mut guard = self.entries.lock().await;
        guard.insert(
            key,
            StoredValue {
                value,
                expires_at_ms,
            },
        );
    }

    /// Looks up a key, lazily evicting it if its expiry has passed.
    pub async fn get(&self, key: &Bytes) -> Option<Bytes> {
        let mut guard = self.entries.lock().await;
        let now = now_ms();
        match guard.get(key) {
            Some(v) if v.is_expired(now) => {
                guard.remove(key);
                None
            }
            Some(v) => Some(v.value.clone()),
            None => None,
        }
    }

    /// Every non-expired key, filtering out expired ones as a side effect.
    pub async fn keys(&self) -> Vec<Bytes> {
        let mut guard = self.entries.lock().await;
        let now = now_ms();
        let expired: Vec<Bytes> = guard
            .iter()
            .filter(|(_, v)| v.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            guard.remove(key);
        }
        guard.keys().cloned().collect()
    }

    pub async fn delete(&self, key: &Bytes) -> bool {
        let mut guard = self.entries.lock().await;
        guard.remove(key).is_some()
    }

    /// A point-in-time copy of every non-expired entry, for RDB encoding.
    pub async fn snapshot(&self) -> Vec<(Bytes, StoredValue)> {
        let guard = self.entries.lock().await;
        let now = now_ms();
        guard
            .iter()
            .filter(|(_, v)| !v.is_expired(now))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Replaces the entire keyspace with a freshly loaded snapshot.
    pub async fn load(&self, entries: Vec<(Bytes, StoredValue)>) {
        let mut guard = self.entries.lock().await;
        guard.clear();
        for (key, value) in entries {
            guard.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_returns_the_value() {
        let ks = Keyspace::new();
        ks.set(Bytes::from_static(b"k"), Bytes::from_static(b"v"), None)
            .await;
        assert_eq!(ks.get(&Bytes::from_static(b"k")).await, Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn expired_key_reads_as_missing() {
        let ks = Keyspace::new();
        ks.set(Bytes::from_static(b"k"), Bytes::from_static(b"v"), Some(0))
            .await;
        assert_eq!(ks.get(&Bytes::from_static(b"k")).await, None);
    }

    #[tokio::test]
    async fn keys_filters_out_expired_entries() {
        let ks = Keyspace::new();
        ks.set(Bytes::from_static(b"a"), Bytes::from_static(b"1"), None)
            .await;
        ks.set(Bytes::from_static(b"b"), Bytes::from_static(b"2"), Some(0))
            .await;
        let mut keys = ks.keys().await;
        keys.sort();
        assert_eq!(keys, vec![Bytes::from_static(b"a")]);
    }

    #[tokio::test]
    async fn delete_reports_whether_key_was_present() {
        let ks = Keyspace::new();
        ks.set(Bytes::from_static(b"k"), Bytes::from_static(b"v"), None)
            .await;
        assert!(ks.delete(&Bytes::from_static(b"k")).await);
        assert!(!ks.delete(&Bytes::from_static(b"k")).await);
    }
}
