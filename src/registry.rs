// src/registry.rs

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Fixed-TTL map. Every insert schedules a sleeper task that silently drops
/// the entry once its lifetime elapses; a consumer that races the sleeper
/// wins. Absence is the only failure signal.
#[derive(Debug)]
pub struct TtlRegistry<K, V> {
    entries: Arc<Mutex<HashMap<K, V>>>,
    ttl: Duration,
}

impl<K, V> Clone for TtlRegistry<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            ttl: self.ttl,
        }
    }
}

impl<K, V> TtlRegistry<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn insert(&self, key: K, value: V) {
        self.entries.lock().await.insert(key.clone(), value);
        let entries = Arc::clone(&self.entries);
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            entries.lock().await.remove(&key);
        });
    }

    /// Atomic lookup-and-delete. The single-use guarantee for tickets rests
    /// on this being one critical section.
    pub async fn take_if_present(&self, key: &K) -> Option<V> {
        self.entries.lock().await.remove(key)
    }

    pub async fn contains(&self, key: &K) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
