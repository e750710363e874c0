use std::{collections::HashMap, hash::Hash, sync::Arc};

use anyhow::anyhow;
use tokio::sync::Mutex;

/// A keyed async lock with a timestamped cached result per key.
///
/// Callers take the per-key lock, check `last_ts` against their own
/// timeout, and either reuse the cached result or recompute and
/// [TimeoutCacheEntry::set] it. Waiters queued on the same key then
/// observe the fresh result without repeating the work.
#[derive(Default)]
pub struct TimeoutCache<K, V> {
  map: Mutex<HashMap<K, Arc<Mutex<TimeoutCacheEntry<V>>>>>,
}

impl<K: Clone + Eq + Hash, V: Clone> TimeoutCache<K, V> {
  pub async fn get_lock(
    &self,
    key: K,
  ) -> Arc<Mutex<TimeoutCacheEntry<V>>> {
    let mut map = self.map.lock().await;
    map.entry(key).or_default().clone()
  }

  /// Drop the entry (and cached result) for a key.
  pub async fn remove(&self, key: &K) {
    self.map.lock().await.remove(key);
  }

  /// Test hook.
  pub async fn clear(&self) {
    self.map.lock().await.clear();
  }
}

pub struct TimeoutCacheEntry<V> {
  /// When the cached result was produced, unix ms. 0 = never.
  pub last_ts: i64,
  res: Result<V, String>,
}

impl<V> Default for TimeoutCacheEntry<V> {
  fn default() -> Self {
    TimeoutCacheEntry {
      last_ts: 0,
      res: Err(String::from("no result produced yet")),
    }
  }
}

impl<V: Clone> TimeoutCacheEntry<V> {
  pub fn set(&mut self, res: &anyhow::Result<V>, ts: i64) {
    self.last_ts = ts;
    self.res = match res {
      Ok(v) => Ok(v.clone()),
      Err(e) => Err(format!("{e:#}")),
    };
  }

  pub fn clone_res(&self) -> anyhow::Result<V> {
    self.res.clone().map_err(|e| anyhow!(e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn same_key_yields_same_lock() {
    let cache = TimeoutCache::<String, u64>::default();
    let a = cache.get_lock("k".to_string()).await;
    let b = cache.get_lock("k".to_string()).await;
    assert!(Arc::ptr_eq(&a, &b));
  }

  #[tokio::test]
  async fn cached_result_round_trip() {
    let cache = TimeoutCache::<String, u64>::default();
    let lock = cache.get_lock("k".to_string()).await;
    let mut entry = lock.lock().await;
    assert!(entry.clone_res().is_err());
    entry.set(&Ok(7), 1000);
    assert_eq!(entry.last_ts, 1000);
    assert_eq!(entry.clone_res().unwrap(), 7);
  }

  #[tokio::test]
  async fn remove_resets_the_entry() {
    let cache = TimeoutCache::<String, u64>::default();
    {
      let lock = cache.get_lock("k".to_string()).await;
      lock.lock().await.set(&Ok(1), 5);
    }
    cache.remove(&"k".to_string()).await;
    let lock = cache.get_lock("k".to_string()).await;
    assert_eq!(lock.lock().await.last_ts, 0);
  }
}
