use std::{collections::HashMap, hash::Hash, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lazily created async mutexes, one per key.
///
/// Entries are only dropped by [`KeyedLocks::prune`], and only when no task
/// holds or waits on them.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }

    pub async fn prune(&self, key: &K) {
        let mut locks = self.locks.lock().await;
        if locks
            .get(key)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(key);
        }
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_serializes_and_distinct_keys_do_not() {
        let locks = Arc::new(KeyedLocks::<u32>::new());
        let held = locks.lock(&1).await;

        let other = tokio::time::timeout(Duration::from_millis(50), locks.lock(&2)).await;
        assert!(other.is_ok());

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock(&1).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(held);
        contender.await.expect("contender");
    }

    #[tokio::test]
    async fn prune_keeps_entries_that_are_in_use() {
        let locks = KeyedLocks::<&'static str>::new();
        let guard = locks.lock(&"a").await;
        locks.prune(&"a").await;
        assert_eq!(locks.len().await, 1);

        drop(guard);
        locks.prune(&"a").await;
        assert_eq!(locks.len().await, 0);
    }
}
