use std::{collections::HashMap, sync::Arc, time::Duration};

use shared::domain::SlotKey;
use storage::AccountDirectory;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::{
    client::{disconnect_quietly, SessionClient, SessionClientFactory},
    error::{remote, CoreError},
    locks::KeyedLocks,
};

/// Connected clients keyed by account slot.
///
/// Lookup-or-create and teardown for one slot run under that slot's lock, so
/// at most one live client exists per Session File.
pub struct SessionPool {
    directory: AccountDirectory,
    factory: Arc<dyn SessionClientFactory>,
    locks: Arc<KeyedLocks<SlotKey>>,
    entries: Mutex<HashMap<SlotKey, Arc<dyn SessionClient>>>,
    connect_timeout: Duration,
}

impl SessionPool {
    pub fn new(
        directory: AccountDirectory,
        factory: Arc<dyn SessionClientFactory>,
        locks: Arc<KeyedLocks<SlotKey>>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            factory,
            locks,
            entries: Mutex::new(HashMap::new()),
            connect_timeout,
        }
    }

    /// Returns the live client for `slot`, connecting one from its Session File
    /// if none exists yet or the pooled one has dropped its transport.
    pub async fn get_or_start(&self, slot: &SlotKey) -> Result<Arc<dyn SessionClient>, CoreError> {
        let _guard = self.locks.lock(slot).await;
        let pooled = self.entries.lock().await.get(slot).cloned();
        if let Some(client) = pooled {
            if client.is_connected() {
                return Ok(client);
            }
            self.take_entry(slot).await;
            disconnect_quietly(client.as_ref()).await;
            warn!(slot = %slot, "pooled client lost its connection; reconnecting");
        }

        if !self.directory.slot_exists(slot).await? {
            return Err(CoreError::NotFound(format!("account {slot}")));
        }
        let client = self.connect_fresh(slot).await?;
        self.entries
            .lock()
            .await
            .insert(slot.clone(), Arc::clone(&client));
        info!(slot = %slot, "session client started");
        Ok(client)
    }

    /// Disconnects and forgets the client for `slot`. Returns whether one was live.
    pub async fn release(&self, slot: &SlotKey) -> bool {
        let guard = self.locks.lock(slot).await;
        let released = match self.take_entry(slot).await {
            Some(client) => {
                disconnect_quietly(client.as_ref()).await;
                debug!(slot = %slot, "session client released");
                true
            }
            None => false,
        };
        drop(guard);
        self.locks.prune(slot).await;
        released
    }

    pub async fn is_live(&self, slot: &SlotKey) -> bool {
        self.entries.lock().await.contains_key(slot)
    }

    pub async fn live_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Disconnects every live client.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.entries.lock().await.drain().collect();
        let count = drained.len();
        futures::future::join_all(drained.into_iter().map(|(slot, client)| async move {
            let _guard = self.locks.lock(&slot).await;
            disconnect_quietly(client.as_ref()).await;
        }))
        .await;
        info!(count, "session pool shut down");
    }

    pub(crate) async fn lock_slot(&self, slot: &SlotKey) -> OwnedMutexGuard<()> {
        self.locks.lock(slot).await
    }

    pub(crate) async fn prune_lock(&self, slot: &SlotKey) {
        self.locks.prune(slot).await;
    }

    /// Removes the entry without disconnecting it. Callers hold the slot lock.
    pub(crate) async fn take_entry(&self, slot: &SlotKey) -> Option<Arc<dyn SessionClient>> {
        self.entries.lock().await.remove(slot)
    }

    /// Builds and connects a client for `slot` outside the pool. Callers hold
    /// the slot lock. An unauthorized session yields `SessionInvalid`.
    pub(crate) async fn connect_fresh(
        &self,
        slot: &SlotKey,
    ) -> Result<Arc<dyn SessionClient>, CoreError> {
        let client = self
            .factory
            .build(slot, self.directory.session_file(slot)?);
        match remote("connect", self.connect_timeout, client.connect()).await {
            Ok(true) => Ok(client),
            Ok(false) => {
                disconnect_quietly(client.as_ref()).await;
                warn!(slot = %slot, "stored session is not authorized");
                Err(CoreError::SessionInvalid(format!(
                    "account {slot} is not authorized"
                )))
            }
            Err(err) => {
                disconnect_quietly(client.as_ref()).await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/pool_tests.rs"]
mod tests;
