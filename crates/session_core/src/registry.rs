use std::sync::Arc;

use shared::domain::{AccountIndex, SlotKey, UserId};
use storage::{AccountDirectory, MediaLayout};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{info, warn};

use crate::{
    client::SessionClientFactory,
    config::CoreConfig,
    error::CoreError,
    handshake::HandshakeTable,
    locks::KeyedLocks,
    media_cache::MediaCache,
    pool::SessionPool,
};

/// Process-wide owner of every account slot: the directory on disk, the
/// live client pool, pending login handshakes and the media cache.
///
/// Operations are grouped by concern in `handshake`, `directory_reader`,
/// `message_reader` and `logout`.
pub struct SessionRegistry {
    pub(crate) config: CoreConfig,
    pub(crate) directory: AccountDirectory,
    pub(crate) factory: Arc<dyn SessionClientFactory>,
    pub(crate) pool: SessionPool,
    pub(crate) cache: MediaCache,
    pub(crate) handshakes: HandshakeTable,
    fanout: Semaphore,
}

impl SessionRegistry {
    pub fn new(config: CoreConfig, factory: Arc<dyn SessionClientFactory>) -> Arc<Self> {
        let directory = AccountDirectory::new(&config.sessions_root);
        let layout = MediaLayout::new(&config.media_root, config.public_media_prefix.clone());
        let slot_locks = Arc::new(KeyedLocks::new());
        let pool = SessionPool::new(
            directory.clone(),
            Arc::clone(&factory),
            Arc::clone(&slot_locks),
            config.connect_timeout,
        );
        let cache = MediaCache::new(layout, slot_locks, config.download_timeout);
        let handshakes = HandshakeTable::new(config.handshake_key_policy, config.handshake_ttl);
        let fanout = Semaphore::new(config.max_concurrent_connections.max(1));
        info!(
            sessions_root = %config.sessions_root.display(),
            media_root = %config.media_root.display(),
            "session registry ready"
        );
        Arc::new(Self {
            config,
            directory,
            factory,
            pool,
            cache,
            handshakes,
            fanout,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn directory(&self) -> &AccountDirectory {
        &self.directory
    }

    pub fn media_layout(&self) -> &MediaLayout {
        self.cache.layout()
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub async fn list_slots(&self, user_id: &UserId) -> Result<Vec<AccountIndex>, CoreError> {
        let user_id = checked_user(user_id)?;
        Ok(self.directory.list_slots(user_id).await?)
    }

    /// Cancels pending handshakes and disconnects every live client.
    pub async fn shutdown(&self) {
        self.fanout.close();
        let cancelled = self.cancel_all_handshakes().await;
        self.pool.shutdown().await;
        info!(cancelled_handshakes = cancelled, "session registry shut down");
    }

    pub(crate) async fn fanout_permit(&self) -> Result<SemaphorePermit<'_>, CoreError> {
        self.fanout
            .acquire()
            .await
            .map_err(|_| CoreError::Remote("session registry is shutting down".into()))
    }

    pub(crate) async fn evict_on_invalid<T>(
        &self,
        slot: &SlotKey,
        result: Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        if let Err(err) = &result {
            if err.is_session_invalid() {
                if let Err(evict_err) = self.evict_slot(slot).await {
                    warn!(slot = %slot, error = %evict_err, "eviction failed");
                }
            }
        }
        result
    }
}

pub(crate) fn checked_user(user_id: &UserId) -> Result<&UserId, CoreError> {
    if user_id.is_path_safe() {
        Ok(user_id)
    } else {
        Err(CoreError::Validation(format!(
            "user id '{user_id}' is not a valid identifier"
        )))
    }
}

pub(crate) fn slot_for(user_id: &UserId, index: AccountIndex) -> Result<SlotKey, CoreError> {
    if index.0 == 0 {
        return Err(CoreError::Validation("account index starts at 1".into()));
    }
    Ok(SlotKey::new(checked_user(user_id)?.clone(), index))
}
