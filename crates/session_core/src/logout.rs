use std::sync::Arc;

use shared::{
    domain::{AccountIndex, SlotKey, UserId},
    protocol::LogoutStatus,
};
use tracing::{info, warn};

use crate::{
    client::{disconnect_quietly, SessionClient},
    error::{remote, CoreError},
    registry::{checked_user, slot_for, SessionRegistry},
};

/// Outcome of logging out one slot as part of a bulk logout.
#[derive(Debug)]
pub struct SlotLogout {
    pub index: AccountIndex,
    pub outcome: Result<LogoutStatus, CoreError>,
}

impl SessionRegistry {
    /// Revokes the session remotely when possible, then unconditionally
    /// deletes the Session File and every cached file of the slot.
    pub async fn logout_one(
        &self,
        user_id: &UserId,
        index: AccountIndex,
    ) -> Result<LogoutStatus, CoreError> {
        let slot = slot_for(user_id, index)?;
        let guard = self.pool.lock_slot(&slot).await;
        let result = self.logout_locked(&slot).await;
        drop(guard);
        self.pool.prune_lock(&slot).await;
        result
    }

    async fn logout_locked(&self, slot: &SlotKey) -> Result<LogoutStatus, CoreError> {
        let live = self
            .pool
            .take_entry(slot)
            .await
            .filter(|client| client.is_connected());
        if live.is_none() && !self.directory.slot_exists(slot).await? {
            return Ok(LogoutStatus::NotFound);
        }

        let client = match live {
            Some(client) => Some(client),
            None => match self.pool.connect_fresh(slot).await {
                Ok(client) => Some(client),
                Err(err) => {
                    warn!(slot = %slot, error = %err, "could not reconnect for remote logout");
                    None
                }
            },
        };
        let revoked = match client {
            Some(client) => self.revoke(slot, client).await,
            None => false,
        };

        self.remove_local_state(slot).await?;
        let status = if revoked {
            LogoutStatus::LoggedOut
        } else {
            LogoutStatus::FileRemovedOnly
        };
        info!(slot = %slot, status = ?status, "account logged out");
        Ok(status)
    }

    async fn revoke(&self, slot: &SlotKey, client: Arc<dyn SessionClient>) -> bool {
        let revoked = match remote("log_out", self.config.request_timeout, client.log_out()).await {
            Ok(()) => true,
            Err(err) => {
                warn!(slot = %slot, error = %err, "remote logout failed");
                false
            }
        };
        disconnect_quietly(client.as_ref()).await;
        revoked
    }

    /// Logs out every slot of `user_id` independently. One slot failing does
    /// not stop or roll back the others.
    pub async fn logout_all(&self, user_id: &UserId) -> Result<Vec<SlotLogout>, CoreError> {
        let user_id = checked_user(user_id)?;
        let slots = self.directory.list_slots(user_id).await?;
        let logouts = slots.into_iter().map(|index| async move {
            let outcome = match self.fanout_permit().await {
                Ok(_permit) => self.logout_one(user_id, index).await,
                Err(err) => Err(err),
            };
            SlotLogout { index, outcome }
        });
        Ok(futures::future::join_all(logouts).await)
    }

    /// Deletes a slot's Session File and cache subtree without contacting the
    /// remote side. Idempotent.
    pub async fn remove_slot(&self, user_id: &UserId, index: AccountIndex) -> Result<(), CoreError> {
        let slot = slot_for(user_id, index)?;
        self.evict_slot(&slot).await
    }

    /// Local-only teardown for a slot whose session was revoked upstream.
    /// Idempotent.
    pub async fn evict_slot(&self, slot: &SlotKey) -> Result<(), CoreError> {
        let guard = self.pool.lock_slot(slot).await;
        if let Some(client) = self.pool.take_entry(slot).await {
            disconnect_quietly(client.as_ref()).await;
        }
        let result = self.remove_local_state(slot).await;
        drop(guard);
        self.pool.prune_lock(slot).await;
        if result.is_ok() {
            info!(slot = %slot, "account evicted");
        }
        result
    }

    /// Deletes the Session File, then purges the cache even if that failed.
    async fn remove_local_state(&self, slot: &SlotKey) -> Result<(), CoreError> {
        let removed = self.directory.remove_session_file(slot).await;
        let purged = self.cache.purge(slot).await;
        removed?;
        purged
    }
}

#[cfg(test)]
#[path = "tests/logout_tests.rs"]
mod tests;
