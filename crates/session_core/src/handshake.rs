use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use shared::{
    domain::{AccountIndex, SlotKey, UserId},
    protocol::{LoginStatus, StartLoginResponse, VerifyResponse},
};
use storage::AccountDirectory;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    client::{disconnect_quietly, SessionClient, SignInOutcome},
    config::HandshakeKeyPolicy,
    error::{classify, remote, with_timeout, CoreError},
    locks::KeyedLocks,
    registry::{checked_user, SessionRegistry},
};

const MIN_PHONE_DIGITS: usize = 7;
const MAX_PHONE_DIGITS: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct HandshakeKey {
    scope: Option<UserId>,
    phone: String,
}

/// A login in progress: the unauthenticated client that requested the code
/// and the slot it will be persisted into.
#[derive(Clone)]
struct Handshake {
    id: Uuid,
    user_id: UserId,
    phone: String,
    phone_code_hash: String,
    account_index: AccountIndex,
    client: Arc<dyn SessionClient>,
    requires_password: bool,
    password_attempts: u32,
    started_at: Instant,
}

impl Handshake {
    fn slot(&self) -> SlotKey {
        SlotKey::new(self.user_id.clone(), self.account_index)
    }
}

pub(crate) struct HandshakeTable {
    policy: HandshakeKeyPolicy,
    ttl: Duration,
    locks: KeyedLocks<HandshakeKey>,
    records: Mutex<HashMap<HandshakeKey, Handshake>>,
    reserved: Mutex<HashMap<UserId, BTreeSet<AccountIndex>>>,
}

impl HandshakeTable {
    pub(crate) fn new(policy: HandshakeKeyPolicy, ttl: Duration) -> Self {
        Self {
            policy,
            ttl,
            locks: KeyedLocks::new(),
            records: Mutex::new(HashMap::new()),
            reserved: Mutex::new(HashMap::new()),
        }
    }

    fn key_for(&self, user_id: &UserId, phone: &str) -> HandshakeKey {
        let scope = match self.policy {
            HandshakeKeyPolicy::PhoneOnly => None,
            HandshakeKeyPolicy::UserAndPhone => Some(user_id.clone()),
        };
        HandshakeKey {
            scope,
            phone: phone.to_string(),
        }
    }

    async fn lock(&self, key: &HandshakeKey) -> OwnedMutexGuard<()> {
        self.locks.lock(key).await
    }

    async fn unlock(&self, key: &HandshakeKey, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.locks.prune(key).await;
    }

    fn is_expired(&self, handshake: &Handshake) -> bool {
        handshake.started_at.elapsed() >= self.ttl
    }

    async fn get(&self, key: &HandshakeKey) -> Option<Handshake> {
        self.records.lock().await.get(key).cloned()
    }

    async fn insert(&self, key: HandshakeKey, handshake: Handshake) {
        self.records.lock().await.insert(key, handshake);
    }

    async fn remove(&self, key: &HandshakeKey) -> Option<Handshake> {
        self.records.lock().await.remove(key)
    }

    async fn remove_if_expired(&self, key: &HandshakeKey) -> Option<Handshake> {
        let mut records = self.records.lock().await;
        if records
            .get(key)
            .is_some_and(|handshake| self.is_expired(handshake))
        {
            records.remove(key)
        } else {
            None
        }
    }

    async fn require_password(&self, key: &HandshakeKey) {
        if let Some(handshake) = self.records.lock().await.get_mut(key) {
            handshake.requires_password = true;
        }
    }

    /// Counts one more failed password and returns the running total.
    async fn record_failed_password(&self, key: &HandshakeKey) -> u32 {
        match self.records.lock().await.get_mut(key) {
            Some(handshake) => {
                handshake.password_attempts += 1;
                handshake.password_attempts
            }
            None => u32::MAX,
        }
    }

    async fn keys(&self) -> Vec<HandshakeKey> {
        self.records.lock().await.keys().cloned().collect()
    }

    async fn drain(&self) -> Vec<Handshake> {
        self.records
            .lock()
            .await
            .drain()
            .map(|(_, handshake)| handshake)
            .collect()
    }

    async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Allocates the next slot index for `user_id`, skipping indices already
    /// promised to other pending handshakes of the same user.
    async fn reserve_index(
        &self,
        directory: &AccountDirectory,
        user_id: &UserId,
    ) -> Result<AccountIndex, CoreError> {
        let mut reserved = self.reserved.lock().await;
        let mut index = directory.allocate_next_index(user_id).await?;
        let taken = reserved.entry(user_id.clone()).or_default();
        while taken.contains(&index) {
            index = index.next();
        }
        taken.insert(index);
        Ok(index)
    }

    async fn release_index(&self, user_id: &UserId, index: AccountIndex) {
        let mut reserved = self.reserved.lock().await;
        if let Some(taken) = reserved.get_mut(user_id) {
            taken.remove(&index);
            if taken.is_empty() {
                reserved.remove(user_id);
            }
        }
    }
}

impl SessionRegistry {
    /// Requests a login code for `phone_number` and records a pending handshake
    /// bound to a freshly allocated slot. A pending handshake under the same
    /// key is superseded and its client disconnected.
    pub async fn start_login(
        &self,
        user_id: &UserId,
        phone_number: &str,
    ) -> Result<StartLoginResponse, CoreError> {
        let user_id = checked_user(user_id)?;
        let phone = normalize_phone(phone_number)?;
        let key = self.handshakes.key_for(user_id, &phone);
        let guard = self.handshakes.lock(&key).await;
        let result = self.start_login_locked(user_id, phone, key.clone()).await;
        self.handshakes.unlock(&key, guard).await;
        result
    }

    async fn start_login_locked(
        &self,
        user_id: &UserId,
        phone: String,
        key: HandshakeKey,
    ) -> Result<StartLoginResponse, CoreError> {
        if let Some(previous) = self.handshakes.remove(&key).await {
            info!(
                phone = %mask_phone(&phone),
                superseded_index = %previous.account_index,
                "superseding pending login handshake"
            );
            self.discard_handshake(previous).await;
        }

        let account_index = self
            .handshakes
            .reserve_index(&self.directory, user_id)
            .await?;
        let slot = SlotKey::new(user_id.clone(), account_index);
        let client = match self.directory.session_file(&slot) {
            Ok(session_file) => self.factory.build(&slot, session_file),
            Err(err) => {
                self.handshakes.release_index(user_id, account_index).await;
                return Err(err.into());
            }
        };

        let sent = async {
            remote("connect", self.config.connect_timeout, client.connect()).await?;
            remote(
                "send_code",
                self.config.request_timeout,
                client.send_code(&phone),
            )
            .await
        }
        .await;
        let sent = match sent {
            Ok(sent) => sent,
            Err(err) => {
                warn!(
                    slot = %slot,
                    phone = %mask_phone(&phone),
                    error = %err,
                    "login code request failed"
                );
                disconnect_quietly(client.as_ref()).await;
                self.handshakes.release_index(user_id, account_index).await;
                return Err(err);
            }
        };

        let handshake = Handshake {
            id: Uuid::new_v4(),
            user_id: user_id.clone(),
            phone: phone.clone(),
            phone_code_hash: sent.phone_code_hash,
            account_index,
            client,
            requires_password: false,
            password_attempts: 0,
            started_at: Instant::now(),
        };
        let challenge_id = handshake.id.to_string();
        self.handshakes.insert(key, handshake).await;
        info!(slot = %slot, phone = %mask_phone(&phone), "login code sent");
        Ok(StartLoginResponse {
            challenge_id,
            account_index,
        })
    }

    /// Submits the login code. A wrong code leaves the handshake pending; an
    /// expired code or any other upstream failure ends it.
    pub async fn verify_code(
        &self,
        user_id: &UserId,
        phone_number: &str,
        code: &str,
    ) -> Result<VerifyResponse, CoreError> {
        let user_id = checked_user(user_id)?;
        let phone = normalize_phone(phone_number)?;
        let code = code.trim();
        if code.is_empty() {
            return Err(CoreError::Validation("verification code is empty".into()));
        }
        let key = self.handshakes.key_for(user_id, &phone);
        let guard = self.handshakes.lock(&key).await;
        let result = self.verify_code_locked(user_id, &key, code).await;
        self.handshakes.unlock(&key, guard).await;
        result
    }

    async fn verify_code_locked(
        &self,
        user_id: &UserId,
        key: &HandshakeKey,
        code: &str,
    ) -> Result<VerifyResponse, CoreError> {
        let handshake = self.live_handshake(key, user_id).await?;
        let account_index = handshake.account_index;
        if handshake.requires_password {
            return Err(CoreError::Conflict(
                "login is waiting for the account password".into(),
            ));
        }

        let outcome = with_timeout(
            "sign_in",
            self.config.request_timeout,
            handshake
                .client
                .sign_in(&handshake.phone, &handshake.phone_code_hash, code),
        )
        .await?;
        match outcome {
            Ok(SignInOutcome::LoggedIn(_)) => {
                self.complete_login(key, handshake).await?;
                Ok(VerifyResponse {
                    status: LoginStatus::LoggedIn,
                    account_index,
                })
            }
            Ok(SignInOutcome::PasswordRequired { .. }) => {
                self.mark_password_required(key, &handshake).await;
                Ok(VerifyResponse {
                    status: LoginStatus::PasswordRequired,
                    account_index,
                })
            }
            Err(err) if err.is("SESSION_PASSWORD_NEEDED") => {
                self.mark_password_required(key, &handshake).await;
                Ok(VerifyResponse {
                    status: LoginStatus::PasswordRequired,
                    account_index,
                })
            }
            Err(err) => {
                let retry_with_new_code = err.is("PHONE_CODE_INVALID") || err.is("PHONE_CODE_EMPTY");
                let err = classify(err);
                if !retry_with_new_code && !is_transient(&err) {
                    self.abort_handshake(key).await;
                }
                Err(err)
            }
        }
    }

    /// Submits the second-factor password. After `max_password_attempts`
    /// rejections the handshake is terminated.
    pub async fn verify_password(
        &self,
        user_id: &UserId,
        phone_number: &str,
        password: &str,
    ) -> Result<VerifyResponse, CoreError> {
        let user_id = checked_user(user_id)?;
        let phone = normalize_phone(phone_number)?;
        if password.is_empty() {
            return Err(CoreError::Validation("password is empty".into()));
        }
        let key = self.handshakes.key_for(user_id, &phone);
        let guard = self.handshakes.lock(&key).await;
        let result = self.verify_password_locked(user_id, &key, password).await;
        self.handshakes.unlock(&key, guard).await;
        result
    }

    async fn verify_password_locked(
        &self,
        user_id: &UserId,
        key: &HandshakeKey,
        password: &str,
    ) -> Result<VerifyResponse, CoreError> {
        let handshake = self.live_handshake(key, user_id).await?;
        let account_index = handshake.account_index;
        if !handshake.requires_password {
            return Err(CoreError::Conflict(
                "login does not require a password".into(),
            ));
        }

        let outcome = with_timeout(
            "check_password",
            self.config.request_timeout,
            handshake.client.check_password(password),
        )
        .await?;
        match outcome {
            Ok(_) => {
                self.complete_login(key, handshake).await?;
                Ok(VerifyResponse {
                    status: LoginStatus::LoggedIn,
                    account_index,
                })
            }
            Err(err) if err.is("PASSWORD_HASH_INVALID") => {
                let attempts = self.handshakes.record_failed_password(key).await;
                let attempts_remaining = self.config.max_password_attempts.saturating_sub(attempts);
                if attempts_remaining == 0 {
                    warn!(
                        slot = %handshake.slot(),
                        "password attempts exhausted, login aborted"
                    );
                    self.abort_handshake(key).await;
                }
                Err(CoreError::InvalidPassword { attempts_remaining })
            }
            Err(err) => {
                let err = classify(err);
                if !is_transient(&err) {
                    self.abort_handshake(key).await;
                }
                Err(err)
            }
        }
    }

    /// Drops handshakes older than the configured TTL. Returns how many ended.
    pub async fn sweep_expired_handshakes(&self) -> usize {
        let mut swept = 0;
        for key in self.handshakes.keys().await {
            let guard = self.handshakes.lock(&key).await;
            if let Some(handshake) = self.handshakes.remove_if_expired(&key).await {
                debug!(slot = %handshake.slot(), "login handshake expired");
                self.discard_handshake(handshake).await;
                swept += 1;
            }
            self.handshakes.unlock(&key, guard).await;
        }
        if swept > 0 {
            info!(count = swept, "expired login handshakes swept");
        }
        swept
    }

    pub async fn pending_handshakes(&self) -> usize {
        self.handshakes.len().await
    }

    pub(crate) async fn cancel_all_handshakes(&self) -> usize {
        let drained = self.handshakes.drain().await;
        let count = drained.len();
        for handshake in drained {
            self.discard_handshake(handshake).await;
        }
        count
    }

    async fn live_handshake(
        &self,
        key: &HandshakeKey,
        user_id: &UserId,
    ) -> Result<Handshake, CoreError> {
        let handshake = self
            .handshakes
            .get(key)
            .await
            .ok_or_else(|| CoreError::NotFound("pending login".into()))?;
        if self.handshakes.is_expired(&handshake) {
            self.abort_handshake(key).await;
            return Err(CoreError::NotFound("pending login".into()));
        }
        if handshake.user_id != *user_id {
            return Err(CoreError::Conflict(
                "phone number has a pending login for another user".into(),
            ));
        }
        Ok(handshake)
    }

    async fn mark_password_required(&self, key: &HandshakeKey, handshake: &Handshake) {
        self.handshakes.require_password(key).await;
        info!(slot = %handshake.slot(), "login requires account password");
    }

    /// Persists the authorized session into its slot under the slot lock, then
    /// ends the handshake whether or not persisting succeeded.
    async fn complete_login(&self, key: &HandshakeKey, handshake: Handshake) -> Result<(), CoreError> {
        let slot = handshake.slot();
        let guard = self.pool.lock_slot(&slot).await;
        let persisted = match remote(
            "persist",
            self.config.request_timeout,
            handshake.client.persist(),
        )
        .await
        {
            Ok(()) => self
                .directory
                .mark_persisted(&slot)
                .await
                .map_err(CoreError::from),
            Err(err) => Err(err),
        };
        if persisted.is_err() {
            if let Err(err) = self.directory.remove_session_file(&slot).await {
                warn!(slot = %slot, error = %err, "failed to clean up partial session file");
            }
        }
        drop(guard);
        self.pool.prune_lock(&slot).await;

        self.handshakes.remove(key).await;
        self.discard_handshake(handshake).await;
        persisted?;
        info!(slot = %slot, "account linked");
        Ok(())
    }

    async fn abort_handshake(&self, key: &HandshakeKey) {
        if let Some(handshake) = self.handshakes.remove(key).await {
            debug!(slot = %handshake.slot(), "login handshake terminated");
            self.discard_handshake(handshake).await;
        }
    }

    async fn discard_handshake(&self, handshake: Handshake) {
        disconnect_quietly(handshake.client.as_ref()).await;
        self.handshakes
            .release_index(&handshake.user_id, handshake.account_index)
            .await;
    }
}

fn is_transient(err: &CoreError) -> bool {
    matches!(
        err,
        CoreError::RateLimited { .. } | CoreError::Timeout { .. }
    )
}

/// Canonical `+<digits>` form. Spaces, dashes, dots and parentheses are
/// ignored; anything else is rejected.
pub fn normalize_phone(raw: &str) -> Result<String, CoreError> {
    let trimmed = raw.trim();
    let body = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let mut digits = String::with_capacity(body.len() + 1);
    digits.push('+');
    for c in body.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' | '.' | '(' | ')' => {}
            _ => {
                return Err(CoreError::Validation(
                    "phone number may only contain digits".into(),
                ))
            }
        }
    }
    let count = digits.len() - 1;
    if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&count) {
        return Err(CoreError::Validation(format!(
            "phone number must have {MIN_PHONE_DIGITS} to {MAX_PHONE_DIGITS} digits"
        )));
    }
    Ok(digits)
}

/// Log-safe form of a normalized phone number.
pub(crate) fn mask_phone(phone: &str) -> String {
    let visible = phone.len().saturating_sub(4);
    match phone.get(visible..) {
        Some(tail) if visible > 0 => format!("***{tail}"),
        _ => "***".to_string(),
    }
}

#[cfg(test)]
#[path = "tests/handshake_tests.rs"]
mod tests;
