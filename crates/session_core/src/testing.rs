//! In-memory stand-in for the messaging network, for tests of this crate and
//! of crates built on it.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use futures::{stream, StreamExt};
use shared::{
    domain::{AccountIndex, ChatId, ChatKind, MessageId, PeerId, SlotKey, UserId},
    protocol::LoginStatus,
};
use storage::{PersistedSession, SessionFile};

use crate::{
    client::{
        ChatPhoto, RemoteChat, RemoteDialog, RemoteError, RemoteMessage, RemoteStream,
        RemoteUser, SentCode, SessionClient, SessionClientFactory, SignInOutcome,
    },
    config::CoreConfig,
    error::CoreError,
    registry::SessionRegistry,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One remote account reachable by phone number.
#[derive(Debug, Clone)]
pub struct FakeAccount {
    pub user: RemoteUser,
    pub code: String,
    pub password: Option<String>,
    pub dialogs: Vec<RemoteDialog>,
    pub histories: HashMap<ChatId, Vec<RemoteMessage>>,
    pub members: HashMap<ChatId, Vec<RemoteUser>>,
}

impl FakeAccount {
    pub fn new(user: RemoteUser, code: impl Into<String>) -> Self {
        Self {
            user,
            code: code.into(),
            password: None,
            dialogs: Vec::new(),
            histories: HashMap::new(),
            members: HashMap::new(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Adds a dialog; `history` is newest first.
    pub fn with_dialog(mut self, dialog: RemoteDialog, history: Vec<RemoteMessage>) -> Self {
        self.histories.insert(dialog.chat.id, history);
        self.dialogs.push(dialog);
        self
    }

    pub fn with_members(mut self, chat_id: ChatId, members: Vec<RemoteUser>) -> Self {
        self.members.insert(chat_id, members);
        self
    }
}

#[derive(Default)]
struct FakeState {
    accounts: HashMap<String, FakeAccount>,
    media: HashMap<String, Vec<u8>>,
    revoked: HashSet<i64>,
    latest_hash: HashMap<String, String>,
    issued_hashes: u64,
    open_per_file: HashMap<PathBuf, usize>,
    max_open_per_file: usize,
    flood_wait_secs: Option<u32>,
    connect_delay: Option<Duration>,
    download_delay: Option<Duration>,
    fail_log_out: bool,
    fail_member_counts: bool,
}

/// Shared state of the fake network plus call counters.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    downloads: AtomicUsize,
    log_outs: AtomicUsize,
    history_pulled: Arc<AtomicUsize>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn factory(self: &Arc<Self>) -> Arc<FakeClientFactory> {
        Arc::new(FakeClientFactory {
            remote: Arc::clone(self),
        })
    }

    pub fn add_account(&self, phone: &str, account: FakeAccount) {
        lock(&self.state).accounts.insert(phone.to_string(), account);
    }

    pub fn put_media(&self, file_id: &str, bytes: &[u8]) {
        lock(&self.state)
            .media
            .insert(file_id.to_string(), bytes.to_vec());
    }

    /// Revokes every session of the remote user, as a logout from another
    /// device would.
    pub fn revoke(&self, remote_user_id: i64) {
        lock(&self.state).revoked.insert(remote_user_id);
    }

    pub fn is_revoked(&self, remote_user_id: i64) -> bool {
        lock(&self.state).revoked.contains(&remote_user_id)
    }

    pub fn set_flood_wait(&self, secs: Option<u32>) {
        lock(&self.state).flood_wait_secs = secs;
    }

    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        lock(&self.state).connect_delay = delay;
    }

    pub fn set_download_delay(&self, delay: Option<Duration>) {
        lock(&self.state).download_delay = delay;
    }

    pub fn set_fail_log_out(&self, fail: bool) {
        lock(&self.state).fail_log_out = fail;
    }

    pub fn set_fail_member_counts(&self, fail: bool) {
        lock(&self.state).fail_member_counts = fail;
    }

    pub fn latest_code_hash(&self, phone: &str) -> Option<String> {
        lock(&self.state).latest_hash.get(phone).cloned()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn log_outs(&self) -> usize {
        self.log_outs.load(Ordering::SeqCst)
    }

    /// History items actually pulled from streams.
    pub fn history_pulled(&self) -> usize {
        self.history_pulled.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        lock(&self.state).open_per_file.values().sum()
    }

    /// Highest number of simultaneous connections seen on any single file.
    pub fn max_open_per_file(&self) -> usize {
        lock(&self.state).max_open_per_file
    }

    fn account_of(&self, remote_user_id: i64) -> Option<FakeAccount> {
        lock(&self.state)
            .accounts
            .values()
            .find(|account| account.user.id.0 == remote_user_id)
            .cloned()
    }
}

pub struct FakeClientFactory {
    remote: Arc<FakeRemote>,
}

impl SessionClientFactory for FakeClientFactory {
    fn build(&self, _slot: &SlotKey, session_file: SessionFile) -> Arc<dyn SessionClient> {
        Arc::new(FakeClient {
            remote: Arc::clone(&self.remote),
            session_file,
            state: Mutex::new(ClientState::default()),
        })
    }
}

#[derive(Default)]
struct ClientState {
    connected: bool,
    me: Option<RemoteUser>,
    phone: Option<String>,
    awaiting_password: bool,
}

pub struct FakeClient {
    remote: Arc<FakeRemote>,
    session_file: SessionFile,
    state: Mutex<ClientState>,
}

impl FakeClient {
    fn authorized(&self) -> Result<FakeAccount, RemoteError> {
        let state = lock(&self.state);
        if !state.connected {
            return Err(RemoteError::NotConnected);
        }
        let me = state
            .me
            .as_ref()
            .ok_or_else(|| RemoteError::rpc(401, "AUTH_KEY_UNREGISTERED"))?;
        if self.remote.is_revoked(me.id.0) {
            return Err(RemoteError::rpc(401, "AUTH_KEY_UNREGISTERED"));
        }
        self.remote
            .account_of(me.id.0)
            .ok_or_else(|| RemoteError::rpc(401, "USER_DEACTIVATED"))
    }

    fn pending_account(&self) -> Result<(String, FakeAccount), RemoteError> {
        let phone = lock(&self.state)
            .phone
            .clone()
            .ok_or_else(|| RemoteError::Transport("no login code was requested".into()))?;
        let account = lock(&self.remote.state)
            .accounts
            .get(&phone)
            .cloned()
            .ok_or_else(|| RemoteError::rpc(400, "PHONE_NUMBER_INVALID"))?;
        Ok((phone, account))
    }
}

fn failed_stream<'a, T: Send + 'a>(err: RemoteError) -> RemoteStream<'a, T> {
    stream::iter(vec![Err(err)]).boxed()
}

#[async_trait]
impl SessionClient for FakeClient {
    async fn connect(&self) -> Result<bool, RemoteError> {
        let delay = lock(&self.remote.state).connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.remote.connects.fetch_add(1, Ordering::SeqCst);

        let stored = self
            .session_file
            .load()
            .await
            .map_err(|_| RemoteError::rpc(401, "AUTH_KEY_INVALID"))?;
        let me = match stored.and_then(|session| session.remote_user_id) {
            Some(remote_user_id) => {
                if self.remote.is_revoked(remote_user_id) {
                    return Err(RemoteError::rpc(401, "AUTH_KEY_UNREGISTERED"));
                }
                Some(
                    self.remote
                        .account_of(remote_user_id)
                        .ok_or_else(|| RemoteError::rpc(401, "USER_DEACTIVATED"))?
                        .user,
                )
            }
            None => None,
        };

        {
            let mut remote = lock(&self.remote.state);
            let open = remote
                .open_per_file
                .entry(self.session_file.path().to_path_buf())
                .or_default();
            *open += 1;
            let open = *open;
            remote.max_open_per_file = remote.max_open_per_file.max(open);
        }
        let mut state = lock(&self.state);
        state.connected = true;
        state.me = me;
        Ok(state.me.is_some())
    }

    async fn disconnect(&self) -> Result<(), RemoteError> {
        let was_connected = std::mem::take(&mut lock(&self.state).connected);
        if was_connected {
            self.remote.disconnects.fetch_add(1, Ordering::SeqCst);
            let mut remote = lock(&self.remote.state);
            if let Some(open) = remote.open_per_file.get_mut(self.session_file.path()) {
                *open = open.saturating_sub(1);
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    async fn send_code(&self, phone_number: &str) -> Result<SentCode, RemoteError> {
        if !lock(&self.state).connected {
            return Err(RemoteError::NotConnected);
        }
        let phone_code_hash = {
            let mut remote = lock(&self.remote.state);
            if let Some(secs) = remote.flood_wait_secs {
                return Err(RemoteError::rpc(420, &format!("FLOOD_WAIT_{secs}")));
            }
            if !remote.accounts.contains_key(phone_number) {
                return Err(RemoteError::rpc(400, "PHONE_NUMBER_INVALID"));
            }
            remote.issued_hashes += 1;
            let hash = format!("hash-{}", remote.issued_hashes);
            remote
                .latest_hash
                .insert(phone_number.to_string(), hash.clone());
            hash
        };
        lock(&self.state).phone = Some(phone_number.to_string());
        Ok(SentCode { phone_code_hash })
    }

    async fn sign_in(
        &self,
        phone_number: &str,
        phone_code_hash: &str,
        code: &str,
    ) -> Result<SignInOutcome, RemoteError> {
        let (phone, account) = self.pending_account()?;
        if phone != phone_number
            || self.remote.latest_code_hash(&phone).as_deref() != Some(phone_code_hash)
        {
            return Err(RemoteError::rpc(400, "PHONE_CODE_EXPIRED"));
        }
        if code != account.code {
            return Err(RemoteError::rpc(400, "PHONE_CODE_INVALID"));
        }
        let mut state = lock(&self.state);
        if account.password.is_some() {
            state.awaiting_password = true;
            return Ok(SignInOutcome::PasswordRequired {
                hint: Some("usual".into()),
            });
        }
        state.me = Some(account.user.clone());
        Ok(SignInOutcome::LoggedIn(account.user))
    }

    async fn check_password(&self, password: &str) -> Result<RemoteUser, RemoteError> {
        if !lock(&self.state).awaiting_password {
            return Err(RemoteError::Transport("no password challenge pending".into()));
        }
        let (_, account) = self.pending_account()?;
        if account.password.as_deref() != Some(password) {
            return Err(RemoteError::rpc(400, "PASSWORD_HASH_INVALID"));
        }
        let mut state = lock(&self.state);
        state.awaiting_password = false;
        state.me = Some(account.user.clone());
        Ok(account.user)
    }

    async fn persist(&self) -> Result<(), RemoteError> {
        let me = lock(&self.state)
            .me
            .clone()
            .ok_or_else(|| RemoteError::rpc(401, "AUTH_KEY_UNREGISTERED"))?;
        self.session_file
            .save(&PersistedSession {
                dc_id: 2,
                auth_key: vec![0xAB; 256],
                remote_user_id: Some(me.id.0),
                is_bot: me.is_bot,
                test_mode: true,
                updated_at: Utc::now(),
            })
            .await
            .map_err(|err| RemoteError::Transport(format!("{err:#}")))
    }

    async fn log_out(&self) -> Result<(), RemoteError> {
        let account = self.authorized()?;
        if lock(&self.remote.state).fail_log_out {
            return Err(RemoteError::Transport("network unreachable".into()));
        }
        self.remote.revoke(account.user.id.0);
        self.remote.log_outs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_me(&self) -> Result<RemoteUser, RemoteError> {
        Ok(self.authorized()?.user)
    }

    fn get_dialogs(&self, limit: Option<usize>) -> RemoteStream<'_, RemoteDialog> {
        match self.authorized() {
            Ok(account) => stream::iter(
                account
                    .dialogs
                    .into_iter()
                    .take(limit.unwrap_or(usize::MAX))
                    .map(Ok),
            )
            .boxed(),
            Err(err) => failed_stream(err),
        }
    }

    async fn get_chat(&self, chat_id: ChatId) -> Result<RemoteChat, RemoteError> {
        self.authorized()?
            .dialogs
            .into_iter()
            .map(|dialog| dialog.chat)
            .find(|chat| chat.id == chat_id)
            .ok_or_else(|| RemoteError::rpc(400, "PEER_ID_INVALID"))
    }

    fn get_chat_history(&self, chat_id: ChatId) -> RemoteStream<'_, RemoteMessage> {
        match self.authorized() {
            Ok(mut account) => {
                let history = account.histories.remove(&chat_id).unwrap_or_default();
                let pulled = Arc::clone(&self.remote.history_pulled);
                stream::iter(history.into_iter().map(Ok))
                    .inspect(move |_| {
                        pulled.fetch_add(1, Ordering::SeqCst);
                    })
                    .boxed()
            }
            Err(err) => failed_stream(err),
        }
    }

    async fn get_chat_members_count(&self, chat_id: ChatId) -> Result<u64, RemoteError> {
        let account = self.authorized()?;
        if lock(&self.remote.state).fail_member_counts {
            return Err(RemoteError::rpc(400, "CHAT_ADMIN_REQUIRED"));
        }
        Ok(account
            .members
            .get(&chat_id)
            .map_or(0, |members| members.len() as u64))
    }

    fn get_chat_members(&self, chat_id: ChatId) -> RemoteStream<'_, RemoteUser> {
        match self.authorized() {
            Ok(mut account) => {
                let members = account.members.remove(&chat_id).unwrap_or_default();
                stream::iter(members.into_iter().map(Ok)).boxed()
            }
            Err(err) => failed_stream(err),
        }
    }

    async fn download_media(&self, file_id: &str) -> Result<Vec<u8>, RemoteError> {
        self.authorized()?;
        self.remote.downloads.fetch_add(1, Ordering::SeqCst);
        let delay = lock(&self.remote.state).download_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.remote.state)
            .media
            .get(file_id)
            .cloned()
            .ok_or_else(|| RemoteError::rpc(400, "FILE_ID_INVALID"))
    }
}

pub fn registry(remote: &Arc<FakeRemote>, config: CoreConfig) -> Arc<SessionRegistry> {
    SessionRegistry::new(config, remote.factory())
}

/// Runs a full code login for an account without a password.
pub async fn link_account(
    registry: &SessionRegistry,
    user_id: &UserId,
    phone: &str,
    code: &str,
) -> Result<AccountIndex, CoreError> {
    let started = registry.start_login(user_id, phone).await?;
    let verified = registry.verify_code(user_id, phone, code).await?;
    if verified.status != LoginStatus::LoggedIn {
        return Err(CoreError::Conflict("account unexpectedly needs a password".into()));
    }
    Ok(started.account_index)
}

/// Small timeouts under `root/sessions` and `root/media`.
pub fn test_config(root: &Path) -> CoreConfig {
    CoreConfig {
        sessions_root: root.join("sessions"),
        media_root: root.join("media"),
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        download_timeout: Duration::from_secs(2),
        ..CoreConfig::default()
    }
}

pub fn remote_user(id: i64, first_name: &str, username: Option<&str>) -> RemoteUser {
    RemoteUser {
        id: PeerId(id),
        first_name: Some(first_name.to_string()),
        username: username.map(str::to_string),
        phone_number: Some(format!("1555{id:04}")),
        ..RemoteUser::default()
    }
}

pub fn photo(small: &str, big: &str) -> ChatPhoto {
    ChatPhoto {
        small_file_id: Some(small.to_string()),
        big_file_id: Some(big.to_string()),
    }
}

pub fn private_chat(user: &RemoteUser) -> RemoteChat {
    RemoteChat {
        id: ChatId(user.id.0),
        kind: ChatKind::Private,
        title: None,
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
        username: user.username.clone(),
        photo: user.photo.clone(),
        status: user.status.clone(),
    }
}

pub fn group_chat(id: i64, title: &str) -> RemoteChat {
    RemoteChat {
        id: ChatId(id),
        kind: ChatKind::Supergroup,
        title: Some(title.to_string()),
        first_name: None,
        last_name: None,
        username: None,
        photo: None,
        status: None,
    }
}

pub fn dialog(chat: RemoteChat, read_inbox_max_id: i64, read_outbox_max_id: i64) -> RemoteDialog {
    RemoteDialog {
        chat,
        read_inbox_max_id: MessageId(read_inbox_max_id),
        read_outbox_max_id: MessageId(read_outbox_max_id),
    }
}

pub fn text_message(id: i64, text: &str, outgoing: bool) -> RemoteMessage {
    RemoteMessage {
        id: MessageId(id),
        date: Some(Utc::now()),
        outgoing,
        from_user: None,
        text: Some(text.to_string()),
        caption: None,
        media: None,
    }
}
