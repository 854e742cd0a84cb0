use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use shared::domain::{ChatId, ChatKind, MediaKind, MessageId, PeerId, SlotKey};
use storage::SessionFile;
use thiserror::Error;

/// Error reported by the messaging network for a single RPC.
///
/// Numeric suffixes are split off the name: `FLOOD_WAIT_30` becomes
/// `name = "FLOOD_WAIT"`, `value = Some(30)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: i32,
    pub name: String,
    pub value: Option<u32>,
}

impl RpcError {
    pub fn from_telegram(code: i32, message: &str) -> Self {
        if let Some((name, suffix)) = message.rsplit_once('_') {
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(value) = suffix.parse::<u32>() {
                    return Self {
                        code,
                        name: name.to_string(),
                        value: Some(value),
                    };
                }
            }
        }
        Self {
            code,
            name: message.to_string(),
            value: None,
        }
    }

    /// Matches the error name. A trailing `*` matches by prefix, a leading `*`
    /// by suffix.
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }

    /// Seconds to wait for `FLOOD_WAIT_n` and `SLOWMODE_WAIT_n` errors.
    pub fn wait_seconds(&self) -> Option<u64> {
        if self.code == 420 || self.is("FLOOD_WAIT") || self.is("SLOWMODE_WAIT") {
            self.value.map(u64::from)
        } else {
            None
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(value) = self.value {
            write!(f, " (value: {value})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

/// Failure surfaced by a [`SessionClient`] call.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("{0}")]
    Rpc(RpcError),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("client is not connected")]
    NotConnected,
}

impl RemoteError {
    pub fn rpc(code: i32, message: &str) -> Self {
        Self::Rpc(RpcError::from_telegram(code, message))
    }

    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(err) => err.is(pattern),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCode {
    pub phone_code_hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignInOutcome {
    LoggedIn(RemoteUser),
    PasswordRequired { hint: Option<String> },
}

/// Remote file ids of a profile photo in its two published sizes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatPhoto {
    pub small_file_id: Option<String>,
    pub big_file_id: Option<String>,
}

impl ChatPhoto {
    /// The preferred size, falling back to the other one when it is absent.
    pub fn file_id(&self, prefer_small: bool) -> Option<&str> {
        let (first, second) = if prefer_small {
            (&self.small_file_id, &self.big_file_id)
        } else {
            (&self.big_file_id, &self.small_file_id)
        };
        first.as_deref().or(second.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserStatus {
    Online,
    Offline { was_online: Option<DateTime<Utc>> },
    Recently,
    LastWeek,
    LastMonth,
    LongAgo,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteUser {
    pub id: PeerId,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub phone_number: Option<String>,
    pub is_bot: bool,
    pub photo: Option<ChatPhoto>,
    pub status: Option<UserStatus>,
}

impl RemoteUser {
    pub fn full_name(&self) -> Option<String> {
        join_name(self.first_name.as_deref(), self.last_name.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChat {
    pub id: ChatId,
    pub kind: ChatKind,
    pub title: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub photo: Option<ChatPhoto>,
    pub status: Option<UserStatus>,
}

impl RemoteChat {
    /// Title for groups and channels, joined first/last name for private chats.
    pub fn display_name(&self) -> Option<String> {
        self.title
            .clone()
            .or_else(|| join_name(self.first_name.as_deref(), self.last_name.as_deref()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDialog {
    pub chat: RemoteChat,
    pub read_inbox_max_id: MessageId,
    pub read_outbox_max_id: MessageId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMedia {
    pub kind: MediaKind,
    pub file_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<u64>,
    pub duration_secs: Option<u32>,
    pub waveform: Option<Vec<u8>>,
    pub thumb_file_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMessage {
    pub id: MessageId,
    pub date: Option<DateTime<Utc>>,
    pub outgoing: bool,
    pub from_user: Option<RemoteUser>,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub media: Option<RemoteMedia>,
}

pub type RemoteStream<'a, T> = BoxStream<'a, Result<T, RemoteError>>;

/// One client connection to the messaging network, bound to a single
/// Session File.
///
/// Nothing is written to the Session File before `persist` succeeds.
/// Streams are pulled lazily: callers that stop early never fetch the rest.
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Opens the connection. Returns whether the bound session is authorized.
    async fn connect(&self) -> Result<bool, RemoteError>;
    async fn disconnect(&self) -> Result<(), RemoteError>;
    /// Whether the transport is still up. False after `disconnect` or a drop.
    fn is_connected(&self) -> bool;

    async fn send_code(&self, phone_number: &str) -> Result<SentCode, RemoteError>;
    async fn sign_in(
        &self,
        phone_number: &str,
        phone_code_hash: &str,
        code: &str,
    ) -> Result<SignInOutcome, RemoteError>;
    async fn check_password(&self, password: &str) -> Result<RemoteUser, RemoteError>;
    /// Flushes the authorized credential state into the bound Session File.
    async fn persist(&self) -> Result<(), RemoteError>;
    /// Revokes the session on the remote side.
    async fn log_out(&self) -> Result<(), RemoteError>;

    async fn get_me(&self) -> Result<RemoteUser, RemoteError>;
    fn get_dialogs(&self, limit: Option<usize>) -> RemoteStream<'_, RemoteDialog>;
    async fn get_chat(&self, chat_id: ChatId) -> Result<RemoteChat, RemoteError>;
    /// Messages of one chat, newest first.
    fn get_chat_history(&self, chat_id: ChatId) -> RemoteStream<'_, RemoteMessage>;
    async fn get_chat_members_count(&self, chat_id: ChatId) -> Result<u64, RemoteError>;
    fn get_chat_members(&self, chat_id: ChatId) -> RemoteStream<'_, RemoteUser>;
    async fn download_media(&self, file_id: &str) -> Result<Vec<u8>, RemoteError>;
}

/// Builds unconnected clients bound to a slot's Session File.
pub trait SessionClientFactory: Send + Sync {
    fn build(&self, slot: &SlotKey, session_file: SessionFile) -> Arc<dyn SessionClient>;
}

/// Disconnects and only logs failures; used on teardown paths.
pub(crate) async fn disconnect_quietly(client: &dyn SessionClient) {
    if let Err(err) = client.disconnect().await {
        tracing::debug!(error = %err, "disconnect failed; dropping client anyway");
    }
}

fn join_name(first: Option<&str>, last: Option<&str>) -> Option<String> {
    let joined = [first, last]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!joined.is_empty()).then_some(joined)
}
