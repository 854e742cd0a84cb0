use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{AccountIndex, ChatId, ChatKind, MediaKind, MessageId, PeerId, Presence},
    error::ApiError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartLoginResponse {
    pub challenge_id: String,
    pub account_index: AccountIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoginStatus {
    LoggedIn,
    PasswordRequired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub status: LoginStatus,
    pub account_index: AccountIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub index: AccountIndex,
    pub full_name: Option<String>,
    pub username: Option<String>,
    pub phone_number: Option<String>,
    pub remote_id: PeerId,
    pub avatar_url: Option<String>,
    pub profile_url: Option<String>,
}

/// One entry of `list_accounts`. `available` is false when the slot could not be
/// reached right now (timeout, upstream error) but was not found to be invalid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub index: AccountIndex,
    pub full_name: Option<String>,
    pub username: Option<String>,
    pub phone_number: Option<String>,
    pub remote_id: Option<PeerId>,
    pub avatar_url: Option<String>,
    pub profile_url: Option<String>,
    pub available: bool,
}

impl AccountSummary {
    pub fn unavailable(index: AccountIndex) -> Self {
        Self {
            index,
            full_name: None,
            username: None,
            phone_number: None,
            remote_id: None,
            avatar_url: None,
            profile_url: None,
            available: false,
        }
    }
}

impl From<Profile> for AccountSummary {
    fn from(profile: Profile) -> Self {
        Self {
            index: profile.index,
            full_name: profile.full_name,
            username: profile.username,
            phone_number: profile.phone_number,
            remote_id: Some(profile.remote_id),
            avatar_url: profile.avatar_url,
            profile_url: profile.profile_url,
            available: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: PeerId,
    pub full_name: Option<String>,
    pub username: Option<String>,
    pub presence: Presence,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub is_online: bool,
    pub has_photo: bool,
    pub photo_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub id: ChatId,
    pub title: Option<String>,
    pub username: Option<String>,
    pub member_count: u64,
    /// Approximate: counted over a bounded prefix of the member list.
    pub online_count: u64,
    pub has_photo: bool,
    pub photo_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub kind: MediaKind,
    pub file_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: Option<u64>,
    pub size_human: Option<String>,
    pub duration_secs: Option<u32>,
    pub waveform: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSender {
    pub id: PeerId,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub date: Option<DateTime<Utc>>,
    pub chat_id: ChatId,
    pub chat_type: ChatKind,
    pub is_read: bool,
    pub is_outgoing: bool,
    pub from_user: Option<MessageSender>,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub media: Option<MediaDescriptor>,
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedMessage {
    pub from: String,
    pub text: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSummary {
    pub url: String,
    pub path: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaLink {
    pub url: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoutStatus {
    LoggedOut,
    FileRemovedOnly,
    NotFound,
    /// Only reported by bulk logout, alongside `LogoutResult::error`.
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutResult {
    pub index: AccountIndex,
    pub status: LogoutStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_status_uses_upper_snake_case_on_the_wire() {
        let response = VerifyResponse {
            status: LoginStatus::PasswordRequired,
            account_index: AccountIndex(2),
        };
        let json = serde_json::to_value(&response).expect("serialize");
        assert_eq!(json["status"], "PASSWORD_REQUIRED");
        assert_eq!(json["account_index"], 2);
    }

    #[test]
    fn exported_message_kind_is_named_type() {
        let message = ExportedMessage {
            from: "alice".into(),
            text: "hi".into(),
            kind: "text".into(),
        };
        let json = serde_json::to_value(&message).expect("serialize");
        assert_eq!(json["type"], "text");
        assert!(json.get("kind").is_none());
    }
}
