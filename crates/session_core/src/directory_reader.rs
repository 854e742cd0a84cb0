use shared::{
    domain::{AccountIndex, ChatId, ChatKind, PeerId, Presence, SlotKey, UserId},
    protocol::{AccountSummary, GroupSummary, PeerSummary, Profile},
};
use tracing::{debug, warn};

use crate::{
    client::{ChatPhoto, RemoteChat, SessionClient, UserStatus},
    error::{next_remote, remote, CoreError},
    media_cache::CacheKey,
    registry::{checked_user, slot_for, SessionRegistry},
};

const PROFILE_URL_BASE: &str = "https://t.me/";

/// Result of probing one slot's own profile.
#[derive(Debug, Clone, PartialEq)]
pub enum OwnProfile {
    Valid(Profile),
    /// The stored session is no longer authorized.
    Invalid { index: AccountIndex },
}

impl SessionRegistry {
    pub async fn get_own_profile(
        &self,
        user_id: &UserId,
        index: AccountIndex,
    ) -> Result<OwnProfile, CoreError> {
        let slot = slot_for(user_id, index)?;
        let probe = async {
            let client = self.pool.get_or_start(&slot).await?;
            let me = remote("get_me", self.config.request_timeout, client.get_me()).await?;
            Ok::<_, CoreError>((client, me))
        };
        let (client, me) = match probe.await {
            Ok(found) => found,
            Err(CoreError::SessionInvalid(reason)) => {
                debug!(slot = %slot, reason = %reason, "own profile probe hit an invalid session");
                return Ok(OwnProfile::Invalid { index });
            }
            Err(err) => return Err(err),
        };

        let avatar_url = self
            .cached_avatar(&slot, client.as_ref(), me.id.0, me.photo.as_ref(), false)
            .await;
        Ok(OwnProfile::Valid(Profile {
            index,
            full_name: me.full_name(),
            profile_url: me
                .username
                .as_deref()
                .map(|username| format!("{PROFILE_URL_BASE}{username}")),
            username: me.username,
            phone_number: me.phone_number,
            remote_id: me.id,
            avatar_url,
        }))
    }

    /// Profiles of every slot, probed with bounded concurrency. Slots whose
    /// sessions were revoked are evicted and left out; slots that fail for any
    /// other reason are reported as unavailable.
    pub async fn list_accounts(&self, user_id: &UserId) -> Result<Vec<AccountSummary>, CoreError> {
        let user_id = checked_user(user_id)?;
        let slots = self.directory.list_slots(user_id).await?;

        let probes = slots.into_iter().map(|index| async move {
            let _permit = self.fanout_permit().await?;
            let summary = match self.get_own_profile(user_id, index).await {
                Ok(OwnProfile::Valid(profile)) => Some(AccountSummary::from(profile)),
                Ok(OwnProfile::Invalid { index }) => {
                    let slot = SlotKey::new(user_id.clone(), index);
                    warn!(slot = %slot, "evicting account with revoked session");
                    if let Err(err) = self.evict_slot(&slot).await {
                        warn!(slot = %slot, error = %err, "eviction failed");
                    }
                    None
                }
                Err(err) => {
                    warn!(user_id = %user_id, index = %index, error = %err, "account profile unavailable");
                    Some(AccountSummary::unavailable(index))
                }
            };
            Ok::<_, CoreError>(summary)
        });

        let mut accounts = Vec::new();
        for probe in futures::future::join_all(probes).await {
            if let Some(summary) = probe? {
                accounts.push(summary);
            }
        }
        Ok(accounts)
    }

    /// Private one-to-one chats among the first `limit` dialogs.
    pub async fn list_private_peers(
        &self,
        user_id: &UserId,
        index: AccountIndex,
        limit: usize,
    ) -> Result<Vec<PeerSummary>, CoreError> {
        let slot = slot_for(user_id, index)?;
        let result = self.collect_private_peers(&slot, limit).await;
        self.evict_on_invalid(&slot, result).await
    }

    async fn collect_private_peers(
        &self,
        slot: &SlotKey,
        limit: usize,
    ) -> Result<Vec<PeerSummary>, CoreError> {
        let client = self.pool.get_or_start(slot).await?;
        let timeout = self.config.request_timeout;
        let mut dialogs = client.get_dialogs(Some(limit));
        let mut peers = Vec::new();

        while let Some(dialog) = next_remote("get_dialogs", timeout, &mut dialogs).await? {
            if dialog.chat.kind != ChatKind::Private {
                continue;
            }
            let chat = match remote("get_chat", timeout, client.get_chat(dialog.chat.id)).await {
                Ok(chat) => chat,
                Err(err @ CoreError::SessionInvalid(_)) => return Err(err),
                Err(err) => {
                    debug!(slot = %slot, chat_id = %dialog.chat.id, error = %err, "using dialog snapshot of peer");
                    dialog.chat
                }
            };
            peers.push(self.peer_summary(slot, client.as_ref(), chat).await);
        }
        Ok(peers)
    }

    async fn peer_summary(
        &self,
        slot: &SlotKey,
        client: &dyn SessionClient,
        chat: RemoteChat,
    ) -> PeerSummary {
        let (presence, last_seen_at) = presence_of(chat.status.as_ref());
        let avatar = self
            .cached_avatar(slot, client, chat.id.0, chat.photo.as_ref(), true)
            .await;
        PeerSummary {
            id: PeerId(chat.id.0),
            full_name: chat.display_name(),
            username: chat.username,
            is_online: presence == Presence::Online,
            presence,
            last_seen_at,
            has_photo: chat.photo.is_some(),
            photo_url: avatar.unwrap_or_else(|| self.media_layout().default_avatar_url()),
        }
    }

    /// Groups and supergroups among the first `limit` dialogs, with member and
    /// online counts. Counting failures degrade to zero.
    pub async fn list_groups(
        &self,
        user_id: &UserId,
        index: AccountIndex,
        limit: usize,
    ) -> Result<Vec<GroupSummary>, CoreError> {
        let slot = slot_for(user_id, index)?;
        let result = self.collect_groups(&slot, limit).await;
        self.evict_on_invalid(&slot, result).await
    }

    async fn collect_groups(
        &self,
        slot: &SlotKey,
        limit: usize,
    ) -> Result<Vec<GroupSummary>, CoreError> {
        let client = self.pool.get_or_start(slot).await?;
        let mut dialogs = client.get_dialogs(Some(limit));
        let mut groups = Vec::new();

        while let Some(dialog) =
            next_remote("get_dialogs", self.config.request_timeout, &mut dialogs).await?
        {
            let chat = dialog.chat;
            if !chat.kind.is_group() {
                continue;
            }
            let (member_count, online_count) = match self.count_members(client.as_ref(), chat.id).await {
                Ok(counts) => counts,
                Err(err @ CoreError::SessionInvalid(_)) => return Err(err),
                Err(err) => {
                    debug!(slot = %slot, chat_id = %chat.id, error = %err, "member counts unavailable");
                    (0, 0)
                }
            };
            let avatar = self
                .cached_avatar(slot, client.as_ref(), chat.id.0, chat.photo.as_ref(), true)
                .await;
            groups.push(GroupSummary {
                id: chat.id,
                title: chat.title,
                username: chat.username,
                member_count,
                online_count,
                has_photo: chat.photo.is_some(),
                photo_url: avatar.unwrap_or_else(|| self.media_layout().default_avatar_url()),
            });
        }
        Ok(groups)
    }

    /// Total members plus how many of the first `online_scan_limit` are online.
    async fn count_members(
        &self,
        client: &dyn SessionClient,
        chat_id: ChatId,
    ) -> Result<(u64, u64), CoreError> {
        let timeout = self.config.request_timeout;
        let member_count = remote(
            "get_chat_members_count",
            timeout,
            client.get_chat_members_count(chat_id),
        )
        .await?;

        let mut members = client.get_chat_members(chat_id);
        let mut scanned = 0;
        let mut online = 0;
        while scanned < self.config.online_scan_limit {
            let Some(member) = next_remote("get_chat_members", timeout, &mut members).await? else {
                break;
            };
            scanned += 1;
            if matches!(member.status, Some(UserStatus::Online)) {
                online += 1;
            }
        }
        Ok((member_count, online))
    }

    /// Caches the small photo of `peer_id` and returns its public URL, or
    /// `None` when the peer is not a person or has no photo.
    pub async fn download_peer_avatar(
        &self,
        user_id: &UserId,
        index: AccountIndex,
        peer_id: PeerId,
    ) -> Result<Option<String>, CoreError> {
        let slot = slot_for(user_id, index)?;
        let result = async {
            let client = self.pool.get_or_start(&slot).await?;
            let chat = remote(
                "get_chat",
                self.config.request_timeout,
                client.get_chat(ChatId(peer_id.0)),
            )
            .await?;
            if chat.kind != ChatKind::Private {
                return Ok::<_, CoreError>(None);
            }
            let Some(file_id) = chat.photo.as_ref().and_then(|photo| photo.file_id(true)) else {
                return Ok(None);
            };
            let cached = self
                .cache
                .ensure_downloaded(&slot, CacheKey::Avatar(peer_id.0), client.as_ref(), file_id)
                .await?;
            Ok(Some(cached.url))
        }
        .await;
        self.evict_on_invalid(&slot, result).await
    }

    /// Best-effort avatar lookup. Download failures are logged and reported
    /// as a missing photo.
    pub(crate) async fn cached_avatar(
        &self,
        slot: &SlotKey,
        client: &dyn SessionClient,
        owner_id: i64,
        photo: Option<&ChatPhoto>,
        prefer_small: bool,
    ) -> Option<String> {
        let file_id = photo?.file_id(prefer_small)?;
        match self
            .cache
            .ensure_downloaded(slot, CacheKey::Avatar(owner_id), client, file_id)
            .await
        {
            Ok(cached) => Some(cached.url),
            Err(err) => {
                debug!(slot = %slot, owner_id, error = %err, "avatar download failed");
                None
            }
        }
    }
}

/// Maps an upstream status onto the closed presence vocabulary.
pub fn presence_of(
    status: Option<&UserStatus>,
) -> (Presence, Option<chrono::DateTime<chrono::Utc>>) {
    match status {
        Some(UserStatus::Online) => (Presence::Online, None),
        Some(UserStatus::Offline { was_online }) => (Presence::Offline, *was_online),
        Some(UserStatus::Recently) => (Presence::Recently, None),
        Some(UserStatus::LastWeek) => (Presence::LastWeek, None),
        Some(UserStatus::LastMonth) => (Presence::LastMonth, None),
        Some(UserStatus::LongAgo) => (Presence::LongAgo, None),
        None => (Presence::Unknown, None),
    }
}

#[cfg(test)]
#[path = "tests/directory_reader_tests.rs"]
mod tests;
