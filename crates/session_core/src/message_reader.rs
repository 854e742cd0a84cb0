use chrono::Utc;
use shared::{
    domain::{AccountIndex, ChatId, SlotKey, UserId},
    protocol::{
        ExportSummary, ExportedMessage, MediaDescriptor, MediaLink, MessagePayload, MessageSender,
    },
};
use tracing::{debug, info};

use crate::{
    client::{RemoteDialog, RemoteMedia, RemoteMessage, RemoteUser, SessionClient},
    error::{next_remote, CoreError},
    media_cache::CacheKey,
    registry::{slot_for, SessionRegistry},
};

const SIZE_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

impl SessionRegistry {
    /// Page of a chat's history, newest first, skipping `offset` messages.
    pub async fn get_messages(
        &self,
        user_id: &UserId,
        index: AccountIndex,
        chat_id: ChatId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MessagePayload>, CoreError> {
        let slot = slot_for(user_id, index)?;
        let result = self.read_page(&slot, chat_id, limit, offset).await;
        self.evict_on_invalid(&slot, result).await
    }

    async fn read_page(
        &self,
        slot: &SlotKey,
        chat_id: ChatId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MessagePayload>, CoreError> {
        let client = self.pool.get_or_start(slot).await?;
        let dialog = self.find_dialog(client.as_ref(), chat_id).await?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut history = client.get_chat_history(chat_id);
        let mut skipped = 0;
        let mut page = Vec::with_capacity(limit.min(256));
        while page.len() < limit {
            let Some(message) =
                next_remote("get_chat_history", self.config.request_timeout, &mut history).await?
            else {
                break;
            };
            if skipped < offset {
                skipped += 1;
                continue;
            }
            page.push(self.message_payload(slot, client.as_ref(), &dialog, message).await);
        }
        Ok(page)
    }

    /// Writes the full history of a chat to a JSON file in the export namespace.
    pub async fn export_messages(
        &self,
        user_id: &UserId,
        index: AccountIndex,
        chat_id: ChatId,
    ) -> Result<ExportSummary, CoreError> {
        let slot = slot_for(user_id, index)?;
        let result = self.write_export(&slot, chat_id).await;
        self.evict_on_invalid(&slot, result).await
    }

    async fn write_export(&self, slot: &SlotKey, chat_id: ChatId) -> Result<ExportSummary, CoreError> {
        let client = self.pool.get_or_start(slot).await?;
        self.find_dialog(client.as_ref(), chat_id).await?;

        let mut history = client.get_chat_history(chat_id);
        let mut exported = Vec::new();
        while let Some(message) =
            next_remote("get_chat_history", self.config.request_timeout, &mut history).await?
        {
            exported.push(exported_message(&message));
        }

        let bytes = serde_json::to_vec_pretty(&exported)
            .map_err(|err| CoreError::Storage(anyhow::Error::new(err)))?;
        let file_name = format!("{chat_id}_{}.json", Utc::now().format("%Y%m%dT%H%M%S%3f"));
        let stored = self.cache.store_export(slot, &file_name, &bytes).await?;
        info!(slot = %slot, chat_id = %chat_id, count = exported.len(), "chat history exported");
        Ok(ExportSummary {
            url: stored.url,
            path: stored.path.display().to_string(),
            count: exported.len(),
        })
    }

    /// Caches a message attachment by its remote file id.
    pub async fn download_media(
        &self,
        user_id: &UserId,
        index: AccountIndex,
        file_id: &str,
    ) -> Result<MediaLink, CoreError> {
        if file_id.trim().is_empty() {
            return Err(CoreError::Validation("file id is empty".into()));
        }
        let slot = slot_for(user_id, index)?;
        let result = async {
            let client = self.pool.get_or_start(&slot).await?;
            self.cache
                .ensure_downloaded(&slot, CacheKey::Attachment(file_id), client.as_ref(), file_id)
                .await
        }
        .await;
        let cached = self.evict_on_invalid(&slot, result).await?;
        Ok(MediaLink {
            url: cached.url,
            path: cached.path.display().to_string(),
        })
    }

    async fn find_dialog(
        &self,
        client: &dyn SessionClient,
        chat_id: ChatId,
    ) -> Result<RemoteDialog, CoreError> {
        let mut dialogs = client.get_dialogs(None);
        while let Some(dialog) =
            next_remote("get_dialogs", self.config.request_timeout, &mut dialogs).await?
        {
            if dialog.chat.id == chat_id {
                return Ok(dialog);
            }
        }
        Err(CoreError::NotFound(format!("chat {chat_id}")))
    }

    async fn message_payload(
        &self,
        slot: &SlotKey,
        client: &dyn SessionClient,
        dialog: &RemoteDialog,
        message: RemoteMessage,
    ) -> MessagePayload {
        let is_read = if message.outgoing {
            message.id <= dialog.read_outbox_max_id
        } else {
            message.id <= dialog.read_inbox_max_id
        };

        let from_user = match message.from_user {
            Some(user) => Some(self.message_sender(slot, client, user).await),
            None => None,
        };
        let thumbnail_url = match message
            .media
            .as_ref()
            .and_then(|media| media.thumb_file_id.as_deref())
        {
            Some(thumb_file_id) => {
                let key = CacheKey::Thumbnail {
                    chat_id: dialog.chat.id,
                    message_id: message.id,
                };
                match self
                    .cache
                    .ensure_downloaded(slot, key, client, thumb_file_id)
                    .await
                {
                    Ok(cached) => Some(cached.url),
                    Err(err) => {
                        debug!(slot = %slot, message_id = %message.id, error = %err, "thumbnail download failed");
                        None
                    }
                }
            }
            None => None,
        };

        MessagePayload {
            id: message.id,
            date: message.date,
            chat_id: dialog.chat.id,
            chat_type: dialog.chat.kind,
            is_read,
            is_outgoing: message.outgoing,
            from_user,
            text: message.text,
            caption: message.caption,
            media: message.media.map(media_descriptor),
            thumbnail_url,
        }
    }

    async fn message_sender(
        &self,
        slot: &SlotKey,
        client: &dyn SessionClient,
        user: RemoteUser,
    ) -> MessageSender {
        let avatar_url = self
            .cached_avatar(slot, client, user.id.0, user.photo.as_ref(), true)
            .await;
        MessageSender {
            id: user.id,
            first_name: user.first_name,
            last_name: user.last_name,
            username: user.username,
            avatar_url,
        }
    }
}

fn media_descriptor(media: RemoteMedia) -> MediaDescriptor {
    MediaDescriptor {
        kind: media.kind,
        file_id: media.file_id,
        file_name: media.file_name,
        mime_type: media.mime_type,
        size_bytes: media.file_size,
        size_human: media.file_size.map(human_size),
        duration_secs: media.duration_secs,
        waveform: media.waveform,
    }
}

fn exported_message(message: &RemoteMessage) -> ExportedMessage {
    let from = message
        .from_user
        .as_ref()
        .and_then(|user| user.full_name().or_else(|| user.username.clone()))
        .unwrap_or_else(|| "unknown".to_string());
    let text = message
        .text
        .clone()
        .or_else(|| message.caption.clone())
        .unwrap_or_default();
    let kind = message
        .media
        .as_ref()
        .map_or("text", |media| media.kind.as_str());
    ExportedMessage {
        from,
        text,
        kind: kind.to_string(),
    }
}

/// Binary-unit size with one decimal above bytes: `512 B`, `1.5 KB`, `3.0 MB`.
pub fn human_size(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", SIZE_UNITS[unit])
}

#[cfg(test)]
#[path = "tests/message_reader_tests.rs"]
mod tests;
