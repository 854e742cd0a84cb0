use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};

use shared::domain::{ChatId, MediaNamespace, MessageId, SlotKey};
use storage::{sanitize_file_component, write_atomic, MediaLayout};
use tracing::debug;

use crate::{
    client::SessionClient,
    error::{remote, CoreError},
    locks::KeyedLocks,
};

/// Cache entry addresses. Each variant lives in its own namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKey<'a> {
    /// Profile photo of a peer or chat, by its remote id.
    Avatar(i64),
    /// Message attachment, by remote file id.
    Attachment(&'a str),
    /// Message thumbnail, by owning chat and message id.
    Thumbnail { chat_id: ChatId, message_id: MessageId },
}

impl CacheKey<'_> {
    fn namespace(&self) -> MediaNamespace {
        match self {
            Self::Avatar(_) => MediaNamespace::Avatar,
            Self::Attachment(_) => MediaNamespace::Attachment,
            Self::Thumbnail { .. } => MediaNamespace::Thumbnail,
        }
    }

    fn file_name(&self) -> String {
        match self {
            Self::Avatar(id) => format!("{id}.jpg"),
            Self::Attachment(file_id) => sanitize_file_component(file_id),
            Self::Thumbnail {
                chat_id,
                message_id,
            } => format!("{chat_id}_{message_id}.jpg"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    pub path: PathBuf,
    pub url: String,
}

/// Per-slot download cache on top of [`MediaLayout`].
///
/// Downloads for a slot run under the same per-slot lock as the session pool,
/// and the existence check is repeated after acquiring it, so a missing entry
/// is fetched at most once.
pub struct MediaCache {
    layout: MediaLayout,
    locks: Arc<KeyedLocks<SlotKey>>,
    download_timeout: Duration,
}

impl MediaCache {
    pub fn new(layout: MediaLayout, locks: Arc<KeyedLocks<SlotKey>>, download_timeout: Duration) -> Self {
        Self {
            layout,
            locks,
            download_timeout,
        }
    }

    pub fn layout(&self) -> &MediaLayout {
        &self.layout
    }

    pub fn locate(&self, slot: &SlotKey, key: CacheKey<'_>) -> CachedFile {
        self.locate_in(key.namespace(), slot, &key.file_name())
    }

    pub async fn ensure_downloaded(
        &self,
        slot: &SlotKey,
        key: CacheKey<'_>,
        client: &dyn SessionClient,
        remote_file_id: &str,
    ) -> Result<CachedFile, CoreError> {
        let download_timeout = self.download_timeout;
        self.ensure_with(key.namespace(), slot, &key.file_name(), || {
            remote(
                "download_media",
                download_timeout,
                client.download_media(remote_file_id),
            )
        })
        .await
    }

    /// Writes a generated artifact into the export namespace, replacing any
    /// previous file of the same name.
    pub async fn store_export(
        &self,
        slot: &SlotKey,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<CachedFile, CoreError> {
        let target = self.locate_in(
            MediaNamespace::Export,
            slot,
            &sanitize_export_name(file_name),
        );
        write_atomic(&target.path, bytes).await?;
        Ok(target)
    }

    pub async fn purge(&self, slot: &SlotKey) -> Result<(), CoreError> {
        self.layout.purge_slot(slot).await?;
        Ok(())
    }

    pub(crate) async fn ensure_with<F, Fut>(
        &self,
        namespace: MediaNamespace,
        slot: &SlotKey,
        file_name: &str,
        fetch: F,
    ) -> Result<CachedFile, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, CoreError>>,
    {
        let target = self.locate_in(namespace, slot, file_name);
        if is_file(&target.path).await {
            return Ok(target);
        }

        let _guard = self.locks.lock(slot).await;
        if is_file(&target.path).await {
            return Ok(target);
        }
        let bytes = fetch().await?;
        write_atomic(&target.path, &bytes).await?;
        debug!(
            slot = %slot,
            namespace = namespace.dir_name(),
            bytes = bytes.len(),
            "media cached"
        );
        Ok(target)
    }

    fn locate_in(&self, namespace: MediaNamespace, slot: &SlotKey, file_name: &str) -> CachedFile {
        CachedFile {
            path: self.layout.path_for(namespace, slot, file_name),
            url: self.layout.url_for(namespace, slot, file_name),
        }
    }
}

async fn is_file(path: &std::path::Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|metadata| metadata.is_file())
        .unwrap_or(false)
}

fn sanitize_export_name(file_name: &str) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, extension)) => format!(
            "{}.{}",
            sanitize_file_component(stem),
            sanitize_file_component(extension)
        ),
        None => sanitize_file_component(file_name),
    }
}

#[cfg(test)]
#[path = "tests/media_cache_tests.rs"]
mod tests;
