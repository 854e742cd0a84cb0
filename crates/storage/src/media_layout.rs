use anyhow::{Context, Result};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::debug;

use shared::domain::{MediaNamespace, SlotKey};

const DEFAULT_AVATAR_FILE: &str = "default.jpg";

/// On-disk layout of the cache namespaces:
/// `<media_root>/<namespace>/<user_id>/<account_index>/<file>`, served under
/// `<public_prefix>/<namespace>/<user_id>/<account_index>/<file>`.
#[derive(Debug, Clone)]
pub struct MediaLayout {
    media_root: PathBuf,
    public_prefix: String,
}

impl MediaLayout {
    pub fn new(media_root: impl Into<PathBuf>, public_prefix: impl Into<String>) -> Self {
        let public_prefix = public_prefix.into();
        Self {
            media_root: media_root.into(),
            public_prefix: public_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    pub fn slot_dir(&self, namespace: MediaNamespace, slot: &SlotKey) -> PathBuf {
        self.media_root
            .join(namespace.dir_name())
            .join(slot.user_id.as_str())
            .join(slot.index.to_string())
    }

    pub fn path_for(&self, namespace: MediaNamespace, slot: &SlotKey, file_name: &str) -> PathBuf {
        self.slot_dir(namespace, slot).join(file_name)
    }

    pub fn url_for(&self, namespace: MediaNamespace, slot: &SlotKey, file_name: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.public_prefix,
            namespace.dir_name(),
            slot.user_id,
            slot.index,
            file_name
        )
    }

    /// Placeholder served for peers without a photo.
    pub fn default_avatar_url(&self) -> String {
        format!(
            "{}/{}/{DEFAULT_AVATAR_FILE}",
            self.public_prefix,
            MediaNamespace::Avatar.dir_name()
        )
    }

    /// Removes every namespace subtree owned by `slot`. Missing directories are fine.
    pub async fn purge_slot(&self, slot: &SlotKey) -> Result<()> {
        for namespace in MediaNamespace::ALL {
            let dir = self.slot_dir(namespace, slot);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!(slot = %slot, dir = %dir.display(), "cache subtree purged"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to purge '{}'", dir.display()))
                }
            }
        }
        Ok(())
    }

    /// Total bytes stored per namespace for `slot`.
    pub async fn usage(&self, slot: &SlotKey) -> Result<Vec<(MediaNamespace, u64)>> {
        let mut report = Vec::with_capacity(MediaNamespace::ALL.len());
        for namespace in MediaNamespace::ALL {
            let dir = self.slot_dir(namespace, slot);
            let mut total = 0u64;
            match tokio::fs::read_dir(&dir).await {
                Ok(mut entries) => {
                    while let Some(entry) = entries.next_entry().await? {
                        let metadata = entry.metadata().await?;
                        if metadata.is_file() {
                            total += metadata.len();
                        }
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to read '{}'", dir.display()))
                }
            }
            report.push((namespace, total));
        }
        Ok(report)
    }
}

/// Maps an arbitrary remote identifier onto a single safe file-name component.
pub fn sanitize_file_component(raw: &str) -> String {
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "_".to_string()
    } else {
        sanitized
    }
}

/// Writes `bytes` to a sibling temp file and renames it over `path`, so readers
/// never observe a partially written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path '{}' has no parent directory", path.display()))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("failed to create '{}'", parent.display()))?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("blob");
    let temp_path = parent.join(format!(".{file_name}.{}.part", uuid::Uuid::new_v4()));
    tokio::fs::write(&temp_path, bytes)
        .await
        .with_context(|| format!("failed to write '{}'", temp_path.display()))?;
    if let Err(err) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("failed to move into '{}'", path.display()));
    }
    Ok(())
}
