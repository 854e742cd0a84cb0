use anyhow::{bail, Context, Result};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::debug;

use shared::domain::{AccountIndex, SlotKey, UserId};

mod media_layout;
mod session_file;

pub use media_layout::{sanitize_file_component, write_atomic, MediaLayout};
pub use session_file::{PersistedSession, SessionFile};

pub const SESSION_FILE_EXTENSION: &str = "session";
const INDEX_HIGH_WATER_MARK_FILE: &str = ".index_hwm";
const SQLITE_SIDECAR_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

/// Tracks which account slots exist per user, backed by the presence of
/// `<sessions_root>/<user_id>/<index>.session` files.
///
/// Clones share one lock over high-water mark updates.
#[derive(Debug, Clone)]
pub struct AccountDirectory {
    sessions_root: PathBuf,
    mark_lock: Arc<Mutex<()>>,
}

impl AccountDirectory {
    pub fn new(sessions_root: impl Into<PathBuf>) -> Self {
        Self {
            sessions_root: sessions_root.into(),
            mark_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn sessions_root(&self) -> &Path {
        &self.sessions_root
    }

    pub fn user_dir(&self, user_id: &UserId) -> Result<PathBuf> {
        if !user_id.is_path_safe() {
            bail!("user id '{user_id}' cannot be used as a directory name");
        }
        Ok(self.sessions_root.join(user_id.as_str()))
    }

    pub fn session_path(&self, slot: &SlotKey) -> Result<PathBuf> {
        Ok(self
            .user_dir(&slot.user_id)?
            .join(format!("{}.{SESSION_FILE_EXTENSION}", slot.index)))
    }

    pub fn session_file(&self, slot: &SlotKey) -> Result<SessionFile> {
        Ok(SessionFile::new(self.session_path(slot)?))
    }

    pub async fn slot_exists(&self, slot: &SlotKey) -> Result<bool> {
        let path = self.session_path(slot)?;
        tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("failed to stat session file '{}'", path.display()))
    }

    /// Existing slot indices for `user_id`, ascending.
    pub async fn list_slots(&self, user_id: &UserId) -> Result<Vec<AccountIndex>> {
        let dir = self.user_dir(user_id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read session dir '{}'", dir.display()))
            }
        };

        let mut indices = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed to iterate session dir '{}'", dir.display()))?
        {
            if let Some(index) = index_from_session_path(&entry.path()) {
                indices.push(index);
            }
        }
        indices.sort();
        Ok(indices)
    }

    /// `max(existing indices, high-water mark) + 1`, or 1 for a fresh user.
    pub async fn allocate_next_index(&self, user_id: &UserId) -> Result<AccountIndex> {
        let existing = self.list_slots(user_id).await?.into_iter().max();
        let high_water = self.high_water_mark(user_id).await?;
        let floor = existing.max(high_water);
        Ok(floor.map_or(AccountIndex::FIRST, AccountIndex::next))
    }

    /// Records that `slot` has been persisted so its index is never handed out again.
    pub async fn mark_persisted(&self, slot: &SlotKey) -> Result<()> {
        let _guard = self.mark_lock.lock().await;
        let current = self.high_water_mark(&slot.user_id).await?;
        if current.is_some_and(|mark| mark >= slot.index) {
            return Ok(());
        }
        let path = self.high_water_mark_path(&slot.user_id)?;
        write_atomic(&path, slot.index.to_string().as_bytes()).await
    }

    /// Deletes the Session File of `slot` (and SQLite sidecars). Returns whether
    /// a Session File was present. Idempotent.
    pub async fn remove_session_file(&self, slot: &SlotKey) -> Result<bool> {
        let path = self.session_path(slot)?;
        let removed = remove_if_exists(&path).await?;
        for suffix in SQLITE_SIDECAR_SUFFIXES {
            let mut sidecar = path.clone().into_os_string();
            sidecar.push(suffix);
            remove_if_exists(Path::new(&sidecar)).await?;
        }
        if removed {
            debug!(slot = %slot, "session file removed");
        }
        Ok(removed)
    }

    async fn high_water_mark(&self, user_id: &UserId) -> Result<Option<AccountIndex>> {
        let path = self.high_water_mark_path(user_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(raw.trim().parse::<u32>().ok().map(AccountIndex)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err)
                .with_context(|| format!("failed to read index mark '{}'", path.display())),
        }
    }

    fn high_water_mark_path(&self, user_id: &UserId) -> Result<PathBuf> {
        Ok(self.user_dir(user_id)?.join(INDEX_HIGH_WATER_MARK_FILE))
    }
}

fn index_from_session_path(path: &Path) -> Option<AccountIndex> {
    if path.extension()?.to_str()? != SESSION_FILE_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || !stem.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    stem.parse::<u32>()
        .ok()
        .filter(|index| *index >= 1)
        .map(AccountIndex)
}

pub(crate) async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("failed to remove '{}'", path.display())),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
