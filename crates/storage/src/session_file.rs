use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::path::{Path, PathBuf};

use crate::remove_if_exists;

/// Credential state persisted for one account slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedSession {
    pub dc_id: i32,
    pub auth_key: Vec<u8>,
    pub remote_user_id: Option<i64>,
    pub is_bot: bool,
    pub test_mode: bool,
    pub updated_at: DateTime<Utc>,
}

/// A single-row SQLite database holding one [`PersistedSession`].
///
/// Every operation opens its own single-connection pool and closes it before
/// returning, so the file is never held open between calls.
#[derive(Debug, Clone)]
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> Result<bool> {
        tokio::fs::try_exists(&self.path)
            .await
            .with_context(|| format!("failed to stat '{}'", self.path.display()))
    }

    pub async fn save(&self, session: &PersistedSession) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create '{}'", parent.display()))?;
        }

        let pool = self.open(true).await?;
        let result = async {
            ensure_session_table(&pool).await?;
            sqlx::query(
                "INSERT INTO session (id, dc_id, auth_key, user_id, is_bot, test_mode, updated_at)
                 VALUES (1, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    dc_id=excluded.dc_id,
                    auth_key=excluded.auth_key,
                    user_id=excluded.user_id,
                    is_bot=excluded.is_bot,
                    test_mode=excluded.test_mode,
                    updated_at=excluded.updated_at",
            )
            .bind(session.dc_id)
            .bind(session.auth_key.as_slice())
            .bind(session.remote_user_id)
            .bind(session.is_bot)
            .bind(session.test_mode)
            .bind(session.updated_at)
            .execute(&pool)
            .await
            .with_context(|| format!("failed to write session '{}'", self.path.display()))?;
            Ok::<(), anyhow::Error>(())
        }
        .await;
        pool.close().await;
        result
    }

    /// Loads the stored session, `None` when no file exists. A file that exists
    /// but cannot be read as a session is an error.
    pub async fn load(&self) -> Result<Option<PersistedSession>> {
        if !self.exists().await? {
            return Ok(None);
        }

        let pool = self.open(false).await?;
        let result = async {
            let row = sqlx::query(
                "SELECT dc_id, auth_key, user_id, is_bot, test_mode, updated_at
                 FROM session WHERE id = 1",
            )
            .fetch_optional(&pool)
            .await
            .with_context(|| format!("failed to read session '{}'", self.path.display()))?;

            row.map(|r| -> Result<PersistedSession> {
                Ok(PersistedSession {
                    dc_id: r.try_get("dc_id")?,
                    auth_key: r.try_get("auth_key")?,
                    remote_user_id: r.try_get("user_id")?,
                    is_bot: r.try_get("is_bot")?,
                    test_mode: r.try_get("test_mode")?,
                    updated_at: r.try_get("updated_at")?,
                })
            })
            .transpose()
        }
        .await;
        pool.close().await;
        result
    }

    pub async fn delete(&self) -> Result<bool> {
        remove_if_exists(&self.path).await
    }

    async fn open(&self, create: bool) -> Result<Pool<Sqlite>> {
        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(create);
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open session file '{}'", self.path.display()))
    }
}

async fn ensure_session_table(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session (
            id          INTEGER PRIMARY KEY CHECK (id = 1),
            dc_id       INTEGER NOT NULL,
            auth_key    BLOB NOT NULL,
            user_id     INTEGER,
            is_bot      INTEGER NOT NULL DEFAULT 0,
            test_mode   INTEGER NOT NULL DEFAULT 0,
            updated_at  TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to ensure session table exists")?;
    Ok(())
}
