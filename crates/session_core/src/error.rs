use std::{future::Future, time::Duration};

use futures::{Stream, StreamExt};
use shared::error::ErrorCode;
use thiserror::Error;

use crate::client::RemoteError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("verification code rejected or expired")]
    InvalidCode,
    #[error("password rejected, {attempts_remaining} attempt(s) remaining")]
    InvalidPassword { attempts_remaining: u32 },
    #[error("rate limited by upstream, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("upstream failure: {0}")]
    Remote(String),
    #[error("session is no longer authorized: {0}")]
    SessionInvalid(String),
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::Validation,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::InvalidCode => ErrorCode::InvalidCode,
            Self::InvalidPassword { .. } => ErrorCode::InvalidPassword,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::Remote(_) => ErrorCode::RemoteError,
            Self::SessionInvalid(_) => ErrorCode::SessionInvalid,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Storage(_) => ErrorCode::Internal,
        }
    }

    pub fn is_session_invalid(&self) -> bool {
        matches!(self, Self::SessionInvalid(_))
    }
}

const VALIDATION_ERRORS: [&str; 3] = [
    "PHONE_NUMBER_INVALID",
    "PHONE_NUMBER_BANNED",
    "PHONE_NUMBER_UNOCCUPIED",
];
const CODE_ERRORS: [&str; 3] = ["PHONE_CODE_INVALID", "PHONE_CODE_EXPIRED", "PHONE_CODE_EMPTY"];
const NOT_FOUND_ERRORS: [&str; 5] = [
    "PEER_ID_INVALID",
    "CHAT_ID_INVALID",
    "CHANNEL_INVALID",
    "CHANNEL_PRIVATE",
    "USERNAME_NOT_OCCUPIED",
];
const SESSION_ERRORS: [&str; 6] = [
    "AUTH_KEY_UNREGISTERED",
    "AUTH_KEY_INVALID",
    "AUTH_KEY_DUPLICATED",
    "SESSION_REVOKED",
    "SESSION_EXPIRED",
    "USER_DEACTIVATED*",
];

/// Maps an upstream failure onto the closed error taxonomy.
pub fn classify(err: RemoteError) -> CoreError {
    let RemoteError::Rpc(rpc) = &err else {
        return CoreError::Remote(err.to_string());
    };
    if let Some(retry_after_secs) = rpc.wait_seconds() {
        return CoreError::RateLimited { retry_after_secs };
    }
    let matches_any = |names: &[&str]| names.iter().any(|name| rpc.is(name));
    if matches_any(&VALIDATION_ERRORS) {
        CoreError::Validation(rpc.name.to_ascii_lowercase().replace('_', " "))
    } else if matches_any(&CODE_ERRORS) {
        CoreError::InvalidCode
    } else if rpc.is("PASSWORD_HASH_INVALID") {
        CoreError::InvalidPassword {
            attempts_remaining: 0,
        }
    } else if matches_any(&NOT_FOUND_ERRORS) {
        CoreError::NotFound(format!("peer ({})", rpc.name))
    } else if matches_any(&SESSION_ERRORS) || rpc.code == 401 {
        CoreError::SessionInvalid(rpc.name.clone())
    } else {
        CoreError::Remote(rpc.to_string())
    }
}

/// Awaits `fut` under `limit`, keeping the raw upstream error for callers that
/// need to inspect it before classification.
pub(crate) async fn with_timeout<T, F>(
    operation: &'static str,
    limit: Duration,
    fut: F,
) -> Result<Result<T, RemoteError>, CoreError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| CoreError::Timeout {
            operation,
            after: limit,
        })
}

/// Awaits a remote call under `limit` and classifies its failure.
pub(crate) async fn remote<T, F>(operation: &'static str, limit: Duration, fut: F) -> Result<T, CoreError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    with_timeout(operation, limit, fut).await?.map_err(classify)
}

/// Pulls the next stream item with a per-item deadline.
pub(crate) async fn next_remote<T, S>(
    operation: &'static str,
    limit: Duration,
    stream: &mut S,
) -> Result<Option<T>, CoreError>
where
    S: Stream<Item = Result<T, RemoteError>> + Unpin,
{
    match tokio::time::timeout(limit, stream.next()).await {
        Ok(Some(item)) => item.map(Some).map_err(classify),
        Ok(None) => Ok(None),
        Err(_) => Err(CoreError::Timeout {
            operation,
            after: limit,
        }),
    }
}
