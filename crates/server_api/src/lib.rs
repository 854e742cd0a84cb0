//! Operation surface over the session registry, as called by a transport layer.

use std::sync::Arc;

use session_core::{CoreError, SessionRegistry, SlotLogout};
use shared::{
    domain::{AccountIndex, ChatId, PeerId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        AccountSummary, ExportSummary, GroupSummary, LogoutResult, LogoutStatus, MediaLink,
        MessagePayload, PeerSummary, StartLoginResponse, VerifyResponse,
    },
};
use tracing::{error, info, warn};

pub mod config;
pub mod identity;

pub use identity::{
    authenticate, AuthenticatedUser, IdentityError, IdentityProvider, StaticIdentityProvider,
};

/// Upper bound on caller-supplied page and list sizes.
pub const MAX_LIST_LIMIT: usize = 500;

#[derive(Clone)]
pub struct ApiContext {
    pub registry: Arc<SessionRegistry>,
    pub identity: Arc<dyn IdentityProvider>,
}

impl ApiContext {
    pub async fn authenticate(&self, authorization: &str) -> Result<AuthenticatedUser, ApiError> {
        authenticate(self.identity.as_ref(), authorization).await
    }
}

pub async fn start_login(
    ctx: &ApiContext,
    user_id: &UserId,
    phone_number: &str,
) -> Result<StartLoginResponse, ApiError> {
    ctx.registry
        .start_login(user_id, phone_number)
        .await
        .map_err(api_error)
}

pub async fn verify_code(
    ctx: &ApiContext,
    user_id: &UserId,
    phone_number: &str,
    code: &str,
) -> Result<VerifyResponse, ApiError> {
    ctx.registry
        .verify_code(user_id, phone_number, code)
        .await
        .map_err(api_error)
}

pub async fn verify_password(
    ctx: &ApiContext,
    user_id: &UserId,
    phone_number: &str,
    password: &str,
) -> Result<VerifyResponse, ApiError> {
    ctx.registry
        .verify_password(user_id, phone_number, password)
        .await
        .map_err(api_error)
}

pub async fn list_accounts(
    ctx: &ApiContext,
    user_id: &UserId,
) -> Result<Vec<AccountSummary>, ApiError> {
    ctx.registry.list_accounts(user_id).await.map_err(api_error)
}

pub async fn list_private_chats(
    ctx: &ApiContext,
    user_id: &UserId,
    index: AccountIndex,
    limit: usize,
) -> Result<Vec<PeerSummary>, ApiError> {
    ensure_limit(limit)?;
    ctx.registry
        .list_private_peers(user_id, index, limit)
        .await
        .map_err(api_error)
}

pub async fn list_groups(
    ctx: &ApiContext,
    user_id: &UserId,
    index: AccountIndex,
    limit: usize,
) -> Result<Vec<GroupSummary>, ApiError> {
    ensure_limit(limit)?;
    ctx.registry
        .list_groups(user_id, index, limit)
        .await
        .map_err(api_error)
}

pub async fn get_messages(
    ctx: &ApiContext,
    user_id: &UserId,
    index: AccountIndex,
    chat_id: ChatId,
    limit: usize,
    offset: usize,
) -> Result<Vec<MessagePayload>, ApiError> {
    ensure_limit(limit)?;
    ctx.registry
        .get_messages(user_id, index, chat_id, limit, offset)
        .await
        .map_err(api_error)
}

pub async fn export_messages(
    ctx: &ApiContext,
    user_id: &UserId,
    index: AccountIndex,
    chat_id: ChatId,
) -> Result<ExportSummary, ApiError> {
    ctx.registry
        .export_messages(user_id, index, chat_id)
        .await
        .map_err(api_error)
}

pub async fn download_media(
    ctx: &ApiContext,
    user_id: &UserId,
    index: AccountIndex,
    file_id: &str,
) -> Result<MediaLink, ApiError> {
    ctx.registry
        .download_media(user_id, index, file_id)
        .await
        .map_err(api_error)
}

pub async fn download_peer_avatar(
    ctx: &ApiContext,
    user_id: &UserId,
    index: AccountIndex,
    peer_id: PeerId,
) -> Result<Option<String>, ApiError> {
    ctx.registry
        .download_peer_avatar(user_id, index, peer_id)
        .await
        .map_err(api_error)
}

pub async fn logout_one(
    ctx: &ApiContext,
    user_id: &UserId,
    index: AccountIndex,
) -> Result<LogoutResult, ApiError> {
    let status = ctx
        .registry
        .logout_one(user_id, index)
        .await
        .map_err(api_error)?;
    Ok(LogoutResult {
        index,
        status,
        error: None,
    })
}

/// Per-slot results; a slot that failed is reported as `failed` with its error
/// instead of failing the whole call.
pub async fn logout_all(ctx: &ApiContext, user_id: &UserId) -> Result<Vec<LogoutResult>, ApiError> {
    let results = ctx.registry.logout_all(user_id).await.map_err(api_error)?;
    let results: Vec<LogoutResult> = results.into_iter().map(logout_result).collect();
    info!(
        user_id = %user_id,
        slots = results.len(),
        failed = results.iter().filter(|r| r.status == LogoutStatus::Failed).count(),
        "bulk logout finished"
    );
    Ok(results)
}

fn logout_result(slot: SlotLogout) -> LogoutResult {
    match slot.outcome {
        Ok(status) => LogoutResult {
            index: slot.index,
            status,
            error: None,
        },
        Err(err) => LogoutResult {
            index: slot.index,
            status: LogoutStatus::Failed,
            error: Some(api_error(err)),
        },
    }
}

fn ensure_limit(limit: usize) -> Result<(), ApiError> {
    if limit > MAX_LIST_LIMIT {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("limit must not exceed {MAX_LIST_LIMIT}"),
        ));
    }
    Ok(())
}

/// Maps a core failure onto the wire taxonomy. Storage details are logged and
/// withheld from the caller.
pub fn api_error(err: CoreError) -> ApiError {
    let code = err.code();
    match err {
        CoreError::RateLimited { retry_after_secs } => {
            ApiError::new(code, "rate limited by upstream, retry later")
                .with_retry_after(retry_after_secs)
        }
        CoreError::Storage(source) => {
            error!(error = %format!("{source:#}"), "storage failure");
            ApiError::new(code, "internal storage error")
        }
        CoreError::SessionInvalid(_) => {
            warn!(error = %err, "linked account session is no longer valid");
            ApiError::new(code, err.to_string())
        }
        other => ApiError::new(code, other.to_string()),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
