use std::time::Duration;

use session_core::testing::{self, FakeAccount, FakeRemote};
use tempfile::TempDir;

use super::*;

const PHONE: &str = "+15550100";
const CODE: &str = "11111";

fn context(root: &TempDir, remote: &Arc<FakeRemote>) -> ApiContext {
    ApiContext {
        registry: testing::registry(remote, testing::test_config(root.path())),
        identity: Arc::new(StaticIdentityProvider::new().with_token("token", "u1")),
    }
}

#[test]
fn rate_limits_carry_the_retry_hint() {
    let err = api_error(CoreError::RateLimited {
        retry_after_secs: 42,
    });
    assert_eq!(err.code, ErrorCode::RateLimited);
    assert_eq!(err.retry_after_secs, Some(42));
}

#[test]
fn storage_details_are_withheld() {
    let err = api_error(CoreError::Storage(anyhow::anyhow!(
        "disk full at /var/lib/sessions/u1/1.session"
    )));
    assert_eq!(err.code, ErrorCode::Internal);
    assert!(!err.message.contains("/var/lib"));
}

#[test]
fn core_errors_keep_their_codes() {
    let cases = [
        (CoreError::Validation("phone".into()), ErrorCode::Validation),
        (CoreError::NotFound("chat 1".into()), ErrorCode::NotFound),
        (CoreError::InvalidCode, ErrorCode::InvalidCode),
        (
            CoreError::InvalidPassword {
                attempts_remaining: 2,
            },
            ErrorCode::InvalidPassword,
        ),
        (
            CoreError::SessionInvalid("AUTH_KEY_UNREGISTERED".into()),
            ErrorCode::SessionInvalid,
        ),
        (
            CoreError::Timeout {
                operation: "connect",
                after: Duration::from_secs(30),
            },
            ErrorCode::Timeout,
        ),
    ];
    for (core, code) in cases {
        let err = api_error(core);
        assert_eq!(err.code, code);
        assert_eq!(err.retry_after_secs, None);
    }
}

#[test]
fn failed_bulk_slots_report_their_error() {
    let ok = logout_result(SlotLogout {
        index: AccountIndex(1),
        outcome: Ok(LogoutStatus::LoggedOut),
    });
    assert_eq!(ok.status, LogoutStatus::LoggedOut);
    assert!(ok.error.is_none());

    let failed = logout_result(SlotLogout {
        index: AccountIndex(2),
        outcome: Err(CoreError::Remote("connection reset".into())),
    });
    assert_eq!(failed.status, LogoutStatus::Failed);
    assert_eq!(
        failed.error.map(|err| err.code),
        Some(ErrorCode::RemoteError)
    );
}

#[tokio::test]
async fn oversized_limits_are_rejected_before_any_remote_call() {
    let root = TempDir::new().expect("tempdir");
    let remote = FakeRemote::new();
    let ctx = context(&root, &remote);

    let err = get_messages(
        &ctx,
        &UserId::from("u1"),
        AccountIndex(1),
        ChatId(1),
        MAX_LIST_LIMIT + 1,
        0,
    )
    .await
    .expect_err("too large");
    assert_eq!(err.code, ErrorCode::Validation);
    assert_eq!(remote.connects(), 0);
}

#[tokio::test]
async fn single_logout_wraps_the_status() {
    let root = TempDir::new().expect("tempdir");
    let remote = FakeRemote::new();
    remote.add_account(
        PHONE,
        FakeAccount::new(testing::remote_user(7, "Grace", None), CODE),
    );
    let ctx = context(&root, &remote);
    let user = ctx.authenticate("Bearer token").await.expect("auth").user_id;
    let index = testing::link_account(&ctx.registry, &user, PHONE, CODE)
        .await
        .expect("link");

    let result = logout_one(&ctx, &user, index).await.expect("logout");
    assert_eq!(result.index, index);
    assert_eq!(result.status, LogoutStatus::LoggedOut);

    let again = logout_one(&ctx, &user, index).await.expect("logout again");
    assert_eq!(again.status, LogoutStatus::NotFound);
}
