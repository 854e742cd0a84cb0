use super::*;
use crate::fixture::{ada, bob, Fixture, OTHER_PHONE, PHONE};
use crate::testing::photo;
use shared::domain::MediaNamespace;

async fn seed_cache(fixture: &Fixture, slot: &SlotKey) {
    let layout = fixture.registry.media_layout();
    for namespace in MediaNamespace::ALL {
        storage::write_atomic(&layout.path_for(namespace, slot, "seed.bin"), b"cached")
            .await
            .expect("seed cache");
    }
}

fn assert_cache_cleared(fixture: &Fixture, slot: &SlotKey) {
    let layout = fixture.registry.media_layout();
    for namespace in MediaNamespace::ALL {
        let dir = layout.slot_dir(namespace, slot);
        assert!(!dir.exists(), "{} still present", dir.display());
    }
}

#[tokio::test]
async fn live_logout_revokes_and_clears_local_state() {
    let fixture = Fixture::new();
    let mut account = ada();
    account.user.photo = Some(photo("ada-small", "ada-big"));
    fixture.remote.add_account(PHONE, account);
    fixture.remote.put_media("ada-big", b"big");
    let slot = fixture.link(PHONE).await;
    fixture
        .registry
        .get_own_profile(&fixture.user, slot.index)
        .await
        .expect("profile");
    let avatars = fixture
        .registry
        .media_layout()
        .slot_dir(MediaNamespace::Avatar, &slot);
    assert!(avatars.is_dir());

    let status = fixture
        .registry
        .logout_one(&fixture.user, slot.index)
        .await
        .expect("logout");

    assert_eq!(status, LogoutStatus::LoggedOut);
    assert!(fixture.remote.is_revoked(101));
    assert_eq!(fixture.remote.log_outs(), 1);
    assert_eq!(fixture.remote.open_connections(), 0);
    assert!(!fixture.registry.pool().is_live(&slot).await);
    assert!(!avatars.exists());
    assert!(!fixture
        .registry
        .directory()
        .slot_exists(&slot)
        .await
        .expect("exists"));

    fixture.remote.add_account(OTHER_PHONE, bob());
    let next = fixture.link(OTHER_PHONE).await;
    assert_eq!(next.index, AccountIndex(2));
}

#[tokio::test]
async fn logout_reconnects_a_slot_that_is_not_live() {
    let fixture = Fixture::new();
    fixture.remote.add_account(PHONE, ada());
    let slot = fixture.link(PHONE).await;
    let connects = fixture.remote.connects();

    let status = fixture
        .registry
        .logout_one(&fixture.user, slot.index)
        .await
        .expect("logout");

    assert_eq!(status, LogoutStatus::LoggedOut);
    assert_eq!(fixture.remote.connects(), connects + 1);
    assert_eq!(fixture.remote.open_connections(), 0);
}

#[tokio::test]
async fn logout_reconnects_past_a_dropped_pooled_client() {
    let fixture = Fixture::new();
    fixture.remote.add_account(PHONE, ada());
    let slot = fixture.link(PHONE).await;
    let stale = fixture
        .registry
        .pool()
        .get_or_start(&slot)
        .await
        .expect("client");
    stale.disconnect().await.expect("drop transport");

    let status = fixture
        .registry
        .logout_one(&fixture.user, slot.index)
        .await
        .expect("logout");

    assert_eq!(status, LogoutStatus::LoggedOut);
    assert!(fixture.remote.is_revoked(101));
    assert_eq!(fixture.remote.open_connections(), 0);
}

#[tokio::test]
async fn failed_remote_logout_still_removes_the_file() {
    let fixture = Fixture::new();
    fixture.remote.add_account(PHONE, ada());
    let slot = fixture.link(PHONE).await;
    seed_cache(&fixture, &slot).await;
    fixture.remote.set_fail_log_out(true);

    let status = fixture
        .registry
        .logout_one(&fixture.user, slot.index)
        .await
        .expect("logout");

    assert_eq!(status, LogoutStatus::FileRemovedOnly);
    assert!(!fixture.remote.is_revoked(101));
    assert_eq!(fixture.remote.open_connections(), 0);
    assert_cache_cleared(&fixture, &slot);
    assert!(!fixture
        .registry
        .directory()
        .slot_exists(&slot)
        .await
        .expect("exists"));
}

#[tokio::test]
async fn revoked_session_is_removed_locally() {
    let fixture = Fixture::new();
    fixture.remote.add_account(PHONE, ada());
    let slot = fixture.link(PHONE).await;
    seed_cache(&fixture, &slot).await;
    fixture.remote.revoke(101);

    let status = fixture
        .registry
        .logout_one(&fixture.user, slot.index)
        .await
        .expect("logout");
    assert_eq!(status, LogoutStatus::FileRemovedOnly);
    assert!(fixture
        .registry
        .list_slots(&fixture.user)
        .await
        .expect("slots")
        .is_empty());
    assert_cache_cleared(&fixture, &slot);
}

#[tokio::test]
async fn unknown_slot_reports_not_found() {
    let fixture = Fixture::new();
    let status = fixture
        .registry
        .logout_one(&fixture.user, AccountIndex(5))
        .await
        .expect("logout");
    assert_eq!(status, LogoutStatus::NotFound);

    let err = fixture
        .registry
        .logout_one(&fixture.user, AccountIndex(0))
        .await
        .expect_err("index zero");
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn logout_all_reports_each_slot() {
    let fixture = Fixture::new();
    fixture.remote.add_account(PHONE, ada());
    fixture.remote.add_account(OTHER_PHONE, bob());
    fixture.link(PHONE).await;
    fixture.link(OTHER_PHONE).await;
    fixture.remote.revoke(102);

    let results = fixture
        .registry
        .logout_all(&fixture.user)
        .await
        .expect("logout all");

    let statuses: Vec<_> = results
        .iter()
        .map(|result| {
            (
                result.index,
                *result.outcome.as_ref().expect("slot outcome"),
            )
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            (AccountIndex(1), LogoutStatus::LoggedOut),
            (AccountIndex(2), LogoutStatus::FileRemovedOnly),
        ]
    );
    assert!(fixture
        .registry
        .list_slots(&fixture.user)
        .await
        .expect("slots")
        .is_empty());
}

#[tokio::test]
async fn logout_all_without_slots_is_empty() {
    let fixture = Fixture::new();
    let results = fixture
        .registry
        .logout_all(&fixture.user)
        .await
        .expect("logout all");
    assert!(results.is_empty());
}

#[tokio::test]
async fn eviction_is_idempotent() {
    let fixture = Fixture::new();
    fixture.remote.add_account(PHONE, ada());
    let slot = fixture.link(PHONE).await;
    fixture
        .registry
        .pool()
        .get_or_start(&slot)
        .await
        .expect("client");

    fixture.registry.evict_slot(&slot).await.expect("first");
    fixture.registry.evict_slot(&slot).await.expect("second");

    assert!(!fixture.registry.pool().is_live(&slot).await);
    assert_eq!(fixture.remote.open_connections(), 0);
    assert_eq!(fixture.remote.log_outs(), 0);
    assert!(!fixture
        .registry
        .directory()
        .slot_exists(&slot)
        .await
        .expect("exists"));
}

#[tokio::test]
async fn logout_racing_a_lookup_leaves_no_live_client() {
    let fixture = Fixture::new();
    fixture.remote.add_account(PHONE, ada());
    let slot = fixture.link(PHONE).await;

    let (logout, lookup) = tokio::join!(
        fixture.registry.logout_one(&fixture.user, slot.index),
        fixture.registry.pool().get_or_start(&slot)
    );

    assert!(matches!(
        logout.expect("logout"),
        LogoutStatus::LoggedOut | LogoutStatus::FileRemovedOnly
    ));
    match lookup {
        Ok(_) => {}
        Err(err) => assert!(matches!(err, CoreError::NotFound(_))),
    }
    assert!(!fixture.registry.pool().is_live(&slot).await);
    assert_eq!(fixture.remote.open_connections(), 0);
    assert!(!fixture
        .registry
        .directory()
        .slot_exists(&slot)
        .await
        .expect("exists"));
}

#[tokio::test]
async fn remove_slot_skips_remote_revocation() {
    let fixture = Fixture::new();
    fixture.remote.add_account(PHONE, ada());
    let slot = fixture.link(PHONE).await;

    fixture
        .registry
        .remove_slot(&fixture.user, slot.index)
        .await
        .expect("remove");
    fixture
        .registry
        .remove_slot(&fixture.user, slot.index)
        .await
        .expect("remove again");

    assert!(!fixture.remote.is_revoked(101));
    assert!(fixture
        .registry
        .list_slots(&fixture.user)
        .await
        .expect("slots")
        .is_empty());
}
