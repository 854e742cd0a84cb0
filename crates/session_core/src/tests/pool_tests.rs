use super::*;
use crate::fixture::{ada, Fixture, PHONE};
use chrono::Utc;
use shared::domain::{AccountIndex, UserId};
use storage::PersistedSession;

fn client_addr(client: &Arc<dyn SessionClient>) -> *const () {
    Arc::as_ptr(client) as *const ()
}

#[tokio::test]
async fn concurrent_lookups_share_one_connection() {
    let fixture = Fixture::new();
    fixture.remote.add_account(PHONE, ada());
    let slot = fixture.link(PHONE).await;
    fixture
        .remote
        .set_connect_delay(Some(Duration::from_millis(50)));
    let connects_before = fixture.remote.connects();

    let pool = fixture.registry.pool();
    let clients = futures::future::join_all((0..8).map(|_| pool.get_or_start(&slot))).await;
    let clients: Vec<_> = clients
        .into_iter()
        .map(|client| client.expect("client"))
        .collect();

    assert_eq!(fixture.remote.connects() - connects_before, 1);
    assert!(clients
        .iter()
        .all(|client| client_addr(client) == client_addr(&clients[0])));
    assert_eq!(fixture.remote.max_open_per_file(), 1);
    assert_eq!(pool.live_count().await, 1);
}

#[tokio::test]
async fn missing_slot_is_not_found_without_connecting() {
    let fixture = Fixture::new();
    let slot = SlotKey::new(UserId::from("u1"), AccountIndex(3));

    let err = fixture
        .registry
        .pool()
        .get_or_start(&slot)
        .await
        .err()
        .expect("missing slot");
    assert!(matches!(err, CoreError::NotFound(_)));
    assert_eq!(fixture.remote.connects(), 0);
}

#[tokio::test]
async fn unauthorized_session_file_is_never_admitted() {
    let fixture = Fixture::new();
    let slot = SlotKey::new(fixture.user.clone(), AccountIndex(1));
    fixture
        .registry
        .directory()
        .session_file(&slot)
        .expect("session file")
        .save(&PersistedSession {
            dc_id: 2,
            auth_key: vec![1; 8],
            remote_user_id: None,
            is_bot: false,
            test_mode: true,
            updated_at: Utc::now(),
        })
        .await
        .expect("save");

    let pool = fixture.registry.pool();
    let err = pool.get_or_start(&slot).await.err().expect("unauthorized");
    assert!(matches!(err, CoreError::SessionInvalid(_)));
    assert!(!pool.is_live(&slot).await);
    assert_eq!(fixture.remote.open_connections(), 0);
}

#[tokio::test]
async fn release_disconnects_and_next_lookup_reconnects() {
    let fixture = Fixture::new();
    fixture.remote.add_account(PHONE, ada());
    let slot = fixture.link(PHONE).await;
    let pool = fixture.registry.pool();

    pool.get_or_start(&slot).await.expect("first");
    assert!(pool.release(&slot).await);
    assert!(!pool.release(&slot).await);
    assert_eq!(fixture.remote.open_connections(), 0);

    let connects_before = fixture.remote.connects();
    pool.get_or_start(&slot).await.expect("second");
    assert_eq!(fixture.remote.connects() - connects_before, 1);
}

#[tokio::test]
async fn dropped_transport_is_replaced_on_next_use() {
    let fixture = Fixture::new();
    fixture.remote.add_account(PHONE, ada());
    let slot = fixture.link(PHONE).await;
    let pool = fixture.registry.pool();

    let stale = pool.get_or_start(&slot).await.expect("client");
    stale.disconnect().await.expect("drop transport");
    assert!(pool.is_live(&slot).await);
    let connects_before = fixture.remote.connects();

    for _ in 0..3 {
        fixture
            .registry
            .list_private_peers(&fixture.user, slot.index, 10)
            .await
            .expect("peers after reconnect");
    }

    assert_eq!(fixture.remote.connects() - connects_before, 1);
    let fresh = pool.get_or_start(&slot).await.expect("fresh client");
    assert!(fresh.is_connected());
    assert_ne!(client_addr(&fresh), client_addr(&stale));
    assert_eq!(fixture.remote.open_connections(), 1);
}

#[tokio::test]
async fn connect_timeout_leaves_no_entry() {
    let fixture = Fixture::with_config(|config| {
        config.connect_timeout = Duration::from_millis(100);
    });
    fixture.remote.add_account(PHONE, ada());
    let slot = fixture.link(PHONE).await;
    fixture.remote.set_connect_delay(Some(Duration::from_secs(2)));

    let pool = fixture.registry.pool();
    let err = pool.get_or_start(&slot).await.err().expect("timeout");
    assert!(matches!(
        err,
        CoreError::Timeout {
            operation: "connect",
            ..
        }
    ));
    assert!(!pool.is_live(&slot).await);
}

#[tokio::test]
async fn registry_shutdown_disconnects_clients_and_cancels_logins() {
    let fixture = Fixture::new();
    fixture.remote.add_account(PHONE, ada());
    fixture
        .remote
        .add_account(crate::fixture::OTHER_PHONE, crate::fixture::bob());
    let slot = fixture.link(PHONE).await;
    fixture
        .registry
        .pool()
        .get_or_start(&slot)
        .await
        .expect("client");
    fixture
        .registry
        .start_login(&fixture.user, crate::fixture::OTHER_PHONE)
        .await
        .expect("pending login");
    assert_eq!(fixture.remote.open_connections(), 2);

    fixture.registry.shutdown().await;

    assert_eq!(fixture.remote.open_connections(), 0);
    assert_eq!(fixture.registry.pending_handshakes().await, 0);
    assert_eq!(fixture.registry.pool().live_count().await, 0);
}
