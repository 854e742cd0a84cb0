use chrono::Utc;
use shared::domain::{AccountIndex, MediaNamespace, SlotKey, UserId};
use storage::{write_atomic, AccountDirectory, MediaLayout, PersistedSession};
use tempfile::TempDir;

#[tokio::test]
async fn persisted_slot_is_listed_then_fully_removed() {
    let sessions = TempDir::new().expect("sessions");
    let media = TempDir::new().expect("media");
    let directory = AccountDirectory::new(sessions.path());
    let layout = MediaLayout::new(media.path(), "/media");
    let user = UserId::from("user-7");

    let index = directory
        .allocate_next_index(&user)
        .await
        .expect("allocate");
    assert_eq!(index, AccountIndex(1));
    let slot = SlotKey::new(user.clone(), index);

    directory
        .session_file(&slot)
        .expect("session file")
        .save(&PersistedSession {
            dc_id: 4,
            auth_key: vec![1, 2, 3],
            remote_user_id: Some(99),
            is_bot: false,
            test_mode: true,
            updated_at: Utc::now(),
        })
        .await
        .expect("save");
    directory.mark_persisted(&slot).await.expect("mark");
    write_atomic(
        &layout.path_for(MediaNamespace::Avatar, &slot, "99.jpg"),
        b"jpeg",
    )
    .await
    .expect("avatar");

    assert_eq!(
        directory.list_slots(&user).await.expect("list"),
        vec![AccountIndex(1)]
    );

    assert!(directory.remove_session_file(&slot).await.expect("remove"));
    layout.purge_slot(&slot).await.expect("purge");

    assert!(directory.list_slots(&user).await.expect("list").is_empty());
    assert!(!layout.slot_dir(MediaNamespace::Avatar, &slot).exists());
    assert_eq!(
        directory
            .allocate_next_index(&user)
            .await
            .expect("allocate again"),
        AccountIndex(2)
    );
}
