use super::*;
use crate::fixture::{ada, Fixture, PHONE};
use crate::testing::{dialog, photo, private_chat, remote_user, text_message, FakeAccount};
use shared::domain::{ChatKind, MediaKind, MessageId};

const ZED: i64 = 300;

fn zed() -> RemoteUser {
    RemoteUser {
        photo: Some(photo("zed-small", "zed-big")),
        ..remote_user(ZED, "Zed", Some("zed"))
    }
}

/// Ten messages, newest first, alternating outgoing (even ids) and incoming.
fn history() -> Vec<RemoteMessage> {
    (1..=10)
        .rev()
        .map(|id| text_message(id, &format!("message {id}"), id % 2 == 0))
        .collect()
}

fn account_with(history: Vec<RemoteMessage>) -> FakeAccount {
    ada().with_dialog(dialog(private_chat(&zed()), 7, 9), history)
}

fn document_message(id: i64) -> RemoteMessage {
    RemoteMessage {
        from_user: Some(zed()),
        text: None,
        caption: Some("the report".into()),
        media: Some(RemoteMedia {
            kind: MediaKind::Document,
            file_id: "doc-1".into(),
            file_name: Some("report.pdf".into()),
            mime_type: Some("application/pdf".into()),
            file_size: Some(1536),
            duration_secs: None,
            waveform: None,
            thumb_file_id: Some("thumb-1".into()),
        }),
        ..text_message(id, "", false)
    }
}

#[tokio::test]
async fn pages_with_offset_pull_only_what_they_return() {
    let fixture = Fixture::new();
    fixture.remote.add_account(PHONE, account_with(history()));
    let slot = fixture.link(PHONE).await;

    let page = fixture
        .registry
        .get_messages(&fixture.user, slot.index, ChatId(ZED), 3, 2)
        .await
        .expect("page");

    let ids: Vec<_> = page.iter().map(|message| message.id).collect();
    assert_eq!(ids, vec![MessageId(8), MessageId(7), MessageId(6)]);
    assert_eq!(fixture.remote.history_pulled(), 5);
    assert!(page.iter().all(|message| message.chat_id == ChatId(ZED)));
    assert!(page
        .iter()
        .all(|message| message.chat_type == ChatKind::Private));
}

#[tokio::test]
async fn read_state_follows_the_dialog_watermarks() {
    let fixture = Fixture::new();
    fixture.remote.add_account(PHONE, account_with(history()));
    let slot = fixture.link(PHONE).await;

    let page = fixture
        .registry
        .get_messages(&fixture.user, slot.index, ChatId(ZED), 4, 0)
        .await
        .expect("page");

    let read: Vec<_> = page
        .iter()
        .map(|message| (message.id.0, message.is_outgoing, message.is_read))
        .collect();
    assert_eq!(
        read,
        vec![
            (10, true, false),
            (9, false, false),
            (8, true, true),
            (7, false, true),
        ]
    );
}

#[tokio::test]
async fn short_history_returns_a_short_page() {
    let fixture = Fixture::new();
    fixture.remote.add_account(PHONE, account_with(history()));
    let slot = fixture.link(PHONE).await;

    let page = fixture
        .registry
        .get_messages(&fixture.user, slot.index, ChatId(ZED), 50, 8)
        .await
        .expect("page");
    assert_eq!(page.len(), 2);

    let empty = fixture
        .registry
        .get_messages(&fixture.user, slot.index, ChatId(ZED), 0, 0)
        .await
        .expect("zero limit");
    assert!(empty.is_empty());
}

#[tokio::test]
async fn unknown_chat_is_not_found() {
    let fixture = Fixture::new();
    fixture.remote.add_account(PHONE, account_with(history()));
    let slot = fixture.link(PHONE).await;

    let err = fixture
        .registry
        .get_messages(&fixture.user, slot.index, ChatId(999), 10, 0)
        .await
        .expect_err("unknown chat");
    assert!(matches!(err, CoreError::NotFound(_)));
    assert_eq!(fixture.remote.history_pulled(), 0);
}

#[tokio::test]
async fn media_messages_carry_descriptor_thumbnail_and_sender_avatar() {
    let fixture = Fixture::new();
    fixture
        .remote
        .add_account(PHONE, account_with(vec![document_message(5)]));
    fixture.remote.put_media("thumb-1", b"thumb");
    fixture.remote.put_media("zed-small", b"zed");
    let slot = fixture.link(PHONE).await;

    let page = fixture
        .registry
        .get_messages(&fixture.user, slot.index, ChatId(ZED), 10, 0)
        .await
        .expect("page");
    let message = &page[0];

    let media = message.media.as_ref().expect("media");
    assert_eq!(media.kind, MediaKind::Document);
    assert_eq!(media.size_bytes, Some(1536));
    assert_eq!(media.size_human.as_deref(), Some("1.5 KB"));
    assert_eq!(media.file_name.as_deref(), Some("report.pdf"));
    assert_eq!(message.caption.as_deref(), Some("the report"));
    assert_eq!(
        message.thumbnail_url.as_deref(),
        Some("/media/thumbs/u1/1/300_5.jpg")
    );
    let sender = message.from_user.as_ref().expect("sender");
    assert_eq!(sender.username.as_deref(), Some("zed"));
    assert_eq!(
        sender.avatar_url.as_deref(),
        Some("/media/avatars/u1/1/300.jpg")
    );
}

#[tokio::test]
async fn missing_thumbnail_degrades_to_none() {
    let fixture = Fixture::new();
    fixture
        .remote
        .add_account(PHONE, account_with(vec![document_message(5)]));
    let slot = fixture.link(PHONE).await;

    let page = fixture
        .registry
        .get_messages(&fixture.user, slot.index, ChatId(ZED), 10, 0)
        .await
        .expect("page");
    assert_eq!(page[0].thumbnail_url, None);
    assert!(page[0].from_user.as_ref().expect("sender").avatar_url.is_none());
}

#[tokio::test]
async fn export_writes_the_whole_history_as_json() {
    let fixture = Fixture::new();
    let mut messages = history();
    messages.insert(0, document_message(11));
    fixture.remote.add_account(PHONE, account_with(messages));
    let slot = fixture.link(PHONE).await;

    let summary = fixture
        .registry
        .export_messages(&fixture.user, slot.index, ChatId(ZED))
        .await
        .expect("export");

    assert_eq!(summary.count, 11);
    assert!(summary.url.starts_with("/media/exports/u1/1/300_"));
    assert!(summary.url.ends_with(".json"));
    let bytes = tokio::fs::read(&summary.path).await.expect("export file");
    let exported: Vec<ExportedMessage> = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(exported.len(), 11);
    assert_eq!(exported[0].from, "Zed");
    assert_eq!(exported[0].text, "the report");
    assert_eq!(exported[0].kind, "document");
    assert_eq!(exported[1].from, "unknown");
    assert_eq!(exported[1].text, "message 10");
    assert_eq!(exported[1].kind, "text");
}

#[tokio::test]
async fn attachments_are_downloaded_once() {
    let fixture = Fixture::new();
    fixture.remote.add_account(PHONE, account_with(Vec::new()));
    fixture.remote.put_media("AgAD-file", b"payload");
    let slot = fixture.link(PHONE).await;

    let first = fixture
        .registry
        .download_media(&fixture.user, slot.index, "AgAD-file")
        .await
        .expect("download");
    let second = fixture
        .registry
        .download_media(&fixture.user, slot.index, "AgAD-file")
        .await
        .expect("cached");

    assert_eq!(first, second);
    assert_eq!(first.url, "/media/messages/u1/1/AgAD-file");
    assert_eq!(fixture.remote.downloads(), 1);
    assert_eq!(
        tokio::fs::read(&first.path).await.expect("file"),
        b"payload"
    );

    let err = fixture
        .registry
        .download_media(&fixture.user, slot.index, " ")
        .await
        .expect_err("empty id");
    assert!(matches!(err, CoreError::Validation(_)));
}

#[test]
fn sizes_are_human_readable() {
    assert_eq!(human_size(0), "0 B");
    assert_eq!(human_size(512), "512 B");
    assert_eq!(human_size(1536), "1.5 KB");
    assert_eq!(human_size(3 * 1024 * 1024), "3.0 MB");
    assert_eq!(human_size(5 * 1024u64.pow(5)), "5120.0 TB");
}
