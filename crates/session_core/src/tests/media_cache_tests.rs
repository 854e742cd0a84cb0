use super::*;
use crate::fixture::{ada, Fixture, PHONE};
use shared::domain::{AccountIndex, UserId};

#[tokio::test]
async fn concurrent_misses_download_once() {
    let fixture = Fixture::new();
    fixture.remote.add_account(PHONE, ada());
    fixture.remote.put_media("photo-small", b"jpeg-bytes");
    let slot = fixture.link(PHONE).await;
    let client = fixture
        .registry
        .pool()
        .get_or_start(&slot)
        .await
        .expect("client");
    fixture
        .remote
        .set_download_delay(Some(Duration::from_millis(50)));

    let cache = &fixture.registry.cache;
    let results = futures::future::join_all((0..5).map(|_| {
        cache.ensure_downloaded(&slot, CacheKey::Avatar(42), client.as_ref(), "photo-small")
    }))
    .await;

    assert_eq!(fixture.remote.downloads(), 1);
    let first = results[0].as_ref().expect("cached");
    assert!(results
        .iter()
        .all(|result| result.as_ref().expect("cached") == first));
    assert_eq!(first.url, "/media/avatars/u1/1/42.jpg");
    assert_eq!(
        tokio::fs::read(&first.path).await.expect("read"),
        b"jpeg-bytes"
    );

    cache
        .ensure_downloaded(&slot, CacheKey::Avatar(42), client.as_ref(), "photo-small")
        .await
        .expect("hit");
    assert_eq!(fixture.remote.downloads(), 1);
}

#[tokio::test]
async fn failed_download_leaves_nothing_behind() {
    let fixture = Fixture::new();
    fixture.remote.add_account(PHONE, ada());
    let slot = fixture.link(PHONE).await;
    let client = fixture
        .registry
        .pool()
        .get_or_start(&slot)
        .await
        .expect("client");
    let cache = &fixture.registry.cache;

    let err = cache
        .ensure_downloaded(
            &slot,
            CacheKey::Attachment("missing"),
            client.as_ref(),
            "missing",
        )
        .await
        .err()
        .expect("download fails");
    assert!(matches!(err, CoreError::Remote(_)));

    let dir = cache.layout().slot_dir(MediaNamespace::Attachment, &slot);
    assert!(!dir.exists() || std::fs::read_dir(&dir).expect("dir").next().is_none());
}

#[tokio::test]
async fn fetch_runs_only_when_entry_is_missing() {
    let fixture = Fixture::new();
    let slot = SlotKey::new(UserId::from("u1"), AccountIndex(1));
    let cache = &fixture.registry.cache;

    let first = cache
        .ensure_with(MediaNamespace::Thumbnail, &slot, "9.jpg", || async {
            Ok(b"thumb".to_vec())
        })
        .await
        .expect("first");
    let second = cache
        .ensure_with(MediaNamespace::Thumbnail, &slot, "9.jpg", || async {
            Err(CoreError::Remote("must not be called".into()))
        })
        .await
        .expect("second");
    assert_eq!(first, second);
}

#[test]
fn cache_keys_map_to_namespaced_file_names() {
    let layout = MediaLayout::new("/srv/media", "/media");
    let cache = MediaCache::new(layout, Arc::new(KeyedLocks::new()), Duration::from_secs(1));
    let slot = SlotKey::new(UserId::from("u1"), AccountIndex(2));

    let thumb = cache.locate(
        &slot,
        CacheKey::Thumbnail {
            chat_id: ChatId(-100),
            message_id: MessageId(5),
        },
    );
    assert_eq!(thumb.url, "/media/thumbs/u1/2/-100_5.jpg");

    let attachment = cache.locate(&slot, CacheKey::Attachment("AgAD/../x"));
    assert_eq!(attachment.url, "/media/messages/u1/2/AgAD____x");
}

#[tokio::test]
async fn exports_are_written_under_the_export_namespace() {
    let fixture = Fixture::new();
    let slot = SlotKey::new(UserId::from("u1"), AccountIndex(1));

    let stored = fixture
        .registry
        .cache
        .store_export(&slot, "../7_20260101T000000.json", b"[]")
        .await
        .expect("export");
    assert_eq!(stored.url, "/media/exports/u1/1/___7_20260101T000000.json");
    assert!(stored.path.starts_with(fixture.root.path()));
}
