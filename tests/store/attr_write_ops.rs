use super::common::{root_auth, user_auth, Fixture};

use dittofs_store::error::StoreError;
use dittofs_store::handle::FileHandle;
use dittofs_store::model::{ServerSettings, SetAttributes, Timestamp};
use dittofs_store::store::MetadataStore;

#[tokio::test]
async fn owner_may_chmod_and_ctime_is_stamped() {
    let (fixture, root) = Fixture::with_root("export").await;
    let owner = user_auth(1000, 100);
    let (handle, before) = fixture.mkfile(&owner, &root, "a.txt").await;

    let updated = fixture
        .store
        .set_attributes(
            &fixture.cancel,
            &owner,
            &handle,
            SetAttributes { mode: Some(0o600), ..Default::default() },
        )
        .await
        .expect("chmod");
    assert_eq!(updated.mode, 0o600);
    assert!(updated.ctime > before.ctime);
}

#[tokio::test]
async fn non_owners_cannot_change_mode_or_ownership() {
    let (fixture, root) = Fixture::with_root("export").await;
    let owner = user_auth(1000, 100);
    let (handle, _) = fixture.mkfile(&owner, &root, "a.txt").await;

    for changes in [
        SetAttributes { mode: Some(0o777), ..Default::default() },
        SetAttributes { uid: Some(2000), ..Default::default() },
        SetAttributes { gid: Some(2000), ..Default::default() },
    ] {
        let err = fixture
            .store
            .set_attributes(&fixture.cancel, &user_auth(2000, 200), &handle, changes)
            .await
            .expect_err("non-owner attr change");
        assert!(matches!(err, StoreError::AccessDenied(_)));
    }

    // Root is exempt.
    fixture
        .store
        .set_attributes(
            &fixture.cancel,
            &root_auth(),
            &handle,
            SetAttributes { uid: Some(2000), ..Default::default() },
        )
        .await
        .expect("root chown");
}

#[tokio::test]
async fn truncation_requires_a_regular_file() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let dir = fixture.mkdir(&auth, &root, "sub").await;
    let err = fixture
        .store
        .set_attributes(
            &fixture.cancel,
            &auth,
            &dir,
            SetAttributes { size: Some(0), ..Default::default() },
        )
        .await
        .expect_err("truncate a directory");
    assert!(matches!(err, StoreError::InvalidArgument(_)));
}

#[tokio::test]
async fn truncation_updates_size_but_not_content_id() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = user_auth(1000, 100);
    let (handle, created) = fixture.mkfile(&auth, &root, "a.txt").await;

    let intent = fixture
        .store
        .prepare_write(&fixture.cancel, &auth, &handle, 1024)
        .await
        .expect("prepare");
    fixture.store.commit_write(&fixture.cancel, &auth, &intent).await.expect("commit");

    let truncated = fixture
        .store
        .set_attributes(
            &fixture.cancel,
            &auth,
            &handle,
            SetAttributes { size: Some(16), ..Default::default() },
        )
        .await
        .expect("truncate");
    assert_eq!(truncated.size, 16);
    assert_eq!(truncated.content_id, created.content_id);
}

#[tokio::test]
async fn explicit_times_can_be_set() {
    let (fixture, root) = Fixture::with_root("export").await;
    let owner = user_auth(1000, 100);
    let (handle, _) = fixture.mkfile(&owner, &root, "a.txt").await;
    let stamp = Timestamp { seconds: 1_600_000_000, nanos: 0 };
    let updated = fixture
        .store
        .set_attributes(
            &fixture.cancel,
            &owner,
            &handle,
            SetAttributes { atime: Some(stamp), mtime: Some(stamp), ..Default::default() },
        )
        .await
        .expect("utimes");
    assert_eq!(updated.atime, stamp);
    assert_eq!(updated.mtime, stamp);
}

#[tokio::test]
async fn write_commits_are_max_monotone_and_replayable() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = user_auth(1000, 100);
    let (handle, created) = fixture.mkfile(&auth, &root, "a.txt").await;

    let large = fixture
        .store
        .prepare_write(&fixture.cancel, &auth, &handle, 4096)
        .await
        .expect("prepare large");
    assert_eq!(large.content_id, created.content_id);
    assert_eq!(large.before.size, 0);

    let small = fixture
        .store
        .prepare_write(&fixture.cancel, &auth, &handle, 512)
        .await
        .expect("prepare small");

    let after_large =
        fixture.store.commit_write(&fixture.cancel, &auth, &large).await.expect("commit large");
    assert_eq!(after_large.size, 4096);

    // The out-of-order smaller commit must not shrink the file.
    let after_small =
        fixture.store.commit_write(&fixture.cancel, &auth, &small).await.expect("commit small");
    assert_eq!(after_small.size, 4096);

    // Replay is idempotent on size.
    let replay =
        fixture.store.commit_write(&fixture.cancel, &auth, &large).await.expect("replay");
    assert_eq!(replay.size, 4096);
}

#[tokio::test]
async fn write_preparation_enforces_permissions_and_type() {
    let (fixture, root) = Fixture::with_root("export").await;
    let owner = user_auth(1000, 100);
    let (handle, _) = fixture.mkfile(&owner, &root, "a.txt").await;
    let dir = fixture.mkdir(&root_auth(), &root, "sub").await;

    let err = fixture
        .store
        .prepare_write(&fixture.cancel, &user_auth(2000, 200), &handle, 10)
        .await
        .expect_err("no write permission");
    assert!(matches!(err, StoreError::AccessDenied(_)));

    let err = fixture
        .store
        .prepare_write(&fixture.cancel, &root_auth(), &dir, 10)
        .await
        .expect_err("directory write");
    assert!(matches!(err, StoreError::IsDirectory { .. }));
}

#[tokio::test]
async fn read_preparation_returns_the_content_pointer() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = user_auth(1000, 100);
    let (handle, created) = fixture.mkfile(&auth, &root, "a.txt").await;
    let plan =
        fixture.store.prepare_read(&fixture.cancel, &auth, &handle).await.expect("prepare read");
    assert_eq!(plan.content_id, created.content_id);

    let dir = fixture.mkdir(&root_auth(), &root, "sub").await;
    let err = fixture
        .store
        .prepare_read(&fixture.cancel, &auth, &dir)
        .await
        .expect_err("directory read");
    assert!(matches!(err, StoreError::IsDirectory { .. }));
}

#[tokio::test]
async fn malformed_handles_are_rejected() {
    let fixture = Fixture::new().await;
    let bogus = FileHandle::from_bytes(vec![0x07, 0x00]);
    let err = fixture.store.get_file(&fixture.cancel, &bogus).await.expect_err("bad handle");
    assert!(matches!(err, StoreError::InvalidHandle(_)));
}

#[tokio::test]
async fn statistics_track_usage_and_capabilities_are_static() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = user_auth(1000, 100);
    let (handle, _) = fixture.mkfile(&auth, &root, "a.txt").await;
    let intent =
        fixture.store.prepare_write(&fixture.cancel, &auth, &handle, 2048).await.expect("prep");
    fixture.store.commit_write(&fixture.cancel, &auth, &intent).await.expect("commit");

    let stats = fixture
        .store
        .filesystem_statistics(&fixture.cancel, &root)
        .await
        .expect("statistics");
    assert_eq!(stats.used_files, 2); // root plus the file
    assert_eq!(stats.used_bytes, 2048);
    assert_eq!(stats.available_bytes, stats.total_bytes - 2048);

    let caps = fixture
        .store
        .filesystem_capabilities(&fixture.cancel, &root)
        .await
        .expect("capabilities");
    assert_eq!(caps.max_name_length, 255);
    assert!(caps.max_read_size >= 64 * 1024);
}

#[tokio::test]
async fn server_settings_round_trip_last_writer_wins() {
    let fixture = Fixture::new().await;
    assert!(fixture.store.server_config(&fixture.cancel).await.expect("empty").is_empty());

    let mut first = ServerSettings::new();
    first.insert("lease_seconds".into(), "90".into());
    first.insert("grace_seconds".into(), "30".into());
    fixture.store.set_server_config(&fixture.cancel, first.clone()).await.expect("set");
    assert_eq!(fixture.store.server_config(&fixture.cancel).await.expect("get"), first);

    let mut second = ServerSettings::new();
    second.insert("lease_seconds".into(), "120".into());
    fixture.store.set_server_config(&fixture.cancel, second.clone()).await.expect("replace");
    assert_eq!(fixture.store.server_config(&fixture.cancel).await.expect("get"), second);
}

#[tokio::test]
async fn cancelled_tokens_abort_operations() {
    let (fixture, root) = Fixture::with_root("export").await;
    fixture.cancel.cancel();
    let err = fixture
        .store
        .get_file(&fixture.cancel, &root)
        .await
        .expect_err("cancelled");
    assert!(matches!(err, StoreError::Cancelled));
}
