use super::common::{root_auth, user_auth, Fixture};

use dittofs_store::error::StoreError;
use dittofs_store::model::{CreateAttributes, FileType};
use dittofs_store::store::MetadataStore;

#[tokio::test]
async fn rename_moves_a_file_between_directories() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let dest = fixture.mkdir(&auth, &root, "dest").await;
    let (handle, _) = fixture.mkfile(&auth, &root, "old.txt").await;

    let outcome = fixture
        .store
        .rename(&fixture.cancel, &auth, &root, "old.txt", &dest, "new.txt")
        .await
        .expect("rename");
    assert!(outcome.replaced.is_none());

    let err = fixture
        .store
        .lookup(&fixture.cancel, &auth, &root, "old.txt")
        .await
        .expect_err("source gone");
    assert!(matches!(err, StoreError::NotFound { .. }));

    let (_, moved) =
        fixture.store.lookup(&fixture.cancel, &auth, &dest, "new.txt").await.expect("dest");
    assert_eq!(moved.path, "/dest/new.txt");

    // The old handle still addresses the moved file.
    let by_handle = fixture.store.get_file(&fixture.cancel, &handle).await.expect("by handle");
    assert_eq!(by_handle.path, "/dest/new.txt");
}

#[tokio::test]
async fn rename_onto_itself_is_a_no_op() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let (_, before) = fixture.mkfile(&auth, &root, "a.txt").await;

    let outcome = fixture
        .store
        .rename(&fixture.cancel, &auth, &root, "a.txt", &root, "a.txt")
        .await
        .expect("no-op rename");
    assert!(outcome.replaced.is_none());

    let (_, after) =
        fixture.store.lookup(&fixture.cancel, &auth, &root, "a.txt").await.expect("still there");
    assert_eq!(after, before);
}

#[tokio::test]
async fn rename_between_hard_links_of_the_same_file_changes_nothing() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let (handle, _) = fixture.mkfile(&auth, &root, "a.txt").await;
    fixture
        .store
        .create_hard_link(&fixture.cancel, &auth, &root, "b.txt", &handle)
        .await
        .expect("link");

    let outcome = fixture
        .store
        .rename(&fixture.cancel, &auth, &root, "a.txt", &root, "b.txt")
        .await
        .expect("same-file rename");
    assert!(outcome.replaced.is_none());

    // POSIX: both names survive.
    fixture.store.lookup(&fixture.cancel, &auth, &root, "a.txt").await.expect("a kept");
    fixture.store.lookup(&fixture.cancel, &auth, &root, "b.txt").await.expect("b kept");
}

#[tokio::test]
async fn cross_share_renames_are_invalid() {
    let (fixture, root) = Fixture::with_root("export").await;
    let (other_root, _) = fixture
        .store
        .create_root_directory(&fixture.cancel, "media", CreateAttributes::default())
        .await
        .expect("second share");
    let auth = root_auth();
    fixture.mkfile(&auth, &root, "a.txt").await;

    let err = fixture
        .store
        .rename(&fixture.cancel, &auth, &root, "a.txt", &other_root, "a.txt")
        .await
        .expect_err("cross share");
    assert!(matches!(err, StoreError::InvalidArgument(_)));
}

#[tokio::test]
async fn rename_over_replaces_a_type_compatible_destination() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let (_, old) = fixture.mkfile(&auth, &root, "old.txt").await;
    let (_, victim) = fixture.mkfile(&auth, &root, "new.txt").await;
    assert_ne!(old.content_id, victim.content_id);

    let outcome = fixture
        .store
        .rename(&fixture.cancel, &auth, &root, "old.txt", &root, "new.txt")
        .await
        .expect("rename over");
    let replaced = outcome.replaced.expect("victim destroyed");
    assert_eq!(replaced.id, victim.id);
    assert_eq!(replaced.content_id, victim.content_id);
    assert_eq!(replaced.nlink, 0);

    let err = fixture
        .store
        .lookup(&fixture.cancel, &auth, &root, "old.txt")
        .await
        .expect_err("source name gone");
    assert!(matches!(err, StoreError::NotFound { .. }));

    let (_, now_there) =
        fixture.store.lookup(&fixture.cancel, &auth, &root, "new.txt").await.expect("dest");
    assert_eq!(now_there.id, old.id);
    assert_eq!(now_there.content_id, old.content_id);
}

#[tokio::test]
async fn rename_over_keeps_victims_with_remaining_links() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let (victim_handle, victim) = fixture.mkfile(&auth, &root, "victim.txt").await;
    fixture
        .store
        .create_hard_link(&fixture.cancel, &auth, &root, "keep.txt", &victim_handle)
        .await
        .expect("link victim");
    fixture.mkfile(&auth, &root, "src.txt").await;

    let outcome = fixture
        .store
        .rename(&fixture.cancel, &auth, &root, "src.txt", &root, "victim.txt")
        .await
        .expect("rename over linked victim");
    let replaced = outcome.replaced.expect("victim reported");
    assert_eq!(replaced.id, victim.id);
    // Content survives under the other name, so no reclamation signal.
    assert_eq!(replaced.content_id, "");
    assert_eq!(replaced.nlink, 1);

    let survivor = fixture
        .store
        .get_file(&fixture.cancel, &victim_handle)
        .await
        .expect("victim survives by handle");
    assert_eq!(survivor.path, "/keep.txt");
}

#[tokio::test]
async fn rename_refuses_type_mismatched_destinations() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    fixture.mkfile(&auth, &root, "file.txt").await;
    fixture.mkdir(&auth, &root, "dir").await;

    let err = fixture
        .store
        .rename(&fixture.cancel, &auth, &root, "file.txt", &root, "dir")
        .await
        .expect_err("file over directory");
    assert!(matches!(err, StoreError::IsDirectory { .. }));

    let err = fixture
        .store
        .rename(&fixture.cancel, &auth, &root, "dir", &root, "file.txt")
        .await
        .expect_err("directory over file");
    assert!(matches!(err, StoreError::NotDirectory { .. }));
}

#[tokio::test]
async fn rename_refuses_populated_directory_destinations() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    fixture.mkdir(&auth, &root, "src").await;
    let full = fixture.mkdir(&auth, &root, "full").await;
    fixture.mkfile(&auth, &full, "inner.txt").await;

    let err = fixture
        .store
        .rename(&fixture.cancel, &auth, &root, "src", &root, "full")
        .await
        .expect_err("populated destination");
    assert!(matches!(err, StoreError::NotEmpty { .. }));
}

#[tokio::test]
async fn rename_replaces_an_empty_directory_destination() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    fixture.mkdir(&auth, &root, "src").await;
    let (_, victim) = {
        let handle = fixture.mkdir(&auth, &root, "empty").await;
        let file = fixture.store.get_file(&fixture.cancel, &handle).await.expect("victim");
        (handle, file)
    };
    let before = fixture.store.get_file(&fixture.cancel, &root).await.expect("root");
    assert_eq!(before.nlink, 4);

    let outcome = fixture
        .store
        .rename(&fixture.cancel, &auth, &root, "src", &root, "empty")
        .await
        .expect("replace empty dir");
    assert_eq!(outcome.replaced.expect("victim destroyed").id, victim.id);

    // One subdirectory replaced another: the parent count drops by one.
    let after = fixture.store.get_file(&fixture.cancel, &root).await.expect("root");
    assert_eq!(after.nlink, 3);
}

#[tokio::test]
async fn directory_moves_rewrite_descendant_paths() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let src = fixture.mkdir(&auth, &root, "src").await;
    let sub = fixture.mkdir(&auth, &src, "sub").await;
    let (leaf, leaf_file) = fixture.mkfile(&auth, &sub, "f").await;
    let content_id = leaf_file.content_id.clone();

    let root_before = fixture.store.get_file(&fixture.cancel, &root).await.expect("root");
    let src_before = fixture.store.get_file(&fixture.cancel, &src).await.expect("src");

    fixture
        .store
        .rename(&fixture.cancel, &auth, &root, "src", &root, "dst")
        .await
        .expect("move directory");

    let moved = fixture.store.get_file(&fixture.cancel, &src).await.expect("moved dir");
    assert_eq!(moved.path, "/dst");
    let moved_sub = fixture.store.get_file(&fixture.cancel, &sub).await.expect("sub");
    assert_eq!(moved_sub.path, "/dst/sub");
    let moved_leaf = fixture.store.get_file(&fixture.cancel, &leaf).await.expect("leaf");
    assert_eq!(moved_leaf.path, "/dst/sub/f");
    // Renames never recompute content ids.
    assert_eq!(moved_leaf.content_id, content_id);

    // Same-parent move: neither the moved directory's count nor the
    // root's changes.
    let root_after = fixture.store.get_file(&fixture.cancel, &root).await.expect("root");
    assert_eq!(root_after.nlink, root_before.nlink);
    assert_eq!(moved.nlink, src_before.nlink);
}

#[tokio::test]
async fn cross_directory_moves_migrate_the_dot_dot_reference() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let from = fixture.mkdir(&auth, &root, "from").await;
    let to = fixture.mkdir(&auth, &root, "to").await;
    fixture.mkdir(&auth, &from, "payload").await;

    let from_before = fixture.store.get_file(&fixture.cancel, &from).await.expect("from");
    let to_before = fixture.store.get_file(&fixture.cancel, &to).await.expect("to");
    assert_eq!(from_before.nlink, 3);
    assert_eq!(to_before.nlink, 2);

    fixture
        .store
        .rename(&fixture.cancel, &auth, &from, "payload", &to, "payload")
        .await
        .expect("cross-directory move");

    let from_after = fixture.store.get_file(&fixture.cancel, &from).await.expect("from");
    let to_after = fixture.store.get_file(&fixture.cancel, &to).await.expect("to");
    assert_eq!(from_after.nlink, 2);
    assert_eq!(to_after.nlink, 3);
}

#[tokio::test]
async fn cross_directory_directory_moves_require_ownership() {
    let (fixture, root) = Fixture::with_root("export").await;
    let owner = user_auth(1000, 100);
    let dest = fixture
        .store
        .create(
            &fixture.cancel,
            &root_auth(),
            &root,
            "dest",
            FileType::Directory,
            CreateAttributes { mode: 0o777, uid: 0, gid: 0 },
        )
        .await
        .expect("writable destination")
        .0;
    fixture
        .store
        .create(
            &fixture.cancel,
            &owner,
            &root,
            "mine",
            FileType::Directory,
            CreateAttributes::default(),
        )
        .await
        .expect("owned dir");

    let err = fixture
        .store
        .rename(&fixture.cancel, &user_auth(2000, 100), &root, "mine", &dest, "mine")
        .await
        .expect_err("non-owner moves directory");
    assert!(matches!(err, StoreError::AccessDenied(_)));

    fixture
        .store
        .rename(&fixture.cancel, &owner, &root, "mine", &dest, "mine")
        .await
        .expect("owner moves directory");
}

#[tokio::test]
async fn a_directory_cannot_move_beneath_itself() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let outer = fixture.mkdir(&auth, &root, "outer").await;
    fixture.mkdir(&auth, &outer, "inner").await;

    let err = fixture
        .store
        .rename(&fixture.cancel, &auth, &root, "outer", &outer, "loop")
        .await
        .expect_err("cycle");
    assert!(matches!(err, StoreError::InvalidArgument(_)));
}

#[tokio::test]
async fn silly_rename_zeroes_the_link_count_but_keeps_the_record() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let (handle, created) = fixture.mkfile(&auth, &root, "doc").await;
    assert_eq!(created.nlink, 1);

    fixture
        .store
        .rename(&fixture.cancel, &auth, &root, "doc", &root, ".nfs0001")
        .await
        .expect("silly rename");

    let silly = fixture.store.get_file(&fixture.cancel, &handle).await.expect("by handle");
    assert_eq!(silly.nlink, 0);
    assert_eq!(silly.path, "/.nfs0001");

    let err = fixture
        .store
        .lookup(&fixture.cancel, &auth, &root, "doc")
        .await
        .expect_err("old name gone");
    assert!(matches!(err, StoreError::NotFound { .. }));

    let (_, by_name) =
        fixture.store.lookup(&fixture.cancel, &auth, &root, ".nfs0001").await.expect("sentinel");
    assert_eq!(by_name.id, created.id);
}

#[tokio::test]
async fn rename_updates_the_moved_objects_ctime() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let (handle, before) = fixture.mkfile(&auth, &root, "a.txt").await;
    fixture
        .store
        .rename(&fixture.cancel, &auth, &root, "a.txt", &root, "b.txt")
        .await
        .expect("rename");
    let after = fixture.store.get_file(&fixture.cancel, &handle).await.expect("moved");
    assert!(after.ctime > before.ctime);
    assert_eq!(after.mtime, before.mtime);
}
