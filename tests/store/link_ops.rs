use super::common::{root_auth, Fixture};

use dittofs_store::error::StoreError;
use dittofs_store::store::MetadataStore;

#[tokio::test]
async fn hard_link_survives_removal_of_the_original_name() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();

    let (handle, original) = fixture.mkfile(&auth, &root, "a.txt").await;
    let content_id = original.content_id.clone();
    assert!(!content_id.is_empty());

    let linked = fixture
        .store
        .create_hard_link(&fixture.cancel, &auth, &root, "b.txt", &handle)
        .await
        .expect("link");
    assert_eq!(linked.id, original.id);
    assert_eq!(linked.nlink, 2);

    // Removing the first name keeps the payload alive.
    let removed = fixture
        .store
        .remove_file(&fixture.cancel, &auth, &root, "a.txt")
        .await
        .expect("remove original");
    assert_eq!(removed.id, original.id);
    assert_eq!(removed.content_id, "");
    assert_eq!(removed.nlink, 1);

    let err = fixture
        .store
        .lookup(&fixture.cancel, &auth, &root, "a.txt")
        .await
        .expect_err("old name gone");
    assert!(matches!(err, StoreError::NotFound { .. }));

    let (_, survivor) =
        fixture.store.lookup(&fixture.cancel, &auth, &root, "b.txt").await.expect("new name");
    assert_eq!(survivor.id, original.id);
    assert_eq!(survivor.path, "/b.txt");

    // Removing the last name hands the content id back for reclamation.
    let last = fixture
        .store
        .remove_file(&fixture.cancel, &auth, &root, "b.txt")
        .await
        .expect("remove last");
    assert_eq!(last.content_id, content_id);
    assert_eq!(last.nlink, 0);

    let err = fixture
        .store
        .get_file(&fixture.cancel, &handle)
        .await
        .expect_err("record destroyed");
    assert!(matches!(err, StoreError::NotFound { .. }));
}

#[tokio::test]
async fn directories_cannot_be_hard_linked() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let dir = fixture.mkdir(&auth, &root, "sub").await;
    let err = fixture
        .store
        .create_hard_link(&fixture.cancel, &auth, &root, "alias", &dir)
        .await
        .expect_err("directory link");
    assert!(matches!(err, StoreError::IsDirectory { .. }));
}

#[tokio::test]
async fn hard_link_refuses_occupied_names() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let (handle, _) = fixture.mkfile(&auth, &root, "a.txt").await;
    fixture.mkfile(&auth, &root, "b.txt").await;
    let err = fixture
        .store
        .create_hard_link(&fixture.cancel, &auth, &root, "b.txt", &handle)
        .await
        .expect_err("occupied name");
    assert!(matches!(err, StoreError::AlreadyExists { .. }));
}

#[tokio::test]
async fn content_id_is_stable_across_linking() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let (handle, original) = fixture.mkfile(&auth, &root, "a.txt").await;
    fixture
        .store
        .create_hard_link(&fixture.cancel, &auth, &root, "b.txt", &handle)
        .await
        .expect("link");
    let (_, through_link) =
        fixture.store.lookup(&fixture.cancel, &auth, &root, "b.txt").await.expect("lookup");
    assert_eq!(through_link.content_id, original.content_id);
}
