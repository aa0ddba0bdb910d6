use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use super::common::{root_auth, Fixture};

use dittofs_store::model::{CreateAttributes, FileType};
use dittofs_store::store::MetadataStore;

#[tokio::test]
async fn parallel_creates_in_one_directory_all_land() {
    let (fixture, root) = Fixture::with_root("export").await;
    let cancel = fixture.cancel.clone();
    let store = Arc::new(fixture.store);

    let mut tasks = Vec::new();
    for index in 0..16 {
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        let root = root.clone();
        tasks.push(tokio::spawn(async move {
            store
                .create(
                    &cancel,
                    &root_auth(),
                    &root,
                    &format!("file-{index:02}"),
                    FileType::Regular,
                    CreateAttributes::default(),
                )
                .await
        }));
    }
    for task in tasks {
        task.await.expect("task join").expect("create succeeds");
    }

    let page = store
        .read_directory(&cancel, &root_auth(), &root, None, 64 * 1024)
        .await
        .expect("read dir");
    assert_eq!(page.entries.len(), 16);
    assert!(page.next.is_none());
}

#[tokio::test]
async fn opposing_cross_directory_renames_do_not_deadlock() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let left = fixture.mkdir(&auth, &root, "left").await;
    let right = fixture.mkdir(&auth, &root, "right").await;
    fixture.mkfile(&auth, &left, "ping").await;
    fixture.mkfile(&auth, &right, "pong").await;

    let cancel = fixture.cancel.clone();
    let store = Arc::new(fixture.store);

    // Opposite lock orders would deadlock without the sorted-id rule.
    let one = {
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        let (left, right) = (left.clone(), right.clone());
        tokio::spawn(async move {
            store.rename(&cancel, &root_auth(), &left, "ping", &right, "ping").await
        })
    };
    let two = {
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        let (left, right) = (left.clone(), right.clone());
        tokio::spawn(async move {
            store.rename(&cancel, &root_auth(), &right, "pong", &left, "pong").await
        })
    };

    let bounded = timeout(Duration::from_secs(30), async {
        one.await.expect("join").expect("rename ping");
        two.await.expect("join").expect("rename pong");
    });
    bounded.await.expect("renames must not deadlock");

    store.lookup(&cancel, &root_auth(), &right, "ping").await.expect("ping moved");
    store.lookup(&cancel, &root_auth(), &left, "pong").await.expect("pong moved");
}

#[tokio::test]
async fn mutations_on_distinct_parents_proceed_concurrently() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let mut dirs = Vec::new();
    for index in 0..4 {
        dirs.push(fixture.mkdir(&auth, &root, &format!("dir-{index}")).await);
    }

    let cancel = fixture.cancel.clone();
    let store = Arc::new(fixture.store);

    let mut tasks = Vec::new();
    for dir in &dirs {
        for index in 0..8 {
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            let dir = dir.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .create(
                        &cancel,
                        &root_auth(),
                        &dir,
                        &format!("f-{index}"),
                        FileType::Regular,
                        CreateAttributes::default(),
                    )
                    .await
            }));
        }
    }
    for task in tasks {
        task.await.expect("join").expect("create succeeds");
    }

    for dir in &dirs {
        let page = store
            .read_directory(&cancel, &root_auth(), dir, None, 64 * 1024)
            .await
            .expect("read dir");
        assert_eq!(page.entries.len(), 8);
    }
}
