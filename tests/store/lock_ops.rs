use super::common::{root_auth, Fixture};

use dittofs_store::error::StoreError;
use dittofs_store::store::MetadataStore;

const SESSION_A: u64 = 0xA11CE;
const SESSION_B: u64 = 0xB0B;

#[tokio::test]
async fn test_lock_reports_the_blocking_record_without_mutating() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let (handle, _) = fixture.mkfile(&auth, &root, "data.bin").await;
    let locks = fixture.store.locks();

    locks.lock(&handle, SESSION_A, 0, 100, true).expect("exclusive lock");

    let conflict =
        locks.test_lock(&handle, SESSION_B, 50, 200, false).expect("hypothetical conflict");
    assert_eq!(conflict.session_id, SESSION_A);
    assert_eq!((conflict.offset, conflict.length), (0, 100));
    assert!(conflict.exclusive);

    // The query left the table untouched: the same lock still conflicts
    // and session A can still grow its own holdings.
    assert!(locks.test_lock(&handle, SESSION_B, 50, 200, false).is_some());
    locks.lock(&handle, SESSION_A, 200, 50, true).expect("owner extends");
}

#[tokio::test]
async fn io_interlock_matches_the_contract() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let (handle, _) = fixture.mkfile(&auth, &root, "data.bin").await;
    let locks = fixture.store.locks();

    locks.lock(&handle, SESSION_A, 0, 100, true).expect("exclusive lock");

    assert!(matches!(
        locks.check_io(&handle, SESSION_B, 50, 10, false),
        Err(StoreError::Locked { conflict }) if conflict.session_id == SESSION_A
    ));
    assert!(matches!(
        locks.check_io(&handle, SESSION_B, 50, 10, true),
        Err(StoreError::Locked { .. })
    ));
    // Outside the range both directions pass.
    locks.check_io(&handle, SESSION_B, 100, 10, false).expect("beyond the range");
    // The owner is never interlocked against itself.
    locks.check_io(&handle, SESSION_A, 50, 10, true).expect("own lock");

    locks.unlock_all_for_session(&handle, SESSION_A);
    locks.check_io(&handle, SESSION_B, 50, 10, true).expect("released");
    assert!(locks.test_lock(&handle, SESSION_B, 50, 200, false).is_none());
}

#[tokio::test]
async fn zero_length_locks_cover_to_end_of_file() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let (handle, _) = fixture.mkfile(&auth, &root, "data.bin").await;
    let locks = fixture.store.locks();

    locks.lock(&handle, SESSION_A, 1 << 20, 0, true).expect("eof lock");
    assert!(locks.test_lock(&handle, SESSION_B, u64::MAX - 10, 5, false).is_some());
    assert!(locks.test_lock(&handle, SESSION_B, 0, 100, false).is_none());
}

#[tokio::test]
async fn unlock_requires_the_exact_triple() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let (handle, _) = fixture.mkfile(&auth, &root, "data.bin").await;
    let locks = fixture.store.locks();

    locks.lock(&handle, SESSION_A, 10, 20, false).expect("lock");
    assert!(matches!(
        locks.unlock(&handle, SESSION_A, 10, 21),
        Err(StoreError::NotFound { .. })
    ));
    assert!(matches!(
        locks.unlock(&handle, SESSION_B, 10, 20),
        Err(StoreError::NotFound { .. })
    ));
    locks.unlock(&handle, SESSION_A, 10, 20).expect("exact unlock");
}

#[tokio::test]
async fn shared_locks_coexist_across_sessions() {
    let (fixture, root) = Fixture::with_root("export").await;
    let auth = root_auth();
    let (handle, _) = fixture.mkfile(&auth, &root, "data.bin").await;
    let locks = fixture.store.locks();

    locks.lock(&handle, SESSION_A, 0, 100, false).expect("shared a");
    locks.lock(&handle, SESSION_B, 50, 100, false).expect("shared b");

    // Reads pass everywhere; writes are blocked by the foreign share.
    locks.check_io(&handle, SESSION_A, 60, 5, false).expect("read through shares");
    assert!(matches!(
        locks.check_io(&handle, SESSION_A, 60, 5, true),
        Err(StoreError::Locked { conflict }) if conflict.session_id == SESSION_B
    ));
}
