use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use dittofs_store::auth::{AuthContext, AuthMethod, Identity};
use dittofs_store::config::StoreConfig;
use dittofs_store::handle::FileHandle;
use dittofs_store::model::{Clock, CreateAttributes, File, FileType, RandomIds, Timestamp};
use dittofs_store::store::kv::KvStore;
use dittofs_store::store::MetadataStore;

/// Deterministic clock: every observation is one second after the last, so
/// timestamp ordering assertions never race the wall clock.
#[derive(Default)]
pub struct TickingClock(AtomicI64);

impl Clock for TickingClock {
    fn now(&self) -> Timestamp {
        Timestamp { seconds: self.0.fetch_add(1, Ordering::SeqCst), nanos: 0 }
    }
}

pub struct Fixture {
    _tempdir: TempDir,
    pub store: KvStore,
    pub cancel: CancellationToken,
}

impl Fixture {
    pub async fn new() -> Self {
        let tempdir = TempDir::new().expect("create temp dir");
        let mut config = StoreConfig::default();
        config.kv.directory = tempdir.path().join("meta");
        let store =
            KvStore::open(&config, Arc::new(TickingClock::default()), Arc::new(RandomIds))
                .await
                .expect("open store");
        Self { _tempdir: tempdir, store, cancel: CancellationToken::new() }
    }

    /// Fresh store with one share rooted at a world-writable `/`, so the
    /// unprivileged identities used by the tests can populate it.
    pub async fn with_root(share: &str) -> (Self, FileHandle) {
        let fixture = Self::new().await;
        let (root, _) = fixture
            .store
            .create_root_directory(
                &fixture.cancel,
                share,
                CreateAttributes { mode: 0o777, uid: 0, gid: 0 },
            )
            .await
            .expect("create root");
        (fixture, root)
    }

    pub async fn mkdir(&self, auth: &AuthContext, parent: &FileHandle, name: &str) -> FileHandle {
        self.store
            .create(
                &self.cancel,
                auth,
                parent,
                name,
                FileType::Directory,
                CreateAttributes::default(),
            )
            .await
            .expect("create directory")
            .0
    }

    pub async fn mkfile(
        &self,
        auth: &AuthContext,
        parent: &FileHandle,
        name: &str,
    ) -> (FileHandle, File) {
        self.store
            .create(
                &self.cancel,
                auth,
                parent,
                name,
                FileType::Regular,
                CreateAttributes::default(),
            )
            .await
            .expect("create file")
    }
}

pub fn root_auth() -> AuthContext {
    AuthContext::new(Identity::unix(0, 0), AuthMethod::Unix, "10.0.0.2".parse().unwrap())
}

pub fn user_auth(uid: u32, gid: u32) -> AuthContext {
    AuthContext::new(Identity::unix(uid, gid), AuthMethod::Unix, "10.0.0.3".parse().unwrap())
}

pub fn anonymous_auth() -> AuthContext {
    AuthContext::new(Identity::anonymous(), AuthMethod::Anonymous, "10.0.0.4".parse().unwrap())
}
