//! The namespace transactional core.
//!
//! [`MetadataStore`] is the contract both backends satisfy: atomic,
//! invariant-preserving mutation of the file / parent-child / link-count /
//! share tables, observed through consistent snapshots. The embedded
//! backend ([`kv::KvStore`]) runs one serializable write transaction per
//! operation; the relational backend ([`sql::SqlStore`]) pins rows with
//! `SELECT ... FOR UPDATE`. Validation, defaults, access control and the
//! handle codec are shared pure modules, so both backends normalize and
//! authorize identically.

pub mod kv;
pub mod paths;
pub mod sql;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthContext;
use crate::config::{BackendKind, StoreConfig};
use crate::error::StoreResult;
use crate::handle::FileHandle;
use crate::locks::LockManager;
use crate::model::{
    CreateAttributes, DeviceNumbers, File, FsCapabilities, FsStatistics, RandomIds,
    ServerSettings, SetAttributes, SystemClock, Timestamp,
};

/// One directory entry as served to protocol layers.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub handle: FileHandle,
    pub file: File,
}

/// Opaque continuation token for paged directory reads. Holds the last
/// name served; listings resume strictly after it in the stable order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationToken(pub String);

/// A page of directory entries.
#[derive(Debug, Clone)]
pub struct DirPage {
    pub entries: Vec<DirEntry>,
    /// Present while the directory is not exhausted.
    pub next: Option<ContinuationToken>,
}

/// Plan-of-record returned by `prepare_write` and consumed by
/// `commit_write`. Commits are max-monotone on size so out-of-order
/// commits never shrink a file.
#[derive(Debug, Clone)]
pub struct WriteIntent {
    pub handle: FileHandle,
    pub new_size: u64,
    pub mtime: Timestamp,
    pub content_id: String,
    /// Attributes observed before the write, for weak cache consistency.
    pub before: File,
}

/// Outcome of a rename. When the destination name was occupied and its
/// last link was removed, `replaced` carries the destroyed file with its
/// content id so the payload layer can reclaim bytes.
#[derive(Debug, Clone, Default)]
pub struct RenameOutcome {
    pub replaced: Option<File>,
}

/// Result of a share-access evaluation: the decision plus the context
/// carrying the effective (possibly squashed) identity.
pub type ShareAccess = (crate::access::AccessDecision, AuthContext);

/// Transactional, share-scoped hierarchical namespace with
/// POSIX-compatible semantics.
///
/// Every mutating operation is atomic and durable; every read observes a
/// single consistent snapshot. All operations accept a cancellation token
/// and return `cancelled` without leaving partial state when it fires.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// The in-memory byte-range lock tables owned by this store instance.
    fn locks(&self) -> &LockManager;

    /// Evaluate share export options for a connecting session and produce
    /// the effective identity for subsequent operations.
    async fn check_share_access(
        &self,
        cancel: &CancellationToken,
        share_name: &str,
        auth: &AuthContext,
    ) -> StoreResult<ShareAccess>;

    /// Replace the export options of an existing share. This is the seam
    /// the administrative plane drives; file operations never mutate
    /// options.
    async fn set_share_options(
        &self,
        cancel: &CancellationToken,
        share_name: &str,
        options: crate::model::ShareOptions,
    ) -> StoreResult<()>;

    /// Idempotently create (or fetch) the root directory of a share.
    async fn create_root_directory(
        &self,
        cancel: &CancellationToken,
        share_name: &str,
        attr: CreateAttributes,
    ) -> StoreResult<(FileHandle, File)>;

    /// Fetch the complete file record behind a handle.
    async fn get_file(&self, cancel: &CancellationToken, handle: &FileHandle) -> StoreResult<File>;

    /// Resolve one name inside a directory.
    async fn lookup(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        parent: &FileHandle,
        name: &str,
    ) -> StoreResult<(FileHandle, File)>;

    /// Page through a directory in stable name order. `max_bytes` of zero
    /// selects the default page budget.
    async fn read_directory(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        dir: &FileHandle,
        token: Option<ContinuationToken>,
        max_bytes: u32,
    ) -> StoreResult<DirPage>;

    /// Create a regular file or directory.
    async fn create(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        parent: &FileHandle,
        name: &str,
        file_type: crate::model::FileType,
        attr: CreateAttributes,
    ) -> StoreResult<(FileHandle, File)>;

    /// Create a symbolic link to `target`.
    async fn create_symlink(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        parent: &FileHandle,
        name: &str,
        target: &str,
        attr: CreateAttributes,
    ) -> StoreResult<(FileHandle, File)>;

    /// Create a device node, socket or FIFO. Device types require a root
    /// caller and populated device numbers.
    async fn create_special_file(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        parent: &FileHandle,
        name: &str,
        file_type: crate::model::FileType,
        attr: CreateAttributes,
        device: Option<DeviceNumbers>,
    ) -> StoreResult<(FileHandle, File)>;

    /// Add a new name for an existing non-directory file.
    async fn create_hard_link(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        dir: &FileHandle,
        name: &str,
        target: &FileHandle,
    ) -> StoreResult<File>;

    /// Remove a non-directory entry by name. The returned record carries
    /// the content id iff the last link was removed (signal to reclaim the
    /// payload); otherwise the content id comes back cleared.
    async fn remove_file(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        parent: &FileHandle,
        name: &str,
    ) -> StoreResult<File>;

    /// Remove an empty directory.
    async fn remove_directory(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        parent: &FileHandle,
        name: &str,
    ) -> StoreResult<()>;

    /// Move or rename within one share, atomically replacing a
    /// type-compatible destination.
    async fn rename(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        src_parent: &FileHandle,
        src_name: &str,
        dst_parent: &FileHandle,
        dst_name: &str,
    ) -> StoreResult<RenameOutcome>;

    /// Read a symlink's target together with its attributes.
    async fn read_symlink(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        handle: &FileHandle,
    ) -> StoreResult<(String, File)>;

    /// Update attributes. Mode and ownership changes require ownership or
    /// root; `ctime` is always stamped.
    async fn set_attributes(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        handle: &FileHandle,
        changes: SetAttributes,
    ) -> StoreResult<File>;

    /// Validate a pending write and capture its plan-of-record.
    async fn prepare_write(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        handle: &FileHandle,
        new_size: u64,
    ) -> StoreResult<WriteIntent>;

    /// Apply a previously prepared write: size grows to at most
    /// `max(current, intent.new_size)`, mtime/ctime are stamped. Replays
    /// are idempotent.
    async fn commit_write(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        intent: &WriteIntent,
    ) -> StoreResult<File>;

    /// Validate read permission on a regular file and snapshot its
    /// attributes plus content id.
    async fn prepare_read(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        handle: &FileHandle,
    ) -> StoreResult<File>;

    /// Dynamic usage counters for the share behind `handle`. May be served
    /// from a short-TTL cache; the cache is invalidated by every mutation.
    async fn filesystem_statistics(
        &self,
        cancel: &CancellationToken,
        handle: &FileHandle,
    ) -> StoreResult<FsStatistics>;

    /// Static limits of this store.
    async fn filesystem_capabilities(
        &self,
        cancel: &CancellationToken,
        handle: &FileHandle,
    ) -> StoreResult<FsCapabilities>;

    /// Process-wide dynamic settings.
    async fn server_config(&self, cancel: &CancellationToken) -> StoreResult<ServerSettings>;

    /// Replace the process-wide settings; last writer wins.
    async fn set_server_config(
        &self,
        cancel: &CancellationToken,
        settings: ServerSettings,
    ) -> StoreResult<()>;
}

/// Open the backend selected by `config` with production defaults for the
/// clock and id source.
pub async fn open_store(config: &StoreConfig) -> StoreResult<Arc<dyn MetadataStore>> {
    let clock = Arc::new(SystemClock);
    let ids = Arc::new(RandomIds);
    match config.backend {
        BackendKind::EmbeddedKv => {
            Ok(Arc::new(kv::KvStore::open(config, clock, ids).await?))
        }
        BackendKind::Relational => {
            Ok(Arc::new(sql::SqlStore::connect(config, clock, ids).await?))
        }
    }
}
