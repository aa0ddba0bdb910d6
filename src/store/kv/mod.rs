//! Embedded key-value backend.
//!
//! Every mutation runs inside a single serializable write transaction, so
//! cross-record changes (edges, link counts, timestamps, descendant paths)
//! commit or vanish together. Per-parent mutexes serialize same-directory
//! mutations in front of the engine's single writer, which keeps
//! transaction contention away from unrelated directories; rename takes
//! both parents in sorted-id order so two concurrent renames can never
//! deadlock.

mod codec;
mod keys;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use redb::{Database, ReadableTable};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::access::{self, Permissions};
use crate::auth::AuthContext;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::handle::FileHandle;
use crate::locks::LockManager;
use crate::model::{
    Clock, CreateAttributes, DeviceNumbers, File, FileType, FsCapabilities, FsStatistics,
    IdSource, ServerSettings, SetAttributes, ShareOptions, Timestamp, MODE_MASK,
};
use crate::store::paths;
use crate::store::{
    ContinuationToken, DirEntry, DirPage, MetadataStore, RenameOutcome, ShareAccess, WriteIntent,
};
use crate::validate;

use codec::ShareRecord;

/// Rows touched between cancellation checks during bulk path rewrites.
const REWRITE_BATCH: usize = 256;

/// Metadata store backed by an embedded transactional key-value engine.
pub struct KvStore {
    db: Arc<Database>,
    locks: LockManager,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
    parent_mutexes: DashMap<Uuid, Arc<Mutex<()>>>,
    share_mutex: Mutex<()>,
    stats_cache: moka::sync::Cache<String, FsStatistics>,
    capacity_bytes: u64,
    capacity_files: u64,
}

impl KvStore {
    /// Open (or create) the database under the configured directory and
    /// make sure every table exists before the first reader shows up.
    pub async fn open(
        config: &StoreConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdSource>,
    ) -> StoreResult<KvStore> {
        let kv = &config.kv;
        std::fs::create_dir_all(&kv.directory)
            .map_err(|err| StoreError::io(format!("create {}: {err}", kv.directory.display())))?;

        let mut builder = redb::Builder::new();
        if let Some(cache_bytes) = kv.cache_bytes {
            builder.set_cache_size(cache_bytes);
        }
        let mut db = builder
            .create(kv.directory.join("metadata.redb"))
            .map_err(|err| StoreError::io(format!("open metadata database: {err}")))?;
        if kv.compact_on_open {
            db.compact().map_err(|err| StoreError::io(format!("compact: {err}")))?;
        }

        let txn = db.begin_write().map_err(map_transaction)?;
        {
            txn.open_table(keys::FILES).map_err(map_table)?;
            txn.open_table(keys::CHILDREN).map_err(map_table)?;
            txn.open_table(keys::PARENTS).map_err(map_table)?;
            txn.open_table(keys::LINKS).map_err(map_table)?;
            txn.open_table(keys::SHARES).map_err(map_table)?;
            txn.open_table(keys::DEVICES).map_err(map_table)?;
            txn.open_table(keys::CONFIG).map_err(map_table)?;
        }
        txn.commit().map_err(map_commit)?;

        Ok(KvStore {
            db: Arc::new(db),
            locks: LockManager::new(Arc::clone(&clock)),
            clock,
            ids,
            parent_mutexes: DashMap::new(),
            share_mutex: Mutex::new(()),
            stats_cache: moka::sync::Cache::builder()
                .time_to_live(kv.statistics_cache_ttl())
                .build(),
            capacity_bytes: config.capacity_bytes,
            capacity_files: config.capacity_files,
        })
    }

    fn parent_mutex(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.parent_mutexes.entry(id).or_default().clone()
    }

    async fn with_write<T, F>(&self, cancel: &CancellationToken, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&redb::WriteTransaction) -> StoreResult<T> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write().map_err(map_transaction)?;
            match f(&txn) {
                Ok(value) => {
                    txn.commit().map_err(map_commit)?;
                    Ok(value)
                }
                // Dropping the transaction rolls it back.
                Err(err) => Err(err),
            }
        })
        .await
        .map_err(|err| StoreError::io(format!("storage task failed: {err}")))?
    }

    async fn with_read<T, F>(&self, cancel: &CancellationToken, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&redb::ReadTransaction) -> StoreResult<T> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read().map_err(map_transaction)?;
            f(&txn)
        })
        .await
        .map_err(|err| StoreError::io(format!("storage task failed: {err}")))?
    }

    /// Shared trunk of the create family. Callers have already validated
    /// the type-specific inputs; this stamps defaults, allocates the id,
    /// and wires the edge, link count and parent bookkeeping in one
    /// transaction.
    async fn create_node(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        parent: &FileHandle,
        name: &str,
        file_type: FileType,
        attr: CreateAttributes,
        link_target: String,
        device: Option<DeviceNumbers>,
    ) -> StoreResult<(FileHandle, File)> {
        validate::validate_name(name)?;
        let (share, parent_id) = parent.decode()?;
        let applied = validate::apply_defaults(&attr, file_type, &link_target, auth, self.clock.as_ref());
        let id = self.ids.next_id();
        let auth = auth.clone();
        let name = name.to_owned();
        let share_for_cache = share.clone();

        let _guard = self.parent_mutex(parent_id).lock_owned().await;
        let created = self
            .with_write(cancel, move |txn| {
                let mut t = WriteTables::open(txn)?;
                let mut dir = t.require_directory(&share, parent_id)?;
                let record = t.share_record(&share)?;
                access::require(&auth, &dir, &record.options, Permissions::WRITE)?;

                let path = paths::join_path(&dir.path, &name);
                if t.child_id(parent_id, &name)?.is_some() {
                    return Err(StoreError::AlreadyExists { path });
                }

                let content_id = match file_type {
                    FileType::Regular => paths::content_id_for(&share, &path),
                    _ => String::new(),
                };
                let nlink = if file_type.is_directory() { 2 } else { 1 };
                let file = File {
                    id,
                    share_name: share.clone(),
                    path,
                    file_type,
                    mode: applied.mode,
                    uid: applied.uid,
                    gid: applied.gid,
                    size: applied.size,
                    atime: applied.now,
                    mtime: applied.now,
                    ctime: applied.now,
                    creation_time: applied.now,
                    link_target,
                    content_id,
                    device,
                    nlink,
                };

                t.store_file(&file)?;
                t.set_link_count(id, u64::from(nlink))?;
                t.insert_edge(parent_id, &name, id)?;
                t.set_parent(id, parent_id)?;
                if let Some(device) = device {
                    t.store_device(id, device)?;
                }
                if file_type.is_directory() {
                    t.bump_link_count(parent_id, 1)?;
                }
                dir.mtime = applied.now;
                dir.ctime = applied.now;
                t.store_file(&dir)?;

                Ok(file)
            })
            .await?;

        self.stats_cache.invalidate(&share_for_cache);
        let handle = FileHandle::encode(&created.share_name, created.id)?;
        Ok((handle, created))
    }

    fn statistics_for(&self, share: String, used_bytes: u64, used_files: u64) -> FsStatistics {
        let stats = FsStatistics {
            total_bytes: self.capacity_bytes,
            used_bytes,
            available_bytes: self.capacity_bytes.saturating_sub(used_bytes),
            total_files: self.capacity_files,
            used_files,
            free_files: self.capacity_files.saturating_sub(used_files),
        };
        self.stats_cache.insert(share, stats);
        stats
    }
}

#[async_trait]
impl MetadataStore for KvStore {
    fn locks(&self) -> &LockManager {
        &self.locks
    }

    async fn check_share_access(
        &self,
        cancel: &CancellationToken,
        share_name: &str,
        auth: &AuthContext,
    ) -> StoreResult<ShareAccess> {
        let share = share_name.to_owned();
        let auth = auth.clone();
        self.with_read(cancel, move |txn| {
            let shares = txn.open_table(keys::SHARES).map_err(map_table)?;
            let record = share_record_from(&shares, &share)?;
            Ok(access::evaluate_share_access(&record.options, &auth))
        })
        .await
    }

    async fn create_root_directory(
        &self,
        cancel: &CancellationToken,
        share_name: &str,
        attr: CreateAttributes,
    ) -> StoreResult<(FileHandle, File)> {
        let share = share_name.to_owned();
        let mode = if attr.mode == 0 { validate::DEFAULT_DIR_MODE } else { attr.mode & MODE_MASK };
        let (uid, gid) = (attr.uid, attr.gid);
        let id = self.ids.next_id();
        let now = self.clock.now();

        let _guard = self.share_mutex.lock().await;
        let share_for_cache = share.clone();
        let root = self
            .with_write(cancel, move |txn| {
                let mut t = WriteTables::open(txn)?;
                if let Some(record) = t.share_record_opt(&share)? {
                    let mut root = t.require_file(record.root_id, &share)?;
                    // Repeat creation refreshes ownership and mode when the
                    // supplied attributes differ.
                    if root.mode != mode || root.uid != uid || root.gid != gid {
                        root.mode = mode;
                        root.uid = uid;
                        root.gid = gid;
                        root.ctime = now;
                        t.store_file(&root)?;
                    }
                    return Ok(root);
                }

                let root = File {
                    id,
                    share_name: share.clone(),
                    path: "/".to_owned(),
                    file_type: FileType::Directory,
                    mode,
                    uid,
                    gid,
                    size: 0,
                    atime: now,
                    mtime: now,
                    ctime: now,
                    creation_time: now,
                    link_target: String::new(),
                    content_id: String::new(),
                    device: None,
                    nlink: 2,
                };
                t.store_file(&root)?;
                t.set_link_count(id, 2)?;
                t.put_share_record(
                    &share,
                    &ShareRecord { root_id: id, options: ShareOptions::default() },
                )?;
                debug!(share = %share, root = %id, "created share root");
                Ok(root)
            })
            .await?;

        self.stats_cache.invalidate(&share_for_cache);
        let handle = FileHandle::encode(&root.share_name, root.id)?;
        Ok((handle, root))
    }

    async fn set_share_options(
        &self,
        cancel: &CancellationToken,
        share_name: &str,
        options: ShareOptions,
    ) -> StoreResult<()> {
        let share = share_name.to_owned();
        self.with_write(cancel, move |txn| {
            let mut t = WriteTables::open(txn)?;
            let record = t.share_record(&share)?;
            t.put_share_record(&share, &ShareRecord { root_id: record.root_id, options })
        })
        .await
    }

    async fn get_file(&self, cancel: &CancellationToken, handle: &FileHandle) -> StoreResult<File> {
        let (share, id) = handle.decode()?;
        self.with_read(cancel, move |txn| {
            let files = txn.open_table(keys::FILES).map_err(map_table)?;
            let links = txn.open_table(keys::LINKS).map_err(map_table)?;
            let devices = txn.open_table(keys::DEVICES).map_err(map_table)?;
            require_file_from(&files, &links, &devices, &share, id)
        })
        .await
    }

    async fn lookup(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        parent: &FileHandle,
        name: &str,
    ) -> StoreResult<(FileHandle, File)> {
        validate::validate_name(name)?;
        let (share, parent_id) = parent.decode()?;
        let auth = auth.clone();
        let name = name.to_owned();
        self.with_read(cancel, move |txn| {
            let files = txn.open_table(keys::FILES).map_err(map_table)?;
            let links = txn.open_table(keys::LINKS).map_err(map_table)?;
            let devices = txn.open_table(keys::DEVICES).map_err(map_table)?;
            let children = txn.open_table(keys::CHILDREN).map_err(map_table)?;
            let shares = txn.open_table(keys::SHARES).map_err(map_table)?;

            let dir = require_directory_from(&files, &links, &devices, &share, parent_id)?;
            let record = share_record_from(&shares, &share)?;
            access::require(&auth, &dir, &record.options, Permissions::EXECUTE)?;

            let child_id = child_id_from(&children, parent_id, &name)?
                .ok_or_else(|| StoreError::not_found(paths::join_path(&dir.path, &name)))?;
            let child = require_file_from(&files, &links, &devices, &share, child_id)?;
            let handle = FileHandle::encode(&share, child_id)?;
            Ok((handle, child))
        })
        .await
    }

    async fn read_directory(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        dir: &FileHandle,
        token: Option<ContinuationToken>,
        max_bytes: u32,
    ) -> StoreResult<DirPage> {
        let (share, dir_id) = dir.decode()?;
        let budget =
            u64::from(if max_bytes == 0 { paths::DEFAULT_READDIR_BYTES } else { max_bytes });
        let resume_after = token.map(|t| t.0);
        let auth = auth.clone();
        let cancel_scan = cancel.clone();

        self.with_read(cancel, move |txn| {
            let files = txn.open_table(keys::FILES).map_err(map_table)?;
            let links = txn.open_table(keys::LINKS).map_err(map_table)?;
            let devices = txn.open_table(keys::DEVICES).map_err(map_table)?;
            let children = txn.open_table(keys::CHILDREN).map_err(map_table)?;
            let shares = txn.open_table(keys::SHARES).map_err(map_table)?;

            let dir = require_directory_from(&files, &links, &devices, &share, dir_id)?;
            let record = share_record_from(&shares, &share)?;
            access::require(
                &auth,
                &dir,
                &record.options,
                Permissions::READ.union(Permissions::EXECUTE),
            )?;

            let start = match &resume_after {
                Some(name) => keys::children_resume(dir_id, name),
                None => keys::children_start(dir_id),
            };
            let end = keys::children_end(dir_id);
            let iter = match &end {
                Some(end) => children
                    .range::<&[u8]>(start.as_slice()..end.as_slice())
                    .map_err(map_storage)?,
                None => children.range::<&[u8]>(start.as_slice()..).map_err(map_storage)?,
            };

            let mut entries: Vec<DirEntry> = Vec::new();
            let mut used = 0u64;
            let mut next = None;
            for (index, item) in iter.enumerate() {
                if index % REWRITE_BATCH == 0 && cancel_scan.is_cancelled() {
                    return Err(StoreError::Cancelled);
                }
                let (key, value) = item.map_err(map_storage)?;
                let (_, name_bytes) = keys::split_child_key(key.value())
                    .ok_or_else(|| StoreError::io("corrupt edge key"))?;
                let name = std::str::from_utf8(name_bytes)
                    .map_err(|_| StoreError::io("corrupt edge key"))?
                    .to_owned();
                let child_id = Uuid::from_slice(value.value())
                    .map_err(|_| StoreError::io("corrupt edge value"))?;
                let child = require_file_from(&files, &links, &devices, &share, child_id)?;
                let handle = FileHandle::encode(&share, child_id)?;

                let estimate = u64::from(paths::estimated_entry_size(&name, handle.as_bytes().len()));
                if !entries.is_empty() && used + estimate > budget {
                    next = entries.last().map(|e| ContinuationToken(e.name.clone()));
                    break;
                }
                used += estimate;
                entries.push(DirEntry { name, handle, file: child });
            }
            Ok(DirPage { entries, next })
        })
        .await
    }

    async fn create(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        parent: &FileHandle,
        name: &str,
        file_type: FileType,
        attr: CreateAttributes,
    ) -> StoreResult<(FileHandle, File)> {
        validate::validate_create_type(file_type)?;
        self.create_node(cancel, auth, parent, name, file_type, attr, String::new(), None).await
    }

    async fn create_symlink(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        parent: &FileHandle,
        name: &str,
        target: &str,
        attr: CreateAttributes,
    ) -> StoreResult<(FileHandle, File)> {
        validate::validate_symlink_target(target)?;
        self.create_node(
            cancel,
            auth,
            parent,
            name,
            FileType::Symlink,
            attr,
            target.to_owned(),
            None,
        )
        .await
    }

    async fn create_special_file(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        parent: &FileHandle,
        name: &str,
        file_type: FileType,
        attr: CreateAttributes,
        device: Option<DeviceNumbers>,
    ) -> StoreResult<(FileHandle, File)> {
        validate::validate_special_type(file_type, auth)?;
        let device = match (file_type.is_device(), device) {
            (true, Some(device)) => Some(device),
            (true, None) => {
                return Err(StoreError::invalid_argument("device numbers are required"))
            }
            (false, _) => None,
        };
        self.create_node(cancel, auth, parent, name, file_type, attr, String::new(), device).await
    }

    async fn create_hard_link(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        dir: &FileHandle,
        name: &str,
        target: &FileHandle,
    ) -> StoreResult<File> {
        validate::validate_name(name)?;
        let (share, dir_id) = dir.decode()?;
        let (target_share, target_id) = target.decode()?;
        if share != target_share {
            return Err(StoreError::invalid_argument("cross-share hard link"));
        }
        let now = self.clock.now();
        let auth = auth.clone();
        let name = name.to_owned();
        let share_for_cache = share.clone();

        let _guard = self.parent_mutex(dir_id).lock_owned().await;
        let linked = self
            .with_write(cancel, move |txn| {
                let mut t = WriteTables::open(txn)?;
                let mut dir = t.require_directory(&share, dir_id)?;
                let record = t.share_record(&share)?;
                access::require(&auth, &dir, &record.options, Permissions::WRITE)?;

                let mut file = t.require_file(target_id, &share)?;
                if file.file_type.is_directory() {
                    return Err(StoreError::IsDirectory { path: file.path });
                }
                let link_path = paths::join_path(&dir.path, &name);
                if t.child_id(dir_id, &name)?.is_some() {
                    return Err(StoreError::AlreadyExists { path: link_path });
                }

                t.insert_edge(dir_id, &name, target_id)?;
                let count = t.bump_link_count(target_id, 1)?;
                file.nlink = count as u32;
                file.ctime = now;
                t.store_file(&file)?;

                dir.mtime = now;
                dir.ctime = now;
                t.store_file(&dir)?;
                Ok(file)
            })
            .await?;

        self.stats_cache.invalidate(&share_for_cache);
        Ok(linked)
    }

    async fn remove_file(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        parent: &FileHandle,
        name: &str,
    ) -> StoreResult<File> {
        validate::validate_name(name)?;
        let (share, parent_id) = parent.decode()?;
        let now = self.clock.now();
        let auth = auth.clone();
        let name = name.to_owned();
        let share_for_cache = share.clone();

        let _guard = self.parent_mutex(parent_id).lock_owned().await;
        let removed = self
            .with_write(cancel, move |txn| {
                let mut t = WriteTables::open(txn)?;
                let mut dir = t.require_directory(&share, parent_id)?;
                let record = t.share_record(&share)?;
                access::require(&auth, &dir, &record.options, Permissions::WRITE)?;

                let victim_path = paths::join_path(&dir.path, &name);
                let child_id = t
                    .child_id(parent_id, &name)?
                    .ok_or_else(|| StoreError::not_found(victim_path.clone()))?;
                let mut victim = t.require_file(child_id, &share)?;
                if victim.file_type.is_directory() {
                    return Err(StoreError::IsDirectory { path: victim.path });
                }
                access::check_sticky_bit(&auth, &dir, &victim)?;

                // The edge is matched by (parent, name): with hard links
                // the same child may sit under several names here.
                t.remove_edge(parent_id, &name)?;
                let remaining = t.bump_link_count(child_id, -1)?;

                if remaining == 0 {
                    t.destroy_file(child_id)?;
                    victim.nlink = 0;
                } else {
                    victim.nlink = remaining as u32;
                    if victim.path == victim_path {
                        if let Some((other_parent, other_name)) =
                            t.find_edge_for(child_id, parent_id, &name)?
                        {
                            let other_dir = t.require_file(other_parent, &share)?;
                            victim.path = paths::join_path(&other_dir.path, &other_name);
                            t.set_parent(child_id, other_parent)?;
                        }
                    }
                    victim.ctime = now;
                    t.store_file(&victim)?;
                    // Links remain: tell the caller to keep the payload.
                    victim.content_id = String::new();
                }

                dir.mtime = now;
                dir.ctime = now;
                t.store_file(&dir)?;
                Ok(victim)
            })
            .await?;

        self.stats_cache.invalidate(&share_for_cache);
        Ok(removed)
    }

    async fn remove_directory(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        parent: &FileHandle,
        name: &str,
    ) -> StoreResult<()> {
        validate::validate_name(name)?;
        let (share, parent_id) = parent.decode()?;
        let now = self.clock.now();
        let auth = auth.clone();
        let name = name.to_owned();
        let share_for_cache = share.clone();

        let _guard = self.parent_mutex(parent_id).lock_owned().await;
        self.with_write(cancel, move |txn| {
            let mut t = WriteTables::open(txn)?;
            let mut dir = t.require_directory(&share, parent_id)?;
            let record = t.share_record(&share)?;
            access::require(&auth, &dir, &record.options, Permissions::WRITE)?;

            let victim_path = paths::join_path(&dir.path, &name);
            let child_id = t
                .child_id(parent_id, &name)?
                .ok_or_else(|| StoreError::not_found(victim_path.clone()))?;
            let victim = t.require_file(child_id, &share)?;
            if !victim.file_type.is_directory() {
                return Err(StoreError::NotDirectory { path: victim.path });
            }
            access::check_sticky_bit(&auth, &dir, &victim)?;
            if t.has_children(child_id)? {
                return Err(StoreError::NotEmpty { path: victim.path });
            }

            t.remove_edge(parent_id, &name)?;
            t.destroy_file(child_id)?;
            t.bump_link_count(parent_id, -1)?;
            dir.mtime = now;
            dir.ctime = now;
            t.store_file(&dir)?;
            Ok(())
        })
        .await?;

        self.stats_cache.invalidate(&share_for_cache);
        Ok(())
    }

    async fn rename(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        src_parent: &FileHandle,
        src_name: &str,
        dst_parent: &FileHandle,
        dst_name: &str,
    ) -> StoreResult<RenameOutcome> {
        validate::validate_name(src_name)?;
        validate::validate_name(dst_name)?;
        let (src_share, src_parent_id) = src_parent.decode()?;
        let (dst_share, dst_parent_id) = dst_parent.decode()?;
        if src_share != dst_share {
            return Err(StoreError::invalid_argument("cross-share move"));
        }
        let share = src_share;
        let now = self.clock.now();
        let auth = auth.clone();
        let src_name = src_name.to_owned();
        let dst_name = dst_name.to_owned();
        let share_for_cache = share.clone();
        let cancel_rewrite = cancel.clone();

        // Both parents lock in sorted-id order; a same-directory rename
        // degrades to a single acquisition.
        let mut order = [src_parent_id, dst_parent_id];
        order.sort();
        let _first = self.parent_mutex(order[0]).lock_owned().await;
        let _second = if order[1] != order[0] {
            Some(self.parent_mutex(order[1]).lock_owned().await)
        } else {
            None
        };

        let outcome = self
            .with_write(cancel, move |txn| {
                let mut t = WriteTables::open(txn)?;
                let record = t.share_record(&share)?;
                let same_parent = src_parent_id == dst_parent_id;

                let mut src_dir = t.require_directory(&share, src_parent_id)?;
                let mut dst_dir = if same_parent {
                    src_dir.clone()
                } else {
                    t.require_directory(&share, dst_parent_id)?
                };
                access::require(&auth, &src_dir, &record.options, Permissions::WRITE)?;
                access::require(&auth, &dst_dir, &record.options, Permissions::WRITE)?;

                let src_path = paths::join_path(&src_dir.path, &src_name);
                let child_id = t
                    .child_id(src_parent_id, &src_name)?
                    .ok_or_else(|| StoreError::not_found(src_path.clone()))?;
                let mut child = t.require_file(child_id, &share)?;
                access::check_sticky_bit(&auth, &src_dir, &child)?;

                if same_parent && src_name == dst_name {
                    return Ok(RenameOutcome::default());
                }
                let existing_dst = t.child_id(dst_parent_id, &dst_name)?;
                if existing_dst == Some(child_id) {
                    // Hard links of the same file; POSIX rename does nothing.
                    return Ok(RenameOutcome::default());
                }

                let moving_directory = child.file_type.is_directory();
                if moving_directory {
                    if dst_parent_id == child_id
                        || dst_dir.path == child.path
                        || paths::rewrite_prefix(&dst_dir.path, &child.path, "").is_some()
                    {
                        return Err(StoreError::invalid_argument(
                            "cannot move a directory beneath itself",
                        ));
                    }
                    if !same_parent && !auth.is_root() && auth.identity.uid != Some(child.uid) {
                        return Err(StoreError::access_denied(format!(
                            "moving directory {} requires ownership",
                            child.path
                        )));
                    }
                }

                let mut replaced = None;
                if let Some(victim_id) = existing_dst {
                    let mut victim = t.require_file(victim_id, &share)?;
                    access::check_sticky_bit(&auth, &dst_dir, &victim)?;

                    match (moving_directory, victim.file_type.is_directory()) {
                        (true, false) => {
                            return Err(StoreError::NotDirectory { path: victim.path })
                        }
                        (false, true) => return Err(StoreError::IsDirectory { path: victim.path }),
                        (true, true) => {
                            if t.has_children(victim_id)? {
                                return Err(StoreError::NotEmpty { path: victim.path });
                            }
                            t.remove_edge(dst_parent_id, &dst_name)?;
                            t.destroy_file(victim_id)?;
                            t.bump_link_count(dst_parent_id, -1)?;
                            victim.nlink = 0;
                            replaced = Some(victim);
                        }
                        (false, false) => {
                            t.remove_edge(dst_parent_id, &dst_name)?;
                            let remaining = t.bump_link_count(victim_id, -1)?;
                            if remaining == 0 {
                                t.destroy_file(victim_id)?;
                                victim.nlink = 0;
                            } else {
                                victim.nlink = remaining as u32;
                                let displaced = paths::join_path(&dst_dir.path, &dst_name);
                                if victim.path == displaced {
                                    if let Some((other_parent, other_name)) =
                                        t.find_edge_for(victim_id, dst_parent_id, &dst_name)?
                                    {
                                        let other_dir = t.require_file(other_parent, &share)?;
                                        victim.path =
                                            paths::join_path(&other_dir.path, &other_name);
                                        t.set_parent(victim_id, other_parent)?;
                                    }
                                }
                                victim.ctime = now;
                                t.store_file(&victim)?;
                                victim.content_id = String::new();
                            }
                            replaced = Some(victim);
                        }
                    }
                }

                t.remove_edge(src_parent_id, &src_name)?;
                t.insert_edge(dst_parent_id, &dst_name, child_id)?;
                t.set_parent(child_id, dst_parent_id)?;

                let old_path = child.path.clone();
                let new_path = paths::join_path(&dst_dir.path, &dst_name);
                child.path = new_path.clone();
                child.ctime = now;
                if !moving_directory && paths::is_silly_rename_name(&dst_name) {
                    // NFS silly rename: unlinked but still open. The record
                    // stays addressable by handle while reporting no links.
                    t.set_link_count(child_id, 0)?;
                    child.nlink = 0;
                }
                t.store_file(&child)?;

                if moving_directory && !same_parent {
                    // The `..` reference migrates with the directory.
                    t.bump_link_count(src_parent_id, -1)?;
                    t.bump_link_count(dst_parent_id, 1)?;
                }

                if moving_directory && old_path != new_path {
                    t.rewrite_descendant_paths(&share, &old_path, &new_path, now, &cancel_rewrite)?;
                }

                src_dir.mtime = now;
                src_dir.ctime = now;
                t.store_file(&src_dir)?;
                if !same_parent {
                    dst_dir.mtime = now;
                    dst_dir.ctime = now;
                    t.store_file(&dst_dir)?;
                }

                Ok(RenameOutcome { replaced })
            })
            .await?;

        self.stats_cache.invalidate(&share_for_cache);
        Ok(outcome)
    }

    async fn read_symlink(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        handle: &FileHandle,
    ) -> StoreResult<(String, File)> {
        let (share, id) = handle.decode()?;
        let auth = auth.clone();
        self.with_read(cancel, move |txn| {
            let files = txn.open_table(keys::FILES).map_err(map_table)?;
            let links = txn.open_table(keys::LINKS).map_err(map_table)?;
            let devices = txn.open_table(keys::DEVICES).map_err(map_table)?;
            let shares = txn.open_table(keys::SHARES).map_err(map_table)?;

            let file = require_file_from(&files, &links, &devices, &share, id)?;
            if file.file_type != FileType::Symlink {
                return Err(StoreError::invalid_argument(format!(
                    "{} is not a symbolic link",
                    file.path
                )));
            }
            let record = share_record_from(&shares, &share)?;
            access::require(&auth, &file, &record.options, Permissions::READ)?;
            Ok((file.link_target.clone(), file))
        })
        .await
    }

    async fn set_attributes(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        handle: &FileHandle,
        changes: SetAttributes,
    ) -> StoreResult<File> {
        let (share, id) = handle.decode()?;
        let now = self.clock.now();
        let auth = auth.clone();
        let share_for_cache = share.clone();

        let updated = self
            .with_write(cancel, move |txn| {
                let mut t = WriteTables::open(txn)?;
                let mut file = t.require_file(id, &share)?;
                let record = t.share_record(&share)?;

                let is_owner = auth.is_root() || auth.identity.uid == Some(file.uid);
                if changes.changes_ownership_or_mode() && !is_owner {
                    return Err(StoreError::access_denied(format!(
                        "changing mode or ownership of {} requires ownership",
                        file.path
                    )));
                }
                if changes.size.is_some() {
                    if file.file_type != FileType::Regular {
                        return Err(StoreError::invalid_argument(format!(
                            "cannot truncate {}: not a regular file",
                            file.path
                        )));
                    }
                    access::require(&auth, &file, &record.options, Permissions::WRITE)?;
                }
                if (changes.atime.is_some() || changes.mtime.is_some()) && !is_owner {
                    access::require(&auth, &file, &record.options, Permissions::WRITE)?;
                }

                file.apply_changes(&changes, now);
                t.store_file(&file)?;
                Ok(file)
            })
            .await?;

        self.stats_cache.invalidate(&share_for_cache);
        Ok(updated)
    }

    async fn prepare_write(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        handle: &FileHandle,
        new_size: u64,
    ) -> StoreResult<WriteIntent> {
        let (share, id) = handle.decode()?;
        let auth = auth.clone();
        let mtime = self.clock.now();
        let file = self
            .with_read(cancel, move |txn| {
                let files = txn.open_table(keys::FILES).map_err(map_table)?;
                let links = txn.open_table(keys::LINKS).map_err(map_table)?;
                let devices = txn.open_table(keys::DEVICES).map_err(map_table)?;
                let shares = txn.open_table(keys::SHARES).map_err(map_table)?;

                let file = require_file_from(&files, &links, &devices, &share, id)?;
                require_regular(&file)?;
                let record = share_record_from(&shares, &share)?;
                access::require(&auth, &file, &record.options, Permissions::WRITE)?;
                Ok(file)
            })
            .await?;

        Ok(WriteIntent {
            handle: FileHandle::encode(&file.share_name, file.id)?,
            new_size,
            mtime,
            content_id: file.content_id.clone(),
            before: file,
        })
    }

    async fn commit_write(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        intent: &WriteIntent,
    ) -> StoreResult<File> {
        let (share, id) = intent.handle.decode()?;
        let now = self.clock.now();
        let auth = auth.clone();
        let new_size = intent.new_size;
        let mtime = intent.mtime;
        let share_for_cache = share.clone();

        let committed = self
            .with_write(cancel, move |txn| {
                let mut t = WriteTables::open(txn)?;
                let mut file = t.require_file(id, &share)?;
                require_regular(&file)?;
                let record = t.share_record(&share)?;
                access::require(&auth, &file, &record.options, Permissions::WRITE)?;

                // Out-of-order commits never shrink the file.
                file.size = file.size.max(new_size);
                file.mtime = mtime;
                file.ctime = now;
                t.store_file(&file)?;
                Ok(file)
            })
            .await?;

        self.stats_cache.invalidate(&share_for_cache);
        Ok(committed)
    }

    async fn prepare_read(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        handle: &FileHandle,
    ) -> StoreResult<File> {
        let (share, id) = handle.decode()?;
        let auth = auth.clone();
        self.with_read(cancel, move |txn| {
            let files = txn.open_table(keys::FILES).map_err(map_table)?;
            let links = txn.open_table(keys::LINKS).map_err(map_table)?;
            let devices = txn.open_table(keys::DEVICES).map_err(map_table)?;
            let shares = txn.open_table(keys::SHARES).map_err(map_table)?;

            let file = require_file_from(&files, &links, &devices, &share, id)?;
            require_regular(&file)?;
            let record = share_record_from(&shares, &share)?;
            access::require(&auth, &file, &record.options, Permissions::READ)?;
            Ok(file)
        })
        .await
    }

    async fn filesystem_statistics(
        &self,
        cancel: &CancellationToken,
        handle: &FileHandle,
    ) -> StoreResult<FsStatistics> {
        let (share, _) = handle.decode()?;
        if let Some(stats) = self.stats_cache.get(&share) {
            return Ok(stats);
        }
        let scan_share = share.clone();
        let (used_bytes, used_files) = self
            .with_read(cancel, move |txn| {
                let shares = txn.open_table(keys::SHARES).map_err(map_table)?;
                share_record_from(&shares, &scan_share)?;
                let files = txn.open_table(keys::FILES).map_err(map_table)?;
                let mut used_bytes = 0u64;
                let mut used_files = 0u64;
                for item in files.iter().map_err(map_storage)? {
                    let (_, value) = item.map_err(map_storage)?;
                    let file = codec::decode_file(value.value())?;
                    if file.share_name == scan_share {
                        used_files += 1;
                        used_bytes = used_bytes.saturating_add(file.size);
                    }
                }
                Ok((used_bytes, used_files))
            })
            .await?;
        Ok(self.statistics_for(share, used_bytes, used_files))
    }

    async fn filesystem_capabilities(
        &self,
        _cancel: &CancellationToken,
        handle: &FileHandle,
    ) -> StoreResult<FsCapabilities> {
        handle.decode()?;
        Ok(FsCapabilities::default())
    }

    async fn server_config(&self, cancel: &CancellationToken) -> StoreResult<ServerSettings> {
        self.with_read(cancel, move |txn| {
            let config = txn.open_table(keys::CONFIG).map_err(map_table)?;
            match config.get(keys::SERVER_SETTINGS_KEY).map_err(map_storage)? {
                Some(guard) => codec::decode_settings(guard.value()),
                None => Ok(ServerSettings::new()),
            }
        })
        .await
    }

    async fn set_server_config(
        &self,
        cancel: &CancellationToken,
        settings: ServerSettings,
    ) -> StoreResult<()> {
        self.with_write(cancel, move |txn| {
            let mut config = txn.open_table(keys::CONFIG).map_err(map_table)?;
            config
                .insert(keys::SERVER_SETTINGS_KEY, codec::encode_settings(&settings).as_slice())
                .map_err(map_storage)?;
            Ok(())
        })
        .await
    }
}

/// All tables of one write transaction, opened together.
struct WriteTables<'t> {
    files: redb::Table<'t, &'static [u8], &'static [u8]>,
    children: redb::Table<'t, &'static [u8], &'static [u8]>,
    parents: redb::Table<'t, &'static [u8], &'static [u8]>,
    links: redb::Table<'t, &'static [u8], u64>,
    shares: redb::Table<'t, &'static [u8], &'static [u8]>,
    devices: redb::Table<'t, &'static [u8], &'static [u8]>,
}

impl<'t> WriteTables<'t> {
    fn open(txn: &'t redb::WriteTransaction) -> StoreResult<Self> {
        Ok(WriteTables {
            files: txn.open_table(keys::FILES).map_err(map_table)?,
            children: txn.open_table(keys::CHILDREN).map_err(map_table)?,
            parents: txn.open_table(keys::PARENTS).map_err(map_table)?,
            links: txn.open_table(keys::LINKS).map_err(map_table)?,
            shares: txn.open_table(keys::SHARES).map_err(map_table)?,
            devices: txn.open_table(keys::DEVICES).map_err(map_table)?,
        })
    }

    fn require_file(&self, id: Uuid, share: &str) -> StoreResult<File> {
        require_file_from(&self.files, &self.links, &self.devices, share, id)
    }

    fn require_directory(&self, share: &str, id: Uuid) -> StoreResult<File> {
        let file = self.require_file(id, share)?;
        if !file.file_type.is_directory() {
            return Err(StoreError::NotDirectory { path: file.path });
        }
        Ok(file)
    }

    fn store_file(&mut self, file: &File) -> StoreResult<()> {
        self.files
            .insert(keys::id_key(file.id).as_slice(), codec::encode_file(file).as_slice())
            .map_err(map_storage)?;
        Ok(())
    }

    fn child_id(&self, parent: Uuid, name: &str) -> StoreResult<Option<Uuid>> {
        child_id_from(&self.children, parent, name)
    }

    fn insert_edge(&mut self, parent: Uuid, name: &str, child: Uuid) -> StoreResult<()> {
        self.children
            .insert(keys::child_key(parent, name).as_slice(), child.as_bytes().as_slice())
            .map_err(map_storage)?;
        Ok(())
    }

    fn remove_edge(&mut self, parent: Uuid, name: &str) -> StoreResult<()> {
        self.children.remove(keys::child_key(parent, name).as_slice()).map_err(map_storage)?;
        Ok(())
    }

    fn set_parent(&mut self, child: Uuid, parent: Uuid) -> StoreResult<()> {
        self.parents
            .insert(keys::id_key(child).as_slice(), parent.as_bytes().as_slice())
            .map_err(map_storage)?;
        Ok(())
    }

    fn link_count(&self, id: Uuid) -> StoreResult<u64> {
        Ok(self.links.get(keys::id_key(id).as_slice()).map_err(map_storage)?.map(|g| g.value()).unwrap_or(0))
    }

    fn set_link_count(&mut self, id: Uuid, count: u64) -> StoreResult<()> {
        self.links.insert(keys::id_key(id).as_slice(), count).map_err(map_storage)?;
        Ok(())
    }

    /// Adjust a link count and return the new value. Decrements saturate
    /// at zero so a silly-renamed file can still be unlinked.
    fn bump_link_count(&mut self, id: Uuid, delta: i64) -> StoreResult<u64> {
        let current = self.link_count(id)?;
        let next = if delta < 0 {
            current.saturating_sub(delta.unsigned_abs())
        } else {
            current.saturating_add(delta as u64)
        };
        self.set_link_count(id, next)?;
        Ok(next)
    }

    fn has_children(&self, parent: Uuid) -> StoreResult<bool> {
        has_children_from(&self.children, parent)
    }

    fn destroy_file(&mut self, id: Uuid) -> StoreResult<()> {
        let key = keys::id_key(id);
        self.files.remove(key.as_slice()).map_err(map_storage)?;
        self.links.remove(key.as_slice()).map_err(map_storage)?;
        self.parents.remove(key.as_slice()).map_err(map_storage)?;
        self.devices.remove(key.as_slice()).map_err(map_storage)?;
        Ok(())
    }

    fn store_device(&mut self, id: Uuid, device: DeviceNumbers) -> StoreResult<()> {
        self.devices
            .insert(keys::id_key(id).as_slice(), codec::encode_device(device).as_slice())
            .map_err(map_storage)?;
        Ok(())
    }

    fn share_record_opt(&self, share: &str) -> StoreResult<Option<ShareRecord>> {
        match self.shares.get(share.as_bytes()).map_err(map_storage)? {
            Some(guard) => Ok(Some(codec::decode_share_record(guard.value())?)),
            None => Ok(None),
        }
    }

    fn share_record(&self, share: &str) -> StoreResult<ShareRecord> {
        self.share_record_opt(share)?.ok_or_else(|| StoreError::not_found(share))
    }

    fn put_share_record(&mut self, share: &str, record: &ShareRecord) -> StoreResult<()> {
        self.shares
            .insert(share.as_bytes(), codec::encode_share_record(record).as_slice())
            .map_err(map_storage)?;
        Ok(())
    }

    /// Any surviving edge pointing at `child`, skipping the one being
    /// removed. Used to repoint a hard link's canonical path.
    fn find_edge_for(
        &self,
        child: Uuid,
        skip_parent: Uuid,
        skip_name: &str,
    ) -> StoreResult<Option<(Uuid, String)>> {
        for item in self.children.iter().map_err(map_storage)? {
            let (key, value) = item.map_err(map_storage)?;
            if value.value() != child.as_bytes().as_slice() {
                continue;
            }
            let Some((parent, name_bytes)) = keys::split_child_key(key.value()) else {
                continue;
            };
            let name = match std::str::from_utf8(name_bytes) {
                Ok(name) => name.to_owned(),
                Err(_) => continue,
            };
            if parent == skip_parent && name == skip_name {
                continue;
            }
            return Ok(Some((parent, name)));
        }
        Ok(None)
    }

    /// Splice the path prefix of every descendant of a moved directory,
    /// stamping ctime. Runs inside the same transaction as the rename and
    /// checks cancellation at batch boundaries; a cancelled rewrite rolls
    /// the whole rename back.
    fn rewrite_descendant_paths(
        &mut self,
        share: &str,
        old_path: &str,
        new_path: &str,
        now: Timestamp,
        cancel: &CancellationToken,
    ) -> StoreResult<()> {
        let mut touched = Vec::new();
        for (index, item) in self.files.iter().map_err(map_storage)?.enumerate() {
            if index % REWRITE_BATCH == 0 && cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let (_, value) = item.map_err(map_storage)?;
            let file = codec::decode_file(value.value())?;
            if file.share_name != share {
                continue;
            }
            if let Some(rewritten) = paths::rewrite_prefix(&file.path, old_path, new_path) {
                touched.push((file, rewritten));
            }
        }
        let descendants = touched.len();
        for (index, (mut file, rewritten)) in touched.into_iter().enumerate() {
            if index % REWRITE_BATCH == 0 && cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            file.path = rewritten;
            file.ctime = now;
            self.store_file(&file)?;
        }
        if descendants > 0 {
            debug!(share = %share, from = %old_path, to = %new_path, descendants, "rewrote descendant paths");
        }
        Ok(())
    }
}

fn load_file_from(
    files: &impl ReadableTable<&'static [u8], &'static [u8]>,
    links: &impl ReadableTable<&'static [u8], u64>,
    devices: &impl ReadableTable<&'static [u8], &'static [u8]>,
    id: Uuid,
) -> StoreResult<Option<File>> {
    let key = keys::id_key(id);
    let Some(guard) = files.get(key.as_slice()).map_err(map_storage)? else {
        return Ok(None);
    };
    let mut file = codec::decode_file(guard.value())?;
    drop(guard);
    file.nlink =
        links.get(key.as_slice()).map_err(map_storage)?.map(|g| g.value()).unwrap_or(0) as u32;
    if file.file_type.is_device() {
        if let Some(guard) = devices.get(key.as_slice()).map_err(map_storage)? {
            file.device = Some(codec::decode_device(guard.value())?);
        }
    }
    Ok(Some(file))
}

fn require_file_from(
    files: &impl ReadableTable<&'static [u8], &'static [u8]>,
    links: &impl ReadableTable<&'static [u8], u64>,
    devices: &impl ReadableTable<&'static [u8], &'static [u8]>,
    share: &str,
    id: Uuid,
) -> StoreResult<File> {
    let file = load_file_from(files, links, devices, id)?
        .ok_or_else(|| StoreError::not_found(format!("{share}:{id}")))?;
    if file.share_name != share {
        return Err(StoreError::InvalidHandle("handle share does not match the file".into()));
    }
    Ok(file)
}

fn require_directory_from(
    files: &impl ReadableTable<&'static [u8], &'static [u8]>,
    links: &impl ReadableTable<&'static [u8], u64>,
    devices: &impl ReadableTable<&'static [u8], &'static [u8]>,
    share: &str,
    id: Uuid,
) -> StoreResult<File> {
    let file = require_file_from(files, links, devices, share, id)?;
    if !file.file_type.is_directory() {
        return Err(StoreError::NotDirectory { path: file.path });
    }
    Ok(file)
}

fn share_record_from(
    shares: &impl ReadableTable<&'static [u8], &'static [u8]>,
    share: &str,
) -> StoreResult<ShareRecord> {
    match shares.get(share.as_bytes()).map_err(map_storage)? {
        Some(guard) => codec::decode_share_record(guard.value()),
        None => Err(StoreError::not_found(share)),
    }
}

fn child_id_from(
    children: &impl ReadableTable<&'static [u8], &'static [u8]>,
    parent: Uuid,
    name: &str,
) -> StoreResult<Option<Uuid>> {
    match children.get(keys::child_key(parent, name).as_slice()).map_err(map_storage)? {
        Some(guard) => Uuid::from_slice(guard.value())
            .map(Some)
            .map_err(|_| StoreError::io("corrupt edge value")),
        None => Ok(None),
    }
}

fn has_children_from(
    children: &impl ReadableTable<&'static [u8], &'static [u8]>,
    parent: Uuid,
) -> StoreResult<bool> {
    let start = keys::children_start(parent);
    let mut iter = match keys::children_end(parent) {
        Some(end) => {
            children.range::<&[u8]>(start.as_slice()..end.as_slice()).map_err(map_storage)?
        }
        None => children.range::<&[u8]>(start.as_slice()..).map_err(map_storage)?,
    };
    match iter.next() {
        Some(item) => {
            item.map_err(map_storage)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

fn require_regular(file: &File) -> StoreResult<()> {
    match file.file_type {
        FileType::Regular => Ok(()),
        FileType::Directory => Err(StoreError::IsDirectory { path: file.path.clone() }),
        _ => Err(StoreError::invalid_argument(format!("{} is not a regular file", file.path))),
    }
}

fn map_transaction(err: redb::TransactionError) -> StoreError {
    warn!(error = %err, "transaction begin failed");
    StoreError::retryable_io(format!("transaction: {err}"))
}

fn map_table(err: redb::TableError) -> StoreError {
    StoreError::io(format!("table: {err}"))
}

fn map_storage(err: redb::StorageError) -> StoreError {
    match err {
        redb::StorageError::Io(ref io_err)
            if io_err.kind() == std::io::ErrorKind::StorageFull =>
        {
            StoreError::NoSpace
        }
        other => StoreError::io(format!("storage: {other}")),
    }
}

fn map_commit(err: redb::CommitError) -> StoreError {
    warn!(error = %err, "commit failed");
    StoreError::retryable_io(format!("commit: {err}"))
}
