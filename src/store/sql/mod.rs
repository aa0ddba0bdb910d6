//! Relational backend (PostgreSQL).
//!
//! One transaction per operation; directory rows are pinned with
//! `SELECT ... FOR UPDATE` so same-parent mutations serialize on the row
//! lock, and rename locks both parents in sorted-id order. Check
//! constraints back the type invariants the code also enforces, and the
//! unique `(parent_id, child_name)` index turns create races into
//! `already-exists` instead of duplicate edges.

mod migrations;
mod pool;

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio_postgres::{Row, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::access::{self, Permissions};
use crate::auth::AuthContext;
use crate::config::{MigrationMode, StoreConfig};
use crate::error::{StoreError, StoreResult};
use crate::handle::FileHandle;
use crate::locks::LockManager;
use crate::model::{
    Clock, CreateAttributes, DeviceNumbers, File, FileType, FsCapabilities, FsStatistics,
    IdSource, IdentityMapping, ServerSettings, SetAttributes, ShareOptions, SquashMode,
    Timestamp, MODE_MASK,
};
use crate::store::paths;
use crate::store::{
    ContinuationToken, DirEntry, DirPage, MetadataStore, RenameOutcome, ShareAccess, WriteIntent,
};
use crate::validate;

use pool::{map_pg_error, map_run_error, PgPool};

const FILE_COLUMNS: &str = "f.id, f.share_name, f.path, f.file_type, f.mode, f.uid, f.gid, \
    f.size, f.atime, f.mtime, f.ctime, f.creation_time, f.link_target, f.content_id, \
    f.device_major, f.device_minor, COALESCE(l.link_count, 0) AS link_count";

const FILE_FROM: &str = "FROM files f LEFT JOIN link_counts l ON l.file_id = f.id";

/// Metadata store backed by PostgreSQL with row-level locking.
pub struct SqlStore {
    pool: PgPool,
    locks: LockManager,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
    stats_cache: moka::sync::Cache<String, FsStatistics>,
    capacity_bytes: u64,
    capacity_files: u64,
}

impl SqlStore {
    /// Connect the pool and bring the schema up to date (or verify it,
    /// under the manual migration mode).
    pub async fn connect(
        config: &StoreConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdSource>,
    ) -> StoreResult<SqlStore> {
        let pool = pool::build_pool(&config.sql).await?;
        {
            let mut conn = pool.get().await.map_err(map_run_error)?;
            match config.sql.migration_mode {
                MigrationMode::Auto => migrations::run(&mut conn).await?,
                MigrationMode::Manual => migrations::verify(&conn).await?,
            }
        }
        Ok(SqlStore {
            pool,
            locks: LockManager::new(Arc::clone(&clock)),
            clock,
            ids,
            stats_cache: moka::sync::Cache::builder()
                .time_to_live(config.sql.statistics_cache_ttl())
                .build(),
            capacity_bytes: config.capacity_bytes,
            capacity_files: config.capacity_files,
        })
    }

    /// Shared trunk of the create family; mirrors the embedded backend so
    /// both enforce identical semantics.
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
        let applied =
            validate::apply_defaults(&attr, file_type, &link_target, auth, self.clock.as_ref());
        let id = self.ids.next_id();

        ensure_live(cancel)?;
        let mut conn = self.pool.get().await.map_err(map_run_error)?;
        let txn = conn.transaction().await.map_err(map_pg_error)?;

        let dir = lock_directory(&txn, &share, parent_id).await?;
        let options = share_options(&txn, &share).await?.1;
        access::require(auth, &dir, &options, Permissions::WRITE)?;

        let path = paths::join_path(&dir.path, name);
        if child_id(&txn, parent_id, name).await?.is_some() {
            return Err(StoreError::AlreadyExists { path });
        }

        let content_id = match file_type {
            FileType::Regular => paths::content_id_for(&share, &path),
            _ => String::new(),
        };
        let nlink = if file_type.is_directory() { 2u32 } else { 1u32 };
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

        insert_file(&txn, &file).await?;
        set_link_count(&txn, id, i64::from(nlink)).await?;
        insert_edge(&txn, parent_id, name, id).await?;
        if file_type.is_directory() {
            bump_link_count(&txn, parent_id, 1).await?;
        }
        touch_directory(&txn, parent_id, applied.now).await?;

        ensure_live(cancel)?;
        txn.commit().await.map_err(map_pg_error)?;
        self.stats_cache.invalidate(&share);

        let handle = FileHandle::encode(&share, id)?;
        Ok((handle, file))
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
impl MetadataStore for SqlStore {
    fn locks(&self) -> &LockManager {
        &self.locks
    }

    async fn check_share_access(
        &self,
        cancel: &CancellationToken,
        share_name: &str,
        auth: &AuthContext,
    ) -> StoreResult<ShareAccess> {
        ensure_live(cancel)?;
        let conn = self.pool.get().await.map_err(map_run_error)?;
        let row = conn
            .query_opt(SHARE_QUERY, &[&share_name])
            .await
            .map_err(map_pg_error)?
            .ok_or_else(|| StoreError::not_found(share_name))?;
        let (_, options) = share_from_row(&row)?;
        Ok(access::evaluate_share_access(&options, auth))
    }

    async fn set_share_options(
        &self,
        cancel: &CancellationToken,
        share_name: &str,
        options: ShareOptions,
    ) -> StoreResult<()> {
        ensure_live(cancel)?;
        let conn = self.pool.get().await.map_err(map_run_error)?;
        let (squash, map_uid, map_gid) = mapping_columns(&options.identity_mapping);
        let updated = conn
            .execute(
                "UPDATE shares SET read_only = $2, require_auth = $3, \
                 allowed_auth_methods = $4, denied_clients = $5, allowed_clients = $6, \
                 squash = $7, map_uid = $8, map_gid = $9 WHERE share_name = $1",
                &[
                    &share_name,
                    &options.read_only,
                    &options.require_auth,
                    &options.allowed_auth_methods,
                    &options.denied_clients,
                    &options.allowed_clients,
                    &squash,
                    &map_uid,
                    &map_gid,
                ],
            )
            .await
            .map_err(map_pg_error)?;
        if updated == 0 {
            return Err(StoreError::not_found(share_name));
        }
        Ok(())
    }

    async fn create_root_directory(
        &self,
        cancel: &CancellationToken,
        share_name: &str,
        attr: CreateAttributes,
    ) -> StoreResult<(FileHandle, File)> {
        let share = share_name.to_owned();
        let mode = if attr.mode == 0 { validate::DEFAULT_DIR_MODE } else { attr.mode & MODE_MASK };
        let id = self.ids.next_id();
        let now = self.clock.now();

        ensure_live(cancel)?;
        let mut conn = self.pool.get().await.map_err(map_run_error)?;
        let txn = conn.transaction().await.map_err(map_pg_error)?;

        // Serialize concurrent instances bootstrapping the same share.
        txn.query("SELECT pg_advisory_xact_lock($1)", &[&share_lock_key(&share)])
            .await
            .map_err(map_pg_error)?;

        let existing = txn
            .query_opt("SELECT root_file_id FROM shares WHERE share_name = $1", &[&share])
            .await
            .map_err(map_pg_error)?;

        let root = if let Some(row) = existing {
            let root_id: Uuid = row.try_get(0).map_err(map_pg_error)?;
            let mut root = load_file(&txn, &share, root_id, true).await?;
            if root.mode != mode || root.uid != attr.uid || root.gid != attr.gid {
                root.mode = mode;
                root.uid = attr.uid;
                root.gid = attr.gid;
                root.ctime = now;
                update_file(&txn, &root).await?;
            }
            root
        } else {
            let root = File {
                id,
                share_name: share.clone(),
                path: "/".to_owned(),
                file_type: FileType::Directory,
                mode,
                uid: attr.uid,
                gid: attr.gid,
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
            insert_file(&txn, &root).await?;
            set_link_count(&txn, id, 2).await?;
            txn.execute(
                "INSERT INTO shares (share_name, root_file_id) VALUES ($1, $2)",
                &[&share, &id],
            )
            .await
            .map_err(map_pg_error)?;
            debug!(share = %share, root = %id, "created share root");
            root
        };

        ensure_live(cancel)?;
        txn.commit().await.map_err(map_pg_error)?;
        self.stats_cache.invalidate(&share);
        let handle = FileHandle::encode(&share, root.id)?;
        Ok((handle, root))
    }

    async fn get_file(&self, cancel: &CancellationToken, handle: &FileHandle) -> StoreResult<File> {
        let (share, id) = handle.decode()?;
        ensure_live(cancel)?;
        let conn = self.pool.get().await.map_err(map_run_error)?;
        let row = conn
            .query_opt(&file_query("f.id = $1", false), &[&id])
            .await
            .map_err(map_pg_error)?
            .ok_or_else(|| StoreError::not_found(format!("{share}:{id}")))?;
        let file = file_from_row(&row)?;
        require_same_share(&file, &share)?;
        Ok(file)
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
        ensure_live(cancel)?;
        let mut conn = self.pool.get().await.map_err(map_run_error)?;
        let txn = conn.transaction().await.map_err(map_pg_error)?;

        let dir = require_directory(&txn, &share, parent_id).await?;
        let options = share_options(&txn, &share).await?.1;
        access::require(auth, &dir, &options, Permissions::EXECUTE)?;

        let child = child_id(&txn, parent_id, name)
            .await?
            .ok_or_else(|| StoreError::not_found(paths::join_path(&dir.path, name)))?;
        let file = load_file(&txn, &share, child, false).await?;
        txn.commit().await.map_err(map_pg_error)?;

        let handle = FileHandle::encode(&share, child)?;
        Ok((handle, file))
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
        let resume_after = token.map(|t| t.0).unwrap_or_default();
        // Rows are trimmed by estimated reply size; fetching one page's
        // worth plus one tells us whether the listing is exhausted.
        let fetch_limit = (budget / u64::from(paths::DIR_ENTRY_OVERHEAD) + 2) as i64;

        ensure_live(cancel)?;
        let mut conn = self.pool.get().await.map_err(map_run_error)?;
        let txn = conn.transaction().await.map_err(map_pg_error)?;

        let dir = require_directory(&txn, &share, dir_id).await?;
        let options = share_options(&txn, &share).await?.1;
        access::require(auth, &dir, &options, Permissions::READ.union(Permissions::EXECUTE))?;

        let rows = txn
            .query(
                &format!(
                    "SELECT m.child_name, {FILE_COLUMNS} \
                     FROM parent_child_map m \
                     JOIN files f ON f.id = m.child_id \
                     LEFT JOIN link_counts l ON l.file_id = f.id \
                     WHERE m.parent_id = $1 AND m.child_name > $2 \
                     ORDER BY m.child_name LIMIT $3"
                ),
                &[&dir_id, &resume_after, &fetch_limit],
            )
            .await
            .map_err(map_pg_error)?;
        txn.commit().await.map_err(map_pg_error)?;

        let exhausted = (rows.len() as i64) < fetch_limit;
        let mut entries: Vec<DirEntry> = Vec::new();
        let mut used = 0u64;
        let mut truncated = false;
        for row in &rows {
            let name: String = row.try_get("child_name").map_err(map_pg_error)?;
            let file = file_from_row(row)?;
            let handle = FileHandle::encode(&share, file.id)?;
            let estimate = u64::from(paths::estimated_entry_size(&name, handle.as_bytes().len()));
            if !entries.is_empty() && used + estimate > budget {
                truncated = true;
                break;
            }
            used += estimate;
            entries.push(DirEntry { name, handle, file });
        }
        let next = if truncated || !exhausted {
            entries.last().map(|e| ContinuationToken(e.name.clone()))
        } else {
            None
        };
        Ok(DirPage { entries, next })
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

        ensure_live(cancel)?;
        let mut conn = self.pool.get().await.map_err(map_run_error)?;
        let txn = conn.transaction().await.map_err(map_pg_error)?;

        let dir = lock_directory(&txn, &share, dir_id).await?;
        let options = share_options(&txn, &share).await?.1;
        access::require(auth, &dir, &options, Permissions::WRITE)?;

        let mut file = load_file(&txn, &share, target_id, true).await?;
        if file.file_type.is_directory() {
            return Err(StoreError::IsDirectory { path: file.path });
        }
        let link_path = paths::join_path(&dir.path, name);
        if child_id(&txn, dir_id, name).await?.is_some() {
            return Err(StoreError::AlreadyExists { path: link_path });
        }

        insert_edge(&txn, dir_id, name, target_id).await?;
        let count = bump_link_count(&txn, target_id, 1).await?;
        file.nlink = count as u32;
        file.ctime = now;
        update_file(&txn, &file).await?;
        touch_directory(&txn, dir_id, now).await?;

        ensure_live(cancel)?;
        txn.commit().await.map_err(map_pg_error)?;
        self.stats_cache.invalidate(&share);
        Ok(file)
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

        ensure_live(cancel)?;
        let mut conn = self.pool.get().await.map_err(map_run_error)?;
        let txn = conn.transaction().await.map_err(map_pg_error)?;

        let dir = lock_directory(&txn, &share, parent_id).await?;
        let options = share_options(&txn, &share).await?.1;
        access::require(auth, &dir, &options, Permissions::WRITE)?;

        let victim_path = paths::join_path(&dir.path, name);
        let victim_id = child_id(&txn, parent_id, name)
            .await?
            .ok_or_else(|| StoreError::not_found(victim_path.clone()))?;
        let mut victim = load_file(&txn, &share, victim_id, true).await?;
        if victim.file_type.is_directory() {
            return Err(StoreError::IsDirectory { path: victim.path });
        }
        access::check_sticky_bit(auth, &dir, &victim)?;

        // Match by (parent, name); a hard-linked child may sit under other
        // names in this very directory.
        delete_edge(&txn, parent_id, name).await?;
        let remaining = bump_link_count(&txn, victim_id, -1).await?;

        if remaining == 0 {
            destroy_file(&txn, victim_id).await?;
            victim.nlink = 0;
        } else {
            victim.nlink = remaining as u32;
            if victim.path == victim_path {
                if let Some((_, other_name, other_dir_path)) =
                    find_edge_for(&txn, victim_id, parent_id, name).await?
                {
                    victim.path = paths::join_path(&other_dir_path, &other_name);
                }
            }
            victim.ctime = now;
            update_file(&txn, &victim).await?;
            victim.content_id = String::new();
        }
        touch_directory(&txn, parent_id, now).await?;

        ensure_live(cancel)?;
        txn.commit().await.map_err(map_pg_error)?;
        self.stats_cache.invalidate(&share);
        Ok(victim)
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

        ensure_live(cancel)?;
        let mut conn = self.pool.get().await.map_err(map_run_error)?;
        let txn = conn.transaction().await.map_err(map_pg_error)?;

        let dir = lock_directory(&txn, &share, parent_id).await?;
        let options = share_options(&txn, &share).await?.1;
        access::require(auth, &dir, &options, Permissions::WRITE)?;

        let victim_path = paths::join_path(&dir.path, name);
        let victim_id = child_id(&txn, parent_id, name)
            .await?
            .ok_or_else(|| StoreError::not_found(victim_path.clone()))?;
        let victim = load_file(&txn, &share, victim_id, true).await?;
        if !victim.file_type.is_directory() {
            return Err(StoreError::NotDirectory { path: victim.path });
        }
        access::check_sticky_bit(auth, &dir, &victim)?;
        if has_children(&txn, victim_id).await? {
            return Err(StoreError::NotEmpty { path: victim.path });
        }

        delete_edge(&txn, parent_id, name).await?;
        destroy_file(&txn, victim_id).await?;
        bump_link_count(&txn, parent_id, -1).await?;
        touch_directory(&txn, parent_id, now).await?;

        ensure_live(cancel)?;
        txn.commit().await.map_err(map_pg_error)?;
        self.stats_cache.invalidate(&share);
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
        let same_parent = src_parent_id == dst_parent_id;

        ensure_live(cancel)?;
        let mut conn = self.pool.get().await.map_err(map_run_error)?;
        let txn = conn.transaction().await.map_err(map_pg_error)?;

        // Row locks are taken in sorted-id order to keep concurrent
        // renames deadlock-free.
        let parent_ids: Vec<Uuid> = if same_parent {
            vec![src_parent_id]
        } else {
            let mut ids = vec![src_parent_id, dst_parent_id];
            ids.sort();
            ids
        };
        let rows = txn
            .query(&file_query("f.id = ANY($1) ORDER BY f.id", true), &[&parent_ids])
            .await
            .map_err(map_pg_error)?;
        if rows.len() != parent_ids.len() {
            return Err(StoreError::not_found(format!("{share}: rename parent")));
        }
        let mut src_dir = None;
        let mut dst_dir = None;
        for row in &rows {
            let file = file_from_row(row)?;
            require_same_share(&file, &share)?;
            if !file.file_type.is_directory() {
                return Err(StoreError::NotDirectory { path: file.path });
            }
            if file.id == src_parent_id {
                src_dir = Some(file.clone());
            }
            if file.id == dst_parent_id {
                dst_dir = Some(file);
            }
        }
        let src_dir = src_dir.ok_or_else(|| StoreError::not_found(format!("{share}: source parent")))?;
        let dst_dir = dst_dir.ok_or_else(|| StoreError::not_found(format!("{share}: target parent")))?;

        let options = share_options(&txn, &share).await?.1;
        access::require(auth, &src_dir, &options, Permissions::WRITE)?;
        access::require(auth, &dst_dir, &options, Permissions::WRITE)?;

        let src_path = paths::join_path(&src_dir.path, src_name);
        let child_file_id = child_id(&txn, src_parent_id, src_name)
            .await?
            .ok_or_else(|| StoreError::not_found(src_path.clone()))?;
        let mut child = load_file(&txn, &share, child_file_id, true).await?;
        access::check_sticky_bit(auth, &src_dir, &child)?;

        if same_parent && src_name == dst_name {
            txn.commit().await.map_err(map_pg_error)?;
            return Ok(RenameOutcome::default());
        }
        let existing_dst = child_id(&txn, dst_parent_id, dst_name).await?;
        if existing_dst == Some(child_file_id) {
            // Hard links of the same file; POSIX rename does nothing.
            txn.commit().await.map_err(map_pg_error)?;
            return Ok(RenameOutcome::default());
        }

        let moving_directory = child.file_type.is_directory();
        if moving_directory {
            if dst_parent_id == child_file_id
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
            let mut victim = load_file(&txn, &share, victim_id, true).await?;
            access::check_sticky_bit(auth, &dst_dir, &victim)?;

            match (moving_directory, victim.file_type.is_directory()) {
                (true, false) => return Err(StoreError::NotDirectory { path: victim.path }),
                (false, true) => return Err(StoreError::IsDirectory { path: victim.path }),
                (true, true) => {
                    if has_children(&txn, victim_id).await? {
                        return Err(StoreError::NotEmpty { path: victim.path });
                    }
                    delete_edge(&txn, dst_parent_id, dst_name).await?;
                    destroy_file(&txn, victim_id).await?;
                    bump_link_count(&txn, dst_parent_id, -1).await?;
                    victim.nlink = 0;
                    replaced = Some(victim);
                }
                (false, false) => {
                    delete_edge(&txn, dst_parent_id, dst_name).await?;
                    let remaining = bump_link_count(&txn, victim_id, -1).await?;
                    if remaining == 0 {
                        destroy_file(&txn, victim_id).await?;
                        victim.nlink = 0;
                    } else {
                        victim.nlink = remaining as u32;
                        let displaced = paths::join_path(&dst_dir.path, dst_name);
                        if victim.path == displaced {
                            if let Some((_, other_name, other_dir_path)) =
                                find_edge_for(&txn, victim_id, dst_parent_id, dst_name).await?
                            {
                                victim.path = paths::join_path(&other_dir_path, &other_name);
                            }
                        }
                        victim.ctime = now;
                        update_file(&txn, &victim).await?;
                        victim.content_id = String::new();
                    }
                    replaced = Some(victim);
                }
            }
        }

        delete_edge(&txn, src_parent_id, src_name).await?;
        insert_edge(&txn, dst_parent_id, dst_name, child_file_id).await?;

        let old_path = child.path.clone();
        let new_path = paths::join_path(&dst_dir.path, dst_name);
        child.path = new_path.clone();
        child.ctime = now;
        update_file(&txn, &child).await?;
        if !moving_directory && paths::is_silly_rename_name(dst_name) {
            // NFS silly rename: unlinked but still open. The record stays
            // addressable by handle while reporting no links.
            set_link_count(&txn, child_file_id, 0).await?;
            child.nlink = 0;
        }

        if moving_directory && !same_parent {
            // The `..` reference migrates with the directory.
            bump_link_count(&txn, src_parent_id, -1).await?;
            bump_link_count(&txn, dst_parent_id, 1).await?;
        }

        if moving_directory && old_path != new_path {
            ensure_live(cancel)?;
            let rewritten = txn
                .execute(
                    "UPDATE files \
                     SET path = $3 || substring(path FROM char_length($2) + 1), ctime = $4 \
                     WHERE share_name = $1 AND left(path, char_length($2) + 1) = $2 || '/'",
                    &[&share, &old_path, &new_path, &now.as_unix_nanos()],
                )
                .await
                .map_err(map_pg_error)?;
            if rewritten > 0 {
                debug!(share = %share, from = %old_path, to = %new_path, descendants = rewritten, "rewrote descendant paths");
            }
        }

        touch_directory(&txn, src_parent_id, now).await?;
        if !same_parent {
            touch_directory(&txn, dst_parent_id, now).await?;
        }

        ensure_live(cancel)?;
        txn.commit().await.map_err(map_pg_error)?;
        self.stats_cache.invalidate(&share);
        Ok(RenameOutcome { replaced })
    }

    async fn read_symlink(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        handle: &FileHandle,
    ) -> StoreResult<(String, File)> {
        let (share, id) = handle.decode()?;
        ensure_live(cancel)?;
        let mut conn = self.pool.get().await.map_err(map_run_error)?;
        let txn = conn.transaction().await.map_err(map_pg_error)?;
        let file = load_file(&txn, &share, id, false).await?;
        if file.file_type != FileType::Symlink {
            return Err(StoreError::invalid_argument(format!(
                "{} is not a symbolic link",
                file.path
            )));
        }
        let options = share_options(&txn, &share).await?.1;
        access::require(auth, &file, &options, Permissions::READ)?;
        txn.commit().await.map_err(map_pg_error)?;
        Ok((file.link_target.clone(), file))
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

        ensure_live(cancel)?;
        let mut conn = self.pool.get().await.map_err(map_run_error)?;
        let txn = conn.transaction().await.map_err(map_pg_error)?;

        let mut file = load_file(&txn, &share, id, true).await?;
        let options = share_options(&txn, &share).await?.1;

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
            access::require(auth, &file, &options, Permissions::WRITE)?;
        }
        if (changes.atime.is_some() || changes.mtime.is_some()) && !is_owner {
            access::require(auth, &file, &options, Permissions::WRITE)?;
        }

        file.apply_changes(&changes, now);
        update_file(&txn, &file).await?;
        ensure_live(cancel)?;
        txn.commit().await.map_err(map_pg_error)?;
        self.stats_cache.invalidate(&share);
        Ok(file)
    }

    async fn prepare_write(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        handle: &FileHandle,
        new_size: u64,
    ) -> StoreResult<WriteIntent> {
        let (share, id) = handle.decode()?;
        ensure_live(cancel)?;
        let mut conn = self.pool.get().await.map_err(map_run_error)?;
        let txn = conn.transaction().await.map_err(map_pg_error)?;
        let file = load_file(&txn, &share, id, false).await?;
        require_regular(&file)?;
        let options = share_options(&txn, &share).await?.1;
        access::require(auth, &file, &options, Permissions::WRITE)?;
        txn.commit().await.map_err(map_pg_error)?;

        Ok(WriteIntent {
            handle: FileHandle::encode(&file.share_name, file.id)?,
            new_size,
            mtime: self.clock.now(),
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

        ensure_live(cancel)?;
        let mut conn = self.pool.get().await.map_err(map_run_error)?;
        let txn = conn.transaction().await.map_err(map_pg_error)?;

        let mut file = load_file(&txn, &share, id, true).await?;
        require_regular(&file)?;
        let options = share_options(&txn, &share).await?.1;
        access::require(auth, &file, &options, Permissions::WRITE)?;

        // Out-of-order commits never shrink the file.
        file.size = file.size.max(intent.new_size);
        file.mtime = intent.mtime;
        file.ctime = now;
        update_file(&txn, &file).await?;
        ensure_live(cancel)?;
        txn.commit().await.map_err(map_pg_error)?;
        self.stats_cache.invalidate(&share);
        Ok(file)
    }

    async fn prepare_read(
        &self,
        cancel: &CancellationToken,
        auth: &AuthContext,
        handle: &FileHandle,
    ) -> StoreResult<File> {
        let (share, id) = handle.decode()?;
        ensure_live(cancel)?;
        let mut conn = self.pool.get().await.map_err(map_run_error)?;
        let txn = conn.transaction().await.map_err(map_pg_error)?;
        let file = load_file(&txn, &share, id, false).await?;
        require_regular(&file)?;
        let options = share_options(&txn, &share).await?.1;
        access::require(auth, &file, &options, Permissions::READ)?;
        txn.commit().await.map_err(map_pg_error)?;
        Ok(file)
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
        ensure_live(cancel)?;
        let conn = self.pool.get().await.map_err(map_run_error)?;
        conn.query_opt("SELECT 1 FROM shares WHERE share_name = $1", &[&share])
            .await
            .map_err(map_pg_error)?
            .ok_or_else(|| StoreError::not_found(share.clone()))?;
        let row = conn
            .query_one(
                "SELECT COALESCE(SUM(size), 0)::BIGINT, COUNT(*) FROM files WHERE share_name = $1",
                &[&share],
            )
            .await
            .map_err(map_pg_error)?;
        let used_bytes: i64 = row.try_get(0).map_err(map_pg_error)?;
        let used_files: i64 = row.try_get(1).map_err(map_pg_error)?;
        Ok(self.statistics_for(share, used_bytes as u64, used_files as u64))
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
        ensure_live(cancel)?;
        let conn = self.pool.get().await.map_err(map_run_error)?;
        let rows =
            conn.query("SELECT key, value FROM server_config", &[]).await.map_err(map_pg_error)?;
        let mut settings = ServerSettings::new();
        for row in rows {
            let key: String = row.try_get(0).map_err(map_pg_error)?;
            let value: String = row.try_get(1).map_err(map_pg_error)?;
            settings.insert(key, value);
        }
        Ok(settings)
    }

    async fn set_server_config(
        &self,
        cancel: &CancellationToken,
        settings: ServerSettings,
    ) -> StoreResult<()> {
        ensure_live(cancel)?;
        let mut conn = self.pool.get().await.map_err(map_run_error)?;
        let txn = conn.transaction().await.map_err(map_pg_error)?;
        txn.execute("DELETE FROM server_config", &[]).await.map_err(map_pg_error)?;
        for (key, value) in &settings {
            txn.execute("INSERT INTO server_config (key, value) VALUES ($1, $2)", &[key, value])
                .await
                .map_err(map_pg_error)?;
        }
        txn.commit().await.map_err(map_pg_error)?;
        Ok(())
    }
}

fn ensure_live(cancel: &CancellationToken) -> StoreResult<()> {
    if cancel.is_cancelled() {
        Err(StoreError::Cancelled)
    } else {
        Ok(())
    }
}

fn file_query(where_clause: &str, lock: bool) -> String {
    format!(
        "SELECT {FILE_COLUMNS} {FILE_FROM} WHERE {where_clause}{}",
        if lock { " FOR UPDATE OF f" } else { "" }
    )
}

const SHARE_QUERY: &str = "SELECT root_file_id, read_only, require_auth, allowed_auth_methods, \
    denied_clients, allowed_clients, squash, map_uid, map_gid FROM shares WHERE share_name = $1";

fn file_from_row(row: &Row) -> StoreResult<File> {
    let type_code: i16 = row.try_get("file_type").map_err(map_pg_error)?;
    let file_type = FileType::from_code(type_code as u8)
        .ok_or_else(|| StoreError::io(format!("corrupt file type {type_code}")))?;
    let device_major: Option<i64> = row.try_get("device_major").map_err(map_pg_error)?;
    let device_minor: Option<i64> = row.try_get("device_minor").map_err(map_pg_error)?;
    let device = match (device_major, device_minor) {
        (Some(major), Some(minor)) => {
            Some(DeviceNumbers { major: major as u32, minor: minor as u32 })
        }
        _ => None,
    };
    let mode: i64 = row.try_get("mode").map_err(map_pg_error)?;
    let uid: i64 = row.try_get("uid").map_err(map_pg_error)?;
    let gid: i64 = row.try_get("gid").map_err(map_pg_error)?;
    let size: i64 = row.try_get("size").map_err(map_pg_error)?;
    let atime: i64 = row.try_get("atime").map_err(map_pg_error)?;
    let mtime: i64 = row.try_get("mtime").map_err(map_pg_error)?;
    let ctime: i64 = row.try_get("ctime").map_err(map_pg_error)?;
    let creation_time: i64 = row.try_get("creation_time").map_err(map_pg_error)?;
    let nlink: i64 = row.try_get("link_count").map_err(map_pg_error)?;
    Ok(File {
        id: row.try_get("id").map_err(map_pg_error)?,
        share_name: row.try_get("share_name").map_err(map_pg_error)?,
        path: row.try_get("path").map_err(map_pg_error)?,
        file_type,
        mode: mode as u32,
        uid: uid as u32,
        gid: gid as u32,
        size: size as u64,
        atime: Timestamp::from_unix_nanos(atime),
        mtime: Timestamp::from_unix_nanos(mtime),
        ctime: Timestamp::from_unix_nanos(ctime),
        creation_time: Timestamp::from_unix_nanos(creation_time),
        link_target: row.try_get("link_target").map_err(map_pg_error)?,
        content_id: row.try_get("content_id").map_err(map_pg_error)?,
        device,
        nlink: nlink as u32,
    })
}

fn share_from_row(row: &Row) -> StoreResult<(Uuid, ShareOptions)> {
    let root_id: Uuid = row.try_get("root_file_id").map_err(map_pg_error)?;
    let squash: Option<i16> = row.try_get("squash").map_err(map_pg_error)?;
    let map_uid: Option<i64> = row.try_get("map_uid").map_err(map_pg_error)?;
    let map_gid: Option<i64> = row.try_get("map_gid").map_err(map_pg_error)?;
    let identity_mapping = squash.map(|code| IdentityMapping {
        squash: match code {
            1 => SquashMode::Root,
            2 => SquashMode::All,
            _ => SquashMode::None,
        },
        map_uid: map_uid.map(|v| v as u32),
        map_gid: map_gid.map(|v| v as u32),
    });
    Ok((
        root_id,
        ShareOptions {
            read_only: row.try_get("read_only").map_err(map_pg_error)?,
            require_auth: row.try_get("require_auth").map_err(map_pg_error)?,
            allowed_auth_methods: row.try_get("allowed_auth_methods").map_err(map_pg_error)?,
            denied_clients: row.try_get("denied_clients").map_err(map_pg_error)?,
            allowed_clients: row.try_get("allowed_clients").map_err(map_pg_error)?,
            identity_mapping,
        },
    ))
}

fn mapping_columns(mapping: &Option<IdentityMapping>) -> (Option<i16>, Option<i64>, Option<i64>) {
    match mapping {
        None => (None, None, None),
        Some(mapping) => (
            Some(match mapping.squash {
                SquashMode::None => 0,
                SquashMode::Root => 1,
                SquashMode::All => 2,
            }),
            mapping.map_uid.map(i64::from),
            mapping.map_gid.map(i64::from),
        ),
    }
}

fn require_same_share(file: &File, share: &str) -> StoreResult<()> {
    if file.share_name != share {
        return Err(StoreError::InvalidHandle("handle share does not match the file".into()));
    }
    Ok(())
}

fn require_regular(file: &File) -> StoreResult<()> {
    match file.file_type {
        FileType::Regular => Ok(()),
        FileType::Directory => Err(StoreError::IsDirectory { path: file.path.clone() }),
        _ => Err(StoreError::invalid_argument(format!("{} is not a regular file", file.path))),
    }
}

fn share_lock_key(share: &str) -> i64 {
    let digest = Sha256::digest(share.as_bytes());
    i64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

async fn load_file(
    txn: &Transaction<'_>,
    share: &str,
    id: Uuid,
    lock: bool,
) -> StoreResult<File> {
    let row = txn
        .query_opt(&file_query("f.id = $1", lock), &[&id])
        .await
        .map_err(map_pg_error)?
        .ok_or_else(|| StoreError::not_found(format!("{share}:{id}")))?;
    let file = file_from_row(&row)?;
    require_same_share(&file, share)?;
    Ok(file)
}

async fn require_directory(txn: &Transaction<'_>, share: &str, id: Uuid) -> StoreResult<File> {
    let file = load_file(txn, share, id, false).await?;
    if !file.file_type.is_directory() {
        return Err(StoreError::NotDirectory { path: file.path });
    }
    Ok(file)
}

/// Load a directory under its row lock; every same-parent mutation queues
/// here.
async fn lock_directory(txn: &Transaction<'_>, share: &str, id: Uuid) -> StoreResult<File> {
    let file = load_file(txn, share, id, true).await?;
    if !file.file_type.is_directory() {
        return Err(StoreError::NotDirectory { path: file.path });
    }
    Ok(file)
}

async fn share_options(txn: &Transaction<'_>, share: &str) -> StoreResult<(Uuid, ShareOptions)> {
    let row = txn
        .query_opt(SHARE_QUERY, &[&share])
        .await
        .map_err(map_pg_error)?
        .ok_or_else(|| StoreError::not_found(share))?;
    share_from_row(&row)
}

async fn child_id(txn: &Transaction<'_>, parent: Uuid, name: &str) -> StoreResult<Option<Uuid>> {
    let row = txn
        .query_opt(
            "SELECT child_id FROM parent_child_map WHERE parent_id = $1 AND child_name = $2",
            &[&parent, &name],
        )
        .await
        .map_err(map_pg_error)?;
    match row {
        Some(row) => Ok(Some(row.try_get(0).map_err(map_pg_error)?)),
        None => Ok(None),
    }
}

async fn has_children(txn: &Transaction<'_>, parent: Uuid) -> StoreResult<bool> {
    let row = txn
        .query_one(
            "SELECT EXISTS (SELECT 1 FROM parent_child_map WHERE parent_id = $1)",
            &[&parent],
        )
        .await
        .map_err(map_pg_error)?;
    row.try_get(0).map_err(map_pg_error)
}

async fn insert_file(txn: &Transaction<'_>, file: &File) -> StoreResult<()> {
    let (device_major, device_minor) = match file.device {
        Some(device) => (Some(i64::from(device.major)), Some(i64::from(device.minor))),
        None => (None, None),
    };
    txn.execute(
        "INSERT INTO files (id, share_name, path, file_type, mode, uid, gid, size, \
         atime, mtime, ctime, creation_time, link_target, content_id, device_major, device_minor) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        &[
            &file.id,
            &file.share_name,
            &file.path,
            &i16::from(file.file_type.code()),
            &i64::from(file.mode),
            &i64::from(file.uid),
            &i64::from(file.gid),
            &(file.size as i64),
            &file.atime.as_unix_nanos(),
            &file.mtime.as_unix_nanos(),
            &file.ctime.as_unix_nanos(),
            &file.creation_time.as_unix_nanos(),
            &file.link_target,
            &file.content_id,
            &device_major,
            &device_minor,
        ],
    )
    .await
    .map_err(map_pg_error)?;
    Ok(())
}

async fn update_file(txn: &Transaction<'_>, file: &File) -> StoreResult<()> {
    txn.execute(
        "UPDATE files SET path = $2, mode = $3, uid = $4, gid = $5, size = $6, \
         atime = $7, mtime = $8, ctime = $9 WHERE id = $1",
        &[
            &file.id,
            &file.path,
            &i64::from(file.mode),
            &i64::from(file.uid),
            &i64::from(file.gid),
            &(file.size as i64),
            &file.atime.as_unix_nanos(),
            &file.mtime.as_unix_nanos(),
            &file.ctime.as_unix_nanos(),
        ],
    )
    .await
    .map_err(map_pg_error)?;
    Ok(())
}

async fn touch_directory(txn: &Transaction<'_>, id: Uuid, now: Timestamp) -> StoreResult<()> {
    txn.execute(
        "UPDATE files SET mtime = $2, ctime = $2 WHERE id = $1",
        &[&id, &now.as_unix_nanos()],
    )
    .await
    .map_err(map_pg_error)?;
    Ok(())
}

async fn insert_edge(
    txn: &Transaction<'_>,
    parent: Uuid,
    name: &str,
    child: Uuid,
) -> StoreResult<()> {
    txn.execute(
        "INSERT INTO parent_child_map (parent_id, child_id, child_name) VALUES ($1, $2, $3)",
        &[&parent, &child, &name],
    )
    .await
    .map_err(map_pg_error)?;
    Ok(())
}

async fn delete_edge(txn: &Transaction<'_>, parent: Uuid, name: &str) -> StoreResult<()> {
    txn.execute(
        "DELETE FROM parent_child_map WHERE parent_id = $1 AND child_name = $2",
        &[&parent, &name],
    )
    .await
    .map_err(map_pg_error)?;
    Ok(())
}

async fn set_link_count(txn: &Transaction<'_>, id: Uuid, count: i64) -> StoreResult<()> {
    txn.execute(
        "INSERT INTO link_counts (file_id, link_count) VALUES ($1, $2) \
         ON CONFLICT (file_id) DO UPDATE SET link_count = EXCLUDED.link_count",
        &[&id, &count],
    )
    .await
    .map_err(map_pg_error)?;
    Ok(())
}

/// Adjust a link count and return the new value; decrements saturate at
/// zero so a silly-renamed file can still be unlinked.
async fn bump_link_count(txn: &Transaction<'_>, id: Uuid, delta: i64) -> StoreResult<i64> {
    let row = txn
        .query_opt(
            "UPDATE link_counts SET link_count = GREATEST(link_count + $2, 0) \
             WHERE file_id = $1 RETURNING link_count",
            &[&id, &delta],
        )
        .await
        .map_err(map_pg_error)?
        .ok_or_else(|| StoreError::not_found(format!("link count for {id}")))?;
    row.try_get(0).map_err(map_pg_error)
}

/// Every edge row cascades away with the file.
async fn destroy_file(txn: &Transaction<'_>, id: Uuid) -> StoreResult<()> {
    txn.execute("DELETE FROM files WHERE id = $1", &[&id]).await.map_err(map_pg_error)?;
    Ok(())
}

/// Any surviving edge pointing at `child`, skipping the one being removed.
/// Returns the parent id, the surviving name, and the parent's path.
async fn find_edge_for(
    txn: &Transaction<'_>,
    child: Uuid,
    skip_parent: Uuid,
    skip_name: &str,
) -> StoreResult<Option<(Uuid, String, String)>> {
    let row = txn
        .query_opt(
            "SELECT m.parent_id, m.child_name, p.path \
             FROM parent_child_map m JOIN files p ON p.id = m.parent_id \
             WHERE m.child_id = $1 AND NOT (m.parent_id = $2 AND m.child_name = $3) \
             ORDER BY m.child_name LIMIT 1",
            &[&child, &skip_parent, &skip_name],
        )
        .await
        .map_err(map_pg_error)?;
    match row {
        Some(row) => Ok(Some((
            row.try_get(0).map_err(map_pg_error)?,
            row.try_get(1).map_err(map_pg_error)?,
            row.try_get(2).map_err(map_pg_error)?,
        ))),
        None => Ok(None),
    }
}
