//! Core entities of the metadata store: files, timestamps, shares and the
//! process-wide dependency seams (clock, id generation).

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Permission bits plus setuid/setgid/sticky. Everything a mode can carry.
pub const MODE_MASK: u32 = 0o7777;

/// Sticky bit on a directory restricts removals/renames to root, the
/// directory owner, or the victim owner.
pub const MODE_STICKY: u32 = 0o1000;

/// Point in time as observed by the store.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { seconds: 0, nanos: 0 };

    pub fn from_unix_nanos(nanos: i64) -> Self {
        Self { seconds: nanos.div_euclid(1_000_000_000), nanos: nanos.rem_euclid(1_000_000_000) as u32 }
    }

    pub fn as_unix_nanos(&self) -> i64 {
        self.seconds * 1_000_000_000 + i64::from(self.nanos)
    }
}

/// File type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharacterDevice,
    Socket,
    Fifo,
}

impl FileType {
    pub fn is_directory(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    pub fn is_device(&self) -> bool {
        matches!(self, FileType::BlockDevice | FileType::CharacterDevice)
    }

    /// Stable on-disk discriminant shared by both backends.
    pub fn code(&self) -> u8 {
        match self {
            FileType::Regular => 0,
            FileType::Directory => 1,
            FileType::Symlink => 2,
            FileType::BlockDevice => 3,
            FileType::CharacterDevice => 4,
            FileType::Socket => 5,
            FileType::Fifo => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<FileType> {
        Some(match code {
            0 => FileType::Regular,
            1 => FileType::Directory,
            2 => FileType::Symlink,
            3 => FileType::BlockDevice,
            4 => FileType::CharacterDevice,
            5 => FileType::Socket,
            6 => FileType::Fifo,
            _ => return None,
        })
    }
}

/// Major and minor device pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceNumbers {
    pub major: u32,
    pub minor: u32,
}

/// A named object in a share.
///
/// `nlink` is derived from the link-count table at load time and is never
/// part of the persisted record. `device` lives in a side table and is only
/// populated for block/character devices.
#[derive(Debug, Clone, PartialEq)]
pub struct File {
    pub id: Uuid,
    pub share_name: String,
    pub path: String,
    pub file_type: FileType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub creation_time: Timestamp,
    pub link_target: String,
    pub content_id: String,
    pub device: Option<DeviceNumbers>,
    pub nlink: u32,
}

impl File {
    /// Apply an attribute change set, stamping `ctime`.
    ///
    /// Permission and ownership checks happen before this is called; size
    /// changes on regular files represent truncation and leave the content
    /// id untouched.
    pub fn apply_changes(&mut self, changes: &SetAttributes, now: Timestamp) {
        if let Some(mode) = changes.mode {
            self.mode = mode & MODE_MASK;
        }
        if let Some(uid) = changes.uid {
            self.uid = uid;
        }
        if let Some(gid) = changes.gid {
            self.gid = gid;
        }
        if let Some(size) = changes.size {
            self.size = size;
        }
        if let Some(atime) = changes.atime {
            self.atime = atime;
        }
        if let Some(mtime) = changes.mtime {
            self.mtime = mtime;
        }
        self.ctime = now;
    }
}

/// Attributes supplied to the create family of operations.
///
/// Zero values are placeholders: [`crate::validate::apply_defaults`] turns a
/// zero mode into the per-type default and fills zero ownership from the
/// calling identity.
#[derive(Debug, Clone, Default)]
pub struct CreateAttributes {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Attribute modification for `set_attributes`.
#[derive(Debug, Clone, Default)]
pub struct SetAttributes {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<Timestamp>,
    pub mtime: Option<Timestamp>,
}

impl SetAttributes {
    pub fn changes_ownership_or_mode(&self) -> bool {
        self.mode.is_some() || self.uid.is_some() || self.gid.is_some()
    }
}

/// Identity squash applied after a share-access decision.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum SquashMode {
    #[default]
    None,
    /// Root callers become anonymous.
    Root,
    /// Every caller becomes anonymous.
    All,
}

/// Optional per-share identity rewrite rules.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityMapping {
    pub squash: SquashMode,
    pub map_uid: Option<u32>,
    pub map_gid: Option<u32>,
}

/// Per-share export options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShareOptions {
    pub read_only: bool,
    pub require_auth: bool,
    /// Empty means every method is allowed.
    pub allowed_auth_methods: Vec<String>,
    /// Evaluated before `allowed_clients`; any match denies.
    pub denied_clients: Vec<String>,
    /// When non-empty, membership is required.
    pub allowed_clients: Vec<String>,
    pub identity_mapping: Option<IdentityMapping>,
}

/// Process-wide dynamic runtime settings, last writer wins.
pub type ServerSettings = BTreeMap<String, String>;

/// Dynamic filesystem statistics.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FsStatistics {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub total_files: u64,
    pub used_files: u64,
    pub free_files: u64,
}

/// Static filesystem limits.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FsCapabilities {
    pub max_read_size: u32,
    pub max_write_size: u32,
    pub max_file_size: u64,
    pub max_name_length: u32,
}

impl Default for FsCapabilities {
    fn default() -> Self {
        Self {
            max_read_size: 1024 * 1024,
            max_write_size: 1024 * 1024,
            max_file_size: 128 * 1024 * 1024 * 1024,
            max_name_length: crate::validate::MAX_NAME_LEN as u32,
        }
    }
}

/// Source of "now" for every timestamp the store writes.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Timestamp { seconds: elapsed.as_secs() as i64, nanos: elapsed.subsec_nanos() }
    }
}

/// Source of fresh object ids.
pub trait IdSource: Send + Sync {
    fn next_id(&self) -> Uuid;
}

/// Random v4 ids.
#[derive(Debug, Default)]
pub struct RandomIds;

impl IdSource for RandomIds {
    fn next_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}
