//! Request validation and default application.
//!
//! Every entry point funnels through these helpers so that all backends
//! normalize input identically. Path length is deliberately not enforced
//! here: protocol operations traverse component-by-component, so full-path
//! caps belong to the client operating system.

use crate::auth::AuthContext;
use crate::error::{StoreError, StoreResult};
use crate::model::{Clock, CreateAttributes, FileType, Timestamp, MODE_MASK};

/// Maximum length of a single name component, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Maximum symlink target length, in bytes.
pub const MAX_SYMLINK_TARGET_LEN: usize = 4096;

/// Default mode for new directories.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Default mode for new symlinks.
pub const DEFAULT_SYMLINK_MODE: u32 = 0o777;

/// Default mode for every other file type.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Reject names that cannot be a directory entry.
pub fn validate_name(name: &str) -> StoreResult<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(StoreError::invalid_argument(format!("invalid name {name:?}")));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(StoreError::invalid_argument(format!("invalid character in name {name:?}")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(StoreError::invalid_argument(format!(
            "name exceeds {MAX_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

/// `create` accepts only regular files and directories.
pub fn validate_create_type(file_type: FileType) -> StoreResult<()> {
    match file_type {
        FileType::Regular | FileType::Directory => Ok(()),
        other => Err(StoreError::invalid_argument(format!(
            "create does not accept {other:?} files"
        ))),
    }
}

/// `create_special_file` accepts devices, sockets and FIFOs. Device nodes
/// additionally require a root caller.
pub fn validate_special_type(file_type: FileType, auth: &AuthContext) -> StoreResult<()> {
    match file_type {
        FileType::BlockDevice | FileType::CharacterDevice => require_root(auth),
        FileType::Socket | FileType::Fifo => Ok(()),
        other => Err(StoreError::invalid_argument(format!(
            "not a special file type: {other:?}"
        ))),
    }
}

/// The target is interpreted by the client; only shape is checked here.
pub fn validate_symlink_target(target: &str) -> StoreResult<()> {
    if target.is_empty() {
        return Err(StoreError::invalid_argument("empty symlink target"));
    }
    if target.len() > MAX_SYMLINK_TARGET_LEN {
        return Err(StoreError::invalid_argument(format!(
            "symlink target exceeds {MAX_SYMLINK_TARGET_LEN} bytes"
        )));
    }
    Ok(())
}

/// Fails with access-denied unless the effective uid is zero.
pub fn require_root(auth: &AuthContext) -> StoreResult<()> {
    if auth.is_root() {
        Ok(())
    } else {
        Err(StoreError::access_denied("operation requires root"))
    }
}

/// Normalized attributes ready for persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedDefaults {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub now: Timestamp,
}

/// Normalize creation attributes before persistence.
///
/// A zero mode becomes the per-type default; the mode is always masked to
/// its low twelve bits. Zero ownership under a non-root caller is filled
/// from the caller's identity. All timestamps come from the store clock;
/// size starts at zero except for symlinks, which report their target
/// length.
pub fn apply_defaults(
    attr: &CreateAttributes,
    file_type: FileType,
    link_target: &str,
    auth: &AuthContext,
    clock: &dyn Clock,
) -> AppliedDefaults {
    let mode = if attr.mode == 0 {
        match file_type {
            FileType::Directory => DEFAULT_DIR_MODE,
            FileType::Symlink => DEFAULT_SYMLINK_MODE,
            _ => DEFAULT_FILE_MODE,
        }
    } else {
        attr.mode & MODE_MASK
    };

    let caller_uid = auth.identity.uid.unwrap_or(0);
    let caller_gid = auth.identity.gid.unwrap_or(0);
    let uid = if attr.uid == 0 && caller_uid != 0 { caller_uid } else { attr.uid };
    let gid = if attr.gid == 0 && caller_gid != 0 { caller_gid } else { attr.gid };

    let size = match file_type {
        FileType::Symlink => link_target.len() as u64,
        _ => 0,
    };

    AppliedDefaults { mode, uid, gid, size, now: clock.now() }
}
