//! Canonical-path arithmetic shared by both backends.
//!
//! Paths are absolute within a share, `/`-separated, with the root at `/`.
//! The denormalized `path` column follows every rename; these helpers keep
//! the prefix math in one place.

use sha2::{Digest, Sha256};

/// Destination names with this prefix trigger the NFS "unlinked but still
/// open" convention: the renamed file keeps its record but reports zero
/// links.
pub const SILLY_RENAME_PREFIX: &str = ".nfs";

/// Default directory-page budget when the caller passes zero.
pub const DEFAULT_READDIR_BYTES: u32 = 8 * 1024;

/// Fixed per-entry overhead used to estimate reply sizes, on top of the
/// name and handle bytes.
pub const DIR_ENTRY_OVERHEAD: u32 = 64;

/// Join a child name onto a parent path.
pub fn join_path(parent_path: &str, name: &str) -> String {
    if parent_path == "/" {
        format!("/{name}")
    } else {
        format!("{parent_path}/{name}")
    }
}

/// Rewrite `path` when it lives under `old_prefix`, splicing in
/// `new_prefix`. Returns `None` for paths outside the subtree. The prefix
/// itself is not rewritten here; the caller updates the moved node
/// directly.
pub fn rewrite_prefix(path: &str, old_prefix: &str, new_prefix: &str) -> Option<String> {
    let rest = path.strip_prefix(old_prefix)?;
    if !rest.starts_with('/') {
        return None;
    }
    Some(format!("{new_prefix}{rest}"))
}

/// Content identifier for a regular file, derived once at create. Renames
/// must never recompute it: it stays a stable pointer into the payload
/// store for the lifetime of the file.
pub fn content_id_for(share_name: &str, path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(share_name.as_bytes());
    hasher.update(b":");
    hasher.update(path.as_bytes());
    hex::encode(hasher.finalize())
}

/// NFS silly-rename detection on a destination name.
pub fn is_silly_rename_name(name: &str) -> bool {
    name.starts_with(SILLY_RENAME_PREFIX)
}

/// Estimated on-the-wire size of one directory entry.
pub fn estimated_entry_size(name: &str, handle_len: usize) -> u32 {
    DIR_ENTRY_OVERHEAD + name.len() as u32 + handle_len as u32
}
