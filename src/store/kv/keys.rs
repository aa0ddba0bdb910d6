//! Typed key layout of the embedded backend.
//!
//! One table per record kind, mirroring the prefixes a flat keyspace would
//! use: file records by id, parent/name edges, reverse parent pointers,
//! link counts, share records, device numbers and the settings singleton.
//! Edge keys are `parent id ++ name bytes`, so a directory listing is a
//! bounded range scan in byte-lexicographic name order.

use redb::TableDefinition;
use uuid::Uuid;

pub const FILES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("files");
pub const CHILDREN: TableDefinition<&[u8], &[u8]> = TableDefinition::new("children");
pub const PARENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("parents");
pub const LINKS: TableDefinition<&[u8], u64> = TableDefinition::new("links");
pub const SHARES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("shares");
pub const DEVICES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("devices");
pub const CONFIG: TableDefinition<&[u8], &[u8]> = TableDefinition::new("config");

pub const SERVER_SETTINGS_KEY: &[u8] = b"server";

pub const ID_LEN: usize = 16;

pub fn id_key(id: Uuid) -> [u8; ID_LEN] {
    id.into_bytes()
}

pub fn child_key(parent: Uuid, name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(ID_LEN + name.len());
    key.extend_from_slice(parent.as_bytes());
    key.extend_from_slice(name.as_bytes());
    key
}

/// Inclusive lower bound of a parent's edge range.
pub fn children_start(parent: Uuid) -> Vec<u8> {
    parent.as_bytes().to_vec()
}

/// Inclusive lower bound for resuming a listing strictly after `name`.
/// Names reject NUL bytes, so appending one lands between `name` and every
/// longer sibling.
pub fn children_resume(parent: Uuid, name: &str) -> Vec<u8> {
    let mut key = child_key(parent, name);
    key.push(0);
    key
}

/// Exclusive upper bound of a parent's edge range; `None` means the range
/// runs to the end of the table.
pub fn children_end(parent: Uuid) -> Option<Vec<u8>> {
    let mut bytes = parent.into_bytes();
    for i in (0..ID_LEN).rev() {
        if bytes[i] != u8::MAX {
            bytes[i] += 1;
            return Some(bytes[..=i].to_vec());
        }
    }
    None
}

/// Split an edge key back into its parent id and name bytes.
pub fn split_child_key(key: &[u8]) -> Option<(Uuid, &[u8])> {
    if key.len() < ID_LEN {
        return None;
    }
    let id = Uuid::from_bytes(key[..ID_LEN].try_into().ok()?);
    Some((id, &key[ID_LEN..]))
}
