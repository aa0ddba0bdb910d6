//! Opaque file-handle codec.
//!
//! A handle names `(share, object id)` on the wire: a one-byte version tag,
//! a two-byte big-endian share-name length, the share-name bytes, then the
//! sixteen id bytes. The total is capped so NFS (128-byte handles) and SMB
//! (16-byte file ids plus wrapping) can both carry it. The codec owns this
//! layout exclusively; callers only ever see immutable byte sequences.

use std::fmt;
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

const HANDLE_VERSION: u8 = 1;
const ID_LEN: usize = 16;
const HEADER_LEN: usize = 1 + 2;

/// Largest handle the codec will emit.
pub const MAX_HANDLE_LEN: usize = 128;

/// Longest share name that still fits the handle budget.
pub const MAX_SHARE_NAME_LEN: usize = MAX_HANDLE_LEN - HEADER_LEN - ID_LEN;

/// Opaque handle identifying a file within a share.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FileHandle(Vec<u8>);

impl FileHandle {
    /// Encode a `(share, id)` pair. Fails with invalid-argument when the
    /// share name is empty or exceeds the handle budget.
    pub fn encode(share_name: &str, id: Uuid) -> StoreResult<FileHandle> {
        if share_name.is_empty() {
            return Err(StoreError::invalid_argument("share name is empty"));
        }
        if share_name.len() > MAX_SHARE_NAME_LEN {
            return Err(StoreError::invalid_argument(format!(
                "share name exceeds {MAX_SHARE_NAME_LEN} bytes"
            )));
        }
        let mut bytes = Vec::with_capacity(HEADER_LEN + share_name.len() + ID_LEN);
        bytes.push(HANDLE_VERSION);
        bytes.write_u16::<BigEndian>(share_name.len() as u16).expect("vec write");
        bytes.extend_from_slice(share_name.as_bytes());
        bytes.extend_from_slice(id.as_bytes());
        Ok(FileHandle(bytes))
    }

    /// Wrap raw bytes received from a protocol layer. The bytes are not
    /// validated until [`FileHandle::decode`].
    pub fn from_bytes(bytes: Vec<u8>) -> FileHandle {
        FileHandle(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Recover the `(share, id)` pair, rejecting malformed wire forms.
    pub fn decode(&self) -> StoreResult<(String, Uuid)> {
        let bytes = &self.0;
        if bytes.len() < HEADER_LEN + ID_LEN || bytes.len() > MAX_HANDLE_LEN {
            return Err(StoreError::InvalidHandle(format!("bad length {}", bytes.len())));
        }
        let mut cursor = Cursor::new(bytes.as_slice());
        let version = cursor.read_u8().expect("length checked");
        if version != HANDLE_VERSION {
            return Err(StoreError::InvalidHandle(format!("unknown version {version}")));
        }
        let share_len = cursor.read_u16::<BigEndian>().expect("length checked") as usize;
        if share_len == 0 || bytes.len() != HEADER_LEN + share_len + ID_LEN {
            return Err(StoreError::InvalidHandle("length field mismatch".into()));
        }
        let share_bytes = &bytes[HEADER_LEN..HEADER_LEN + share_len];
        let share_name = std::str::from_utf8(share_bytes)
            .map_err(|_| StoreError::InvalidHandle("share name is not utf-8".into()))?
            .to_owned();
        let mut id_bytes = [0u8; ID_LEN];
        id_bytes.copy_from_slice(&bytes[HEADER_LEN + share_len..]);
        Ok((share_name, Uuid::from_bytes(id_bytes)))
    }

    /// Deterministic 64-bit digest of the handle bytes, used as the
    /// POSIX-facing inode number in `readdir` and `getattr` replies.
    pub fn stable_id(&self) -> u64 {
        let digest = Sha256::digest(&self.0);
        u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileHandle({})", hex::encode(&self.0))
    }
}
