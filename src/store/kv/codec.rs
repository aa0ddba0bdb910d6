//! Length-prefixed binary encodings for the embedded backend's values.
//!
//! Big-endian primitives throughout. Every record opens with a version
//! byte; decoders reject unknown versions instead of guessing. Link counts
//! and device numbers live in their own tables, so the file record never
//! carries them.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::model::{
    DeviceNumbers, File, FileType, IdentityMapping, ServerSettings, ShareOptions, SquashMode,
    Timestamp,
};

const FILE_RECORD_VERSION: u8 = 1;
const SHARE_RECORD_VERSION: u8 = 1;
const SETTINGS_RECORD_VERSION: u8 = 1;

/// Share record value: export options plus the root file id.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareRecord {
    pub root_id: Uuid,
    pub options: ShareOptions,
}

fn corrupt(what: &str) -> StoreError {
    StoreError::io(format!("corrupt {what} record"))
}

fn put_str(buf: &mut Vec<u8>, value: &str) {
    buf.write_u32::<BigEndian>(value.len() as u32).expect("vec write");
    buf.extend_from_slice(value.as_bytes());
}

fn get_str(cursor: &mut Cursor<&[u8]>, what: &str) -> StoreResult<String> {
    let len = cursor.read_u32::<BigEndian>().map_err(|_| corrupt(what))? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes).map_err(|_| corrupt(what))?;
    String::from_utf8(bytes).map_err(|_| corrupt(what))
}

fn put_timestamp(buf: &mut Vec<u8>, ts: Timestamp) {
    buf.write_i64::<BigEndian>(ts.seconds).expect("vec write");
    buf.write_u32::<BigEndian>(ts.nanos).expect("vec write");
}

fn get_timestamp(cursor: &mut Cursor<&[u8]>, what: &str) -> StoreResult<Timestamp> {
    let seconds = cursor.read_i64::<BigEndian>().map_err(|_| corrupt(what))?;
    let nanos = cursor.read_u32::<BigEndian>().map_err(|_| corrupt(what))?;
    Ok(Timestamp { seconds, nanos })
}

fn get_uuid(cursor: &mut Cursor<&[u8]>, what: &str) -> StoreResult<Uuid> {
    let mut bytes = [0u8; 16];
    cursor.read_exact(&mut bytes).map_err(|_| corrupt(what))?;
    Ok(Uuid::from_bytes(bytes))
}

pub fn encode_file(file: &File) -> Vec<u8> {
    let mut buf = Vec::with_capacity(96 + file.path.len() + file.share_name.len());
    buf.push(FILE_RECORD_VERSION);
    buf.extend_from_slice(file.id.as_bytes());
    put_str(&mut buf, &file.share_name);
    put_str(&mut buf, &file.path);
    buf.push(file.file_type.code());
    buf.write_u32::<BigEndian>(file.mode).expect("vec write");
    buf.write_u32::<BigEndian>(file.uid).expect("vec write");
    buf.write_u32::<BigEndian>(file.gid).expect("vec write");
    buf.write_u64::<BigEndian>(file.size).expect("vec write");
    put_timestamp(&mut buf, file.atime);
    put_timestamp(&mut buf, file.mtime);
    put_timestamp(&mut buf, file.ctime);
    put_timestamp(&mut buf, file.creation_time);
    put_str(&mut buf, &file.link_target);
    put_str(&mut buf, &file.content_id);
    buf
}

/// Decode a file record. `nlink` and `device` come from their side tables
/// and are left at their empty values here.
pub fn decode_file(bytes: &[u8]) -> StoreResult<File> {
    let mut cursor = Cursor::new(bytes);
    let version = cursor.read_u8().map_err(|_| corrupt("file"))?;
    if version != FILE_RECORD_VERSION {
        return Err(corrupt("file"));
    }
    let id = get_uuid(&mut cursor, "file")?;
    let share_name = get_str(&mut cursor, "file")?;
    let path = get_str(&mut cursor, "file")?;
    let type_code = cursor.read_u8().map_err(|_| corrupt("file"))?;
    let file_type = FileType::from_code(type_code).ok_or_else(|| corrupt("file"))?;
    let mode = cursor.read_u32::<BigEndian>().map_err(|_| corrupt("file"))?;
    let uid = cursor.read_u32::<BigEndian>().map_err(|_| corrupt("file"))?;
    let gid = cursor.read_u32::<BigEndian>().map_err(|_| corrupt("file"))?;
    let size = cursor.read_u64::<BigEndian>().map_err(|_| corrupt("file"))?;
    let atime = get_timestamp(&mut cursor, "file")?;
    let mtime = get_timestamp(&mut cursor, "file")?;
    let ctime = get_timestamp(&mut cursor, "file")?;
    let creation_time = get_timestamp(&mut cursor, "file")?;
    let link_target = get_str(&mut cursor, "file")?;
    let content_id = get_str(&mut cursor, "file")?;
    Ok(File {
        id,
        share_name,
        path,
        file_type,
        mode,
        uid,
        gid,
        size,
        atime,
        mtime,
        ctime,
        creation_time,
        link_target,
        content_id,
        device: None,
        nlink: 0,
    })
}

pub fn encode_device(device: DeviceNumbers) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.write_u32::<BigEndian>(device.major).expect("vec write");
    buf.write_u32::<BigEndian>(device.minor).expect("vec write");
    buf
}

pub fn decode_device(bytes: &[u8]) -> StoreResult<DeviceNumbers> {
    let mut cursor = Cursor::new(bytes);
    let major = cursor.read_u32::<BigEndian>().map_err(|_| corrupt("device"))?;
    let minor = cursor.read_u32::<BigEndian>().map_err(|_| corrupt("device"))?;
    Ok(DeviceNumbers { major, minor })
}

fn put_str_list(buf: &mut Vec<u8>, list: &[String]) {
    buf.write_u16::<BigEndian>(list.len() as u16).expect("vec write");
    for item in list {
        put_str(buf, item);
    }
}

fn get_str_list(cursor: &mut Cursor<&[u8]>, what: &str) -> StoreResult<Vec<String>> {
    let count = cursor.read_u16::<BigEndian>().map_err(|_| corrupt(what))? as usize;
    let mut list = Vec::with_capacity(count);
    for _ in 0..count {
        list.push(get_str(cursor, what)?);
    }
    Ok(list)
}

pub fn encode_share_record(record: &ShareRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.push(SHARE_RECORD_VERSION);
    buf.extend_from_slice(record.root_id.as_bytes());
    let opts = &record.options;
    buf.push(opts.read_only as u8);
    buf.push(opts.require_auth as u8);
    put_str_list(&mut buf, &opts.allowed_auth_methods);
    put_str_list(&mut buf, &opts.denied_clients);
    put_str_list(&mut buf, &opts.allowed_clients);
    match &opts.identity_mapping {
        None => buf.push(0),
        Some(mapping) => {
            buf.push(1);
            buf.push(match mapping.squash {
                SquashMode::None => 0,
                SquashMode::Root => 1,
                SquashMode::All => 2,
            });
            match mapping.map_uid {
                None => buf.push(0),
                Some(uid) => {
                    buf.push(1);
                    buf.write_u32::<BigEndian>(uid).expect("vec write");
                }
            }
            match mapping.map_gid {
                None => buf.push(0),
                Some(gid) => {
                    buf.push(1);
                    buf.write_u32::<BigEndian>(gid).expect("vec write");
                }
            }
        }
    }
    buf
}

pub fn decode_share_record(bytes: &[u8]) -> StoreResult<ShareRecord> {
    let mut cursor = Cursor::new(bytes);
    let version = cursor.read_u8().map_err(|_| corrupt("share"))?;
    if version != SHARE_RECORD_VERSION {
        return Err(corrupt("share"));
    }
    let root_id = get_uuid(&mut cursor, "share")?;
    let read_only = cursor.read_u8().map_err(|_| corrupt("share"))? != 0;
    let require_auth = cursor.read_u8().map_err(|_| corrupt("share"))? != 0;
    let allowed_auth_methods = get_str_list(&mut cursor, "share")?;
    let denied_clients = get_str_list(&mut cursor, "share")?;
    let allowed_clients = get_str_list(&mut cursor, "share")?;
    let identity_mapping = match cursor.read_u8().map_err(|_| corrupt("share"))? {
        0 => None,
        1 => {
            let squash = match cursor.read_u8().map_err(|_| corrupt("share"))? {
                0 => SquashMode::None,
                1 => SquashMode::Root,
                2 => SquashMode::All,
                _ => return Err(corrupt("share")),
            };
            let map_uid = match cursor.read_u8().map_err(|_| corrupt("share"))? {
                0 => None,
                _ => Some(cursor.read_u32::<BigEndian>().map_err(|_| corrupt("share"))?),
            };
            let map_gid = match cursor.read_u8().map_err(|_| corrupt("share"))? {
                0 => None,
                _ => Some(cursor.read_u32::<BigEndian>().map_err(|_| corrupt("share"))?),
            };
            Some(IdentityMapping { squash, map_uid, map_gid })
        }
        _ => return Err(corrupt("share")),
    };
    Ok(ShareRecord {
        root_id,
        options: ShareOptions {
            read_only,
            require_auth,
            allowed_auth_methods,
            denied_clients,
            allowed_clients,
            identity_mapping,
        },
    })
}

pub fn encode_settings(settings: &ServerSettings) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.push(SETTINGS_RECORD_VERSION);
    buf.write_u32::<BigEndian>(settings.len() as u32).expect("vec write");
    for (key, value) in settings {
        put_str(&mut buf, key);
        put_str(&mut buf, value);
    }
    buf
}

pub fn decode_settings(bytes: &[u8]) -> StoreResult<ServerSettings> {
    let mut cursor = Cursor::new(bytes);
    let version = cursor.read_u8().map_err(|_| corrupt("settings"))?;
    if version != SETTINGS_RECORD_VERSION {
        return Err(corrupt("settings"));
    }
    let count = cursor.read_u32::<BigEndian>().map_err(|_| corrupt("settings"))?;
    let mut settings = ServerSettings::new();
    for _ in 0..count {
        let key = get_str(&mut cursor, "settings")?;
        let value = get_str(&mut cursor, "settings")?;
        settings.insert(key, value);
    }
    Ok(settings)
}
