//! Backup material file formats
//!
//! # MasterInfo file (little endian)
//!
//! ```text
//! magic        6   "\0rkMst"
//! version      u16
//! flags        u8    bit 0: body encrypted, bit 1: salt present
//! reserved     u8
//! entities     u32
//! kdf_salt     16
//! key_check    16    zero when not encrypted
//! body_len     u32
//! body         body_len   deflate stream, XOR'ed with the material keystream if encrypted
//! crc32        u32   over every preceding byte
//! ```
//!
//! Each entity in the inflated body:
//!
//! ```text
//! root u32 | kind u8 | name_len u8 | tbl_name_len u8 | reserved u8 | sql_len u16
//! name \0 | tbl_name \0 | sql \0
//! ```
//!
//! # LeafInfo file (little endian)
//!
//! ```text
//! magic "\0rkLfi" | version u16 | roots u32
//! per root: root u32 | count u32 | leaf u32 * count
//! crc32 u32 over every preceding byte
//! ```
//!
//! The CRC is checked before the key so a damaged file is reported as
//! corrupt, never as a wrong key.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::crypto::{Keystream, KEY_CHECK_LEN, SALT_LEN};

use super::errors::{RepairError, RepairResult};
use super::master::{MasterEntry, SchemaKind};

pub const MASTER_MAGIC: &[u8; 6] = b"\0rkMst";
pub const LEAF_MAGIC: &[u8; 6] = b"\0rkLfi";
pub const MATERIAL_VERSION: u16 = 1;

const FLAG_ENCRYPTED: u8 = 0x01;
const FLAG_HAS_SALT: u8 = 0x02;
const MASTER_HEADER_LEN: usize = 6 + 2 + 1 + 1 + 4 + SALT_LEN + KEY_CHECK_LEN + 4;
const CRC_LEN: usize = 4;

/// Decoded contents of a MasterInfo file.
#[derive(Debug, Clone)]
pub struct MasterMaterial {
    pub entries: Vec<MasterEntry>,
    pub kdf_salt: Option<[u8; SALT_LEN]>,
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Split off and verify the CRC trailer.
fn verify_trailer(data: &[u8]) -> RepairResult<&[u8]> {
    if data.len() < CRC_LEN {
        return Err(RepairError::material_corrupt("file too short"));
    }
    let (content, trailer) = data.split_at(data.len() - CRC_LEN);
    let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if checksum(content) != stored {
        return Err(RepairError::material_corrupt("checksum mismatch"));
    }
    Ok(content)
}

fn read_file(path: &Path) -> RepairResult<Vec<u8>> {
    fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            RepairError::material_not_found(path)
        } else {
            RepairError::io(format!("read {}", path.display()), e)
        }
    })
}

/// Write through a sibling temp file and rename, so a failed save never
/// leaves a half-written file at `path`.
fn write_file(path: &Path, data: &[u8]) -> RepairResult<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = Path::new(&tmp_name);

    let mut file = fs::File::create(tmp)
        .map_err(|e| RepairError::io(format!("create {}", tmp.display()), e))?;
    file.write_all(data)
        .and_then(|_| file.sync_all())
        .map_err(|e| RepairError::io(format!("write {}", tmp.display()), e))?;
    fs::rename(tmp, path)
        .map_err(|e| RepairError::io(format!("rename to {}", path.display()), e))
}

/// Little-endian cursor over an in-memory buffer.
struct Reader<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, at: 0 }
    }

    fn take(&mut self, n: usize) -> RepairResult<&'a [u8]> {
        let end = self
            .at
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| RepairError::material_corrupt("unexpected end of data"))?;
        let slice = &self.data[self.at..end];
        self.at = end;
        Ok(slice)
    }

    fn u8(&mut self) -> RepairResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> RepairResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> RepairResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// `len` bytes of UTF-8 followed by a NUL.
    fn cstr(&mut self, len: usize) -> RepairResult<String> {
        let bytes = self.take(len)?;
        if self.u8()? != 0 {
            return Err(RepairError::material_corrupt("missing string terminator"));
        }
        String::from_utf8(bytes.to_vec())
            .map_err(|_| RepairError::material_corrupt("string is not UTF-8"))
    }
}

// =============================================================================
// MasterInfo
// =============================================================================

fn encode_entities(entries: &[MasterEntry]) -> RepairResult<Vec<u8>> {
    let mut body = Vec::new();
    for entry in entries {
        let name_len = u8::try_from(entry.name.len())
            .map_err(|_| RepairError::material_invalid(format!("name too long: {}", entry.name)))?;
        let tbl_name_len = u8::try_from(entry.tbl_name.len()).map_err(|_| {
            RepairError::material_invalid(format!("table name too long: {}", entry.tbl_name))
        })?;
        let sql_len = u16::try_from(entry.sql.len())
            .map_err(|_| RepairError::material_invalid(format!("DDL too long: {}", entry.name)))?;

        body.extend_from_slice(&entry.root_page.to_le_bytes());
        body.push(entry.kind.code());
        body.push(name_len);
        body.push(tbl_name_len);
        body.push(0);
        body.extend_from_slice(&sql_len.to_le_bytes());
        for text in [&entry.name, &entry.tbl_name, &entry.sql] {
            body.extend_from_slice(text.as_bytes());
            body.push(0);
        }
    }
    Ok(body)
}

fn decode_entities(body: &[u8], count: u32) -> RepairResult<Vec<MasterEntry>> {
    let mut reader = Reader::new(body);
    let mut entries = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        let root_page = reader.u32()?;
        let kind = SchemaKind::from_code(reader.u8()?)
            .ok_or_else(|| RepairError::material_corrupt("unknown entity kind"))?;
        let name_len = reader.u8()? as usize;
        let tbl_name_len = reader.u8()? as usize;
        reader.u8()?;
        let sql_len = reader.u16()? as usize;
        let name = reader.cstr(name_len)?;
        let tbl_name = reader.cstr(tbl_name_len)?;
        let sql = reader.cstr(sql_len)?;
        entries.push(MasterEntry {
            kind,
            name,
            tbl_name,
            root_page,
            sql,
        });
    }
    Ok(entries)
}

/// Serialize a catalog into MasterInfo file bytes.
pub fn encode_master(
    entries: &[MasterEntry],
    kdf_salt: Option<[u8; SALT_LEN]>,
    key: Option<&[u8]>,
) -> RepairResult<Vec<u8>> {
    let count = u32::try_from(entries.len())
        .map_err(|_| RepairError::material_invalid("too many entities"))?;
    let raw = encode_entities(entries)?;

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&raw)
        .map_err(|e| RepairError::io("compress catalog", e))?;
    let mut body = encoder
        .finish()
        .map_err(|e| RepairError::io("compress catalog", e))?;

    let stream = key.map(Keystream::for_material);
    let mut flags = 0u8;
    let mut key_check = [0u8; KEY_CHECK_LEN];
    if let Some(ref stream) = stream {
        flags |= FLAG_ENCRYPTED;
        key_check = stream.key_check();
        stream.apply(0, &mut body);
    }
    if kdf_salt.is_some() {
        flags |= FLAG_HAS_SALT;
    }
    let body_len = u32::try_from(body.len())
        .map_err(|_| RepairError::material_invalid("catalog too large"))?;

    let mut out = Vec::with_capacity(MASTER_HEADER_LEN + body.len() + CRC_LEN);
    out.extend_from_slice(MASTER_MAGIC);
    out.extend_from_slice(&MATERIAL_VERSION.to_le_bytes());
    out.push(flags);
    out.push(0);
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&kdf_salt.unwrap_or([0u8; SALT_LEN]));
    out.extend_from_slice(&key_check);
    out.extend_from_slice(&body_len.to_le_bytes());
    out.extend_from_slice(&body);
    let crc = checksum(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Parse MasterInfo file bytes.
pub fn decode_master(data: &[u8], key: Option<&[u8]>) -> RepairResult<MasterMaterial> {
    let content = verify_trailer(data)?;
    let mut reader = Reader::new(content);

    if reader.take(6)? != MASTER_MAGIC {
        return Err(RepairError::material_corrupt("bad magic"));
    }
    let version = reader.u16()?;
    if version != MATERIAL_VERSION {
        return Err(RepairError::material_corrupt(format!(
            "unsupported version {}",
            version
        )));
    }
    let flags = reader.u8()?;
    reader.u8()?;
    let count = reader.u32()?;
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(reader.take(SALT_LEN)?);
    let mut stored_check = [0u8; KEY_CHECK_LEN];
    stored_check.copy_from_slice(reader.take(KEY_CHECK_LEN)?);
    let body_len = reader.u32()? as usize;
    let mut body = reader.take(body_len)?.to_vec();

    if flags & FLAG_ENCRYPTED != 0 {
        let key = key.ok_or_else(|| RepairError::material_wrong_key("material is encrypted"))?;
        let stream = Keystream::for_material(key);
        if !stream.verify_key_check(&stored_check) {
            return Err(RepairError::material_wrong_key("key check mismatch"));
        }
        stream.apply(0, &mut body);
    }

    let mut raw = Vec::new();
    DeflateDecoder::new(body.as_slice())
        .read_to_end(&mut raw)
        .map_err(|e| RepairError::material_corrupt(format!("inflate failed: {}", e)))?;

    Ok(MasterMaterial {
        entries: decode_entities(&raw, count)?,
        kdf_salt: (flags & FLAG_HAS_SALT != 0).then_some(salt),
    })
}

pub fn write_master(
    path: &Path,
    entries: &[MasterEntry],
    kdf_salt: Option<[u8; SALT_LEN]>,
    key: Option<&[u8]>,
) -> RepairResult<()> {
    let data = encode_master(entries, kdf_salt, key)?;
    write_file(path, &data)
}

pub fn read_master(path: &Path, key: Option<&[u8]>) -> RepairResult<MasterMaterial> {
    let data = read_file(path)?;
    decode_master(&data, key)
}

// =============================================================================
// LeafInfo
// =============================================================================

pub fn encode_leaves(map: &BTreeMap<u32, Vec<u32>>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(LEAF_MAGIC);
    out.extend_from_slice(&MATERIAL_VERSION.to_le_bytes());
    out.extend_from_slice(&(map.len() as u32).to_le_bytes());
    for (root, leaves) in map {
        out.extend_from_slice(&root.to_le_bytes());
        out.extend_from_slice(&(leaves.len() as u32).to_le_bytes());
        for leaf in leaves {
            out.extend_from_slice(&leaf.to_le_bytes());
        }
    }
    let crc = checksum(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

pub fn decode_leaves(data: &[u8]) -> RepairResult<BTreeMap<u32, Vec<u32>>> {
    let content = verify_trailer(data)?;
    let mut reader = Reader::new(content);

    if reader.take(6)? != LEAF_MAGIC {
        return Err(RepairError::material_corrupt("bad magic"));
    }
    if reader.u16()? != MATERIAL_VERSION {
        return Err(RepairError::material_corrupt("unsupported version"));
    }
    let roots = reader.u32()?;
    let mut map = BTreeMap::new();
    for _ in 0..roots {
        let root = reader.u32()?;
        let count = reader.u32()?;
        let mut leaves = Vec::with_capacity(count.min(1 << 16) as usize);
        for _ in 0..count {
            leaves.push(reader.u32()?);
        }
        map.insert(root, leaves);
    }
    Ok(map)
}

pub fn write_leaves(path: &Path, map: &BTreeMap<u32, Vec<u32>>) -> RepairResult<()> {
    write_file(path, &encode_leaves(map))
}

pub fn read_leaves(path: &Path) -> RepairResult<BTreeMap<u32, Vec<u32>>> {
    decode_leaves(&read_file(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repair::errors::RepairErrorCode;

    fn sample() -> Vec<MasterEntry> {
        vec![
            MasterEntry {
                kind: SchemaKind::Table,
                name: "users".into(),
                tbl_name: "users".into(),
                root_page: 2,
                sql: "CREATE TABLE users(id INTEGER PRIMARY KEY, name TEXT)".into(),
            },
            MasterEntry {
                kind: SchemaKind::Index,
                name: "users_name".into(),
                tbl_name: "users".into(),
                root_page: 3,
                sql: "CREATE INDEX users_name ON users(name)".into(),
            },
        ]
    }

    #[test]
    fn test_master_plain() {
        let data = encode_master(&sample(), None, None).unwrap();
        let decoded = decode_master(&data, None).unwrap();
        assert_eq!(decoded.entries, sample());
        assert_eq!(decoded.kdf_salt, None);
    }

    #[test]
    fn test_master_encrypted_carries_salt() {
        let salt = [9u8; SALT_LEN];
        let data = encode_master(&sample(), Some(salt), Some(b"pw")).unwrap();
        let decoded = decode_master(&data, Some(b"pw")).unwrap();
        assert_eq!(decoded.kdf_salt, Some(salt));
        assert_eq!(decoded.entries.len(), 2);
    }

    #[test]
    fn test_wrong_and_missing_key() {
        let data = encode_master(&sample(), None, Some(b"pw")).unwrap();
        let wrong = decode_master(&data, Some(b"nope")).unwrap_err();
        assert_eq!(wrong.code(), RepairErrorCode::RkMaterialWrongKey);
        let missing = decode_master(&data, None).unwrap_err();
        assert_eq!(missing.code(), RepairErrorCode::RkMaterialWrongKey);
    }

    #[test]
    fn test_flipped_byte_is_corrupt_not_wrong_key() {
        let mut data = encode_master(&sample(), None, Some(b"pw")).unwrap();
        // inside the key check field
        data[6 + 2 + 1 + 1 + 4 + SALT_LEN + 3] ^= 0x40;
        let err = decode_master(&data, Some(b"pw")).unwrap_err();
        assert_eq!(err.code(), RepairErrorCode::RkMaterialCorrupt);
    }

    #[test]
    fn test_oversized_name_rejected() {
        let mut entries = sample();
        entries[0].name = "x".repeat(300);
        let err = encode_master(&entries, None, None).unwrap_err();
        assert_eq!(err.code(), RepairErrorCode::RkMaterialInvalid);
    }

    #[test]
    fn test_leaves_detect_truncation() {
        let mut map = BTreeMap::new();
        map.insert(2, vec![5, 6, 7]);
        map.insert(3, vec![]);
        let data = encode_leaves(&map);
        assert_eq!(decode_leaves(&data).unwrap(), map);

        let err = decode_leaves(&data[..data.len() - 5]).unwrap_err();
        assert_eq!(err.code(), RepairErrorCode::RkMaterialCorrupt);
    }
}
