//! Read-only pager over a possibly corrupted database file
//!
//! The pager owns the source file handle and answers three questions for
//! the repair layer:
//! - what the header says (page size, reserved bytes, free pages), with
//!   defaults when it is unreadable
//! - what a given page contains, decrypted if a cipher is in use
//! - which pages the current pass has reached and how they fared
//!
//! # Encrypted sources
//!
//! Opening with a [`CipherSpec`] tries the salt stored in the file first.
//! If page 1 does not decode with it and a fallback salt is supplied (from
//! a MasterInfo backup), the fallback is tried next. Success with the
//! file's own salt marks the salt intact; success only with the fallback
//! marks it damaged. If neither yields a decodable page 1, opening fails.

mod cipher;
mod errors;
mod header;
mod page;
mod record;
mod status;
mod varint;
mod walk;

pub use cipher::{encrypt_file, PageCipher};
pub use errors::{PagerError, PagerErrorCode, PagerResult, Severity};
pub use header::{is_valid_page_size, DatabaseHeader, HEADER_MAGIC, HEADER_SIZE};
pub use page::{local_payload_size, BtreePage, PageDamage, PageType, TableLeafCell};
pub use record::{decode_record, DecodedRecord};
pub use status::{PageStatus, StatusMap};
pub use varint::{read_varint, write_varint};
pub use walk::{leaves_look_valid, visit_leaves, walk_table, WalkOutcome, MAX_TREE_DEPTH};

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::crypto::{CipherSpec, SALT_LEN};

pub struct Pager {
    file: File,
    path: PathBuf,
    header: DatabaseHeader,
    page_size: u32,
    page_count: u32,
    cipher: Option<PageCipher>,
    salt_ok: bool,
    statuses: StatusMap,
}

impl Pager {
    /// Open `path` read-only.
    pub fn open(
        path: &Path,
        cipher: Option<&CipherSpec>,
        fallback_salt: Option<[u8; SALT_LEN]>,
    ) -> PagerResult<Pager> {
        let mut file = File::open(path)
            .map_err(|e| PagerError::io(format!("open {}", path.display()), e))?;
        let file_len = file
            .metadata()
            .map_err(|e| PagerError::io("stat source file", e))?
            .len();

        match cipher {
            None => Self::open_plain(file, path, file_len),
            Some(spec) => {
                let page_size = spec.page_size;
                if !is_valid_page_size(page_size) {
                    return Err(PagerError::invalid_cipher(format!(
                        "cipher page size {} is not a power of two in 512..=65536",
                        page_size
                    )));
                }
                if file_len < u64::from(page_size) {
                    return Err(PagerError::not_a_database("file shorter than one page"));
                }
                let mut first = vec![0u8; page_size as usize];
                read_at(&mut file, 0, &mut first)?;
                Self::open_encrypted(file, path, file_len, spec, first, fallback_salt)
            }
        }
    }

    fn open_plain(mut file: File, path: &Path, file_len: u64) -> PagerResult<Pager> {
        let mut head = vec![0u8; HEADER_SIZE.min(file_len as usize)];
        read_at(&mut file, 0, &mut head)?;
        let header = DatabaseHeader::parse_plain(&head);

        let page_size = header.page_size;
        if file_len < u64::from(page_size) {
            return Err(PagerError::not_a_database("file shorter than one page"));
        }

        let salt_ok = header.valid;
        Ok(Self::assemble(file, path, file_len, header, None, salt_ok))
    }

    fn open_encrypted(
        file: File,
        path: &Path,
        file_len: u64,
        spec: &CipherSpec,
        first: Vec<u8>,
        fallback_salt: Option<[u8; SALT_LEN]>,
    ) -> PagerResult<Pager> {
        let mut file_salt = [0u8; SALT_LEN];
        file_salt.copy_from_slice(&first[..SALT_LEN]);

        let own = try_salt(spec, file_salt, &first)?;
        if own.header.valid {
            return Ok(Self::assemble(file, path, file_len, own.header, Some(own.cipher), true));
        }

        if let Some(salt) = fallback_salt.filter(|s| *s != file_salt) {
            let fallback = try_salt(spec, salt, &first)?;
            if fallback.header.valid || fallback.btree_ok {
                return Ok(Self::assemble(
                    file,
                    path,
                    file_len,
                    fallback.header,
                    Some(fallback.cipher),
                    false,
                ));
            }
        }

        // Header bytes damaged but the salt still opens page 1's b-tree.
        if own.btree_ok {
            return Ok(Self::assemble(file, path, file_len, own.header, Some(own.cipher), true));
        }

        Err(PagerError::wrong_key(
            "page 1 does not decode with the given key and available salts",
        ))
    }

    fn assemble(
        file: File,
        path: &Path,
        file_len: u64,
        header: DatabaseHeader,
        cipher: Option<PageCipher>,
        salt_ok: bool,
    ) -> Pager {
        let page_size = header.page_size;
        let page_count = file_len.div_ceil(u64::from(page_size)).min(u64::from(u32::MAX)) as u32;
        Pager {
            file,
            path: path.to_path_buf(),
            header,
            page_size,
            page_count,
            cipher,
            salt_ok,
            statuses: StatusMap::new(page_count),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &DatabaseHeader {
        &self.header
    }

    pub fn header_ok(&self) -> bool {
        self.header.valid
    }

    pub fn salt_ok(&self) -> bool {
        self.salt_ok
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Salt the pages were decrypted with, if encrypted.
    pub fn kdf_salt(&self) -> Option<[u8; SALT_LEN]> {
        self.cipher.as_ref().map(|c| c.salt())
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn usable_size(&self) -> usize {
        self.header.usable_size() as usize
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn contains(&self, pgno: u32) -> bool {
        pgno >= 1 && pgno <= self.page_count
    }

    pub fn statuses(&self) -> &StatusMap {
        &self.statuses
    }

    pub fn statuses_mut(&mut self) -> &mut StatusMap {
        &mut self.statuses
    }

    /// Read and decrypt page `pgno`. A short final page is zero-padded.
    pub fn read_page(&mut self, pgno: u32) -> PagerResult<Vec<u8>> {
        if !self.contains(pgno) {
            return Err(PagerError::page_out_of_range(pgno, self.page_count));
        }
        let offset = u64::from(pgno - 1) * u64::from(self.page_size);
        let mut page = vec![0u8; self.page_size as usize];
        read_at(&mut self.file, offset, &mut page)?;
        if let Some(ref cipher) = self.cipher {
            cipher.apply(pgno, &mut page);
        }
        Ok(page)
    }

    /// Follow an overflow chain starting at `first` until `needed` more
    /// bytes are appended to `out`. Returns false if the chain ended early.
    pub fn read_overflow(&mut self, first: u32, needed: usize, out: &mut Vec<u8>) -> bool {
        let per_page = self.usable_size() - 4;
        let mut remaining = needed;
        let mut next = first;

        while remaining > 0 {
            if !self.contains(next) || self.statuses.get(next) != PageStatus::Unchecked {
                return false;
            }
            let page = match self.read_page(next) {
                Ok(page) => page,
                Err(_) => return false,
            };
            self.statuses.set(next, PageStatus::Checked);

            let take = remaining.min(per_page);
            out.extend_from_slice(&page[4..4 + take]);
            remaining -= take;
            next = u32::from_be_bytes([page[0], page[1], page[2], page[3]]);
        }
        true
    }
}

struct SaltAttempt {
    cipher: PageCipher,
    header: DatabaseHeader,
    btree_ok: bool,
}

fn try_salt(spec: &CipherSpec, salt: [u8; SALT_LEN], raw_first: &[u8]) -> PagerResult<SaltAttempt> {
    let cipher = PageCipher::new(spec, salt)?;
    let mut page = raw_first.to_vec();
    cipher.apply(1, &mut page);

    let header = DatabaseHeader::parse_encrypted(&page, spec.page_size);
    let btree_ok = BtreePage::parse(1, &page, header.usable_size() as usize).is_ok();
    Ok(SaltAttempt {
        cipher,
        header,
        btree_ok,
    })
}

/// KDF salt stored in the first 16 bytes of an encrypted database.
///
/// A file that starts with the plain header magic is not encrypted and has
/// no salt.
pub fn read_kdf_salt(path: &Path) -> PagerResult<[u8; SALT_LEN]> {
    let mut file = File::open(path)
        .map_err(|e| PagerError::io(format!("open {}", path.display()), e))?;
    let file_len = file
        .metadata()
        .map_err(|e| PagerError::io("stat source file", e))?
        .len();
    if file_len < SALT_LEN as u64 {
        return Err(PagerError::not_a_database("file shorter than a salt"));
    }
    let mut salt = [0u8; SALT_LEN];
    read_at(&mut file, 0, &mut salt)?;
    if &salt == HEADER_MAGIC {
        return Err(PagerError::not_a_database(format!(
            "{} is a plain database and carries no salt",
            path.display()
        )));
    }
    Ok(salt)
}

fn read_at(file: &mut File, offset: u64, buf: &mut [u8]) -> PagerResult<()> {
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| PagerError::io("seek source file", e))?;
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PagerError::io("read source file", e)),
        }
    }
    buf[filled..].fill(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_short_file_is_not_a_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tiny.db");
        fs::write(&path, b"hello").unwrap();
        let err = Pager::open(&path, None, None).err().unwrap();
        assert_eq!(err.code(), PagerErrorCode::PgNotADatabase);
    }

    #[test]
    fn test_garbage_header_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.db");
        fs::write(&path, vec![0xAAu8; 4096 * 3 + 10]).unwrap();

        let pager = Pager::open(&path, None, None).unwrap();
        assert!(!pager.header_ok());
        assert_eq!(pager.page_size(), 4096);
        assert_eq!(pager.page_count(), 4);
    }

    #[test]
    fn test_read_out_of_range() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.db");
        fs::write(&path, vec![0u8; 4096]).unwrap();

        let mut pager = Pager::open(&path, None, None).unwrap();
        assert!(pager.read_page(1).is_ok());
        assert_eq!(
            pager.read_page(2).unwrap_err().code(),
            PagerErrorCode::PgPageOutOfRange
        );
        assert!(pager.read_page(0).is_err());
    }

    #[test]
    fn test_cipher_page_size_is_checked_before_reading() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.db");
        fs::write(&path, vec![0u8; 4096 * 2]).unwrap();

        for page_size in [0, 16, 100, 4095, 131072] {
            let spec = CipherSpec::new(b"k".to_vec()).with_page_size(page_size);
            let err = Pager::open(&path, Some(&spec), None).err().unwrap();
            assert_eq!(err.code(), PagerErrorCode::PgInvalidCipher);
        }
    }
}
