//! Page-level encryption
//!
//! Layout of an encrypted file: the first 16 bytes of page 1 are the plain
//! KDF salt; the rest of page 1 and all other pages are XOR'ed with the
//! keystream for their page number. Page size and reserved bytes are the
//! same as the plain file.

use std::fs;
use std::path::Path;

use crate::crypto::{random_salt, CipherSpec, Keystream, SALT_LEN};

use super::errors::{PagerError, PagerResult};
use super::header::DatabaseHeader;

pub struct PageCipher {
    stream: Keystream,
    salt: [u8; SALT_LEN],
}

impl PageCipher {
    pub fn new(spec: &CipherSpec, salt: [u8; SALT_LEN]) -> PagerResult<Self> {
        let stream = spec
            .page_keystream(&salt)
            .map_err(|e| PagerError::wrong_key(e.to_string()))?;
        Ok(Self { stream, salt })
    }

    pub fn salt(&self) -> [u8; SALT_LEN] {
        self.salt
    }

    /// Decrypt (or encrypt; the operation is its own inverse) one page.
    pub fn apply(&self, pgno: u32, page: &mut [u8]) {
        let start = if pgno == 1 { SALT_LEN } else { 0 };
        if page.len() > start {
            self.stream.apply(u64::from(pgno), &mut page[start..]);
        }
    }
}

/// Write an encrypted copy of the plain database at `plain` to `out`.
///
/// The plain file's page size must match `spec.page_size`. Returns the salt
/// written into page 1.
pub fn encrypt_file(
    plain: &Path,
    out: &Path,
    spec: &CipherSpec,
    salt: Option<[u8; SALT_LEN]>,
) -> PagerResult<[u8; SALT_LEN]> {
    let mut data = fs::read(plain)
        .map_err(|e| PagerError::io(format!("read {}", plain.display()), e))?;

    let header = DatabaseHeader::parse_plain(&data);
    if !header.valid {
        return Err(PagerError::not_a_database("source header is not readable"));
    }
    if header.page_size != spec.page_size {
        return Err(PagerError::not_a_database(format!(
            "source page size {} does not match cipher page size {}",
            header.page_size, spec.page_size
        )));
    }

    let salt = salt.unwrap_or_else(random_salt);
    let cipher = PageCipher::new(spec, salt)?;
    let page_size = header.page_size as usize;

    data[..SALT_LEN].copy_from_slice(&salt);
    for (index, page) in data.chunks_mut(page_size).enumerate() {
        cipher.apply(index as u32 + 1, page);
    }

    fs::write(out, &data).map_err(|e| PagerError::io(format!("write {}", out.display()), e))?;
    Ok(salt)
}
