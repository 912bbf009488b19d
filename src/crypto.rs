//! Key derivation and keystreams
//!
//! Two key sources are used:
//! - Database pages: Argon2id over the passphrase and the 16-byte salt
//!   stored at the start of page 1. Cost parameters come from [`CipherSpec`].
//! - Backup material files: BLAKE3 key derivation over the passphrase with
//!   a fixed context string. These files carry no KDF parameters.
//!
//! Both feed the same construction: a BLAKE3 keyed XOF over a 64-bit nonce,
//! XOR'ed into the data. There is no authentication tag on pages; material
//! files carry a key-check tag and a CRC trailer instead.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Length of the KDF salt stored in page 1 and in MasterInfo files.
pub const SALT_LEN: usize = 16;

/// Length of key-check tags.
pub const KEY_CHECK_LEN: usize = 16;

const MATERIAL_CONTEXT: &str = "rescuedb 2024-01 backup material key";
const KEY_CHECK_LABEL: &[u8] = b"rescuedb key check";

pub const DEFAULT_PAGE_SIZE: u32 = 4096;
pub const DEFAULT_KDF_MEMORY_KIB: u32 = 4096;
pub const DEFAULT_KDF_ITERATIONS: u32 = 2;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    Kdf(String),
}

/// Cipher parameters for an encrypted database file.
#[derive(Clone)]
pub struct CipherSpec {
    pub key: Vec<u8>,
    pub page_size: u32,
    pub kdf_memory_kib: u32,
    pub kdf_iterations: u32,
}

impl CipherSpec {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            page_size: DEFAULT_PAGE_SIZE,
            kdf_memory_kib: DEFAULT_KDF_MEMORY_KIB,
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
        }
    }

    /// Must be a power of two in 512..=65536; `Pager::open` rejects
    /// anything else.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_kdf(mut self, memory_kib: u32, iterations: u32) -> Self {
        self.kdf_memory_kib = memory_kib;
        self.kdf_iterations = iterations;
        self
    }

    /// Derive the page keystream for `salt`.
    pub fn page_keystream(&self, salt: &[u8; SALT_LEN]) -> Result<Keystream, CryptoError> {
        let params = Params::new(self.kdf_memory_kib, self.kdf_iterations, 1, Some(32))
            .map_err(|e| CryptoError::Kdf(e.to_string()))?;
        let mut key = [0u8; 32];
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(&self.key, salt, &mut key)
            .map_err(|e| CryptoError::Kdf(e.to_string()))?;
        Ok(Keystream { key })
    }
}

impl std::fmt::Debug for CipherSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherSpec")
            .field("key", &"<redacted>")
            .field("page_size", &self.page_size)
            .field("kdf_memory_kib", &self.kdf_memory_kib)
            .field("kdf_iterations", &self.kdf_iterations)
            .finish()
    }
}

/// XOR keystream keyed by a 32-byte key.
#[derive(Clone)]
pub struct Keystream {
    key: [u8; 32],
}

impl Keystream {
    /// Keystream for backup material files.
    pub fn for_material(passphrase: &[u8]) -> Self {
        Self {
            key: blake3::derive_key(MATERIAL_CONTEXT, passphrase),
        }
    }

    /// XOR `data` with the stream for `nonce`, starting at stream offset 0.
    pub fn apply(&self, nonce: u64, data: &mut [u8]) {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(&nonce.to_le_bytes());
        let mut reader = hasher.finalize_xof();

        let mut block = [0u8; 64];
        for chunk in data.chunks_mut(block.len()) {
            let stream = &mut block[..chunk.len()];
            reader.fill(stream);
            for (byte, mask) in chunk.iter_mut().zip(stream.iter()) {
                *byte ^= mask;
            }
        }
    }

    /// Tag stored in material headers so a wrong key is detected before
    /// any decompression is attempted.
    pub fn key_check(&self) -> [u8; KEY_CHECK_LEN] {
        let hash = blake3::keyed_hash(&self.key, KEY_CHECK_LABEL);
        let mut tag = [0u8; KEY_CHECK_LEN];
        tag.copy_from_slice(&hash.as_bytes()[..KEY_CHECK_LEN]);
        tag
    }

    pub fn verify_key_check(&self, stored: &[u8; KEY_CHECK_LEN]) -> bool {
        self.key_check().ct_eq(stored).into()
    }
}

/// Fresh random salt.
pub fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_spec(key: &str) -> CipherSpec {
        CipherSpec::new(key.as_bytes()).with_kdf(64, 1)
    }

    #[test]
    fn test_keystream_is_involution() {
        let stream = Keystream::for_material(b"secret");
        let original: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        let mut data = original.clone();
        stream.apply(9, &mut data);
        assert_ne!(data, original);
        stream.apply(9, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_nonce_changes_stream() {
        let stream = Keystream::for_material(b"secret");
        let mut a = vec![0u8; 32];
        let mut b = vec![0u8; 32];
        stream.apply(1, &mut a);
        stream.apply(2, &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_page_key_depends_on_salt() {
        let spec = fast_spec("pw");
        let a = spec.page_keystream(&[1u8; SALT_LEN]).unwrap();
        let b = spec.page_keystream(&[2u8; SALT_LEN]).unwrap();
        assert_ne!(a.key_check(), b.key_check());
    }

    #[test]
    fn test_key_check_rejects_other_key() {
        let right = Keystream::for_material(b"right");
        let wrong = Keystream::for_material(b"wrong");
        assert!(right.verify_key_check(&right.key_check()));
        assert!(!wrong.verify_key_check(&right.key_check()));
    }

    #[test]
    fn test_bad_kdf_params_rejected() {
        let spec = CipherSpec::new(b"pw".to_vec()).with_kdf(1, 1);
        assert!(spec.page_keystream(&[0u8; SALT_LEN]).is_err());
    }
}
