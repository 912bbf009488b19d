//! Database file header (first 100 bytes of page 1)

/// Magic string of a plain database file.
pub const HEADER_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Size of the file header preceding page 1's b-tree header.
pub const HEADER_SIZE: usize = 100;

pub const DEFAULT_PAGE_SIZE: u32 = 4096;

const OFFSET_PAGE_SIZE: usize = 16;
const OFFSET_RESERVED: usize = 20;
const OFFSET_PAYLOAD_FRACTIONS: usize = 21;
const OFFSET_FREE_PAGES: usize = 36;
const PAYLOAD_FRACTIONS: [u8; 3] = [64, 32, 32];

/// Parsed header fields. Fields are always populated; `valid` says
/// whether they came from the file or are defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseHeader {
    pub page_size: u32,
    pub reserved_bytes: u8,
    pub free_pages: u32,
    pub valid: bool,
}

impl DatabaseHeader {
    /// Defaults used when the header is unreadable.
    pub fn fallback(page_size: u32) -> Self {
        Self {
            page_size,
            reserved_bytes: 0,
            free_pages: 0,
            valid: false,
        }
    }

    /// Parse a plain header: magic, page size and payload fractions must all
    /// check out, otherwise the fallback is returned.
    pub fn parse_plain(buf: &[u8]) -> Self {
        if buf.len() < HEADER_SIZE || &buf[..16] != HEADER_MAGIC {
            return Self::fallback(DEFAULT_PAGE_SIZE);
        }
        Self::parse_fields(buf, None).unwrap_or_else(|| Self::fallback(DEFAULT_PAGE_SIZE))
    }

    /// Parse a decrypted header whose first 16 bytes hold the salt. The page
    /// size must equal `expected_page_size`.
    pub fn parse_encrypted(buf: &[u8], expected_page_size: u32) -> Self {
        if buf.len() < HEADER_SIZE {
            return Self::fallback(expected_page_size);
        }
        Self::parse_fields(buf, Some(expected_page_size))
            .unwrap_or_else(|| Self::fallback(expected_page_size))
    }

    fn parse_fields(buf: &[u8], expected_page_size: Option<u32>) -> Option<Self> {
        let page_size = decode_page_size(u16::from_be_bytes([
            buf[OFFSET_PAGE_SIZE],
            buf[OFFSET_PAGE_SIZE + 1],
        ]))?;
        if let Some(expected) = expected_page_size {
            if page_size != expected {
                return None;
            }
        }
        if buf[OFFSET_PAYLOAD_FRACTIONS..OFFSET_PAYLOAD_FRACTIONS + 3] != PAYLOAD_FRACTIONS {
            return None;
        }
        let reserved_bytes = buf[OFFSET_RESERVED];
        if page_size - u32::from(reserved_bytes) < 480 {
            return None;
        }
        let free_pages = u32::from_be_bytes([
            buf[OFFSET_FREE_PAGES],
            buf[OFFSET_FREE_PAGES + 1],
            buf[OFFSET_FREE_PAGES + 2],
            buf[OFFSET_FREE_PAGES + 3],
        ]);
        Some(Self {
            page_size,
            reserved_bytes,
            free_pages,
            valid: true,
        })
    }

    pub fn usable_size(&self) -> u32 {
        self.page_size - u32::from(self.reserved_bytes)
    }
}

/// Page size field: a power of two in 512..=32768, or 1 meaning 65536.
pub fn decode_page_size(raw: u16) -> Option<u32> {
    let size = if raw == 1 { 65536 } else { u32::from(raw) };
    if is_valid_page_size(size) {
        Some(size)
    } else {
        None
    }
}

pub fn is_valid_page_size(size: u32) -> bool {
    (512..=65536).contains(&size) && size.is_power_of_two()
}
