//! B-tree page structure
//!
//! Only the read side needed for salvage is implemented: page type, cell
//! pointer array, child pointers of interior table pages, and table-leaf
//! cells with their local payload and first overflow page.

use std::fmt;

use super::varint::read_varint;

/// B-tree page types by their flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageType {
    InteriorIndex,
    InteriorTable,
    LeafIndex,
    LeafTable,
}

impl PageType {
    pub fn from_byte(byte: u8) -> Option<PageType> {
        match byte {
            2 => Some(PageType::InteriorIndex),
            5 => Some(PageType::InteriorTable),
            10 => Some(PageType::LeafIndex),
            13 => Some(PageType::LeafTable),
            _ => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, PageType::LeafIndex | PageType::LeafTable)
    }

    /// Size of the b-tree page header.
    pub fn header_size(&self) -> usize {
        if self.is_leaf() {
            8
        } else {
            12
        }
    }
}

/// Why a page or cell was classified damaged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageDamage {
    /// Flag byte is not a b-tree page type
    UnknownType(u8),
    /// Valid b-tree page, but not part of a table tree
    NotTablePage(PageType),
    /// Cell pointer array does not fit in the page
    CellCountOverflow { cells: u16 },
    /// A cell pointer points outside the cell content area
    CellPointerOutOfBounds { index: u16, offset: usize },
    /// Interior page with no cells
    EmptyInterior,
    /// Child pointer is 0 or past the end of the file
    ChildOutOfRange(u32),
    /// Page number outside the file or unreadable
    Unreadable(u32),
    /// Page is already on the current walk path
    Cycle(u32),
    /// Tree deeper than any valid database can be
    DepthExceeded,
    /// Cell header or local payload runs off the page
    CellTruncated { index: u16 },
    /// Record header cannot be decoded
    BadRecord,
}

impl fmt::Display for PageDamage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageDamage::UnknownType(b) => write!(f, "unknown page type {}", b),
            PageDamage::NotTablePage(t) => write!(f, "{:?} page in a table tree", t),
            PageDamage::CellCountOverflow { cells } => {
                write!(f, "cell count {} overflows the page", cells)
            }
            PageDamage::CellPointerOutOfBounds { index, offset } => {
                write!(f, "cell {} points to offset {}", index, offset)
            }
            PageDamage::EmptyInterior => write!(f, "interior page without cells"),
            PageDamage::ChildOutOfRange(p) => write!(f, "child page {} out of range", p),
            PageDamage::Unreadable(p) => write!(f, "page {} unreadable", p),
            PageDamage::Cycle(p) => write!(f, "page {} already on the walk path", p),
            PageDamage::DepthExceeded => write!(f, "tree depth exceeded"),
            PageDamage::CellTruncated { index } => write!(f, "cell {} truncated", index),
            PageDamage::BadRecord => write!(f, "record header undecodable"),
        }
    }
}

/// A table-leaf cell. `local` is the on-page part of the payload.
#[derive(Debug, Clone)]
pub struct TableLeafCell<'a> {
    pub rowid: i64,
    pub payload_size: u64,
    pub local: &'a [u8],
    pub overflow: Option<u32>,
}

/// View over one decoded b-tree page.
#[derive(Debug)]
pub struct BtreePage<'a> {
    pgno: u32,
    data: &'a [u8],
    usable: usize,
    header_offset: usize,
    page_type: PageType,
    cell_count: u16,
}

impl<'a> BtreePage<'a> {
    /// Validate the page header and every cell pointer.
    pub fn parse(pgno: u32, data: &'a [u8], usable: usize) -> Result<Self, PageDamage> {
        let header_offset = if pgno == 1 { 100 } else { 0 };
        let usable = usable.min(data.len());
        if header_offset + 12 > usable {
            return Err(PageDamage::Unreadable(pgno));
        }

        let flag = data[header_offset];
        let page_type = PageType::from_byte(flag).ok_or(PageDamage::UnknownType(flag))?;
        let cell_count = u16::from_be_bytes([data[header_offset + 3], data[header_offset + 4]]);

        let array_start = header_offset + page_type.header_size();
        let array_end = array_start + 2 * cell_count as usize;
        if array_end > usable {
            return Err(PageDamage::CellCountOverflow { cells: cell_count });
        }

        for index in 0..cell_count {
            let at = array_start + 2 * index as usize;
            let offset = u16::from_be_bytes([data[at], data[at + 1]]) as usize;
            if offset < array_end || offset + 4 > usable {
                return Err(PageDamage::CellPointerOutOfBounds { index, offset });
            }
        }

        if !page_type.is_leaf() && cell_count == 0 {
            return Err(PageDamage::EmptyInterior);
        }

        Ok(Self {
            pgno,
            data,
            usable,
            header_offset,
            page_type,
            cell_count,
        })
    }

    pub fn pgno(&self) -> u32 {
        self.pgno
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn cell_count(&self) -> u16 {
        self.cell_count
    }

    fn cell_offset(&self, index: u16) -> usize {
        let at = self.header_offset + self.page_type.header_size() + 2 * index as usize;
        u16::from_be_bytes([self.data[at], self.data[at + 1]]) as usize
    }

    fn read_u32(&self, at: usize) -> u32 {
        u32::from_be_bytes([
            self.data[at],
            self.data[at + 1],
            self.data[at + 2],
            self.data[at + 3],
        ])
    }

    /// Raw child pointers of an interior table page, left to right with the
    /// right-most child last. Range checks are left to the walker so one bad
    /// pointer does not hide its siblings.
    pub fn children(&self) -> Result<Vec<u32>, PageDamage> {
        if self.page_type != PageType::InteriorTable {
            return Err(PageDamage::NotTablePage(self.page_type));
        }
        let mut children = Vec::with_capacity(self.cell_count as usize + 1);
        for index in 0..self.cell_count {
            children.push(self.read_u32(self.cell_offset(index)));
        }
        children.push(self.read_u32(self.header_offset + 8));
        Ok(children)
    }

    /// Decode cell `index` of a table-leaf page.
    pub fn table_cell(&self, index: u16) -> Result<TableLeafCell<'a>, PageDamage> {
        let truncated = PageDamage::CellTruncated { index };
        let data: &'a [u8] = self.data;
        let mut at = self.cell_offset(index);

        let (payload_size, n) = data
            .get(at..self.usable)
            .and_then(read_varint)
            .ok_or(truncated.clone())?;
        at += n;
        let (rowid, n) = data
            .get(at..self.usable)
            .and_then(read_varint)
            .ok_or(truncated.clone())?;
        at += n;

        let local_size = local_payload_size(payload_size, self.usable);
        if at + local_size > self.usable {
            return Err(truncated);
        }
        let local = &data[at..at + local_size];

        let overflow = if (local_size as u64) < payload_size {
            let ptr_at = at + local_size;
            if ptr_at + 4 > self.usable {
                return Err(truncated);
            }
            Some(self.read_u32(ptr_at))
        } else {
            None
        };

        Ok(TableLeafCell {
            rowid: rowid as i64,
            payload_size,
            local,
            overflow,
        })
    }
}

/// Bytes of a table-leaf payload stored on the page itself.
pub fn local_payload_size(payload_size: u64, usable: usize) -> usize {
    let usable = usable as u64;
    let max_local = usable - 35;
    if payload_size <= max_local {
        return payload_size as usize;
    }
    let min_local = (usable - 12) * 32 / 255 - 23;
    let surplus = min_local + (payload_size - min_local) % (usable - 4);
    if surplus <= max_local {
        surplus as usize
    } else {
        min_local as usize
    }
}
