//! Per-page status tracking for one repair pass

/// Where a page stands in the current pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// Not reached yet
    Unchecked,
    /// On the current walk path
    Checking,
    /// Decoded structurally
    Checked,
    /// Failed structural checks
    Damaged,
}

/// Status of every page in the file, plus the number of leaves whose cells
/// were decoded.
#[derive(Debug, Clone)]
pub struct StatusMap {
    statuses: Vec<PageStatus>,
    parsed_leaves: u32,
}

impl StatusMap {
    pub fn new(page_count: u32) -> Self {
        Self {
            statuses: vec![PageStatus::Unchecked; page_count as usize],
            parsed_leaves: 0,
        }
    }

    pub fn reset(&mut self) {
        self.statuses.fill(PageStatus::Unchecked);
        self.parsed_leaves = 0;
    }

    /// Status of `pgno` (1-based). Out-of-range pages read as `Damaged`.
    pub fn get(&self, pgno: u32) -> PageStatus {
        pgno.checked_sub(1)
            .and_then(|i| self.statuses.get(i as usize))
            .copied()
            .unwrap_or(PageStatus::Damaged)
    }

    pub fn set(&mut self, pgno: u32, status: PageStatus) {
        if let Some(slot) = pgno
            .checked_sub(1)
            .and_then(|i| self.statuses.get_mut(i as usize))
        {
            *slot = status;
        }
    }

    pub fn mark_leaf_parsed(&mut self) {
        self.parsed_leaves += 1;
    }

    pub fn parsed_leaves(&self) -> u32 {
        self.parsed_leaves
    }

    pub fn count(&self, status: PageStatus) -> u32 {
        self.statuses.iter().filter(|s| **s == status).count() as u32
    }
}
