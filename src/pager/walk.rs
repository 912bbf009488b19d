//! Table b-tree traversal
//!
//! Depth-first, left to right. Interior pages are marked `Checking` while
//! their subtree is walked so a child pointer back into the current path is
//! recognised as a cycle. A damaged page is marked and skipped; its
//! siblings are still visited. Cancellation is polled before every page
//! read.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::observability::{log_event_with_fields, Event};

use super::page::{BtreePage, PageDamage, PageType};
use super::status::PageStatus;
use super::Pager;

/// Deeper than any tree a valid file can hold.
pub const MAX_TREE_DEPTH: usize = 40;

/// How a walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    Completed,
    Canceled,
    /// The visitor asked to stop
    Stopped,
}

enum Halt {
    Canceled,
    Stopped,
}

fn note_damage(pager: &mut Pager, pgno: u32, damage: &PageDamage, mark: bool) {
    if mark {
        pager.statuses_mut().set(pgno, PageStatus::Damaged);
    }
    let page = pgno.to_string();
    let reason = damage.to_string();
    log_event_with_fields(Event::PageDamaged, &[("page", &page), ("reason", &reason)]);
}

/// Walk the table tree rooted at `root`, calling `visit` for every leaf.
pub fn walk_table<F>(pager: &mut Pager, root: u32, cancel: &AtomicBool, visit: &mut F) -> WalkOutcome
where
    F: FnMut(&mut Pager, &BtreePage<'_>) -> ControlFlow<()>,
{
    match walk_page(pager, root, 0, cancel, visit) {
        Ok(()) => WalkOutcome::Completed,
        Err(Halt::Canceled) => WalkOutcome::Canceled,
        Err(Halt::Stopped) => WalkOutcome::Stopped,
    }
}

fn walk_page<F>(
    pager: &mut Pager,
    pgno: u32,
    depth: usize,
    cancel: &AtomicBool,
    visit: &mut F,
) -> Result<(), Halt>
where
    F: FnMut(&mut Pager, &BtreePage<'_>) -> ControlFlow<()>,
{
    if cancel.load(Ordering::SeqCst) {
        return Err(Halt::Canceled);
    }
    if !pager.contains(pgno) {
        note_damage(pager, pgno, &PageDamage::ChildOutOfRange(pgno), false);
        return Ok(());
    }
    if depth > MAX_TREE_DEPTH {
        note_damage(pager, pgno, &PageDamage::DepthExceeded, false);
        return Ok(());
    }
    match pager.statuses().get(pgno) {
        PageStatus::Unchecked => {}
        PageStatus::Checking => {
            note_damage(pager, pgno, &PageDamage::Cycle(pgno), false);
            return Ok(());
        }
        // Reached twice in one pass; emitted already.
        PageStatus::Checked | PageStatus::Damaged => return Ok(()),
    }

    let data = match pager.read_page(pgno) {
        Ok(data) => data,
        Err(_) => {
            note_damage(pager, pgno, &PageDamage::Unreadable(pgno), true);
            return Ok(());
        }
    };
    let page = match BtreePage::parse(pgno, &data, pager.usable_size()) {
        Ok(page) => page,
        Err(damage) => {
            note_damage(pager, pgno, &damage, true);
            return Ok(());
        }
    };

    match page.page_type() {
        PageType::LeafTable => {
            pager.statuses_mut().set(pgno, PageStatus::Checked);
            match visit(pager, &page) {
                ControlFlow::Continue(()) => Ok(()),
                ControlFlow::Break(()) => Err(Halt::Stopped),
            }
        }
        PageType::InteriorTable => {
            let children = match page.children() {
                Ok(children) => children,
                Err(damage) => {
                    note_damage(pager, pgno, &damage, true);
                    return Ok(());
                }
            };
            pager.statuses_mut().set(pgno, PageStatus::Checking);
            for child in children {
                walk_page(pager, child, depth + 1, cancel, visit)?;
            }
            pager.statuses_mut().set(pgno, PageStatus::Checked);
            Ok(())
        }
        other => {
            note_damage(pager, pgno, &PageDamage::NotTablePage(other), true);
            Ok(())
        }
    }
}

/// True if every page in `leaves` reads back as a table leaf.
pub fn leaves_look_valid(pager: &mut Pager, leaves: &[u32]) -> bool {
    let usable = pager.usable_size();
    leaves.iter().all(|&pgno| match pager.read_page(pgno) {
        Ok(data) => matches!(
            BtreePage::parse(pgno, &data, usable),
            Ok(ref page) if page.page_type() == PageType::LeafTable
        ),
        Err(_) => false,
    })
}

/// Visit a known list of leaves without touching interior pages.
pub fn visit_leaves<F>(
    pager: &mut Pager,
    leaves: &[u32],
    cancel: &AtomicBool,
    visit: &mut F,
) -> WalkOutcome
where
    F: FnMut(&mut Pager, &BtreePage<'_>) -> ControlFlow<()>,
{
    for &pgno in leaves {
        if cancel.load(Ordering::SeqCst) {
            return WalkOutcome::Canceled;
        }
        if pager.statuses().get(pgno) != PageStatus::Unchecked {
            continue;
        }
        let data = match pager.read_page(pgno) {
            Ok(data) => data,
            Err(_) => {
                note_damage(pager, pgno, &PageDamage::Unreadable(pgno), true);
                continue;
            }
        };
        let page = match BtreePage::parse(pgno, &data, pager.usable_size()) {
            Ok(page) if page.page_type() == PageType::LeafTable => page,
            Ok(page) => {
                note_damage(pager, pgno, &PageDamage::NotTablePage(page.page_type()), true);
                continue;
            }
            Err(damage) => {
                note_damage(pager, pgno, &damage, true);
                continue;
            }
        };
        pager.statuses_mut().set(pgno, PageStatus::Checked);
        if visit(pager, &page).is_break() {
            return WalkOutcome::Stopped;
        }
    }
    WalkOutcome::Completed
}
