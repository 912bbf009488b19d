//! rescuedb - corruption recovery for SQLite-format databases
//!
//! - [`repair`]: read rows straight out of a damaged file's pages
//! - [`backup`]: statement dumps of a healthy database and their replay
//! - [`checkpoint`]: background WAL checkpointing for live databases

pub mod backup;
pub mod cancel;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod observability;
pub mod pager;
pub mod repair;
pub mod sql;

pub use cancel::CancellationSignal;
