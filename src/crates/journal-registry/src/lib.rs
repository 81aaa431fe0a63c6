//! Journal file naming and discovery.
//!
//! Journal files live in a directory and encode their role in their name:
//!
//! - `system.journal`, `user-1000.journal`: the active file of a stream
//! - `system@<seqnum_id>-<head_seqnum>-<head_realtime>.journal`: an archived file
//! - `system@<timestamp>-<random>.journal~`: a file set aside after corruption
//!
//! This crate parses and produces those names and scans directories for
//! journal files.

pub mod repository;

pub use repository::{
    File, Origin, RepositoryError, Source, Status, disk_usage, scan_journal_files,
};
