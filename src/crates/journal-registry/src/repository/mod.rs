//! Journal file names and directory scanning.

pub mod error;
pub mod file;

pub use crate::repository::error::RepositoryError;
pub use crate::repository::file::{File, Origin, Source, Status, disk_usage, scan_journal_files};
