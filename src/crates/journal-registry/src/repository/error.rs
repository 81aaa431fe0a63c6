use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while naming or scanning journal files
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// I/O error when reading or scanning directories
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The path does not follow the journal file naming scheme
    #[error("not a journal file path: {path}")]
    InvalidPath { path: String },

    /// Error when a path contains invalid UTF-8
    #[error("path contains invalid UTF-8: {}", .path.display())]
    InvalidUtf8 { path: PathBuf },

    /// Error from walkdir when scanning directories
    #[error("directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;
