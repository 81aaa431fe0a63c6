use thiserror::Error;

/// Errors that can occur while setting up or maintaining a journal directory.
#[derive(Error, Debug)]
pub enum WriterError {
    /// Invalid path for journal directory
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Path is not a directory
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Machine or boot id could not be loaded
    #[error("host identity error: {0}")]
    HostIdentity(std::io::Error),

    /// A configuration setting could not be parsed
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidSetting {
        key: String,
        value: String,
        reason: String,
    },

    /// I/O error when interacting with filesystem
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying journal file error
    #[error("journal error: {0}")]
    Journal(#[from] journal_core::JournalError),

    /// Repository/registry error
    #[error("registry error: {0}")]
    Registry(#[from] journal_registry::RepositoryError),
}

pub type Result<T> = std::result::Result<T, WriterError>;
