//! Query sessions over the journal files of a directory.
//!
//! A [`JournalSession`] opens a set of journal files and reads them as a
//! single stream of entries, interleaved by sequence number, boot and
//! time. Matches restrict the stream to entries carrying given field
//! values, and [`Cursor`] strings remember a position across rotations.
//!
//! # Example
//!
//! ```no_run
//! use journal_session::JournalSession;
//!
//! # fn main() -> Result<(), journal_session::SessionError> {
//! let mut session = JournalSession::open("/var/log/journal")?;
//! session.add_match(b"PRIORITY=3")?;
//! session.seek_head();
//! while session.next()? {
//!     if let Some(message) = session.get_field("MESSAGE")? {
//!         println!("{}", String::from_utf8_lossy(&message));
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod cursor;
mod session;

pub use cursor::Cursor;
pub use journal_core::Direction;
pub use session::{Boot, JournalSession, SessionBuilder};

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("journal error: {0}")]
    Journal(#[from] journal_core::JournalError),

    #[error("repository error: {0}")]
    Repository(#[from] journal_core::repository::RepositoryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Reading one file failed. The file is left out from then on.
    #[error("{path}: {source}")]
    File {
        path: String,
        #[source]
        source: journal_core::JournalError,
    },

    #[error("invalid cursor: {0:?}")]
    InvalidCursor(String),

    #[error("not a journal file: {0}")]
    InvalidPath(String),

    #[error("no current entry")]
    NoEntry,
}

pub type Result<T> = std::result::Result<T, SessionError>;
