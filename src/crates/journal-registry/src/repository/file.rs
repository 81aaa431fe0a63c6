use crate::repository::RepositoryError;
use crate::repository::error::Result;
use journal_common::id128;
use std::cmp::Ordering;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Status of a journal file, as encoded in its name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    /// Active journal file currently being written to
    Active,
    /// Archived journal file that has been rotated and is no longer being written to
    Archived {
        /// Lineage the file's sequence numbers belong to
        seqnum_id: Uuid,
        /// Sequence number of the first entry in this file
        head_seqnum: u64,
        /// Realtime timestamp (microseconds since epoch) of the first entry
        head_realtime: u64,
    },
    /// File set aside because it was found corrupted or was not cleanly closed
    Disposed {
        /// Realtime timestamp of the moment the file was set aside
        timestamp: u64,
        /// Random discriminator
        number: u64,
    },
}

impl Ord for Status {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (
                Status::Disposed {
                    timestamp: t1,
                    number: n1,
                },
                Status::Disposed {
                    timestamp: t2,
                    number: n2,
                },
            ) => t1.cmp(t2).then_with(|| n1.cmp(n2)),

            (Status::Disposed { .. }, _) => Ordering::Less,
            (_, Status::Disposed { .. }) => Ordering::Greater,

            (
                Status::Archived {
                    seqnum_id: lhs_seqnum_id,
                    head_seqnum: lhs_head_seqnum,
                    head_realtime: lhs_head_realtime,
                },
                Status::Archived {
                    seqnum_id: rhs_seqnum_id,
                    head_seqnum: rhs_head_seqnum,
                    head_realtime: rhs_head_realtime,
                },
            ) => lhs_head_realtime
                .cmp(rhs_head_realtime)
                .then_with(|| lhs_seqnum_id.cmp(rhs_seqnum_id))
                .then_with(|| lhs_head_seqnum.cmp(rhs_head_seqnum)),

            (Status::Archived { .. }, Status::Active) => Ordering::Less,
            (Status::Active, Status::Archived { .. }) => Ordering::Greater,

            (Status::Active, Status::Active) => Ordering::Equal,
        }
    }
}

impl PartialOrd for Status {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Status {
    /// Parse the status from the end of the path, returning the status and the remaining path
    pub(super) fn parse(path: &str) -> Option<(Self, &str)> {
        if let Some(stem) = path.strip_suffix(".journal") {
            let Some((prefix, suffix)) = stem.rsplit_once('@') else {
                return Some((Status::Active, stem));
            };

            let mut parts = suffix.split('-');
            let seqnum_id = parts.next()?;
            let head_seqnum = parts.next()?;
            let head_realtime = parts.next()?;
            if parts.next().is_some() {
                return None;
            }

            let seqnum_id = id128::parse(seqnum_id).ok()?;
            let head_seqnum = u64::from_str_radix(head_seqnum, 16).ok()?;
            let head_realtime = u64::from_str_radix(head_realtime, 16).ok()?;

            Some((
                Status::Archived {
                    seqnum_id,
                    head_seqnum,
                    head_realtime,
                },
                prefix,
            ))
        } else if let Some(stem) = path.strip_suffix(".journal~") {
            let (prefix, suffix) = stem.rsplit_once('@')?;
            let (timestamp, number) = suffix.rsplit_once('-')?;

            let timestamp = u64::from_str_radix(timestamp, 16).ok()?;
            let number = u64::from_str_radix(number, 16).ok()?;

            Some((Status::Disposed { timestamp, number }, prefix))
        } else {
            None
        }
    }

    /// Builds the file name for a stream named `stem` in this status.
    pub fn file_name(&self, stem: &str) -> String {
        match self {
            Status::Active => format!("{stem}.journal"),
            Status::Archived {
                seqnum_id,
                head_seqnum,
                head_realtime,
            } => format!(
                "{stem}@{}-{head_seqnum:016x}-{head_realtime:016x}.journal",
                id128::to_hex(seqnum_id)
            ),
            Status::Disposed { timestamp, number } => {
                format!("{stem}@{timestamp:016x}-{number:016x}.journal~")
            }
        }
    }
}

/// Stream a journal file belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Source {
    /// System-wide journal (system.journal)
    System,
    /// User-specific journal with the given UID
    User(u32),
    /// Journal received from a remote host
    Remote(String),
    /// Any other journal name
    Unknown(String),
}

impl Source {
    /// Parse the stream name from the end of the path, returning it and the directory path
    pub(super) fn parse(path: &str) -> Option<(Self, &str)> {
        let (dir_path, basename) = path.rsplit_once('/')?;

        let journal_type = if basename == "system" {
            Source::System
        } else if let Some(uid_str) = basename.strip_prefix("user-") {
            if let Ok(uid) = uid_str.parse::<u32>() {
                Source::User(uid)
            } else {
                Source::Unknown(basename.to_string())
            }
        } else if let Some(remote_host) = basename.strip_prefix("remote-") {
            Source::Remote(remote_host.to_string())
        } else {
            Source::Unknown(basename.to_string())
        };

        Some((journal_type, dir_path))
    }

    /// The stream name used as file name stem.
    pub fn stem(&self) -> String {
        match self {
            Source::System => String::from("system"),
            Source::User(uid) => format!("user-{uid}"),
            Source::Remote(host) => format!("remote-{host}"),
            Source::Unknown(name) => name.clone(),
        }
    }
}

/// Origin identifies where a journal file comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    /// Machine id, when the containing directory is named after one
    pub machine_id: Option<Uuid>,
    /// Optional namespace for isolated journal instances
    pub namespace: Option<String>,
    /// Stream the file belongs to
    pub source: Source,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FileInner {
    path: String,
    directory: String,
    origin: Origin,
    status: Status,
}

/// A journal file path with its parsed name components.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct File {
    inner: Arc<FileInner>,
}

impl File {
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    pub fn status(&self) -> &Status {
        &self.inner.status
    }

    /// Directory containing the file.
    pub fn directory(&self) -> &str {
        &self.inner.directory
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        Self::from_str(path.to_str()?)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(path: &str) -> Option<Self> {
        // Only absolute paths are accepted
        if !path.starts_with('/') {
            return None;
        }

        let (status, path_after_status) = Status::parse(path)?;
        let (source, directory) = Source::parse(path_after_status)?;

        let dirname = directory.rsplit('/').next().unwrap_or_default();
        let (machine_id, namespace) = match dirname.split_once('.') {
            Some((id_str, ns)) => match id128::parse(id_str) {
                Ok(machine_id) => (Some(machine_id), Some(ns.to_string())),
                Err(_) => (None, None),
            },
            None => (id128::parse(dirname).ok(), None),
        };

        let inner = Arc::new(FileInner {
            path: String::from(path),
            directory: String::from(directory),
            origin: Origin {
                machine_id,
                namespace,
                source,
            },
            status,
        });

        Some(File { inner })
    }

    /// Builds the file of `source` in `directory` with the given status.
    pub fn new(directory: &Path, source: &Source, status: Status) -> Result<Self> {
        let path = directory.join(status.file_name(&source.stem()));
        Self::from_path(&path).ok_or_else(|| RepositoryError::InvalidPath {
            path: path.display().to_string(),
        })
    }

    /// The same stream in the same directory, under another status.
    pub fn with_status(&self, status: Status) -> Result<Self> {
        Self::new(
            Path::new(&self.inner.directory),
            &self.inner.origin.source,
            status,
        )
    }

    /// The active file of this file's stream.
    pub fn active(&self) -> Result<Self> {
        self.with_status(Status::Active)
    }

    /// Check if a path looks like a journal file
    pub fn is_journal_file(path: &str) -> bool {
        path.ends_with(".journal") || path.ends_with(".journal~")
    }

    pub fn is_active(&self) -> bool {
        matches!(self.inner.status, Status::Active)
    }

    pub fn is_archived(&self) -> bool {
        matches!(self.inner.status, Status::Archived { .. })
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self.inner.status, Status::Disposed { .. })
    }

    pub fn is_user(&self) -> bool {
        matches!(self.inner.origin.source, Source::User(_))
    }

    pub fn is_system(&self) -> bool {
        matches!(self.inner.origin.source, Source::System)
    }

    /// Get the user ID if this is a user journal
    pub fn user_id(&self) -> Option<u32> {
        match &self.inner.origin.source {
            Source::User(uid) => Some(*uid),
            _ => None,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.inner.origin.namespace.as_deref()
    }

    pub fn to_path_buf(&self) -> PathBuf {
        PathBuf::from(&self.inner.path)
    }
}

impl Ord for File {
    fn cmp(&self, other: &Self) -> Ordering {
        self.inner
            .status
            .cmp(&other.inner.status)
            .then_with(|| self.inner.path.cmp(&other.inner.path))
    }
}

impl PartialOrd for File {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Bytes of disk space allocated to a file.
pub fn disk_usage(path: impl AsRef<Path>) -> std::io::Result<u64> {
    let metadata = std::fs::metadata(path)?;
    Ok(metadata.blocks() * 512)
}

/// Scan a directory recursively for journal files
pub fn scan_journal_files(path: impl AsRef<Path>) -> Result<Vec<File>> {
    let mut files = Vec::new();

    for entry in walkdir::WalkDir::new(path).follow_links(false) {
        let entry = entry?;
        let path = entry.path();

        if entry.file_type().is_file() {
            if let Some(file) = File::from_path(path) {
                files.push(file);
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_active_file() {
        let file = File::from_str("/var/log/journal/system.journal").unwrap();
        assert!(file.is_active());
        assert!(file.is_system());
        assert_eq!(file.directory(), "/var/log/journal");
        assert_eq!(file.origin().machine_id, None);
    }

    #[test]
    fn parses_machine_id_and_namespace() {
        let path = "/var/log/journal/0123456789abcdef0123456789abcdef.audit/user-1000.journal";
        let file = File::from_str(path).unwrap();
        assert_eq!(file.user_id(), Some(1000));
        assert_eq!(file.namespace(), Some("audit"));
        assert!(file.origin().machine_id.is_some());
    }

    #[test]
    fn dotted_directories_are_not_machine_ids() {
        let file = File::from_str("/tmp/.tmpAbCd/system.journal").unwrap();
        assert_eq!(file.origin().machine_id, None);
        assert_eq!(file.namespace(), None);
    }

    #[test]
    fn rejects_relative_and_foreign_paths() {
        assert!(File::from_str("system.journal").is_none());
        assert!(File::from_str("/var/log/messages").is_none());
        assert!(File::from_str("/var/log/journal/system@bad.journal").is_none());
    }

    #[test]
    fn archived_names_parse_back() {
        let active = File::from_str("/var/log/journal/user-42.journal").unwrap();
        let seqnum_id = Uuid::from_bytes([7; 16]);
        let archived = active
            .with_status(Status::Archived {
                seqnum_id,
                head_seqnum: 0x10,
                head_realtime: 0x5f5e100,
            })
            .unwrap();

        assert_eq!(
            archived.path(),
            "/var/log/journal/user-42@07070707070707070707070707070707-0000000000000010-0000000005f5e100.journal"
        );
        assert!(archived.is_archived());
        assert_eq!(archived.user_id(), Some(42));
        assert_eq!(archived.active().unwrap(), active);
    }

    #[test]
    fn disposed_names_parse_back() {
        let active = File::from_str("/var/log/journal/system.journal").unwrap();
        let disposed = active
            .with_status(Status::Disposed {
                timestamp: 0xabc,
                number: 0x1,
            })
            .unwrap();

        assert_eq!(
            disposed.path(),
            "/var/log/journal/system@0000000000000abc-0000000000000001.journal~"
        );
        assert!(disposed.is_disposed());
    }

    #[test]
    fn status_orders_disposed_archived_active() {
        let disposed = Status::Disposed {
            timestamp: 100,
            number: 0,
        };
        let old = Status::Archived {
            seqnum_id: Uuid::nil(),
            head_seqnum: 1,
            head_realtime: 10,
        };
        let new = Status::Archived {
            seqnum_id: Uuid::nil(),
            head_seqnum: 50,
            head_realtime: 20,
        };

        let mut statuses = vec![Status::Active, new.clone(), disposed.clone(), old.clone()];
        statuses.sort();
        assert_eq!(statuses, vec![disposed, old, new, Status::Active]);
    }

    #[test]
    fn scan_finds_journal_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("system.journal"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/user-1000.journal"), b"x").unwrap();

        let files = scan_journal_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.user_id() == Some(1000)));
        assert!(files.iter().any(|f| f.is_system()));
    }

    #[test]
    fn disk_usage_counts_allocated_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.journal");
        std::fs::write(&path, vec![1u8; 64 * 1024]).unwrap();
        assert!(disk_usage(&path).unwrap() > 0);
        assert!(disk_usage(dir.path().join("missing.journal")).is_err());
    }
}
