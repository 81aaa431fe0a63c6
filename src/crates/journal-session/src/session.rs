use crate::cursor::Cursor;
use crate::{Result, SessionError};
use journal_common::collections::HashSet;
use journal_common::id128;
use journal_core::repository::{File, disk_usage, scan_journal_files};
use journal_core::{
    Direction, JournalCursor, JournalError, JournalFile, JournalFilter, Location, Mmap, MmapCache,
};
use std::collections::BTreeSet;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use tracing::{debug, warn};

/// Default mmap window size (8 MiB).
const DEFAULT_WINDOW_SIZE: u64 = 8 * 1024 * 1024;
const DEFAULT_MAX_WINDOWS: usize = 32;

/// An entry found in one of the files, not yet handed out.
#[derive(Debug, Copy, Clone)]
struct Candidate {
    offset: NonZeroU64,
    position: Cursor,
}

struct SessionFile {
    file: File,
    journal: JournalFile<Mmap>,
    cursor: JournalCursor,
    pending: Option<Candidate>,
    failed: bool,
}

/// Where iteration continues from.
#[derive(Debug, Copy, Clone)]
enum Anchor {
    Head,
    Tail,
    /// A seek target, included in the results
    Seek(Cursor),
    /// The entry last handed out, excluded from the results
    Entry {
        file: usize,
        offset: NonZeroU64,
        position: Cursor,
    },
}

/// A boot found in the journal, with the time range of its entries.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Boot {
    pub boot_id: Uuid,
    pub first_realtime: u64,
    pub last_realtime: u64,
}

/// A set of journal files read as one interleaved stream of entries.
///
/// Entries of all files are merged in the order given by
/// [`Cursor::compare`]. Matches added with [`add_match`](Self::add_match)
/// restrict the stream; the seek operations move the read position and
/// [`next`](Self::next) and [`previous`](Self::previous) step through it.
pub struct JournalSession {
    directory: Option<PathBuf>,
    cache: MmapCache,
    files: Vec<SessionFile>,
    file_ids: HashSet<Uuid>,
    skipped: Vec<(String, JournalError)>,

    filter: JournalFilter,
    filter_dirty: bool,

    anchor: Anchor,
    direction: Option<Direction>,
}

impl std::fmt::Debug for JournalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalSession")
            .field("directory", &self.directory)
            .field("files", &self.files.len())
            .field("anchor", &self.anchor)
            .finish_non_exhaustive()
    }
}

fn read_position(journal: &JournalFile<Mmap>, offset: NonZeroU64) -> journal_core::Result<Cursor> {
    let seqnum_id = journal.journal_header_ref().seqnum_id();
    let entry = journal.entry_ref(offset)?;
    Ok(Cursor {
        seqnum: Some((seqnum_id, entry.header.seqnum)),
        monotonic: Some((entry.boot_id(), entry.header.monotonic)),
        realtime: Some(entry.header.realtime),
        xor_hash: Some(entry.header.xor_hash),
    })
}

/// Location in `journal` closest to `position` from which stepping in
/// `direction` reaches the entries beyond it.
fn approximate(
    journal: &JournalFile<Mmap>,
    position: &Cursor,
    direction: Direction,
) -> journal_core::Result<Location> {
    if let Some((seqnum_id, seqnum)) = position.seqnum {
        if journal.journal_header_ref().seqnum_id() == seqnum_id {
            return Ok(Location::Seqnum(seqnum));
        }
    }

    if let Some((boot_id, monotonic)) = position.monotonic {
        if journal.boot_id_data_offset(boot_id)?.is_some() {
            return Ok(Location::Monotonic(monotonic, boot_id));
        }
    }

    Ok(match (position.realtime, direction) {
        (Some(realtime), _) => Location::Realtime(realtime),
        (None, Direction::Forward) => Location::Head,
        (None, Direction::Backward) => Location::Tail,
    })
}

fn is_before(a: &Cursor, b: &Cursor, direction: Direction) -> bool {
    match direction {
        Direction::Forward => a.compare(b).is_lt(),
        Direction::Backward => a.compare(b).is_gt(),
    }
}

impl JournalSession {
    /// Opens every journal file found under `path`. Disposed files and
    /// files that fail to open are skipped.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::builder().directory(path).build()
    }

    /// Opens the given files. Any file that fails to open is an error.
    pub fn from_files(paths: &[PathBuf]) -> Result<Self> {
        Self::builder().files(paths.to_vec()).build()
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    fn new(directory: Option<PathBuf>, cache: MmapCache) -> Self {
        Self {
            directory,
            cache,
            files: Vec::new(),
            file_ids: HashSet::default(),
            skipped: Vec::new(),
            filter: JournalFilter::default(),
            filter_dirty: false,
            anchor: Anchor::Head,
            direction: None,
        }
    }

    /// Adds `file` unless it is already part of the session, which happens
    /// when an active file got archived under a new name.
    fn add_file(&mut self, file: File) -> journal_core::Result<bool> {
        let journal = JournalFile::<Mmap>::open(&file, &self.cache)?;
        let file_id = journal.journal_header_ref().file_id();
        if !self.file_ids.insert(file_id) {
            return Ok(false);
        }

        debug!("added {}", file.path());
        self.files.push(SessionFile {
            file,
            journal,
            cursor: JournalCursor::new(),
            pending: None,
            failed: false,
        });
        self.filter_dirty = true;
        Ok(true)
    }

    fn scan(&mut self) -> Result<usize> {
        let Some(directory) = self.directory.clone() else {
            return Ok(0);
        };

        let mut added = 0;
        for file in scan_journal_files(&directory)? {
            if file.is_disposed() {
                continue;
            }
            match self.add_file(file.clone()) {
                Ok(true) => {
                    self.skipped.retain(|(path, _)| path != file.path());
                    added += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    if !self.skipped.iter().any(|(path, _)| path == file.path()) {
                        warn!("skipping {}: {}", file.path(), e);
                        self.skipped.push((file.path().to_string(), e));
                    }
                }
            }
        }
        Ok(added)
    }

    /// Picks up files created in the directory since the last scan and
    /// entries appended to the open ones. Returns the number of files added.
    pub fn refresh(&mut self) -> Result<usize> {
        let added = self.scan()?;
        self.invalidate();
        Ok(added)
    }

    pub fn files(&self) -> impl Iterator<Item = &JournalFile<Mmap>> {
        self.files.iter().map(|f| &f.journal)
    }

    /// Files found in the directory that could not be opened.
    pub fn skipped(&self) -> &[(String, JournalError)] {
        &self.skipped
    }

    fn invalidate(&mut self) {
        self.direction = None;
        for file in &mut self.files {
            file.pending = None;
        }
    }

    /// Adds a `FIELD=value` match. Matches on the same field are
    /// alternatives, matches on different fields must all hold.
    pub fn add_match(&mut self, data: &[u8]) -> Result<()> {
        self.filter.add_match(data)?;
        self.filter_dirty = true;
        self.invalidate();
        Ok(())
    }

    /// Starts a new group of matches, any of which may hold.
    pub fn add_disjunction(&mut self) {
        self.filter.add_disjunction();
        self.filter_dirty = true;
        self.invalidate();
    }

    /// Starts a new set of groups that must hold in addition to the
    /// previous ones.
    pub fn add_conjunction(&mut self) {
        self.filter.add_conjunction();
        self.filter_dirty = true;
        self.invalidate();
    }

    pub fn flush_matches(&mut self) {
        self.filter.clear();
        self.filter_dirty = true;
        self.invalidate();
    }

    fn seek(&mut self, anchor: Anchor) {
        self.anchor = anchor;
        self.invalidate();
    }

    pub fn seek_head(&mut self) {
        self.seek(Anchor::Head);
    }

    pub fn seek_tail(&mut self) {
        self.seek(Anchor::Tail);
    }

    /// Positions before the first entry at or after `realtime` (or after
    /// the last one at or before it, when stepping backwards).
    pub fn seek_realtime(&mut self, realtime: u64) {
        self.seek(Anchor::Seek(Cursor::at_realtime(realtime)));
    }

    pub fn seek_monotonic(&mut self, boot_id: Uuid, monotonic: u64) {
        self.seek(Anchor::Seek(Cursor::at_monotonic(boot_id, monotonic)));
    }

    /// Positions at the entry named by `cursor`, which the next step
    /// returns if it still exists.
    pub fn seek_cursor(&mut self, cursor: &str) -> Result<()> {
        let position: Cursor = cursor.parse()?;
        self.seek(Anchor::Seek(position));
        Ok(())
    }

    fn file_error(&mut self, index: usize, source: JournalError) -> SessionError {
        let file = &mut self.files[index];
        file.failed = true;
        file.pending = None;
        SessionError::File {
            path: file.file.path().to_string(),
            source,
        }
    }

    fn apply_filter(&mut self) -> Result<()> {
        if !self.filter_dirty {
            return Ok(());
        }
        self.filter_dirty = false;

        for index in 0..self.files.len() {
            let file = &mut self.files[index];
            match self.filter.build(&file.journal) {
                Ok(expr) => file.cursor.set_filter(expr),
                Err(e) => return Err(self.file_error(index, e)),
            }
        }
        Ok(())
    }

    /// Places every file's cursor so that stepping in `direction` continues
    /// from the anchor.
    fn reposition(&mut self, direction: Direction) -> Result<()> {
        self.apply_filter()?;

        for index in 0..self.files.len() {
            let file = &mut self.files[index];
            file.pending = None;

            let location = match self.anchor {
                Anchor::Head => Ok(Location::Head),
                Anchor::Tail => Ok(Location::Tail),
                Anchor::Entry { file: owner, offset, .. } if owner == index => {
                    Ok(Location::ResolvedEntry(offset))
                }
                Anchor::Entry { position, .. } | Anchor::Seek(position) => {
                    approximate(&file.journal, &position, direction)
                }
            };

            match location {
                Ok(location) => file.cursor.set_location(location),
                Err(e) => return Err(self.file_error(index, e)),
            }
        }

        self.direction = Some(direction);
        Ok(())
    }

    /// The next entry of file `index` beyond the anchor.
    fn next_in_file(&mut self, index: usize, direction: Direction) -> journal_core::Result<Option<Candidate>> {
        let file = &mut self.files[index];

        loop {
            if !file.cursor.step(&file.journal, direction)? {
                return Ok(None);
            }

            let offset = file.cursor.position()?;
            let position = read_position(&file.journal, offset)?;

            let beyond = match &self.anchor {
                Anchor::Head | Anchor::Tail => true,
                Anchor::Seek(target) => !is_before(&position, target, direction),
                Anchor::Entry { position: last, .. } => is_before(last, &position, direction),
            };
            if beyond {
                return Ok(Some(Candidate { offset, position }));
            }
        }
    }

    fn step(&mut self, direction: Direction) -> Result<bool> {
        if self.direction != Some(direction) || self.filter_dirty {
            self.reposition(direction)?;
        }

        let mut best: Option<(usize, Candidate)> = None;
        for index in 0..self.files.len() {
            if self.files[index].failed {
                continue;
            }

            if self.files[index].pending.is_none() {
                match self.next_in_file(index, direction) {
                    Ok(candidate) => self.files[index].pending = candidate,
                    Err(e) => return Err(self.file_error(index, e)),
                }
            }

            if let Some(candidate) = self.files[index].pending {
                let better = best.is_none_or(|(_, b)| is_before(&candidate.position, &b.position, direction));
                if better {
                    best = Some((index, candidate));
                }
            }
        }

        let Some((index, chosen)) = best else {
            return Ok(false);
        };

        // The same entry may sit in several files; hand it out once
        for file in &mut self.files {
            if file
                .pending
                .is_some_and(|p| p.position.compare(&chosen.position).is_eq())
            {
                file.pending = None;
            }
        }

        self.anchor = Anchor::Entry {
            file: index,
            offset: chosen.offset,
            position: chosen.position,
        };
        Ok(true)
    }

    /// Moves to the next entry. Returns `false` at the end, keeping the
    /// current entry.
    pub fn next(&mut self) -> Result<bool> {
        self.step(Direction::Forward)
    }

    /// Moves to the previous entry. Returns `false` at the start.
    pub fn previous(&mut self) -> Result<bool> {
        self.step(Direction::Backward)
    }

    /// Moves up to `n` entries forward, returning how many were passed.
    pub fn skip_next(&mut self, n: usize) -> Result<usize> {
        let mut skipped = 0;
        while skipped < n && self.next()? {
            skipped += 1;
        }
        Ok(skipped)
    }

    pub fn skip_previous(&mut self, n: usize) -> Result<usize> {
        let mut skipped = 0;
        while skipped < n && self.previous()? {
            skipped += 1;
        }
        Ok(skipped)
    }

    fn current(&self) -> Result<(&JournalFile<Mmap>, NonZeroU64, &Cursor)> {
        match &self.anchor {
            Anchor::Entry {
                file,
                offset,
                position,
            } => Ok((&self.files[*file].journal, *offset, position)),
            _ => Err(SessionError::NoEntry),
        }
    }

    /// Cursor string of the current entry.
    pub fn cursor(&self) -> Result<String> {
        let (_, _, position) = self.current()?;
        Ok(position.to_string())
    }

    /// Whether the current entry is the one `cursor` names.
    pub fn test_cursor(&self, cursor: &str) -> Result<bool> {
        let (_, _, position) = self.current()?;
        let other: Cursor = cursor.parse()?;
        Ok(position.compare(&other).is_eq())
    }

    pub fn realtime(&self) -> Result<u64> {
        let (_, _, position) = self.current()?;
        position.realtime.ok_or(SessionError::NoEntry)
    }

    /// Monotonic time and boot id of the current entry.
    pub fn monotonic(&self) -> Result<(u64, Uuid)> {
        let (_, _, position) = self.current()?;
        let (boot_id, monotonic) = position.monotonic.ok_or(SessionError::NoEntry)?;
        Ok((monotonic, boot_id))
    }

    /// Sequence number and lineage of the current entry.
    pub fn seqnum(&self) -> Result<(u64, Uuid)> {
        let (_, _, position) = self.current()?;
        let (seqnum_id, seqnum) = position.seqnum.ok_or(SessionError::NoEntry)?;
        Ok((seqnum, seqnum_id))
    }

    /// `FIELD=value` payloads of the current entry, decompressed.
    pub fn entry_data(&self) -> Result<Vec<Vec<u8>>> {
        let (journal, offset, _) = self.current()?;

        let mut offsets = Vec::new();
        journal.entry_data_object_offsets(offset, &mut offsets)?;

        let mut payloads = Vec::with_capacity(offsets.len());
        for data_offset in offsets {
            let mut payload = Vec::new();
            journal.data_payload(data_offset, &mut payload)?;
            payloads.push(payload);
        }
        Ok(payloads)
    }

    /// Value of field `name` in the current entry, `None` when the entry
    /// doesn't have it.
    pub fn get_field(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let prefix_len = name.len() + 1;
        for payload in self.entry_data()? {
            if payload.len() >= prefix_len
                && payload.starts_with(name.as_bytes())
                && payload[name.len()] == b'='
            {
                return Ok(Some(payload[prefix_len..].to_vec()));
            }
        }
        Ok(None)
    }

    /// Distinct values of field `name` across all files.
    pub fn query_unique(&self, name: &str) -> Result<BTreeSet<Vec<u8>>> {
        let prefix_len = name.len() + 1;
        let mut values = BTreeSet::new();

        for file in &self.files {
            for item in file.journal.field_data_objects(name.as_bytes())? {
                let (_, payload) = item?;
                if payload.len() >= prefix_len {
                    values.insert(payload[prefix_len..].to_vec());
                }
            }
        }
        Ok(values)
    }

    /// Names of all fields across all files.
    pub fn field_names(&self) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for file in &self.files {
            for name in file.journal.fields() {
                names.insert(String::from_utf8_lossy(&name?).into_owned());
            }
        }
        Ok(names)
    }

    /// Bytes on disk used by the files of the session.
    pub fn usage(&self) -> Result<u64> {
        let mut total = 0;
        for file in &self.files {
            total += disk_usage(file.file.path())?;
        }
        Ok(total)
    }

    /// Wall clock times of the earliest and latest entries.
    pub fn cutoff_realtime(&self) -> Option<(u64, u64)> {
        self.files
            .iter()
            .filter_map(|f| f.journal.cutoff_realtime())
            .reduce(|(from, to), (head, tail)| (from.min(head), to.max(tail)))
    }

    /// Monotonic times of the earliest and latest entries of `boot_id`.
    pub fn cutoff_monotonic(&self, boot_id: Uuid) -> Result<Option<(u64, u64)>> {
        let mut range: Option<(u64, u64)> = None;
        for file in &self.files {
            if let Some((head, tail)) = file.journal.cutoff_monotonic(boot_id)? {
                range = Some(match range {
                    Some((from, to)) => (from.min(head), to.max(tail)),
                    None => (head, tail),
                });
            }
        }
        Ok(range)
    }

    /// Boots recorded in the journal, oldest first. Matches in effect are
    /// left untouched; the read position is reset to the head.
    pub fn boots(&mut self) -> Result<Vec<Boot>> {
        let saved = std::mem::take(&mut self.filter);
        let result = self.collect_boots();
        self.filter = saved;
        self.filter_dirty = true;
        self.seek_head();
        result
    }

    fn collect_boots(&mut self) -> Result<Vec<Boot>> {
        let mut boots = Vec::new();

        for value in self.query_unique("_BOOT_ID")? {
            let Some(boot_id) = std::str::from_utf8(&value)
                .ok()
                .and_then(|s| id128::parse(s).ok())
            else {
                continue;
            };

            self.filter.clear();
            self.add_match(format!("_BOOT_ID={}", id128::to_hex(&boot_id)).as_bytes())?;

            self.seek_head();
            if !self.next()? {
                continue;
            }
            let first_realtime = self.realtime()?;

            self.seek_tail();
            if !self.previous()? {
                continue;
            }
            let last_realtime = self.realtime()?;

            boots.push(Boot {
                boot_id,
                first_realtime,
                last_realtime,
            });
        }

        boots.sort_by_key(|b| (b.first_realtime, b.boot_id));
        Ok(boots)
    }
}

/// Builder for a [`JournalSession`] with custom configuration.
#[derive(Default)]
pub struct SessionBuilder {
    directory: Option<PathBuf>,
    paths: Option<Vec<PathBuf>>,
    window_size: Option<u64>,
}

impl SessionBuilder {
    /// Set the journal directory to scan.
    pub fn directory(mut self, path: impl AsRef<Path>) -> Self {
        self.directory = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set explicit file paths instead of scanning a directory.
    pub fn files(mut self, paths: Vec<PathBuf>) -> Self {
        self.paths = Some(paths);
        self
    }

    /// Set the mmap window size in bytes (default: 8 MiB).
    pub fn window_size(mut self, size: u64) -> Self {
        self.window_size = Some(size);
        self
    }

    pub fn build(self) -> Result<JournalSession> {
        let cache = MmapCache::new(
            self.window_size.unwrap_or(DEFAULT_WINDOW_SIZE),
            DEFAULT_MAX_WINDOWS,
        );

        let directory = match self.directory {
            Some(dir) => Some(dir.canonicalize()?),
            None => None,
        };
        let mut session = JournalSession::new(directory, cache);
        session.scan()?;

        for path in self.paths.unwrap_or_default() {
            let path = path.canonicalize()?;
            let file = File::from_path(&path)
                .ok_or_else(|| SessionError::InvalidPath(path.display().to_string()))?;
            session.add_file(file).map_err(|source| SessionError::File {
                path: path.display().to_string(),
                source,
            })?;
        }

        Ok(session)
    }
}
