//! The write path of a journal directory: file selection, rotation,
//! retention and flood protection around [`JournalWriter`].

use crate::config::{Config, SYSTEM_UID_MAX, SplitMode};
use crate::error::{Result, WriterError};
use crate::rate_limit::{RateLimiter, Verdict};
use crate::vacuum::{VacuumLimits, VacuumReport, vacuum};
use bytesize::ByteSize;
use journal_common::{
    DualTimestamp, Microseconds, RealtimeClock, hostname, id128, load_boot_id, load_machine_id,
    monotonic_now,
};
use journal_core::file::FilesystemSpace;
use journal_core::repository::{File, Source, Status, disk_usage, scan_journal_files};
use journal_core::{
    JournalError, JournalFile, JournalFileOptions, JournalWriter, MmapCache, MmapMut,
    ResolvedMetrics,
};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use tracing::{debug, error, info, instrument, warn};

/// How long a measurement of the available space stays valid.
const SPACE_RECHECK_USEC: u64 = 30 * 1_000_000;

/// Highest priority that is synced to disk right away (LOG_CRIT).
const SYNC_IMMEDIATELY_PRIORITY: u8 = 2;

/// What happened to a dispatched message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Stored under this sequence number
    Written(u64),
    /// Below the configured storage level, or without fields
    Ignored,
    /// Turned away by the rate limiter
    Suppressed,
    /// Could not be stored, even after rotating and vacuuming
    Dropped,
}

/// A file open for appending together with its writer.
struct ActiveFile {
    journal: JournalFile<MmapMut>,
    writer: JournalWriter,
}

impl ActiveFile {
    fn new(journal: JournalFile<MmapMut>, metrics: ResolvedMetrics) -> journal_core::Result<Self> {
        let writer = JournalWriter::new(&journal, metrics)?;
        Ok(Self { journal, writer })
    }

    fn path(&self) -> &str {
        self.journal.file().path()
    }

    fn set_offline(&mut self) {
        if let Err(e) = self.journal.set_offline() {
            warn!("failed to set {} offline: {}", self.path(), e);
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Target {
    System,
    User(u32),
}

/// Where the file set aside on open left its sequence numbers.
#[derive(Debug, Copy, Clone)]
struct Lineage {
    seqnum_id: Uuid,
    tail_seqnum: u64,
    tail_realtime: u64,
}

#[derive(Debug, Default, Copy, Clone)]
struct SpaceCache {
    checked_usec: Option<u64>,
    available: u64,
}

/// Writes entries to the journal files of one machine.
///
/// The directory holds a system file plus, depending on the split mode,
/// one file per regular user. Files are rotated when they fill up or grow
/// old, and archived files are vacuumed to stay within the retention
/// limits. Every file is set offline when the engine is dropped.
pub struct Engine {
    config: Config,
    directory: PathBuf,
    machine_id: Uuid,
    boot_id: Uuid,
    hostname: Option<String>,

    metrics: ResolvedMetrics,
    cache: MmapCache,

    system: Option<ActiveFile>,
    users: LruCache<u32, ActiveFile>,

    seqnum: u64,
    sync_seqnum: u64,
    last_sync_usec: u64,
    clock: RealtimeClock,

    rate_limiter: RateLimiter,
    space: SpaceCache,
    oldest_file_usec: Option<u64>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("directory", &self.directory)
            .field("machine_id", &self.machine_id)
            .field("boot_id", &self.boot_id)
            .field("seqnum", &self.seqnum)
            .field("user_files", &self.users.len())
            .finish_non_exhaustive()
    }
}

fn monotonic_usec() -> u64 {
    monotonic_now().map_or(0, Microseconds::get)
}

/// Creates `<root>/<machine id>` and returns its canonical path.
fn create_directory(root: &Path, machine_id: &Uuid) -> Result<PathBuf> {
    if root.exists() && !root.is_dir() {
        return Err(WriterError::NotADirectory(root.display().to_string()));
    }

    let path = root.join(id128::to_hex(machine_id));
    std::fs::create_dir_all(&path)?;

    let path = path.canonicalize()?;
    if path.to_str().is_none() {
        return Err(WriterError::InvalidPath(path.display().to_string()));
    }

    Ok(path)
}

fn log_rotation_reason(path: &str, err: &JournalError) {
    match err {
        JournalError::FileFull | JournalError::OutOfSpace | JournalError::EntryTooLarge => {
            debug!("{path}: allocation limit reached, rotating")
        }
        JournalError::ForeignLineage => info!("{path}: journal file from another machine, rotating"),
        JournalError::UncleanShutdown => info!("{path}: unclean shutdown, rotating"),
        JournalError::FileArchived => info!("{path}: file was archived, rotating"),
        JournalError::UnsupportedFeature(_) | JournalError::LegacyHeader => {
            info!("{path}: journal file uses an unsupported format, rotating")
        }
        e if e.is_corruption() => warn!("{path}: journal file corrupted ({e}), rotating"),
        e => debug!("{path}: {e}, rotating"),
    }
}

impl Engine {
    /// Opens the journal directory for `config.directory` and the system
    /// file inside it, creating both when needed.
    ///
    /// Sequence numbers and the realtime clock continue from the tail of
    /// the existing system file.
    #[instrument(skip(config), fields(directory = %config.directory.display()))]
    pub fn open(config: Config) -> Result<Self> {
        let machine_id = match config.machine_id {
            Some(id) => id,
            None => load_machine_id().map_err(WriterError::HostIdentity)?,
        };
        let boot_id = match config.boot_id {
            Some(id) => id,
            None => load_boot_id().map_err(WriterError::HostIdentity)?,
        };

        let directory = create_directory(&config.directory, &machine_id)?;
        let metrics = config.metrics().resolve_for(&directory)?;
        info!("journal limits for {}: {}", directory.display(), metrics);

        let hostname = match hostname() {
            Ok(name) if !name.is_empty() => Some(name),
            Ok(_) => None,
            Err(e) => {
                warn!("failed to read hostname: {e}");
                None
            }
        };

        let user_files_max = NonZeroUsize::new(config.user_files_max).unwrap_or(NonZeroUsize::MIN);
        let rate_limiter = RateLimiter::new(config.rate_limit);

        let mut engine = Self {
            config,
            directory,
            machine_id,
            boot_id,
            hostname,
            metrics,
            cache: MmapCache::default(),
            system: None,
            users: LruCache::new(user_files_max),
            seqnum: 0,
            sync_seqnum: 0,
            last_sync_usec: monotonic_usec(),
            clock: RealtimeClock::new(),
            rate_limiter,
            space: SpaceCache::default(),
            oldest_file_usec: None,
        };

        let (system, lineage) = engine.open_reliably(&Source::System)?;
        let header = system.journal.journal_header_ref();
        let (mut tail_seqnum, mut tail_realtime) =
            (header.tail_entry_seqnum, header.tail_entry_realtime);
        if let Some(lineage) = lineage {
            tail_seqnum = tail_seqnum.max(lineage.tail_seqnum);
            tail_realtime = tail_realtime.max(lineage.tail_realtime);
        }

        engine.seqnum = tail_seqnum;
        engine.sync_seqnum = tail_seqnum;
        if tail_realtime > 0 {
            engine.clock = RealtimeClock::with_initial(Microseconds::new(tail_realtime));
        }
        engine.system = Some(system);

        engine.available_space(true);
        Ok(engine)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn machine_id(&self) -> Uuid {
        self.machine_id
    }

    pub fn boot_id(&self) -> Uuid {
        self.boot_id
    }

    /// Sequence number of the last entry written.
    pub fn seqnum(&self) -> u64 {
        self.seqnum
    }

    pub fn metrics(&self) -> &ResolvedMetrics {
        &self.metrics
    }

    /// Last write time of the oldest archived file, as of the last vacuum.
    pub fn oldest_file_usec(&self) -> Option<u64> {
        self.oldest_file_usec
    }

    /// Bytes on disk used by every journal file of the directory.
    pub fn usage(&self) -> Result<u64> {
        let files = scan_journal_files(&self.directory)?;
        Ok(files.iter().filter_map(|f| disk_usage(f.path()).ok()).sum())
    }

    fn file_options(&self) -> JournalFileOptions {
        let options = JournalFileOptions::new(self.machine_id, self.boot_id)
            .with_metrics(&self.metrics)
            .with_keyed_hash(self.config.keyed_hash)
            .with_compression(self.config.compression);

        // User files continue the lineage of the system file
        match &self.system {
            Some(system) => options.with_template(&system.journal),
            None => options,
        }
    }

    /// Opens the active file of `source` for appending. A file that can't
    /// be appended to is archived or disposed and replaced by a new one,
    /// which continues the lineage of an archived predecessor.
    fn open_reliably(&self, source: &Source) -> Result<(ActiveFile, Option<Lineage>)> {
        let file = File::new(&self.directory, source, Status::Active)?;

        let mut lineage = None;
        let journal = match JournalFile::<MmapMut>::open_for_append(
            &file,
            Some(self.machine_id),
            &self.cache,
        ) {
            Ok(journal) => journal,
            Err(JournalError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("creating {}", file.path());
                self.file_options().create(&file, &self.cache)?
            }
            Err(e) if e.is_retryable_by_rotation() => {
                lineage = self.set_aside(&file, &e);
                let options = match &lineage {
                    Some(lineage) => self.file_options().with_seqnum_id(lineage.seqnum_id),
                    None => self.file_options(),
                };
                options.create(&file, &self.cache)?
            }
            Err(e) => return Err(e.into()),
        };

        Ok((ActiveFile::new(journal, self.metrics)?, lineage))
    }

    /// Moves an active file that can't be appended to out of the way.
    /// Intact files are archived, damaged ones disposed.
    ///
    /// Returns the lineage of an archived file of this machine. Disposed
    /// and foreign files leave nothing to continue.
    fn set_aside(&self, file: &File, err: &JournalError) -> Option<Lineage> {
        if !err.is_corruption() {
            let archived = JournalFile::<MmapMut>::open(file, &self.cache).and_then(|mut journal| {
                let header = journal.journal_header_ref();
                let lineage = Lineage {
                    seqnum_id: header.seqnum_id(),
                    tail_seqnum: header.tail_entry_seqnum,
                    tail_realtime: header.tail_entry_realtime,
                };
                journal.archive().map(|archived| (archived, lineage))
            });
            match archived {
                Ok((archived, lineage)) => {
                    info!("{}: {}, archived as {}", file.path(), err, archived.path());
                    let foreign = matches!(err, JournalError::ForeignLineage);
                    return (!foreign).then_some(lineage);
                }
                Err(e) => debug!("failed to archive {}: {}", file.path(), e),
            }
        }

        if let Err(e) = JournalFile::<MmapMut>::dispose(file) {
            warn!("failed to set aside {}: {}", file.path(), e);
        }
        None
    }

    fn active(&self, target: Target) -> Option<&ActiveFile> {
        match target {
            Target::System => self.system.as_ref(),
            Target::User(uid) => self.users.peek(&uid),
        }
    }

    /// Picks the file for an entry of `uid`, opening it when needed.
    /// Regular users fall back to the system file when theirs can't be
    /// opened.
    fn prepare(&mut self, uid: u32) -> Option<Target> {
        if self.config.split_mode == SplitMode::Uid && uid > SYSTEM_UID_MAX {
            if self.users.get(&uid).is_some() {
                return Some(Target::User(uid));
            }

            match self.open_reliably(&Source::User(uid)) {
                Ok((file, _)) => {
                    if let Some((evicted_uid, mut evicted)) = self.users.push(uid, file) {
                        debug!("closing journal of user {evicted_uid} to make room");
                        evicted.set_offline();
                    }
                    return Some(Target::User(uid));
                }
                Err(e) => warn!("failed to open journal of user {uid}, using the system journal: {e}"),
            }
        }

        if self.system.is_none() {
            match self.open_reliably(&Source::System) {
                Ok((file, _)) => self.system = Some(file),
                Err(e) => {
                    error!("failed to open system journal: {e}");
                    return None;
                }
            }
        }

        Some(Target::System)
    }

    fn append_to(
        &mut self,
        target: Target,
        ts: &DualTimestamp,
        fields: &[&[u8]],
    ) -> journal_core::Result<u64> {
        let active = match target {
            Target::System => self.system.as_mut(),
            Target::User(uid) => self.users.get_mut(&uid),
        };
        let active = active.ok_or(JournalError::ReadOnly)?;

        let (seqnum, _) = active.writer.append_entry(
            &mut active.journal,
            ts,
            &self.boot_id,
            fields,
            &mut self.seqnum,
        )?;

        if let Err(e) = active.journal.post_change() {
            warn!("failed to notify readers of {}: {}", active.path(), e);
        }

        Ok(seqnum)
    }

    fn now(&self) -> std::io::Result<DualTimestamp> {
        let monotonic = monotonic_now()?;
        Ok(DualTimestamp::new(self.clock.now().get(), monotonic.get()))
    }

    /// Appends `fields` to the file of `uid`.
    ///
    /// When the file reports an error that a fresh file would not have,
    /// the directory is rotated and vacuumed and the entry written once
    /// more. Entries that still can't be stored are dropped.
    fn write_to_journal(&mut self, uid: u32, fields: &[&[u8]], priority: u8) -> Outcome {
        let ts = match self.now() {
            Ok(ts) if ts.is_valid() => ts,
            Ok(ts) => {
                error!("clock reading {ts:?} is out of range, dropping entry");
                return Outcome::Dropped;
            }
            Err(e) => {
                error!("failed to read the clock, dropping entry: {e}");
                return Outcome::Dropped;
            }
        };

        let Some(mut target) = self.prepare(uid) else {
            return Outcome::Dropped;
        };

        let mut vacuumed = false;
        let max_file_usec = self.config.max_file_usec();
        let suggested = self.active(target).is_some_and(|f| {
            f.writer
                .rotate_suggested(&f.journal, max_file_usec, ts.realtime)
        });
        if suggested {
            self.rotate();
            self.vacuum();
            vacuumed = true;

            let Some(retarget) = self.prepare(uid) else {
                return Outcome::Dropped;
            };
            target = retarget;
        }

        let err = match self.append_to(target, &ts, fields) {
            Ok(seqnum) => {
                self.schedule_sync(priority, ts.monotonic);
                return Outcome::Written(seqnum);
            }
            Err(e) => e,
        };

        let size: usize = fields.iter().map(|f| f.len()).sum();
        if vacuumed || !err.is_retryable_by_rotation() {
            error!(
                "failed to write entry ({} items, {} bytes), ignoring: {}",
                fields.len(),
                size,
                err
            );
            return Outcome::Dropped;
        }

        if let Some(active) = self.active(target) {
            log_rotation_reason(active.path(), &err);
        }
        self.rotate();
        self.vacuum();

        let Some(target) = self.prepare(uid) else {
            return Outcome::Dropped;
        };

        debug!("retrying write");
        match self.append_to(target, &ts, fields) {
            Ok(seqnum) => {
                self.schedule_sync(priority, ts.monotonic);
                Outcome::Written(seqnum)
            }
            Err(e) => {
                error!(
                    "failed to write entry ({} items, {} bytes) despite vacuuming, ignoring: {}",
                    fields.len(),
                    size,
                    e
                );
                Outcome::Dropped
            }
        }
    }

    /// Stores a message of `priority` sent by `uid`.
    ///
    /// `fields` are `NAME=value` byte strings. The boot id, machine id and
    /// hostname are appended, together with the sender's own timestamp
    /// when it supplied one. Messages from a known sender go through the
    /// rate limiter first.
    pub fn dispatch(
        &mut self,
        fields: &[&[u8]],
        priority: u8,
        uid: Option<u32>,
        source_realtime: Option<u64>,
    ) -> Outcome {
        if fields.is_empty() || priority & 7 > self.config.max_level_store {
            return Outcome::Ignored;
        }

        if let Some(uid) = uid {
            if self.config.rate_limit.is_enabled() {
                let available = self.available_space(false);
                match self.rate_limiter.test(priority, available, monotonic_usec()) {
                    Verdict::Allow => {}
                    Verdict::AllowAfterSuppressed(n) => {
                        self.driver_message(&format!("Suppressed {n} messages from uid {uid}"));
                    }
                    Verdict::Deny => return Outcome::Suppressed,
                }
            }
        }

        let trusted = self.trusted_fields(source_realtime);
        let mut all: Vec<&[u8]> = Vec::with_capacity(fields.len() + trusted.len());
        all.extend_from_slice(fields);
        all.extend(trusted.iter().map(Vec::as_slice));

        self.write_to_journal(uid.unwrap_or(0), &all, priority)
    }

    fn trusted_fields(&self, source_realtime: Option<u64>) -> Vec<Vec<u8>> {
        let mut fields = Vec::with_capacity(4);
        if let Some(usec) = source_realtime {
            fields.push(format!("_SOURCE_REALTIME_TIMESTAMP={usec}").into_bytes());
        }
        fields.push(format!("_BOOT_ID={}", id128::to_hex(&self.boot_id)).into_bytes());
        fields.push(format!("_MACHINE_ID={}", id128::to_hex(&self.machine_id)).into_bytes());
        if let Some(hostname) = &self.hostname {
            fields.push(format!("_HOSTNAME={hostname}").into_bytes());
        }
        fields
    }

    /// Writes a message about the engine itself to the system file.
    pub fn driver_message(&mut self, message: &str) -> Outcome {
        let message = format!("MESSAGE={message}");
        let pid = format!("_PID={}", std::process::id());
        let trusted = self.trusted_fields(None);

        let mut fields: Vec<&[u8]> = vec![
            b"PRIORITY=6",
            b"SYSLOG_IDENTIFIER=journal-writer",
            b"_TRANSPORT=driver",
            message.as_bytes(),
            pid.as_bytes(),
            b"_UID=0",
        ];
        fields.extend(trusted.iter().map(Vec::as_slice));

        self.write_to_journal(0, &fields, 6)
    }

    /// Bytes that may still be written before `max_use` or the free space
    /// floor is reached. Measurements are reused for a while unless
    /// `verbose`, which also records them in the journal.
    pub fn available_space(&mut self, verbose: bool) -> u64 {
        let now = monotonic_usec();
        if !verbose
            && self
                .space
                .checked_usec
                .is_some_and(|t| t.saturating_add(SPACE_RECHECK_USEC) > now)
        {
            return self.space.available;
        }

        let sum = match self.usage() {
            Ok(sum) => sum,
            Err(e) => {
                warn!("failed to measure journal usage: {e}");
                return 0;
            }
        };
        let fs = match FilesystemSpace::of(&self.directory) {
            Ok(fs) => fs,
            Err(e) => {
                warn!("failed to stat {}: {}", self.directory.display(), e);
                return 0;
            }
        };

        // Space already in use counts as granted, up to min_use
        let limit = (fs.available.saturating_sub(self.metrics.keep_free) + sum)
            .max(self.metrics.min_use)
            .min(self.metrics.max_use);
        let available = limit.saturating_sub(sum);

        self.space = SpaceCache {
            checked_usec: Some(now),
            available,
        };

        if verbose {
            let message = format!(
                "Journal is using {} (max allowed {}, trying to leave {} free of {} available, current limit {}).",
                ByteSize::b(sum),
                ByteSize::b(self.metrics.max_use),
                ByteSize::b(self.metrics.keep_free),
                ByteSize::b(fs.available),
                ByteSize::b(limit),
            );
            info!("{message}");
            self.driver_message(&message);
        }

        available
    }

    fn schedule_sync(&mut self, priority: u8, now_monotonic: u64) {
        if priority & 7 <= SYNC_IMMEDIATELY_PRIORITY {
            self.sync();
            return;
        }

        let interval = self.config.sync_interval.as_micros() as u64;
        if now_monotonic.saturating_sub(self.last_sync_usec) >= interval {
            self.sync();
        }
    }

    /// Flushes every open file and marks it offline. Files go back online
    /// with their next append.
    pub fn sync(&mut self) {
        self.last_sync_usec = monotonic_usec();
        if self.sync_seqnum >= self.seqnum {
            return;
        }

        let users = self.users.iter_mut().map(|(_, f)| f);
        for file in self.system.iter_mut().chain(users) {
            file.set_offline();
        }
        self.sync_seqnum = self.seqnum;
    }

    fn rotate_file(&self, active: ActiveFile) -> Option<ActiveFile> {
        let path = active.path().to_owned();
        let rotated = active
            .journal
            .rotate(self.boot_id, &self.cache)
            .and_then(|journal| ActiveFile::new(journal, self.metrics));

        match rotated {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("failed to rotate {path}: {e}");
                None
            }
        }
    }

    /// Archives every open file and starts new ones in their place.
    pub fn rotate(&mut self) {
        debug!("rotating");

        if let Some(system) = self.system.take() {
            self.system = self.rotate_file(system);
        }

        // Files are taken out of the cache while rotating so eviction can
        // never pick one halfway through
        let uids: Vec<u32> = self.users.iter().map(|(uid, _)| *uid).collect();
        for uid in uids.into_iter().rev() {
            let Some(file) = self.users.pop(&uid) else {
                continue;
            };
            if let Some(file) = self.rotate_file(file) {
                self.users.push(uid, file);
            }
        }

        self.space.checked_usec = None;
    }

    /// Deletes archived files until the retention limits hold.
    pub fn vacuum(&mut self) -> Option<VacuumReport> {
        let limits = VacuumLimits {
            max_use: self.metrics.max_use,
            max_files: self.metrics.n_max_files,
            max_retention_usec: self.config.max_retention_usec(),
        };

        let report = match vacuum(&self.directory, &limits, Microseconds::now().get()) {
            Ok(report) => report,
            Err(e) => {
                warn!("failed to vacuum {}: {}", self.directory.display(), e);
                return None;
            }
        };

        self.oldest_file_usec = report.oldest_usec;
        self.space.checked_usec = None;
        Some(report)
    }

    /// Syncs and closes every file.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let users = self.users.iter_mut().map(|(_, f)| f);
        for file in self.system.iter_mut().chain(users) {
            file.set_offline();
        }
    }
}
