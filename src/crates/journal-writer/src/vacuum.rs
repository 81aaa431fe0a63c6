//! Deletion of archived files to honor the retention limits.

use crate::error::Result;
use journal_common::HashMap;
use journal_core::file::JournalHeader;
use journal_registry::repository::{File, Status};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::Path;
use std::time::UNIX_EPOCH;
use uuid::Uuid;

use tracing::{debug, info, warn};

/// Limits enforced by [`vacuum`]. Zero disables a limit.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct VacuumLimits {
    /// Maximum bytes used by archived files
    pub max_use: u64,
    /// Maximum number of archived files
    pub max_files: u64,
    /// Archived files last written longer ago than this are deleted
    pub max_retention_usec: u64,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct VacuumReport {
    pub freed: u64,
    pub deleted: usize,
    /// Last write time of the oldest archived file left behind
    pub oldest_usec: Option<u64>,
}

#[derive(Debug)]
struct Candidate {
    file: File,
    usage: u64,
    realtime: u64,
    lineage: Option<(Uuid, u64)>,
}

/// Whether the header of `path` records no entries. Files too short to
/// hold a header count as empty.
fn is_empty(path: &str) -> bool {
    let Ok(fd) = std::fs::File::open(path) else {
        return false;
    };

    let mut n_entries = [0u8; 8];
    let offset = std::mem::offset_of!(JournalHeader, n_entries) as u64;
    match fd.read_exact_at(&mut n_entries, offset) {
        Ok(()) => u64::from_le_bytes(n_entries) == 0,
        Err(_) => true,
    }
}

/// Orders candidates oldest first.
///
/// Files interleave by last write time. Within one sequence number
/// lineage they follow their head sequence numbers instead, which stay
/// correct when the clock jumped.
fn sort_oldest_first(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        a.realtime
            .cmp(&b.realtime)
            .then_with(|| a.lineage.map(|l| l.0).cmp(&b.lineage.map(|l| l.0)))
            .then_with(|| a.file.path().cmp(b.file.path()))
    });

    // Positions each lineage occupies in time order
    let mut slots: HashMap<Uuid, Vec<usize>> = HashMap::default();
    for (index, candidate) in candidates.iter().enumerate() {
        if let Some((seqnum_id, _)) = candidate.lineage {
            slots.entry(seqnum_id).or_default().push(index);
        }
    }

    let mut order: Vec<usize> = (0..candidates.len()).collect();
    for positions in slots.values() {
        let mut members = positions.clone();
        members.sort_by_key(|&index| candidates[index].lineage.map_or(0, |l| l.1));
        for (&slot, member) in positions.iter().zip(members) {
            order[slot] = member;
        }
    }

    let mut taken: Vec<Option<Candidate>> = candidates.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|index| taken[index].take())
        .collect()
}

fn list_candidates(directory: &Path) -> Result<(Vec<Candidate>, u64, usize)> {
    let mut candidates = Vec::new();
    let mut freed = 0;
    let mut deleted = 0;

    // File names are only parsed from absolute paths
    let directory = directory.canonicalize()?;
    for entry in std::fs::read_dir(&directory)? {
        let Ok(path) = entry.map(|e| e.path()) else {
            continue;
        };

        let Some(file) = File::from_path(&path) else {
            continue;
        };

        // Active files are never vacuumed
        let lineage = match file.status() {
            Status::Active => continue,
            Status::Archived {
                seqnum_id,
                head_seqnum,
                ..
            } => Some((*seqnum_id, *head_seqnum)),
            Status::Disposed { .. } => None,
        };

        let Ok(metadata) = std::fs::symlink_metadata(&path) else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        let usage = metadata.blocks() * 512;

        if is_empty(file.path()) {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!("deleted empty journal {} ({} bytes)", file.path(), usage);
                    freed += usage;
                    deleted += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to delete {}: {}", file.path(), e),
            }
            continue;
        }

        let realtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_micros() as u64);

        candidates.push(Candidate {
            file,
            usage,
            realtime,
            lineage,
        });
    }

    Ok((candidates, freed, deleted))
}

/// Deletes archived and disposed files of `directory`, oldest first,
/// until the remaining ones satisfy `limits`.
///
/// Empty files are always deleted. Active files are never touched, so the
/// space they use does not count against `max_use`.
#[tracing::instrument(skip(limits), fields(freed))]
pub fn vacuum(directory: &Path, limits: &VacuumLimits, now_usec: u64) -> Result<VacuumReport> {
    let (candidates, mut freed, mut deleted) = list_candidates(directory)?;
    let candidates = sort_oldest_first(candidates);

    let retention_limit = (limits.max_retention_usec > 0 && now_usec > limits.max_retention_usec)
        .then(|| now_usec - limits.max_retention_usec);

    let mut sum: u64 = candidates.iter().map(|c| c.usage).sum();
    let mut remaining = candidates.len() as u64;
    let mut oldest_usec = None;

    for candidate in &candidates {
        let too_old = retention_limit.is_some_and(|limit| candidate.realtime < limit);
        let too_big = limits.max_use > 0 && sum > limits.max_use;
        let too_many = limits.max_files > 0 && remaining > limits.max_files;

        if !too_old && !too_big && !too_many {
            oldest_usec = Some(candidate.realtime);
            break;
        }

        match std::fs::remove_file(candidate.file.path()) {
            Ok(()) => {
                debug!(
                    "deleted archived journal {} ({} bytes)",
                    candidate.file.path(),
                    candidate.usage
                );
                freed += candidate.usage;
                deleted += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("failed to delete {}: {}", candidate.file.path(), e);
                continue;
            }
        }

        sum = sum.saturating_sub(candidate.usage);
        remaining -= 1;
    }

    tracing::Span::current().record("freed", freed);
    debug!("vacuuming done, freed {freed} bytes");

    Ok(VacuumReport {
        freed,
        deleted,
        oldest_usec,
    })
}
