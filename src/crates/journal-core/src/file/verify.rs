//! Offline consistency check of a whole journal file.

use crate::error::{JournalError, Result};
use crate::file::file::JournalFile;
use crate::file::header::header_contains;
use crate::file::mmap::MemoryMap;
use crate::file::object::{HashableObject, Object};
use journal_common::time::valid_realtime;
use std::num::NonZeroU64;

/// Object counts gathered while walking the arena.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    pub n_objects: u64,
    pub n_entries: u64,
    pub n_data: u64,
    pub n_fields: u64,
    pub n_entry_arrays: u64,
    pub n_tags: u64,
}

fn mismatch(what: &str, header: u64, found: u64) -> JournalError {
    tracing::error!("header claims {header} {what}, found {found}");
    JournalError::InvalidHeader
}

/// Walks every object of `journal_file` and checks that the header, the
/// hash tables and the global entry array agree with what is stored.
pub fn verify<M: MemoryMap>(journal_file: &JournalFile<M>) -> Result<VerifyReport> {
    let header = *journal_file.journal_header_ref();
    let mut report = VerifyReport::default();

    let mut arena_entries = Vec::new();
    let mut data_offsets = Vec::new();
    let mut last_seqnum = 0;

    let mut offset = header.header_size;
    while offset < header.arena_end() {
        let object_offset = NonZeroU64::new(offset).ok_or(JournalError::InvalidObjectLocation)?;
        let object_size = journal_file.object_header(object_offset)?.aligned_size();
        if object_size == 0 {
            return Err(JournalError::InvalidObjectSize);
        }

        let object = journal_file.get_object(object_offset).inspect_err(|e| {
            tracing::error!("invalid object at offset {offset:#x}: {e}");
        })?;
        report.n_objects += 1;

        match &*object {
            Object::Data(data) => {
                report.n_data += 1;
                data_offsets.push((object_offset, data.hash()));
            }
            Object::Field(_) => report.n_fields += 1,
            Object::Entry(entry) => {
                report.n_entries += 1;

                if entry.header.seqnum <= last_seqnum {
                    tracing::error!("entry at offset {offset:#x} does not advance the sequence number");
                    return Err(JournalError::InvalidHeader);
                }
                if !valid_realtime(entry.header.realtime) {
                    return Err(JournalError::InvalidTimestamp);
                }
                if entry.items.is_empty() {
                    return Err(JournalError::InvalidObjectSize);
                }

                last_seqnum = entry.header.seqnum;
                arena_entries.push(object_offset);
            }
            Object::EntryArray(_) => report.n_entry_arrays += 1,
            Object::Tag(_) => report.n_tags += 1,
            Object::DataHashTable(_) | Object::FieldHashTable(_) => {}
        }

        drop(object);
        offset = offset
            .checked_add(object_size)
            .ok_or(JournalError::ObjectExceedsFile)?;
    }

    if report.n_objects != header.n_objects {
        return Err(mismatch("objects", header.n_objects, report.n_objects));
    }
    if report.n_entries != header.n_entries {
        return Err(mismatch("entries", header.n_entries, report.n_entries));
    }
    if header_contains!(header, n_data) && report.n_data != header.n_data {
        return Err(mismatch("data objects", header.n_data, report.n_data));
    }
    if header_contains!(header, n_fields) && report.n_fields != header.n_fields {
        return Err(mismatch("field objects", header.n_fields, report.n_fields));
    }
    if header_contains!(header, n_entry_arrays) && report.n_entry_arrays != header.n_entry_arrays
    {
        return Err(mismatch("entry arrays", header.n_entry_arrays, report.n_entry_arrays));
    }

    if report.n_entries > 0 && last_seqnum != header.tail_entry_seqnum {
        return Err(mismatch("as tail seqnum", header.tail_entry_seqnum, last_seqnum));
    }

    // The global entry array lists every entry in arena order
    let mut listed_entries = Vec::with_capacity(arena_entries.len());
    journal_file.entry_offsets(&mut listed_entries)?;
    if listed_entries != arena_entries {
        tracing::error!("entry array does not match the entries in the arena");
        return Err(JournalError::InvalidOffsetArrayOffset);
    }

    // Every data object is reachable through its hash and stores the hash
    // of its payload
    let mut payload = Vec::new();
    for (data_offset, stored_hash) in data_offsets {
        journal_file.data_payload(data_offset, &mut payload)?;
        let hash = journal_file.hash(&payload);
        if hash != stored_hash {
            tracing::error!("data object at offset {data_offset} has a stale hash");
            return Err(JournalError::HashMismatch);
        }
        if journal_file.find_data_offset(hash, &payload)? != Some(data_offset) {
            tracing::error!("data object at offset {data_offset} is not in the hash table");
            return Err(JournalError::HashMismatch);
        }
    }

    // Every entry item points at a data object
    let mut items = Vec::new();
    for entry_offset in arena_entries {
        items.clear();
        journal_file.entry_data_object_offsets(entry_offset, &mut items)?;
        for &item in &items {
            journal_file.data_ref(item)?;
        }
    }

    Ok(report)
}
