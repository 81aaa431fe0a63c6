//! Match expressions over the entries of one journal file.
//!
//! A [`JournalFilter`] collects `FIELD=value` matches independently of any
//! file. [`JournalFilter::build`] resolves them against the data hash table
//! of a file, producing a [`FilterExpr`] that can be evaluated with entry
//! offsets.
//!
//! Matches combine in three levels: matches on the same field are OR-ed,
//! matches on different fields are AND-ed, a disjunction separates AND
//! groups that are OR-ed, and a conjunction separates such alternatives
//! which are AND-ed again.

use super::mmap::MemoryMap;
use crate::error::{JournalError, Result};
use crate::file::{file::JournalFile, offset_array::Direction, offset_array::InlinedCursor};
use std::num::NonZeroU64;

#[derive(Clone, Debug)]
pub enum FilterExpr {
    /// A match whose data object does not exist in the file.
    None,
    Match(NonZeroU64, InlinedCursor),
    Conjunction(Vec<FilterExpr>),
    Disjunction(Vec<FilterExpr>),
}

impl FilterExpr {
    /// Offset of the first matching entry at or after `needle` (forward), or
    /// the last matching entry at or before it (backward).
    pub fn lookup<M: MemoryMap>(
        &mut self,
        journal_file: &JournalFile<M>,
        needle: NonZeroU64,
        direction: Direction,
    ) -> Result<Option<NonZeroU64>> {
        match self {
            FilterExpr::None => Ok(None),
            FilterExpr::Match(_, ic) => {
                let predicate = |offset: NonZeroU64| {
                    Ok(match direction {
                        Direction::Forward => offset < needle,
                        Direction::Backward => offset <= needle,
                    })
                };

                match ic.directed_partition_point(journal_file, predicate, direction)? {
                    Some(found) => {
                        *ic = found;
                        found.value(journal_file).map(Some)
                    }
                    None => Ok(None),
                }
            }
            FilterExpr::Conjunction(filter_exprs) => {
                let mut needle = needle;

                loop {
                    let previous_needle = needle;

                    for fe in filter_exprs.iter_mut() {
                        match fe.lookup(journal_file, needle, direction)? {
                            Some(offset) => needle = offset,
                            None => return Ok(None),
                        }
                    }

                    if needle == previous_needle {
                        return Ok(Some(needle));
                    }
                }
            }
            FilterExpr::Disjunction(filter_exprs) => {
                let mut best_offset: Option<NonZeroU64> = None;

                for fe in filter_exprs.iter_mut() {
                    if let Some(fe_offset) = fe.lookup(journal_file, needle, direction)? {
                        best_offset = Some(match (best_offset, direction) {
                            (Some(offset), Direction::Forward) => fe_offset.min(offset),
                            (Some(offset), Direction::Backward) => fe_offset.max(offset),
                            (None, _) => fe_offset,
                        });
                    }
                }

                Ok(best_offset)
            }
        }
    }

    /// Whether the entry at `entry_offset` satisfies the expression.
    pub fn matches<M: MemoryMap>(
        &mut self,
        journal_file: &JournalFile<M>,
        entry_offset: NonZeroU64,
    ) -> Result<bool> {
        let found = self.lookup(journal_file, entry_offset, Direction::Forward)?;
        Ok(found == Some(entry_offset))
    }
}

/// One AND group: matches sorted by field name.
type Group = Vec<Vec<u8>>;

/// Builder of a [`FilterExpr`].
#[derive(Debug, Default, Clone)]
pub struct JournalFilter {
    current_group: Group,
    alternatives: Vec<Group>,
    conjunction: Vec<Vec<Group>>,
}

fn extract_key(kv_pair: &[u8]) -> &[u8] {
    match kv_pair.iter().position(|&b| b == b'=') {
        Some(equal_pos) => &kv_pair[..equal_pos],
        None => kv_pair,
    }
}

fn resolve_match<M: MemoryMap>(journal_file: &JournalFile<M>, data: &[u8]) -> Result<FilterExpr> {
    let Some(offset) = journal_file.find_data(data)? else {
        return Ok(FilterExpr::None);
    };

    Ok(match journal_file.data_ref(offset)?.inlined_cursor() {
        Some(ic) => FilterExpr::Match(offset, ic),
        None => FilterExpr::None,
    })
}

fn collapse(mut elements: Vec<FilterExpr>, combine: fn(Vec<FilterExpr>) -> FilterExpr) -> FilterExpr {
    match elements.len() {
        1 => elements.remove(0),
        _ => combine(elements),
    }
}

fn resolve_group<M: MemoryMap>(journal_file: &JournalFile<M>, group: &Group) -> Result<FilterExpr> {
    let mut elements = Vec::new();

    for same_key in group.chunk_by(|a, b| extract_key(a) == extract_key(b)) {
        let mut matches = Vec::with_capacity(same_key.len());
        for data in same_key {
            matches.push(resolve_match(journal_file, data)?);
        }
        elements.push(collapse(matches, FilterExpr::Disjunction));
    }

    Ok(collapse(elements, FilterExpr::Conjunction))
}

impl JournalFilter {
    pub fn is_empty(&self) -> bool {
        self.current_group.is_empty() && self.alternatives.is_empty() && self.conjunction.is_empty()
    }

    /// Adds a `FIELD=value` match to the current group.
    pub fn add_match(&mut self, kv_pair: &[u8]) -> Result<()> {
        let key = extract_key(kv_pair);
        if key.is_empty() || key.len() == kv_pair.len() {
            return Err(JournalError::MalformedFilter);
        }

        let pos = self
            .current_group
            .partition_point(|item| extract_key(item) <= key);
        self.current_group.insert(pos, kv_pair.to_vec());
        Ok(())
    }

    /// Closes the current group; following matches form an alternative.
    pub fn add_disjunction(&mut self) {
        if !self.current_group.is_empty() {
            self.alternatives.push(std::mem::take(&mut self.current_group));
        }
    }

    /// Closes the current set of alternatives; following matches must hold
    /// in addition to it.
    pub fn add_conjunction(&mut self) {
        self.add_disjunction();
        if !self.alternatives.is_empty() {
            self.conjunction.push(std::mem::take(&mut self.alternatives));
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Resolves the collected matches against `journal_file`.
    ///
    /// Returns `None` when no match was added.
    pub fn build<M: MemoryMap>(&self, journal_file: &JournalFile<M>) -> Result<Option<FilterExpr>> {
        let mut terms = Vec::with_capacity(self.conjunction.len() + 1);

        let pending = (!self.current_group.is_empty()).then_some(&self.current_group);
        let open_alternatives = self.alternatives.iter().chain(pending);

        for alternatives in self
            .conjunction
            .iter()
            .map(|a| a.iter().collect::<Vec<_>>())
            .chain(std::iter::once(open_alternatives.collect()))
        {
            if alternatives.is_empty() {
                continue;
            }

            let mut exprs = Vec::with_capacity(alternatives.len());
            for group in alternatives {
                exprs.push(resolve_group(journal_file, group)?);
            }
            terms.push(collapse(exprs, FilterExpr::Disjunction));
        }

        if terms.is_empty() {
            return Ok(None);
        }
        Ok(Some(collapse(terms, FilterExpr::Conjunction)))
    }
}
