//! Chains of entry arrays.
//!
//! An entry array chain is a singly linked list of fixed-capacity offset
//! arrays. The chain does not record how many slots are populated, so every
//! traversal carries the total item count and derives each node's length from
//! the items that remain.
//!
//! Predicates passed to the partition point searches return `true` while the
//! search should continue: a forward search yields the first item for which
//! the predicate is false, a backward search the last item for which it is
//! true.

use crate::error::{JournalError, Result};
use crate::file::file::JournalFile;
use crate::file::mmap::MemoryMap;
use std::num::{NonZeroU64, NonZeroUsize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }
}

/// A single array in a chain.
pub struct Node {
    offset: NonZeroU64,
    next_offset: Option<NonZeroU64>,
    capacity: NonZeroUsize,
    // Items in this array and every array after it
    remaining_items: NonZeroUsize,
}

impl Node {
    fn new<M: MemoryMap>(
        journal_file: &JournalFile<M>,
        offset: NonZeroU64,
        remaining_items: NonZeroUsize,
    ) -> Result<Self> {
        let array = journal_file.offset_array_ref(offset)?;
        let capacity =
            NonZeroUsize::new(array.capacity()).ok_or(JournalError::EmptyOffsetArrayNode)?;

        Ok(Self {
            offset,
            next_offset: array.header.next_offset_array,
            capacity,
            remaining_items,
        })
    }

    pub fn offset(&self) -> NonZeroU64 {
        self.offset
    }

    pub fn capacity(&self) -> NonZeroUsize {
        self.capacity
    }

    pub fn len(&self) -> NonZeroUsize {
        self.capacity.min(self.remaining_items)
    }

    pub fn remaining_items(&self) -> NonZeroUsize {
        self.remaining_items
    }

    pub fn has_next(&self) -> bool {
        self.next_offset.is_some() && self.remaining_items > self.len()
    }

    pub fn next<M: MemoryMap>(&self, journal_file: &JournalFile<M>) -> Result<Option<Self>> {
        let Some(next_offset) = self.next_offset.filter(|_| self.has_next()) else {
            // More items than this array holds, but no link to follow
            if self.remaining_items > self.len() {
                return Err(JournalError::InvalidOffsetArrayOffset);
            }
            return Ok(None);
        };

        let remaining_items = NonZeroUsize::new(self.remaining_items.get() - self.len().get())
            .ok_or(JournalError::EmptyOffsetArrayNode)?;

        Self::new(journal_file, next_offset, remaining_items).map(Some)
    }

    pub fn get<M: MemoryMap>(
        &self,
        journal_file: &JournalFile<M>,
        index: usize,
    ) -> Result<NonZeroU64> {
        if index >= self.len().get() {
            return Err(JournalError::InvalidOffsetArrayIndex);
        }

        let array = journal_file.offset_array_ref(self.offset)?;
        array.get(index, self.remaining_items.get())
    }

    /// Index of the first item in `left..right` for which `predicate` is false.
    pub fn partition_point<M, F>(
        &self,
        journal_file: &JournalFile<M>,
        left: usize,
        right: usize,
        predicate: F,
    ) -> Result<usize>
    where
        M: MemoryMap,
        F: Fn(NonZeroU64) -> Result<bool>,
    {
        let (mut left, mut right) = (left, right);
        debug_assert!(left <= right && right <= self.len().get());

        while left != right {
            let mid = left.midpoint(right);

            if predicate(self.get(journal_file, mid)?)? {
                left = mid + 1;
            } else {
                right = mid;
            }
        }

        Ok(left)
    }

    pub fn directed_partition_point<M, F>(
        &self,
        journal_file: &JournalFile<M>,
        predicate: F,
        direction: Direction,
    ) -> Result<Option<usize>>
    where
        M: MemoryMap,
        F: Fn(NonZeroU64) -> Result<bool>,
    {
        let len = self.len().get();
        let index = self.partition_point(journal_file, 0, len, predicate)?;

        Ok(match direction {
            Direction::Forward => (index < len).then_some(index),
            Direction::Backward => index.checked_sub(1),
        })
    }

    pub fn collect_offsets<M: MemoryMap>(
        &self,
        journal_file: &JournalFile<M>,
        start_index: usize,
        offsets: &mut Vec<NonZeroU64>,
    ) -> Result<()> {
        let array = journal_file.offset_array_ref(self.offset)?;
        array.collect_offsets(start_index, self.remaining_items.get(), offsets)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("next_offset", &self.next_offset.map(NonZeroU64::get))
            .field("capacity", &self.capacity)
            .field("remaining_items", &self.remaining_items)
            .finish()
    }
}

/// A whole chain: its first array and the number of items it holds.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct List {
    head_offset: NonZeroU64,
    total_items: NonZeroUsize,
}

impl std::fmt::Debug for List {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("List")
            .field("head_offset", &format_args!("{:#x}", self.head_offset))
            .field("total_items", &self.total_items)
            .finish()
    }
}

impl List {
    pub fn new(head_offset: NonZeroU64, total_items: NonZeroUsize) -> Self {
        Self {
            head_offset,
            total_items,
        }
    }

    pub fn head_offset(&self) -> NonZeroU64 {
        self.head_offset
    }

    pub fn total_items(&self) -> NonZeroUsize {
        self.total_items
    }

    pub fn head<M: MemoryMap>(&self, journal_file: &JournalFile<M>) -> Result<Node> {
        Node::new(journal_file, self.head_offset, self.total_items)
    }

    /// The last array visited in this chain, if the file remembers it.
    fn cached_node<M: MemoryMap>(&self, journal_file: &JournalFile<M>) -> Result<Option<Node>> {
        let Some(item) = journal_file.chain_cache_get(self.head_offset) else {
            return Ok(None);
        };

        if item.items_before >= self.total_items.get() {
            return Ok(None);
        }

        let remaining_items = NonZeroUsize::new(self.total_items.get() - item.items_before)
            .ok_or(JournalError::EmptyOffsetArrayNode)?;
        Node::new(journal_file, item.node_offset, remaining_items).map(Some)
    }

    fn remember<M: MemoryMap>(&self, journal_file: &JournalFile<M>, node: &Node) {
        let items_before = self.total_items.get() - node.remaining_items.get();
        journal_file.chain_cache_put(self.head_offset, node.offset, items_before);
    }

    /// The last array of the chain.
    pub fn tail<M: MemoryMap>(&self, journal_file: &JournalFile<M>) -> Result<Node> {
        let mut current = match self.cached_node(journal_file)? {
            Some(node) => node,
            None => self.head(journal_file)?,
        };

        while let Some(next) = current.next(journal_file)? {
            current = next;
        }

        self.remember(journal_file, &current);
        Ok(current)
    }

    pub fn cursor_head(self) -> Cursor {
        Cursor::at_head(self)
    }

    pub fn cursor_tail<M: MemoryMap>(self, journal_file: &JournalFile<M>) -> Result<Cursor> {
        Cursor::at_tail(journal_file, self)
    }

    /// Appends every offset in the chain to `offsets`.
    pub fn collect_offsets<M: MemoryMap>(
        &self,
        journal_file: &JournalFile<M>,
        offsets: &mut Vec<NonZeroU64>,
    ) -> Result<()> {
        offsets.reserve(self.total_items.get());

        let mut node = Some(self.head(journal_file)?);
        while let Some(current) = node {
            current.collect_offsets(journal_file, 0, offsets)?;
            node = current.next(journal_file)?;
        }

        Ok(())
    }

    /// Searches the chain for the partition point of `predicate`.
    ///
    /// Whole arrays are skipped until the one holding the partition point;
    /// only that array is binary searched. When the file remembers a later
    /// array of this chain and the predicate still holds at its first item,
    /// the search starts there.
    pub fn directed_partition_point<M, F>(
        self,
        journal_file: &JournalFile<M>,
        predicate: F,
        direction: Direction,
    ) -> Result<Option<Cursor>>
    where
        M: MemoryMap,
        F: Fn(NonZeroU64) -> Result<bool>,
    {
        let mut node = match self.cached_node(journal_file)? {
            Some(cached) if predicate(cached.get(journal_file, 0)?)? => cached,
            _ => self.head(journal_file)?,
        };

        let mut last_cursor: Option<Cursor> = None;

        loop {
            match node.directed_partition_point(journal_file, &predicate, direction)? {
                Some(index) => {
                    let cursor = Cursor::at_node(self, &node, index);

                    match direction {
                        Direction::Forward => {
                            self.remember(journal_file, &node);
                            return Ok(Some(cursor));
                        }
                        Direction::Backward => {
                            // The predicate holds up to the end of this array,
                            // so the answer may be in a later one.
                            last_cursor = Some(cursor);
                            if index + 1 < node.len().get() || !node.has_next() {
                                self.remember(journal_file, &node);
                                return Ok(last_cursor);
                            }
                        }
                    }
                }
                None if direction == Direction::Backward => return Ok(last_cursor),
                None => {}
            }

            match node.next(journal_file)? {
                Some(next) => node = next,
                None => break,
            }
        }

        Ok(last_cursor)
    }
}

/// A position inside a chain.
#[derive(Clone, Copy)]
pub struct Cursor {
    list: List,
    array_offset: NonZeroU64,
    array_index: usize,
    remaining_items: NonZeroUsize,
}

impl Cursor {
    pub fn at_head(list: List) -> Self {
        Self {
            list,
            array_offset: list.head_offset,
            array_index: 0,
            remaining_items: list.total_items,
        }
    }

    pub fn at_tail<M: MemoryMap>(journal_file: &JournalFile<M>, list: List) -> Result<Self> {
        let tail = list.tail(journal_file)?;
        Ok(Self::at_node(list, &tail, tail.len().get() - 1))
    }

    fn at_node(list: List, node: &Node, index: usize) -> Self {
        debug_assert!(index < node.len().get());

        Self {
            list,
            array_offset: node.offset,
            array_index: index,
            remaining_items: node.remaining_items,
        }
    }

    pub fn list(&self) -> List {
        self.list
    }

    pub fn head(&self) -> Self {
        Self::at_head(self.list)
    }

    pub fn node<M: MemoryMap>(&self, journal_file: &JournalFile<M>) -> Result<Node> {
        Node::new(journal_file, self.array_offset, self.remaining_items)
    }

    pub fn value<M: MemoryMap>(&self, journal_file: &JournalFile<M>) -> Result<NonZeroU64> {
        let array = journal_file.offset_array_ref(self.array_offset)?;
        array.get(self.array_index, self.remaining_items.get())
    }

    pub fn next<M: MemoryMap>(&self, journal_file: &JournalFile<M>) -> Result<Option<Self>> {
        let node = self.node(journal_file)?;

        if self.array_index + 1 < node.len().get() {
            return Ok(Some(Self {
                array_index: self.array_index + 1,
                ..*self
            }));
        }

        Ok(node
            .next(journal_file)?
            .map(|next| Self::at_node(self.list, &next, 0)))
    }

    pub fn previous<M: MemoryMap>(&self, journal_file: &JournalFile<M>) -> Result<Option<Self>> {
        if self.array_index > 0 {
            return Ok(Some(Self {
                array_index: self.array_index - 1,
                ..*self
            }));
        }

        if self.array_offset == self.list.head_offset {
            return Ok(None);
        }

        // Arrays only link forward, so find our predecessor from the head.
        let mut node = self.list.head(journal_file)?;
        loop {
            if node.next_offset == Some(self.array_offset) && node.has_next() {
                return Ok(Some(Self::at_node(self.list, &node, node.len().get() - 1)));
            }

            node = node
                .next(journal_file)?
                .ok_or(JournalError::InvalidOffsetArrayOffset)?;
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("array_offset", &format_args!("{:#x}", self.array_offset))
            .field("array_index", &self.array_index)
            .field("remaining_items", &self.remaining_items)
            .finish()
    }
}

/// Walks the entries of a data object: the entry stored inline in the object
/// followed by the object's entry array chain.
#[derive(Debug, Copy, Clone)]
pub struct InlinedCursor {
    inlined_offset: NonZeroU64,
    cursor: Option<Cursor>,
    at_inlined_offset: bool,
}

impl InlinedCursor {
    pub fn new(inlined_offset: NonZeroU64, cursor: Option<Cursor>) -> Self {
        Self {
            inlined_offset,
            cursor,
            at_inlined_offset: true,
        }
    }

    pub fn head(&self) -> Self {
        Self {
            inlined_offset: self.inlined_offset,
            cursor: self.cursor.map(|c| c.head()),
            at_inlined_offset: true,
        }
    }

    pub fn tail<M: MemoryMap>(&self, journal_file: &JournalFile<M>) -> Result<Self> {
        match self.cursor {
            Some(cursor) => Ok(Self {
                inlined_offset: self.inlined_offset,
                cursor: Some(cursor.list.cursor_tail(journal_file)?),
                at_inlined_offset: false,
            }),
            None => Ok(self.head()),
        }
    }

    /// Number of entries reachable through this cursor.
    pub fn len(&self) -> usize {
        1 + self.cursor.map_or(0, |c| c.list.total_items.get())
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn next<M: MemoryMap>(&self, journal_file: &JournalFile<M>) -> Result<Option<Self>> {
        if self.at_inlined_offset {
            return Ok(self.cursor.map(|cursor| Self {
                cursor: Some(cursor.head()),
                at_inlined_offset: false,
                ..*self
            }));
        }

        let Some(cursor) = self.cursor else {
            return Ok(None);
        };

        Ok(cursor.next(journal_file)?.map(|next| Self {
            cursor: Some(next),
            ..*self
        }))
    }

    pub fn previous<M: MemoryMap>(&self, journal_file: &JournalFile<M>) -> Result<Option<Self>> {
        if self.at_inlined_offset {
            return Ok(None);
        }

        let Some(cursor) = self.cursor else {
            return Ok(None);
        };

        Ok(Some(match cursor.previous(journal_file)? {
            Some(previous) => Self {
                cursor: Some(previous),
                ..*self
            },
            None => Self {
                at_inlined_offset: true,
                ..*self
            },
        }))
    }

    pub fn value<M: MemoryMap>(&self, journal_file: &JournalFile<M>) -> Result<NonZeroU64> {
        match (self.at_inlined_offset, self.cursor) {
            (true, _) => Ok(self.inlined_offset),
            (false, Some(cursor)) => cursor.value(journal_file),
            (false, None) => Err(JournalError::UnsetCursor),
        }
    }

    /// Advances until the current offset is at least `offset`.
    pub fn next_until<M: MemoryMap>(
        &mut self,
        journal_file: &JournalFile<M>,
        offset: NonZeroU64,
    ) -> Result<Option<NonZeroU64>> {
        loop {
            let current = self.value(journal_file)?;
            if current >= offset {
                return Ok(Some(current));
            }

            match self.next(journal_file)? {
                Some(next) => *self = next,
                None => return Ok(None),
            }
        }
    }

    /// Moves back until the current offset is at most `offset`.
    pub fn previous_until<M: MemoryMap>(
        &mut self,
        journal_file: &JournalFile<M>,
        offset: NonZeroU64,
    ) -> Result<Option<NonZeroU64>> {
        loop {
            let current = self.value(journal_file)?;
            if current <= offset {
                return Ok(Some(current));
            }

            match self.previous(journal_file)? {
                Some(previous) => *self = previous,
                None => return Ok(None),
            }
        }
    }

    pub fn collect_offsets<M: MemoryMap>(
        &self,
        journal_file: &JournalFile<M>,
        offsets: &mut Vec<NonZeroU64>,
    ) -> Result<()> {
        offsets.push(self.inlined_offset);
        if let Some(cursor) = self.cursor {
            cursor.list.collect_offsets(journal_file, offsets)?;
        }
        Ok(())
    }

    pub fn directed_partition_point<M, F>(
        &self,
        journal_file: &JournalFile<M>,
        predicate: F,
        direction: Direction,
    ) -> Result<Option<Self>>
    where
        M: MemoryMap,
        F: Fn(NonZeroU64) -> Result<bool>,
    {
        let inlined_holds = predicate(self.inlined_offset)?;

        match direction {
            // The inlined entry precedes everything in the chain.
            Direction::Forward if !inlined_holds => return Ok(Some(self.head())),
            Direction::Backward if !inlined_holds => return Ok(None),
            _ => {}
        }

        let array_match = match self.cursor {
            Some(cursor) => cursor
                .list
                .directed_partition_point(journal_file, predicate, direction)?,
            None => None,
        };

        Ok(match (array_match, direction) {
            (Some(cursor), _) => Some(Self {
                cursor: Some(cursor),
                at_inlined_offset: false,
                ..*self
            }),
            (None, Direction::Backward) => Some(self.head()),
            (None, Direction::Forward) => None,
        })
    }
}
