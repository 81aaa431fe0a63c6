//! Typed views over the objects stored in a journal file's arena.
//!
//! Every object starts with an [`ObjectHeader`] at an 8-byte aligned offset.
//! Views borrow the mapped bytes; [`Object`] decodes the type tag once so
//! callers can match on the kind of object instead of trusting the tag.

use crate::error::{JournalError, Result};
use crate::file::compress::Compression;
use crate::file::offset_array::{Cursor, InlinedCursor, List};
use std::mem::size_of;
use std::num::{NonZeroU32, NonZeroU64, NonZeroUsize};
use zerocopy::{
    ByteSlice, ByteSliceMut, FromBytes, Immutable, IntoBytes, KnownLayout, Ref, SplitByteSlice,
};

pub const OBJECT_ALIGNMENT: u64 = 8;

pub const fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    Unused = 0,
    Data = 1,
    Field = 2,
    Entry = 3,
    DataHashTable = 4,
    FieldHashTable = 5,
    EntryArray = 6,
    Tag = 7,
}

impl TryFrom<u8> for ObjectType {
    type Error = JournalError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ObjectType::Unused),
            1 => Ok(ObjectType::Data),
            2 => Ok(ObjectType::Field),
            3 => Ok(ObjectType::Entry),
            4 => Ok(ObjectType::DataHashTable),
            5 => Ok(ObjectType::FieldHashTable),
            6 => Ok(ObjectType::EntryArray),
            7 => Ok(ObjectType::Tag),
            _ => Err(JournalError::InvalidObjectType),
        }
    }
}

impl ObjectType {
    /// Smallest valid object of this type, including its header.
    pub fn min_size(self, is_compact: bool) -> u64 {
        let size = match self {
            ObjectType::Unused => size_of::<ObjectHeader>(),
            ObjectType::Data if is_compact => {
                size_of::<DataObjectHeader>() + size_of::<CompactDataFields>()
            }
            ObjectType::Data => size_of::<DataObjectHeader>(),
            ObjectType::Field => size_of::<FieldObjectHeader>(),
            ObjectType::Entry => size_of::<EntryObjectHeader>(),
            ObjectType::DataHashTable | ObjectType::FieldHashTable => {
                size_of::<ObjectHeader>() + size_of::<HashItem>()
            }
            ObjectType::EntryArray if is_compact => size_of::<OffsetArrayObjectHeader>() + 4,
            ObjectType::EntryArray => size_of::<OffsetArrayObjectHeader>() + 8,
            ObjectType::Tag => size_of::<TagObjectHeader>(),
        };
        size as u64
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ObjectType::Unused => "unused",
            ObjectType::Data => "data",
            ObjectType::Field => "field",
            ObjectType::Entry => "entry",
            ObjectType::DataHashTable => "data hash table",
            ObjectType::FieldHashTable => "field hash table",
            ObjectType::EntryArray => "entry array",
            ObjectType::Tag => "tag",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ObjectHeader {
    pub type_: u8,
    pub flags: u8,
    pub reserved: [u8; 6],
    pub size: u64,
}

impl ObjectHeader {
    pub fn object_type(&self) -> Result<ObjectType> {
        ObjectType::try_from(self.type_)
    }

    pub fn compression(&self) -> Result<Compression> {
        Compression::from_object_flags(self.flags)
    }

    pub fn is_compressed(&self) -> bool {
        self.flags != 0
    }

    pub fn aligned_size(&self) -> u64 {
        align8(self.size)
    }
}

#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct HashItem {
    pub head_hash_offset: Option<NonZeroU64>,
    pub tail_hash_offset: Option<NonZeroU64>,
}

#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DataObjectHeader {
    pub object_header: ObjectHeader,
    pub hash: u64,
    pub next_hash_offset: Option<NonZeroU64>,
    pub next_field_offset: Option<NonZeroU64>,
    pub entry_offset: Option<NonZeroU64>,
    pub entry_array_offset: Option<NonZeroU64>,
    pub n_entries: Option<NonZeroU64>,
}

#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, PartialEq, Eq)]
#[repr(C)]
pub struct CompactDataFields {
    pub tail_entry_array_offset: u32,
    pub tail_entry_array_n_entries: u32,
}

#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FieldObjectHeader {
    pub object_header: ObjectHeader,
    pub hash: u64,
    pub next_hash_offset: Option<NonZeroU64>,
    pub head_data_offset: Option<NonZeroU64>,
}

#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct EntryObjectHeader {
    pub object_header: ObjectHeader,
    pub seqnum: u64,
    pub realtime: u64,
    pub monotonic: u64,
    pub boot_id: [u8; 16],
    pub xor_hash: u64,
}

#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RegularEntryItem {
    pub object_offset: u64,
    pub hash: u64,
}

#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct CompactEntryItem {
    pub object_offset: u32,
}

#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct OffsetArrayObjectHeader {
    pub object_header: ObjectHeader,
    pub next_offset_array: Option<NonZeroU64>,
}

// HMAC-SHA256
pub const TAG_LENGTH: usize = 256 / 8;

#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct TagObjectHeader {
    pub object_header: ObjectHeader,
    pub seqnum: u64,
    pub epoch: u64,
    pub tag: [u8; TAG_LENGTH],
}

/// Objects that live in a hash table collision chain.
pub trait HashableObject {
    fn hash(&self) -> u64;

    /// Payload bytes as stored, possibly compressed.
    fn raw_payload(&self) -> &[u8];

    fn compression(&self) -> Result<Compression>;

    fn next_hash_offset(&self) -> Option<NonZeroU64>;

    fn object_type() -> ObjectType;

    /// Writes the uncompressed payload into `buf`.
    fn payload_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        self.compression()?.decompress(self.raw_payload(), buf)?;
        Ok(())
    }
}

pub trait HashableObjectMut: HashableObject {
    fn set_next_hash_offset(&mut self, offset: NonZeroU64);
}

/// Builds a typed view from the bytes of a whole object.
pub trait JournalObject<B: SplitByteSlice>: Sized {
    fn from_data(data: B, is_compact: bool) -> Option<Self>;
}

pub trait HashTable {
    type Object: HashableObject;

    fn items(&self) -> &[HashItem];

    fn hash_item_ref(&self, hash: u64) -> &HashItem {
        let items = self.items();
        &items[(hash % items.len() as u64) as usize]
    }

    fn len(&self) -> usize {
        self.items().len()
    }

    fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    fn occupied(&self) -> usize {
        self.items()
            .iter()
            .filter(|item| item.head_hash_offset.is_some())
            .count()
    }
}

pub trait HashTableMut: HashTable {
    fn items_mut(&mut self) -> &mut [HashItem];

    fn hash_item_mut(&mut self, hash: u64) -> &mut HashItem {
        let items = self.items_mut();
        let len = items.len() as u64;
        &mut items[(hash % len) as usize]
    }
}

macro_rules! hash_table_object {
    ($name:ident, $object:ident) => {
        pub struct $name<B: ByteSlice> {
            pub header: Ref<B, ObjectHeader>,
            pub items: Ref<B, [HashItem]>,
        }

        impl<B: ByteSlice> HashTable for $name<B> {
            type Object = $object<B>;

            fn items(&self) -> &[HashItem] {
                &self.items
            }
        }

        impl<B: ByteSliceMut> HashTableMut for $name<B> {
            fn items_mut(&mut self) -> &mut [HashItem] {
                &mut self.items
            }
        }

        impl<B: SplitByteSlice> JournalObject<B> for $name<B> {
            fn from_data(data: B, _is_compact: bool) -> Option<Self> {
                let (header, rest) = Ref::from_prefix(data).ok()?;
                let items: Ref<B, [HashItem]> = Ref::from_bytes(rest).ok()?;
                if items.is_empty() {
                    return None;
                }
                Some($name { header, items })
            }
        }
    };
}

hash_table_object!(DataHashTable, DataObject);
hash_table_object!(FieldHashTable, FieldObject);

pub enum DataPayload<B: ByteSlice> {
    Regular(B),
    Compact {
        tail: Ref<B, CompactDataFields>,
        payload: B,
    },
}

impl<B: ByteSlice> std::fmt::Debug for DataPayload<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataPayload::Regular(payload) => write!(f, "Regular({} bytes)", payload.len()),
            DataPayload::Compact { tail, payload } => {
                write!(f, "Compact({:?}, {} bytes)", &**tail, payload.len())
            }
        }
    }
}

pub struct DataObject<B: ByteSlice> {
    pub header: Ref<B, DataObjectHeader>,
    pub payload: DataPayload<B>,
}

impl<B: ByteSlice> std::fmt::Debug for DataObject<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataObject")
            .field("header", &*self.header)
            .field("payload", &self.payload)
            .finish()
    }
}

impl<B: SplitByteSlice> JournalObject<B> for DataObject<B> {
    fn from_data(data: B, is_compact: bool) -> Option<Self> {
        let (header, rest) = Ref::from_prefix(data).ok()?;

        let payload = if is_compact {
            let (tail, payload) = Ref::from_prefix(rest).ok()?;
            DataPayload::Compact { tail, payload }
        } else {
            DataPayload::Regular(rest)
        };

        Some(DataObject { header, payload })
    }
}

impl DataObjectHeader {
    /// Cursor over every entry that references this data object.
    pub fn inlined_cursor(&self) -> Option<InlinedCursor> {
        let inlined_offset = self.entry_offset?;
        let cursor = match self.n_entries?.get() {
            1 => None,
            n => {
                let total_items = NonZeroUsize::new(n as usize - 1)?;
                Some(Cursor::at_head(List::new(self.entry_array_offset?, total_items)))
            }
        };
        Some(InlinedCursor::new(inlined_offset, cursor))
    }
}

impl<B: ByteSlice> DataObject<B> {
    pub fn raw_payload(&self) -> &[u8] {
        match &self.payload {
            DataPayload::Regular(payload) => payload,
            DataPayload::Compact { payload, .. } => payload,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.header.object_header.is_compressed()
    }

    pub fn n_entries(&self) -> u64 {
        self.header.n_entries.map_or(0, NonZeroU64::get)
    }

    pub fn inlined_cursor(&self) -> Option<InlinedCursor> {
        self.header.inlined_cursor()
    }
}

impl<B: ByteSliceMut> DataObject<B> {
    pub fn payload_mut(&mut self) -> &mut [u8] {
        match &mut self.payload {
            DataPayload::Regular(payload) => payload,
            DataPayload::Compact { payload, .. } => payload,
        }
    }
}

impl<B: ByteSlice> HashableObject for DataObject<B> {
    fn hash(&self) -> u64 {
        self.header.hash
    }

    fn raw_payload(&self) -> &[u8] {
        DataObject::raw_payload(self)
    }

    fn compression(&self) -> Result<Compression> {
        self.header.object_header.compression()
    }

    fn next_hash_offset(&self) -> Option<NonZeroU64> {
        self.header.next_hash_offset
    }

    fn object_type() -> ObjectType {
        ObjectType::Data
    }
}

impl<B: ByteSliceMut> HashableObjectMut for DataObject<B> {
    fn set_next_hash_offset(&mut self, offset: NonZeroU64) {
        self.header.next_hash_offset = Some(offset);
    }
}

#[derive(Debug)]
pub struct FieldObject<B: ByteSlice> {
    pub header: Ref<B, FieldObjectHeader>,
    pub payload: B,
}

impl<B: SplitByteSlice> JournalObject<B> for FieldObject<B> {
    fn from_data(data: B, _is_compact: bool) -> Option<Self> {
        let (header, payload) = Ref::from_prefix(data).ok()?;
        Some(FieldObject { header, payload })
    }
}

impl<B: ByteSlice> HashableObject for FieldObject<B> {
    fn hash(&self) -> u64 {
        self.header.hash
    }

    fn raw_payload(&self) -> &[u8] {
        &self.payload
    }

    fn compression(&self) -> Result<Compression> {
        Ok(Compression::None)
    }

    fn next_hash_offset(&self) -> Option<NonZeroU64> {
        self.header.next_hash_offset
    }

    fn object_type() -> ObjectType {
        ObjectType::Field
    }
}

impl<B: ByteSliceMut> HashableObjectMut for FieldObject<B> {
    fn set_next_hash_offset(&mut self, offset: NonZeroU64) {
        self.header.next_hash_offset = Some(offset);
    }
}

pub enum EntryItems<B: ByteSlice> {
    Regular(Ref<B, [RegularEntryItem]>),
    Compact(Ref<B, [CompactEntryItem]>),
}

impl<B: ByteSlice> EntryItems<B> {
    pub fn len(&self) -> usize {
        match self {
            EntryItems::Regular(items) => items.len(),
            EntryItems::Compact(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset of the data object referenced by item `index`.
    pub fn get(&self, index: usize) -> Option<NonZeroU64> {
        match self {
            EntryItems::Regular(items) => NonZeroU64::new(items.get(index)?.object_offset),
            EntryItems::Compact(items) => NonZeroU64::new(items.get(index)?.object_offset as u64),
        }
    }
}

impl<B: ByteSliceMut> EntryItems<B> {
    pub fn set(&mut self, index: usize, object_offset: NonZeroU64, hash: u64) -> Result<()> {
        match self {
            EntryItems::Regular(items) => {
                let item = items
                    .get_mut(index)
                    .ok_or(JournalError::InvalidOffsetArrayIndex)?;
                item.object_offset = object_offset.get();
                item.hash = hash;
            }
            EntryItems::Compact(items) => {
                let item = items
                    .get_mut(index)
                    .ok_or(JournalError::InvalidOffsetArrayIndex)?;
                item.object_offset =
                    u32::try_from(object_offset.get()).map_err(|_| JournalError::InvalidOffset)?;
            }
        }
        Ok(())
    }
}

impl<B: ByteSlice> std::fmt::Debug for EntryItems<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryItems::Regular(items) => write!(f, "Regular({} items)", items.len()),
            EntryItems::Compact(items) => write!(f, "Compact({} items)", items.len()),
        }
    }
}

pub struct EntryObject<B: ByteSlice> {
    pub header: Ref<B, EntryObjectHeader>,
    pub items: EntryItems<B>,
}

impl<B: ByteSlice> EntryObject<B> {
    pub fn collect_offsets(&self, offsets: &mut Vec<NonZeroU64>) -> Result<()> {
        offsets.reserve(self.items.len());
        for index in 0..self.items.len() {
            offsets.push(self.items.get(index).ok_or(JournalError::InvalidOffset)?);
        }
        Ok(())
    }

    pub fn boot_id(&self) -> uuid::Uuid {
        uuid::Uuid::from_bytes(self.header.boot_id)
    }
}

impl<B: ByteSlice> std::fmt::Debug for EntryObject<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryObject")
            .field("header", &*self.header)
            .field("items", &self.items)
            .finish()
    }
}

impl<B: SplitByteSlice> JournalObject<B> for EntryObject<B> {
    fn from_data(data: B, is_compact: bool) -> Option<Self> {
        let (header, rest) = Ref::from_prefix(data).ok()?;

        let items = if is_compact {
            EntryItems::Compact(Ref::from_bytes(rest).ok()?)
        } else {
            EntryItems::Regular(Ref::from_bytes(rest).ok()?)
        };

        Some(EntryObject { header, items })
    }
}

pub enum Offsets<B: ByteSlice> {
    Regular(Ref<B, [Option<NonZeroU64>]>),
    Compact(Ref<B, [Option<NonZeroU32>]>),
}

impl<B: ByteSlice> Offsets<B> {
    pub fn capacity(&self) -> usize {
        match self {
            Offsets::Regular(offsets) => offsets.len(),
            Offsets::Compact(offsets) => offsets.len(),
        }
    }

    pub fn get(&self, index: usize) -> Option<NonZeroU64> {
        match self {
            Offsets::Regular(offsets) => offsets.get(index).copied().flatten(),
            Offsets::Compact(offsets) => offsets.get(index).copied().flatten().map(Into::into),
        }
    }
}

pub struct OffsetArrayObject<B: ByteSlice> {
    pub header: Ref<B, OffsetArrayObjectHeader>,
    pub items: Offsets<B>,
}

impl<B: ByteSlice> OffsetArrayObject<B> {
    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    /// Number of populated slots, given how many items remain in the chain
    /// starting at this array.
    pub fn len(&self, remaining_items: usize) -> usize {
        self.capacity().min(remaining_items)
    }

    pub fn get(&self, index: usize, remaining_items: usize) -> Result<NonZeroU64> {
        if index >= self.len(remaining_items) {
            return Err(JournalError::InvalidOffsetArrayIndex);
        }
        self.items.get(index).ok_or(JournalError::InvalidOffset)
    }

    pub fn collect_offsets(
        &self,
        start_index: usize,
        remaining_items: usize,
        offsets: &mut Vec<NonZeroU64>,
    ) -> Result<()> {
        let len = self.len(remaining_items);
        if start_index >= len {
            return Err(JournalError::InvalidOffsetArrayIndex);
        }

        for index in start_index..len {
            offsets.push(self.items.get(index).ok_or(JournalError::InvalidOffset)?);
        }
        Ok(())
    }
}

impl<B: ByteSliceMut> OffsetArrayObject<B> {
    pub fn set(&mut self, index: usize, offset: NonZeroU64) -> Result<()> {
        match &mut self.items {
            Offsets::Regular(offsets) => {
                *offsets
                    .get_mut(index)
                    .ok_or(JournalError::InvalidOffsetArrayIndex)? = Some(offset);
            }
            Offsets::Compact(offsets) => {
                let offset =
                    u32::try_from(offset.get()).map_err(|_| JournalError::InvalidOffset)?;
                *offsets
                    .get_mut(index)
                    .ok_or(JournalError::InvalidOffsetArrayIndex)? = NonZeroU32::new(offset);
            }
        }
        Ok(())
    }
}

impl<B: ByteSlice> std::fmt::Debug for OffsetArrayObject<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetArrayObject")
            .field("header", &*self.header)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl<B: SplitByteSlice> JournalObject<B> for OffsetArrayObject<B> {
    fn from_data(data: B, is_compact: bool) -> Option<Self> {
        let (header, rest) = Ref::from_prefix(data).ok()?;

        let items = if is_compact {
            Offsets::Compact(Ref::from_bytes(rest).ok()?)
        } else {
            Offsets::Regular(Ref::from_bytes(rest).ok()?)
        };

        Some(OffsetArrayObject { header, items })
    }
}

pub struct TagObject<B: ByteSlice> {
    pub header: Ref<B, TagObjectHeader>,
}

impl<B: ByteSlice> std::fmt::Debug for TagObject<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagObject")
            .field("seqnum", &self.header.seqnum)
            .field("epoch", &self.header.epoch)
            .finish()
    }
}

impl<B: SplitByteSlice> JournalObject<B> for TagObject<B> {
    fn from_data(data: B, _is_compact: bool) -> Option<Self> {
        let (header, _) = Ref::from_prefix(data).ok()?;
        Some(TagObject { header })
    }
}

/// An object of any type, decoded from its type tag.
pub enum Object<B: ByteSlice> {
    Data(DataObject<B>),
    Field(FieldObject<B>),
    Entry(EntryObject<B>),
    DataHashTable(DataHashTable<B>),
    FieldHashTable(FieldHashTable<B>),
    EntryArray(OffsetArrayObject<B>),
    Tag(TagObject<B>),
}

impl<B: SplitByteSlice> Object<B> {
    /// Decodes the object that spans exactly `data`.
    pub fn parse(data: B, is_compact: bool) -> Result<Self> {
        let object_type = {
            let (header, _) = ObjectHeader::ref_from_prefix(&data[..])
                .map_err(|_| JournalError::InvalidObjectSize)?;
            if header.size != data.len() as u64 {
                return Err(JournalError::InvalidObjectSize);
            }
            if header.size < header.object_type()?.min_size(is_compact) {
                return Err(JournalError::InvalidObjectSize);
            }
            header.object_type()?
        };

        let object = match object_type {
            ObjectType::Unused => return Err(JournalError::InvalidObjectType),
            ObjectType::Data => DataObject::from_data(data, is_compact).map(Object::Data),
            ObjectType::Field => FieldObject::from_data(data, is_compact).map(Object::Field),
            ObjectType::Entry => EntryObject::from_data(data, is_compact).map(Object::Entry),
            ObjectType::DataHashTable => {
                DataHashTable::from_data(data, is_compact).map(Object::DataHashTable)
            }
            ObjectType::FieldHashTable => {
                FieldHashTable::from_data(data, is_compact).map(Object::FieldHashTable)
            }
            ObjectType::EntryArray => {
                OffsetArrayObject::from_data(data, is_compact).map(Object::EntryArray)
            }
            ObjectType::Tag => TagObject::from_data(data, is_compact).map(Object::Tag),
        };

        object.ok_or(JournalError::InvalidObjectSize)
    }
}

impl<B: ByteSlice> Object<B> {
    pub fn object_type(&self) -> ObjectType {
        match self {
            Object::Data(_) => ObjectType::Data,
            Object::Field(_) => ObjectType::Field,
            Object::Entry(_) => ObjectType::Entry,
            Object::DataHashTable(_) => ObjectType::DataHashTable,
            Object::FieldHashTable(_) => ObjectType::FieldHashTable,
            Object::EntryArray(_) => ObjectType::EntryArray,
            Object::Tag(_) => ObjectType::Tag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // u64 backing storage keeps the views 8-byte aligned.
    fn words(size: usize) -> Vec<u64> {
        vec![0u64; size.div_ceil(8)]
    }

    fn entry_words(n_items: usize) -> Vec<u64> {
        let size = size_of::<EntryObjectHeader>() + n_items * size_of::<RegularEntryItem>();
        let mut storage = words(size);
        let bytes = storage.as_mut_bytes();
        bytes[0] = ObjectType::Entry as u8;
        bytes[8..16].copy_from_slice(&(size as u64).to_le_bytes());
        storage
    }

    #[test]
    fn header_sizes_match_the_file_format() {
        assert_eq!(size_of::<ObjectHeader>(), 16);
        assert_eq!(size_of::<DataObjectHeader>(), 64);
        assert_eq!(size_of::<FieldObjectHeader>(), 40);
        assert_eq!(size_of::<EntryObjectHeader>(), 64);
        assert_eq!(size_of::<OffsetArrayObjectHeader>(), 24);
        assert_eq!(size_of::<TagObjectHeader>(), 64);
    }

    #[test]
    fn parses_entry_by_type_tag() {
        let storage = entry_words(2);
        let object = Object::parse(storage.as_bytes(), false).unwrap();
        match object {
            Object::Entry(entry) => assert_eq!(entry.items.len(), 2),
            other => panic!("unexpected {}", other.object_type()),
        }
    }

    #[test]
    fn rejects_size_mismatch_and_unknown_type() {
        let mut storage = entry_words(1);
        storage.as_mut_bytes()[8..16].copy_from_slice(&1000u64.to_le_bytes());
        assert!(matches!(
            Object::parse(storage.as_bytes(), false),
            Err(JournalError::InvalidObjectSize)
        ));

        let mut storage = entry_words(1);
        storage.as_mut_bytes()[0] = 42;
        assert!(matches!(
            Object::parse(storage.as_bytes(), false),
            Err(JournalError::InvalidObjectType)
        ));
    }

    #[test]
    fn compact_entry_items_reject_wide_offsets() {
        let mut storage = words(size_of::<EntryObjectHeader>() + 8);
        let bytes = &mut storage.as_mut_bytes()[..size_of::<EntryObjectHeader>() + 4];
        let mut entry = EntryObject::from_data(bytes, true).unwrap();
        let too_far = NonZeroU64::new(u64::from(u32::MAX) + 8).unwrap();
        assert!(entry.items.set(0, too_far, 0).is_err());
        assert!(entry.items.set(0, NonZeroU64::new(64).unwrap(), 0).is_ok());
        assert_eq!(entry.items.get(0), NonZeroU64::new(64));
    }

    #[test]
    fn offset_array_len_is_bounded_by_remaining_items() {
        let mut storage = words(size_of::<OffsetArrayObjectHeader>() + 4 * 8);
        let mut array = OffsetArrayObject::from_data(storage.as_mut_bytes(), false).unwrap();
        array.set(0, NonZeroU64::new(512).unwrap()).unwrap();
        assert_eq!(array.capacity(), 4);
        assert_eq!(array.len(1), 1);
        assert_eq!(array.get(0, 1).unwrap().get(), 512);
        assert!(array.get(1, 1).is_err());
    }
}
